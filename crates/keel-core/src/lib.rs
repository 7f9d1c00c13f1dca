//! Keel Core: shared abstractions for the event-sourcing engine.
//!
//! This crate defines the event, aggregate, store, outbox, snapshot and
//! checkpoint contracts every backend and consumer depends on, together with
//! the upcaster registry and the aggregate repository. It contains no
//! storage or transport code.

pub mod aggregate;
pub mod channel;
pub mod checkpoint;
pub mod clock;
pub mod command;
pub mod config;
pub mod dead_letter;
pub mod error;
pub mod event;
pub mod repository;
pub mod snapshot;
pub mod store;
pub mod upcast;
