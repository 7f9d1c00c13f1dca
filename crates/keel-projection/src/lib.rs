//! Projection engine: builds read models from the global event order and
//! tracks a durable checkpoint per consumer group.
//!
//! Events always reach handlers in `global_position` order. A
//! [`ChannelSource`] or [`ProjectionChannel`] lets relay deliveries pace the
//! projection, but the events themselves are read from the store, so a
//! relay that delivers streams out of global order never makes the
//! checkpoint skip an event.

pub mod channel;
pub mod engine;
pub mod source;

pub use channel::ProjectionChannel;
pub use engine::{
    FailurePolicy, Handler, ProjectionEngine, ProjectionHandle, ProjectionReport,
    ProjectionTaskError,
};
pub use source::{ChannelSource, EventSource, StoreSource};
