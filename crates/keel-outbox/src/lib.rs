//! Outbox relay: delivers committed events to a message channel at least
//! once, with exponential backoff and dead-lettering.

pub mod channel;
pub mod relay;

pub use channel::{TokioChannel, tokio_channel};
pub use relay::{OutboxRelay, RelayError, RelayHandle, RelayReport};
