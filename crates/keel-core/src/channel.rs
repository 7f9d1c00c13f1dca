//! Outbound message channel the outbox relay publishes to.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::PublishError;
use crate::event::RecordedEvent;

/// Transport-agnostic sink for committed events.
///
/// Delivery through a channel is at-least-once: the relay may send the
/// same event again after a crash or a failed acknowledgement.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Publishes `event`.
    ///
    /// # Errors
    ///
    /// Returns `PublishError` if the transport did not accept the event.
    async fn send(&self, event: &RecordedEvent) -> Result<(), PublishError>;
}

#[async_trait]
impl<C: MessageChannel + ?Sized> MessageChannel for Arc<C> {
    async fn send(&self, event: &RecordedEvent) -> Result<(), PublishError> {
        (**self).send(event).await
    }
}
