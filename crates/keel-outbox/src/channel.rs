//! In-process message channel backed by a tokio mpsc queue.

use async_trait::async_trait;
use keel_core::channel::MessageChannel;
use keel_core::error::PublishError;
use keel_core::event::RecordedEvent;
use tokio::sync::mpsc;

/// Publishes events into a bounded tokio queue. A full queue applies
/// backpressure to the relay; a closed receiver is a publish failure.
#[derive(Debug, Clone)]
pub struct TokioChannel {
    sender: mpsc::Sender<RecordedEvent>,
}

/// Creates a channel and the receiver its events arrive on.
#[must_use]
pub fn tokio_channel(capacity: usize) -> (TokioChannel, mpsc::Receiver<RecordedEvent>) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (TokioChannel { sender }, receiver)
}

#[async_trait]
impl MessageChannel for TokioChannel {
    async fn send(&self, event: &RecordedEvent) -> Result<(), PublishError> {
        self.sender
            .send(event.clone())
            .await
            .map_err(|_| PublishError::new("receiver closed"))
    }
}
