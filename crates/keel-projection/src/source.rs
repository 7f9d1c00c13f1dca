//! Where a projection engine gets its next batch of events from.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use keel_core::error::DomainError;
use keel_core::event::RecordedEvent;
use keel_core::store::EventStore;
use tokio::sync::mpsc::{self, error::TryRecvError};

/// Supplies events in `global_position` order.
#[async_trait]
pub trait EventSource: Send {
    /// Returns up to `limit` events with a global position above `after`,
    /// in order. An empty batch means nothing is available yet.
    ///
    /// # Errors
    ///
    /// Returns the underlying store's error.
    async fn next_batch(
        &mut self,
        after: u64,
        limit: usize,
    ) -> Result<Vec<RecordedEvent>, DomainError>;
}

/// Reads directly from the event store's global log.
#[derive(Clone)]
pub struct StoreSource {
    store: Arc<dyn EventStore>,
}

impl std::fmt::Debug for StoreSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreSource").finish_non_exhaustive()
    }
}

impl StoreSource {
    /// Creates a source reading `store`.
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    /// Reads up to `limit` events after `after`, stopping past `up_to`.
    pub(crate) async fn read_range(
        &self,
        after: u64,
        up_to: u64,
        limit: usize,
    ) -> Result<Vec<RecordedEvent>, DomainError> {
        self.store
            .read_all(after + 1)
            .try_take_while(|e| {
                futures::future::ready(Ok::<_, DomainError>(e.global_position <= up_to))
            })
            .take(limit)
            .try_collect()
            .await
    }
}

#[async_trait]
impl EventSource for StoreSource {
    async fn next_batch(
        &mut self,
        after: u64,
        limit: usize,
    ) -> Result<Vec<RecordedEvent>, DomainError> {
        self.read_range(after, u64::MAX, limit).await
    }
}

/// Paces a projection by relay deliveries arriving on a tokio queue.
///
/// Each delivered event announces that the log has reached its position;
/// the batch is then read from the store up to the highest announced
/// position. Redeliveries of already-applied events announce nothing new.
pub struct ChannelSource {
    receiver: mpsc::Receiver<RecordedEvent>,
    store: StoreSource,
    announced: u64,
    closed: bool,
}

impl std::fmt::Debug for ChannelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSource")
            .field("announced", &self.announced)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl ChannelSource {
    /// Creates a source draining `receiver` and reading events from `store`.
    #[must_use]
    pub fn new(receiver: mpsc::Receiver<RecordedEvent>, store: Arc<dyn EventStore>) -> Self {
        Self {
            receiver,
            store: StoreSource::new(store),
            announced: 0,
            closed: false,
        }
    }

    /// Whether every sender has gone away.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn drain(&mut self) {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => self.announced = self.announced.max(event.global_position),
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    if !self.closed {
                        tracing::debug!("projection channel closed");
                    }
                    self.closed = true;
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl EventSource for ChannelSource {
    async fn next_batch(
        &mut self,
        after: u64,
        limit: usize,
    ) -> Result<Vec<RecordedEvent>, DomainError> {
        self.drain();
        if self.announced <= after {
            return Ok(Vec::new());
        }
        self.store.read_range(after, self.announced, limit).await
    }
}
