//! Drives a projection directly from outbox relay deliveries.

use std::sync::Arc;

use async_trait::async_trait;
use keel_core::channel::MessageChannel;
use keel_core::error::PublishError;
use keel_core::event::RecordedEvent;
use keel_core::store::EventStore;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::engine::ProjectionEngine;
use crate::source::StoreSource;

/// A [`MessageChannel`] that hands each delivery to a projection engine.
///
/// A delivery is acknowledged once the engine's checkpoint covers it. The
/// engine catches up from the store in global order, so events of other
/// streams that the relay has not delivered yet are applied first. If a
/// handler fails on the way, the delivery is rejected and the relay retries
/// it with backoff; deliveries at or below the checkpoint are acknowledged
/// without touching the read model.
pub struct ProjectionChannel<RM> {
    engine: Arc<ProjectionEngine<RM>>,
    source: StoreSource,
}

impl<RM> std::fmt::Debug for ProjectionChannel<RM> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionChannel")
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl<RM> ProjectionChannel<RM>
where
    RM: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Creates a channel feeding `engine` with events read from `store`.
    #[must_use]
    pub fn new(engine: Arc<ProjectionEngine<RM>>, store: Arc<dyn EventStore>) -> Self {
        Self {
            engine,
            source: StoreSource::new(store),
        }
    }

    /// The engine behind this channel.
    #[must_use]
    pub fn engine(&self) -> &Arc<ProjectionEngine<RM>> {
        &self.engine
    }
}

#[async_trait]
impl<RM> MessageChannel for ProjectionChannel<RM>
where
    RM: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn send(&self, event: &RecordedEvent) -> Result<(), PublishError> {
        let mut source = self.source.clone();
        loop {
            let position = self
                .engine
                .checkpoint()
                .await
                .map_err(|e| PublishError::new(e.to_string()))?;
            if position >= event.global_position {
                return Ok(());
            }

            let report = self
                .engine
                .run_once(&mut source)
                .await
                .map_err(|e| PublishError::new(e.to_string()))?;
            if report.failed {
                return Err(PublishError::new(format!(
                    "projection {} is stuck at position {}",
                    self.engine.consumer_id(),
                    report.position + 1
                )));
            }
            if !report.progressed() {
                return Err(PublishError::new(format!(
                    "event {} not readable from the store",
                    event.global_position
                )));
            }
        }
    }
}
