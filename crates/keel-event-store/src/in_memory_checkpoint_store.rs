//! In-memory implementation of the `CheckpointStore` trait.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use keel_core::checkpoint::{Checkpoint, CheckpointStore};
use keel_core::error::DomainError;

/// Checkpoints held in a map keyed by consumer id.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: RwLock<HashMap<String, Checkpoint>>,
}

impl InMemoryCheckpointStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self, consumer_id: &str) -> Result<Option<Checkpoint>, DomainError> {
        Ok(self
            .checkpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(consumer_id)
            .cloned())
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), DomainError> {
        self.checkpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(checkpoint.consumer_id.clone(), checkpoint.clone());
        Ok(())
    }
}
