//! Projection checkpoints.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// How far a consumer has progressed through the global order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Consumer group owning the checkpoint.
    pub consumer_id: String,
    /// Last global position fully applied; 0 means nothing applied yet.
    pub last_global_position_applied: u64,
    /// The consumer's read model as of `last_global_position_applied`.
    /// Stored in the same write as the position so the two never diverge.
    #[serde(default)]
    pub read_model: Option<serde_json::Value>,
}

impl Checkpoint {
    /// A checkpoint at the start of the log.
    pub fn initial(consumer_id: impl Into<String>) -> Self {
        Self {
            consumer_id: consumer_id.into(),
            last_global_position_applied: 0,
            read_model: None,
        }
    }
}

/// Durable checkpoint storage. Each consumer writes only its own row.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Loads the checkpoint for `consumer_id`, if one was ever saved.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` on storage failure.
    async fn load(&self, consumer_id: &str) -> Result<Option<Checkpoint>, DomainError>;

    /// Durably stores `checkpoint`, position and read model in one write.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` on storage failure.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), DomainError>;
}
