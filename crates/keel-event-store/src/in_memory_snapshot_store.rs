//! In-memory implementation of the `SnapshotStore` trait.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use keel_core::error::DomainError;
use keel_core::snapshot::{Snapshot, SnapshotStore};

/// Keeps the latest snapshot per stream.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshots: RwLock<HashMap<String, Snapshot>>,
}

impl InMemorySnapshotStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of streams with a snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no snapshot is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn get_latest(&self, stream_id: &str) -> Result<Option<Snapshot>, DomainError> {
        Ok(self
            .snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(stream_id)
            .cloned())
    }

    async fn put(&self, snapshot: Snapshot) -> Result<(), DomainError> {
        let mut snapshots = self.snapshots.write().unwrap_or_else(PoisonError::into_inner);
        match snapshots.get(&snapshot.stream_id) {
            Some(existing) if existing.version >= snapshot.version => {
                tracing::trace!(
                    stream_id = %snapshot.stream_id,
                    version = snapshot.version,
                    held = existing.version,
                    "ignoring stale snapshot"
                );
            }
            _ => {
                snapshots.insert(snapshot.stream_id.clone(), snapshot);
            }
        }
        Ok(())
    }

    async fn delete_all(&self) -> Result<(), DomainError> {
        self.snapshots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }
}
