//! Snapshot contract and the count-based snapshot policy.
//!
//! Snapshots are a read-path optimisation only: a repository with every
//! snapshot deleted loads the same state, just by replaying more events.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Default number of events between snapshots.
pub const DEFAULT_SNAPSHOT_EVERY: u64 = 100;

/// Point-in-time capture of an aggregate's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Stream the state was folded from.
    pub stream_id: String,
    /// Stream version the state was taken after.
    pub version: u64,
    /// Serialized aggregate state.
    pub state: serde_json::Value,
    /// Time the snapshot was taken.
    pub taken_at: DateTime<Utc>,
}

/// Keyed store of the latest snapshot per stream.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Returns the latest snapshot for `stream_id`, if any.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` on storage failure.
    async fn get_latest(&self, stream_id: &str) -> Result<Option<Snapshot>, DomainError>;

    /// Stores `snapshot` unless a snapshot at the same or a later version is
    /// already held for the stream.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` on storage failure.
    async fn put(&self, snapshot: Snapshot) -> Result<(), DomainError>;

    /// Discards every snapshot.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` on storage failure.
    async fn delete_all(&self) -> Result<(), DomainError>;
}

/// Snapshot store that never holds anything; loads always replay fully.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSnapshots;

#[async_trait]
impl SnapshotStore for NoSnapshots {
    async fn get_latest(&self, _stream_id: &str) -> Result<Option<Snapshot>, DomainError> {
        Ok(None)
    }

    async fn put(&self, _snapshot: Snapshot) -> Result<(), DomainError> {
        Ok(())
    }

    async fn delete_all(&self) -> Result<(), DomainError> {
        Ok(())
    }
}

/// Take a snapshot once `every` events have accumulated since the last one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotPolicy {
    /// Events between snapshots; `0` disables automatic snapshots.
    pub every: u64,
}

impl SnapshotPolicy {
    /// Policy that never snapshots automatically.
    #[must_use]
    pub const fn disabled() -> Self {
        Self { every: 0 }
    }

    /// Whether a stream at `new_version` whose last snapshot is at
    /// `last_snapshot_version` is due for a snapshot.
    #[must_use]
    pub fn should_snapshot(&self, new_version: u64, last_snapshot_version: u64) -> bool {
        self.every > 0 && new_version.saturating_sub(last_snapshot_version) >= self.every
    }
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            every: DEFAULT_SNAPSHOT_EVERY,
        }
    }
}
