//! Storage backends shared by the demo's components.

use std::sync::Arc;

use keel_core::checkpoint::CheckpointStore;
use keel_core::snapshot::SnapshotStore;
use keel_core::store::{EventStore, OutboxStore};
use keel_event_store::{
    InMemoryCheckpointStore, InMemoryEventStore, InMemorySnapshotStore, PgCheckpointStore,
    PgEventStore, PgSnapshotStore,
};
use sqlx::PgPool;

/// Every store the engine needs, backed by one storage engine.
#[derive(Clone)]
pub struct Stores {
    /// Event log.
    pub events: Arc<dyn EventStore>,
    /// Outbox over the same log.
    pub outbox: Arc<dyn OutboxStore>,
    /// Aggregate snapshots.
    pub snapshots: Arc<dyn SnapshotStore>,
    /// Projection checkpoints.
    pub checkpoints: Arc<dyn CheckpointStore>,
}

impl Stores {
    /// Process-local stores; everything is lost on exit.
    #[must_use]
    pub fn in_memory() -> Self {
        let log = Arc::new(InMemoryEventStore::new());
        Self {
            events: log.clone(),
            outbox: log,
            snapshots: Arc::new(InMemorySnapshotStore::new()),
            checkpoints: Arc::new(InMemoryCheckpointStore::new()),
        }
    }

    /// `PostgreSQL` stores sharing `pool`. The schema must already be migrated.
    #[must_use]
    pub fn postgres(pool: &PgPool) -> Self {
        let log = Arc::new(PgEventStore::new(pool.clone()));
        Self {
            events: log.clone(),
            outbox: log,
            snapshots: Arc::new(PgSnapshotStore::new(pool.clone())),
            checkpoints: Arc::new(PgCheckpointStore::new(pool.clone())),
        }
    }
}
