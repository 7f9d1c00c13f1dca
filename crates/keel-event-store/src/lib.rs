//! Storage backends for the Keel event-sourcing engine.
//!
//! Each backend implements the `EventStore` and `OutboxStore` traits from
//! `keel-core` on a single type so that an append and its outbox records
//! are written together. The in-memory backends serve tests and
//! single-process use; the `PostgreSQL` backends are durable.

pub mod in_memory_checkpoint_store;
pub mod in_memory_event_store;
pub mod in_memory_snapshot_store;
pub mod pg_checkpoint_store;
pub mod pg_event_store;
pub mod pg_snapshot_store;
mod sql;

pub use in_memory_checkpoint_store::InMemoryCheckpointStore;
pub use in_memory_event_store::InMemoryEventStore;
pub use in_memory_snapshot_store::InMemorySnapshotStore;
pub use pg_checkpoint_store::PgCheckpointStore;
pub use pg_event_store::PgEventStore;
pub use pg_snapshot_store::PgSnapshotStore;

use keel_core::error::DomainError;
use sqlx::PgPool;

/// Applies the bundled schema migrations to `pool`.
///
/// # Errors
///
/// Returns `DomainError::Infrastructure` if a migration fails.
pub async fn migrate(pool: &PgPool) -> Result<(), DomainError> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .map_err(|e| DomainError::Infrastructure(format!("migration failed: {e}")))?;
    tracing::info!("database migrations applied");
    Ok(())
}
