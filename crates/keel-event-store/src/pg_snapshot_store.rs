//! `PostgreSQL` implementation of the `SnapshotStore` trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use keel_core::error::DomainError;
use keel_core::snapshot::{Snapshot, SnapshotStore};

use crate::sql::{db_error, from_db, to_db};

#[derive(sqlx::FromRow)]
struct SnapshotRow {
    stream_id: String,
    version: i64,
    state: serde_json::Value,
    taken_at: DateTime<Utc>,
}

/// PostgreSQL-backed snapshot store holding one row per stream.
#[derive(Debug, Clone)]
pub struct PgSnapshotStore {
    pool: PgPool,
}

impl PgSnapshotStore {
    /// Creates a new `PgSnapshotStore`.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SnapshotStore for PgSnapshotStore {
    async fn get_latest(&self, stream_id: &str) -> Result<Option<Snapshot>, DomainError> {
        let row: Option<SnapshotRow> = sqlx::query_as(
            "SELECT stream_id, version, state, taken_at FROM snapshots WHERE stream_id = $1",
        )
        .bind(stream_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.map(|row| {
            Ok::<_, DomainError>(Snapshot {
                stream_id: row.stream_id,
                version: from_db(row.version)?,
                state: row.state,
                taken_at: row.taken_at,
            })
        })
        .transpose()
    }

    async fn put(&self, snapshot: Snapshot) -> Result<(), DomainError> {
        sqlx::query(
            "INSERT INTO snapshots (stream_id, version, state, taken_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (stream_id) DO UPDATE \
             SET version = EXCLUDED.version, state = EXCLUDED.state, taken_at = EXCLUDED.taken_at \
             WHERE snapshots.version < EXCLUDED.version",
        )
        .bind(&snapshot.stream_id)
        .bind(to_db(snapshot.version)?)
        .bind(&snapshot.state)
        .bind(snapshot.taken_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn delete_all(&self) -> Result<(), DomainError> {
        sqlx::query("DELETE FROM snapshots")
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }
}
