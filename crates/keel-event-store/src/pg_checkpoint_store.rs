//! `PostgreSQL` implementation of the `CheckpointStore` trait.

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::types::Json;

use keel_core::checkpoint::{Checkpoint, CheckpointStore};
use keel_core::error::DomainError;

use crate::sql::{db_error, from_db, to_db};

/// PostgreSQL-backed projection checkpoints.
#[derive(Debug, Clone)]
pub struct PgCheckpointStore {
    pool: PgPool,
}

impl PgCheckpointStore {
    /// Creates a new `PgCheckpointStore`.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct CheckpointRow {
    last_global_position_applied: i64,
    read_model: Option<Json<serde_json::Value>>,
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn load(&self, consumer_id: &str) -> Result<Option<Checkpoint>, DomainError> {
        let row: Option<CheckpointRow> = sqlx::query_as(
            "SELECT last_global_position_applied, read_model FROM checkpoints \
             WHERE consumer_id = $1",
        )
        .bind(consumer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.map(|row| {
            Ok::<_, DomainError>(Checkpoint {
                consumer_id: consumer_id.to_owned(),
                last_global_position_applied: from_db(row.last_global_position_applied)?,
                read_model: row.read_model.map(|Json(value)| value),
            })
        })
        .transpose()
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), DomainError> {
        sqlx::query(
            "INSERT INTO checkpoints \
             (consumer_id, last_global_position_applied, read_model, updated_at) \
             VALUES ($1, $2, $3, NOW()) \
             ON CONFLICT (consumer_id) DO UPDATE \
             SET last_global_position_applied = EXCLUDED.last_global_position_applied, \
                 read_model = EXCLUDED.read_model, \
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(&checkpoint.consumer_id)
        .bind(to_db(checkpoint.last_global_position_applied)?)
        .bind(checkpoint.read_model.as_ref().map(Json))
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }
}
