//! `PostgreSQL` implementation of the `EventStore` and `OutboxStore` traits.
//!
//! An append takes a transaction-scoped advisory lock on its stream and
//! checks the expected version. It then reserves its global positions with
//! `keel_reserve_positions`, which assigns the transaction id and the
//! positions under one short lock and releases it straight away. Appends to
//! different streams therefore insert and commit in parallel.
//!
//! Because transaction ids and positions are handed out in the same order,
//! every event written by a transaction older than the oldest one still
//! running is safe to read: no uncommitted append can precede it. Readers
//! bound `read_all` and `pending` by `keel_visible_head()`. Rolled-back
//! appends leave gaps in the position sequence; readers skip over them.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use keel_core::clock::{Clock, SystemClock};
use keel_core::error::DomainError;
use keel_core::event::{EventDraft, EventMetadata, RecordedEvent};
use keel_core::store::{EventStore, EventStream, OutboxRecord, OutboxStore, paged};

use crate::sql::{db_error, from_db, from_db_u32, limit, to_db, to_db_u32};

/// Name `PostgreSQL` gives the `UNIQUE (stream_id, stream_version)` constraint.
const STREAM_VERSION_CONSTRAINT: &str = "events_stream_id_stream_version_key";

const SELECT_EVENTS: &str = "SELECT global_position, event_id, stream_id, stream_version, \
     event_type, schema_version, payload, metadata, recorded_at FROM events";

const SELECT_OUTBOX: &str = "SELECT global_position, event_id, stream_id, published, attempts, \
     last_error, next_attempt_at, dead_lettered, created_at FROM outbox";

#[derive(sqlx::FromRow)]
struct EventRow {
    global_position: i64,
    event_id: Uuid,
    stream_id: String,
    stream_version: i64,
    event_type: String,
    schema_version: i32,
    payload: serde_json::Value,
    metadata: Json<EventMetadata>,
    recorded_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for RecordedEvent {
    type Error = DomainError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(Self {
            event_id: row.event_id,
            stream_id: row.stream_id,
            stream_version: from_db(row.stream_version)?,
            global_position: from_db(row.global_position)?,
            event_type: row.event_type,
            schema_version: from_db_u32(row.schema_version)?,
            payload: row.payload,
            recorded_at: row.recorded_at,
            metadata: row.metadata.0,
        })
    }
}

#[derive(sqlx::FromRow)]
struct OutboxRow {
    global_position: i64,
    event_id: Uuid,
    stream_id: String,
    published: bool,
    attempts: i32,
    last_error: Option<String>,
    next_attempt_at: Option<DateTime<Utc>>,
    dead_lettered: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<OutboxRow> for OutboxRecord {
    type Error = DomainError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        let global_position = from_db(row.global_position)?;
        Ok(Self {
            event_id: row.event_id,
            global_position,
            stream_id: row.stream_id,
            payload_ref: global_position,
            published: row.published,
            attempts: from_db_u32(row.attempts)?,
            last_error: row.last_error,
            next_attempt_at: row.next_attempt_at,
            dead_lettered: row.dead_lettered,
            created_at: row.created_at,
        })
    }
}

enum AppendFailure {
    /// Another writer inserted the same stream version.
    Duplicate,
    Domain(DomainError),
}

impl From<DomainError> for AppendFailure {
    fn from(error: DomainError) -> Self {
        Self::Domain(error)
    }
}

impl From<sqlx::Error> for AppendFailure {
    fn from(error: sqlx::Error) -> Self {
        let duplicate_version = error
            .as_database_error()
            .is_some_and(|db| db.constraint() == Some(STREAM_VERSION_CONSTRAINT));
        if duplicate_version {
            Self::Duplicate
        } else {
            Self::Domain(db_error(error))
        }
    }
}

/// PostgreSQL-backed event store and outbox.
#[derive(Clone)]
pub struct PgEventStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for PgEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgEventStore")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl PgEventStore {
    /// Creates a new `PgEventStore` stamping events with the system clock.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self::with_clock(pool, Arc::new(SystemClock))
    }

    /// Creates a new `PgEventStore` stamping events with `clock`.
    #[must_use]
    pub fn with_clock(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    async fn append_locked(
        &self,
        stream_id: &str,
        expected_version: u64,
        events: Vec<EventDraft>,
    ) -> Result<u64, AppendFailure> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(stream_id)
            .execute(&mut *tx)
            .await?;
        let current: Option<i64> =
            sqlx::query_scalar("SELECT MAX(stream_version) FROM events WHERE stream_id = $1")
                .bind(stream_id)
                .fetch_one(&mut *tx)
                .await?;
        let current = from_db(current.unwrap_or(0))?;
        if current != expected_version {
            tracing::debug!(current, "version conflict");
            return Err(DomainError::ConcurrencyConflict {
                stream_id: stream_id.to_owned(),
                expected: expected_version,
                actual: current,
            }
            .into());
        }

        let count = i32::try_from(events.len()).map_err(|_| {
            DomainError::Validation(format!("too many events in one append to {stream_id}"))
        })?;
        let first_position: i64 = sqlx::query_scalar("SELECT keel_reserve_positions($1)")
            .bind(count)
            .fetch_one(&mut *tx)
            .await?;

        let recorded_at = self.clock.now();
        let mut new_version = expected_version;
        for (draft, global_position) in events.into_iter().zip(first_position..) {
            new_version += 1;
            let event_id = draft.event_id.unwrap_or_else(Uuid::now_v7);
            sqlx::query(
                "INSERT INTO events (global_position, event_id, stream_id, stream_version, \
                 event_type, schema_version, payload, metadata, recorded_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(global_position)
            .bind(event_id)
            .bind(stream_id)
            .bind(to_db(new_version)?)
            .bind(&draft.event_type)
            .bind(to_db_u32(draft.schema_version)?)
            .bind(&draft.payload)
            .bind(Json(&draft.metadata))
            .bind(recorded_at)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO outbox (global_position, event_id, stream_id, created_at) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(global_position)
            .bind(event_id)
            .bind(stream_id)
            .bind(recorded_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(new_version)
    }

    async fn fetch_outbox(
        &self,
        global_position: u64,
    ) -> Result<Option<OutboxRecord>, DomainError> {
        let row: Option<OutboxRow> =
            sqlx::query_as(&format!("{SELECT_OUTBOX} WHERE global_position = $1"))
                .bind(to_db(global_position)?)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error)?;
        row.map(OutboxRecord::try_from).transpose()
    }
}

fn outbox_not_found(global_position: u64) -> DomainError {
    DomainError::NotFound(format!("outbox record at position {global_position}"))
}

#[async_trait]
impl EventStore for PgEventStore {
    #[tracing::instrument(skip(self, events), fields(event_count = events.len()))]
    async fn append(
        &self,
        stream_id: &str,
        expected_version: u64,
        events: Vec<EventDraft>,
    ) -> Result<u64, DomainError> {
        if stream_id.is_empty() {
            return Err(DomainError::Validation("stream id must not be empty".into()));
        }
        if events.is_empty() {
            return Err(DomainError::Validation(format!(
                "append to {stream_id} must contain at least one event"
            )));
        }

        match self.append_locked(stream_id, expected_version, events).await {
            Ok(new_version) => {
                tracing::debug!(new_version, "events appended");
                Ok(new_version)
            }
            Err(AppendFailure::Duplicate) => {
                let actual = self.stream_version(stream_id).await?;
                Err(DomainError::ConcurrencyConflict {
                    stream_id: stream_id.to_owned(),
                    expected: expected_version,
                    actual,
                })
            }
            Err(AppendFailure::Domain(error)) => Err(error),
        }
    }

    fn read(&self, stream_id: &str, from_version: u64) -> EventStream<'_> {
        let pool = &self.pool;
        let stream_id = stream_id.to_owned();
        futures::stream::once(async move {
            let head: i64 = sqlx::query_scalar(
                "SELECT COALESCE(MAX(stream_version), 0) FROM events WHERE stream_id = $1",
            )
            .bind(&stream_id)
            .fetch_one(pool)
            .await
            .map_err(db_error)?;

            Ok::<_, DomainError>(paged(
                from_version.max(1),
                |e: &RecordedEvent| e.stream_version,
                move |cursor, page_size| {
                    let stream_id = stream_id.clone();
                    async move {
                        let rows: Vec<EventRow> = sqlx::query_as(&format!(
                            "{SELECT_EVENTS} WHERE stream_id = $1 \
                             AND stream_version >= $2 AND stream_version <= $3 \
                             ORDER BY stream_version LIMIT $4"
                        ))
                        .bind(&stream_id)
                        .bind(to_db(cursor)?)
                        .bind(head)
                        .bind(limit(page_size))
                        .fetch_all(pool)
                        .await
                        .map_err(db_error)?;
                        rows.into_iter()
                            .map(RecordedEvent::try_from)
                            .collect::<Result<Vec<_>, DomainError>>()
                    }
                },
            ))
        })
        .try_flatten()
        .boxed()
    }

    fn read_all(&self, from_global_position: u64) -> EventStream<'_> {
        let pool = &self.pool;
        futures::stream::once(async move {
            let head: i64 = sqlx::query_scalar("SELECT keel_visible_head()")
                .fetch_one(pool)
                .await
                .map_err(db_error)?;

            Ok::<_, DomainError>(paged(
                from_global_position.max(1),
                |e: &RecordedEvent| e.global_position,
                move |cursor, page_size| async move {
                    let rows: Vec<EventRow> = sqlx::query_as(&format!(
                        "{SELECT_EVENTS} WHERE global_position >= $1 AND global_position <= $2 \
                         ORDER BY global_position LIMIT $3"
                    ))
                    .bind(to_db(cursor)?)
                    .bind(head)
                    .bind(limit(page_size))
                    .fetch_all(pool)
                    .await
                    .map_err(db_error)?;
                    rows.into_iter()
                        .map(RecordedEvent::try_from)
                        .collect::<Result<Vec<_>, DomainError>>()
                },
            ))
        })
        .try_flatten()
        .boxed()
    }

    async fn stream_version(&self, stream_id: &str) -> Result<u64, DomainError> {
        let version: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(stream_version), 0) FROM events WHERE stream_id = $1",
        )
        .bind(stream_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;
        from_db(version)
    }
}

#[async_trait]
impl OutboxStore for PgEventStore {
    async fn pending(&self, after: u64, max: usize) -> Result<Vec<OutboxRecord>, DomainError> {
        let rows: Vec<OutboxRow> = sqlx::query_as(&format!(
            "{SELECT_OUTBOX} WHERE NOT published AND NOT dead_lettered \
             AND global_position > $1 AND global_position <= keel_visible_head() \
             ORDER BY global_position LIMIT $2"
        ))
        .bind(to_db(after)?)
        .bind(limit(max))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        rows.into_iter().map(OutboxRecord::try_from).collect()
    }

    async fn load_event(&self, record: &OutboxRecord) -> Result<RecordedEvent, DomainError> {
        let row: Option<EventRow> =
            sqlx::query_as(&format!("{SELECT_EVENTS} WHERE global_position = $1"))
                .bind(to_db(record.payload_ref)?)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error)?;
        row.map(RecordedEvent::try_from)
            .transpose()?
            .ok_or_else(|| {
                DomainError::NotFound(format!("event at position {}", record.payload_ref))
            })
    }

    async fn mark_published(&self, global_position: u64) -> Result<(), DomainError> {
        let result = sqlx::query(
            "UPDATE outbox SET published = TRUE, next_attempt_at = NULL WHERE global_position = $1",
        )
        .bind(to_db(global_position)?)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        if result.rows_affected() == 0 {
            return Err(outbox_not_found(global_position));
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        global_position: u64,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<u32, DomainError> {
        let attempts: Option<i32> = sqlx::query_scalar(
            "UPDATE outbox SET attempts = attempts + 1, last_error = $2, next_attempt_at = $3 \
             WHERE global_position = $1 RETURNING attempts",
        )
        .bind(to_db(global_position)?)
        .bind(error)
        .bind(next_attempt_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;
        attempts
            .map(from_db_u32)
            .transpose()?
            .ok_or_else(|| outbox_not_found(global_position))
    }

    async fn mark_dead_lettered(
        &self,
        global_position: u64,
        error: &str,
    ) -> Result<(), DomainError> {
        let result = sqlx::query(
            "UPDATE outbox SET dead_lettered = TRUE, last_error = $2, next_attempt_at = NULL \
             WHERE global_position = $1",
        )
        .bind(to_db(global_position)?)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        if result.rows_affected() == 0 {
            return Err(outbox_not_found(global_position));
        }
        Ok(())
    }

    async fn get(&self, global_position: u64) -> Result<Option<OutboxRecord>, DomainError> {
        self.fetch_outbox(global_position).await
    }
}
