//! Event store and outbox contracts.

use std::collections::VecDeque;
use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;
use crate::event::{EventDraft, RecordedEvent};

/// Number of events fetched per page by lazy reads.
pub const READ_PAGE_SIZE: usize = 256;

/// Lazy, forward-only, finite sequence of events.
pub type EventStream<'a> = BoxStream<'a, Result<RecordedEvent, DomainError>>;

/// Append-only, versioned, per-stream log with a global total order.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends `events` to `stream_id` if its current version equals
    /// `expected_version`, returning the new stream version.
    ///
    /// Event `i` receives `stream_version = expected_version + i + 1` and a
    /// fresh, strictly increasing global position. The events and their
    /// outbox records are written as one atomic unit.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ConcurrencyConflict` if the stream moved,
    /// `DomainError::Validation` for an empty batch or stream id, and
    /// `DomainError::Infrastructure` on storage failure.
    async fn append(
        &self,
        stream_id: &str,
        expected_version: u64,
        events: Vec<EventDraft>,
    ) -> Result<u64, DomainError>;

    /// Reads `stream_id` from `from_version` (1-based) up to the head
    /// observed when reading starts. A fresh call re-reads from the offset.
    fn read(&self, stream_id: &str, from_version: u64) -> EventStream<'_>;

    /// Reads every stream in global order starting at `from_global_position`
    /// (inclusive). Never yields a position while a lower one could still
    /// appear, so repeated calls see a stable order.
    fn read_all(&self, from_global_position: u64) -> EventStream<'_>;

    /// Returns the current version of `stream_id` (0 if it does not exist).
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` on storage failure.
    async fn stream_version(&self, stream_id: &str) -> Result<u64, DomainError>;
}

/// Delivery state of one committed event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxRecord {
    /// The event this record delivers.
    pub event_id: Uuid,
    /// Global position of the event.
    pub global_position: u64,
    /// Stream of the event, used to keep per-stream delivery order.
    pub stream_id: String,
    /// Reference used to load the payload (the event's global position).
    pub payload_ref: u64,
    /// Whether the relay has delivered the event.
    pub published: bool,
    /// Failed delivery attempts so far.
    pub attempts: u32,
    /// Error from the most recent failed attempt.
    pub last_error: Option<String>,
    /// Earliest time the next attempt may run.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Whether the record was routed to the dead-letter sink.
    pub dead_lettered: bool,
    /// Time the record was written.
    pub created_at: DateTime<Utc>,
}

impl OutboxRecord {
    /// Builds the pending record for a freshly appended event.
    #[must_use]
    pub fn for_event(event: &RecordedEvent) -> Self {
        Self {
            event_id: event.event_id,
            global_position: event.global_position,
            stream_id: event.stream_id.clone(),
            payload_ref: event.global_position,
            published: false,
            attempts: 0,
            last_error: None,
            next_attempt_at: None,
            dead_lettered: false,
            created_at: event.recorded_at,
        }
    }

    /// Whether the backoff deadline (if any) has passed.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.is_none_or(|at| at <= now)
    }
}

/// Outbox side of an event store. Implemented by the same backend as
/// [`EventStore`] so records are written in the append transaction.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Up to `limit` unpublished, not dead-lettered records with a global
    /// position above `after`, ordered by global position. Pass 0 to start
    /// from the oldest record.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` on storage failure.
    async fn pending(&self, after: u64, limit: usize) -> Result<Vec<OutboxRecord>, DomainError>;

    /// Dereferences `record.payload_ref` to the committed event.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::NotFound` if the event is missing.
    async fn load_event(&self, record: &OutboxRecord) -> Result<RecordedEvent, DomainError>;

    /// Marks the record at `global_position` as delivered.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::NotFound` for an unknown position.
    async fn mark_published(&self, global_position: u64) -> Result<(), DomainError>;

    /// Records a failed attempt and returns the new attempt count.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::NotFound` for an unknown position.
    async fn record_failure(
        &self,
        global_position: u64,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<u32, DomainError>;

    /// Retires the record after it was handed to the dead-letter sink.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::NotFound` for an unknown position.
    async fn mark_dead_lettered(&self, global_position: u64, error: &str)
    -> Result<(), DomainError>;

    /// Returns the record at `global_position`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` on storage failure.
    async fn get(&self, global_position: u64) -> Result<Option<OutboxRecord>, DomainError>;
}

struct Pager<F> {
    fetch: F,
    cursor: u64,
    buffer: VecDeque<RecordedEvent>,
    exhausted: bool,
}

/// Turns a page fetcher into a lazy [`EventStream`].
///
/// `fetch(cursor, limit)` returns up to `limit` events whose key is
/// `>= cursor`, ordered by key; `key` extracts that key from an event. A
/// short page ends the stream.
pub fn paged<'a, F, Fut>(start: u64, key: fn(&RecordedEvent) -> u64, fetch: F) -> EventStream<'a>
where
    F: FnMut(u64, usize) -> Fut + Send + 'a,
    Fut: Future<Output = Result<Vec<RecordedEvent>, DomainError>> + Send + 'a,
{
    let pager = Pager {
        fetch,
        cursor: start,
        buffer: VecDeque::new(),
        exhausted: false,
    };
    futures::stream::try_unfold(pager, move |mut pager| async move {
        if pager.buffer.is_empty() && !pager.exhausted {
            let page = (pager.fetch)(pager.cursor, READ_PAGE_SIZE).await?;
            if page.len() < READ_PAGE_SIZE {
                pager.exhausted = true;
            }
            pager.buffer.extend(page);
        }
        match pager.buffer.pop_front() {
            Some(event) => {
                pager.cursor = key(&event) + 1;
                Ok(Some((event, pager)))
            }
            None => Ok(None),
        }
    })
    .boxed()
}
