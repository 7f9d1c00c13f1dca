//! In-memory implementation of the `EventStore` and `OutboxStore` traits.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use keel_core::clock::{Clock, SystemClock};
use keel_core::error::DomainError;
use keel_core::event::{EventDraft, RecordedEvent};
use keel_core::store::{EventStore, EventStream, OutboxRecord, OutboxStore, paged};

/// Global positions of a stream's events; index `i` holds version `i + 1`.
type StreamPositions = Arc<Mutex<Vec<u64>>>;

#[derive(Debug, Default)]
struct GlobalLog {
    events: BTreeMap<u64, RecordedEvent>,
    /// Highest position `p` such that every position in `1..=p` is present.
    committed: u64,
}

/// Thread-safe in-memory event store with a transactional outbox.
///
/// Appends to one stream are serialized by that stream's own lock; appends
/// to different streams only meet at the atomic position counter and the
/// short global-log critical section. Events and their outbox records are
/// inserted under the same critical section, and `read_all` never reads
/// past the highest contiguous position.
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<String, StreamPositions>>,
    log: Mutex<GlobalLog>,
    outbox: Mutex<BTreeMap<u64, OutboxRecord>>,
    next_position: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for InMemoryEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryEventStore")
            .field("next_position", &self.next_position)
            .field("committed", &lock(&self.log).committed)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventStore {
    /// Creates an empty store stamping events with the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates an empty store stamping events with `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            log: Mutex::new(GlobalLog::default()),
            outbox: Mutex::new(BTreeMap::new()),
            next_position: AtomicU64::new(0),
            clock,
        }
    }

    fn existing_stream(&self, stream_id: &str) -> Option<StreamPositions> {
        self.streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(stream_id)
            .cloned()
    }

    /// The stream's handle, registering the stream only for an append that
    /// expects it to be new. A stream stays unregistered until it has an
    /// event or a writer about to append its first one.
    fn stream_handle(
        &self,
        stream_id: &str,
        expected_version: u64,
    ) -> Result<StreamPositions, DomainError> {
        if let Some(handle) = self.existing_stream(stream_id) {
            return Ok(handle);
        }
        if expected_version != 0 {
            tracing::debug!(current = 0, "version conflict");
            return Err(DomainError::ConcurrencyConflict {
                stream_id: stream_id.to_owned(),
                expected: expected_version,
                actual: 0,
            });
        }
        Ok(Arc::clone(
            self.streams
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(stream_id.to_owned())
                .or_default(),
        ))
    }

    /// Returns every outbox record, ordered by global position.
    #[must_use]
    pub fn outbox_records(&self) -> Vec<OutboxRecord> {
        lock(&self.outbox).values().cloned().collect()
    }

    /// Number of events committed across all streams.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.log).events.len()
    }

    /// Whether no event has been committed yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn update_outbox<R>(
        &self,
        global_position: u64,
        update: impl FnOnce(&mut OutboxRecord) -> R,
    ) -> Result<R, DomainError> {
        let mut outbox = lock(&self.outbox);
        let record = outbox.get_mut(&global_position).ok_or_else(|| {
            DomainError::NotFound(format!("outbox record at position {global_position}"))
        })?;
        Ok(update(record))
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
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

        let stream = self.stream_handle(stream_id, expected_version)?;
        let mut positions = lock(&stream);
        let current = positions.len() as u64;
        if current != expected_version {
            tracing::debug!(current, "version conflict");
            return Err(DomainError::ConcurrencyConflict {
                stream_id: stream_id.to_owned(),
                expected: expected_version,
                actual: current,
            });
        }

        let count = events.len() as u64;
        let first_position = self.next_position.fetch_add(count, Ordering::SeqCst) + 1;
        let recorded_at = self.clock.now();
        let recorded: Vec<RecordedEvent> = events
            .into_iter()
            .zip(0..)
            .map(|(draft, i)| {
                RecordedEvent::from_draft(
                    draft,
                    stream_id,
                    expected_version + i + 1,
                    first_position + i,
                    recorded_at,
                )
            })
            .collect();

        {
            let mut log = lock(&self.log);
            let mut outbox = lock(&self.outbox);
            for event in &recorded {
                outbox.insert(event.global_position, OutboxRecord::for_event(event));
                log.events.insert(event.global_position, event.clone());
            }
            while log.events.contains_key(&(log.committed + 1)) {
                log.committed += 1;
            }
        }
        positions.extend(recorded.iter().map(|e| e.global_position));

        let new_version = expected_version + count;
        tracing::debug!(new_version, first_position, "events appended");
        Ok(new_version)
    }

    fn read(&self, stream_id: &str, from_version: u64) -> EventStream<'_> {
        let positions: Vec<u64> = self
            .existing_stream(stream_id)
            .map(|stream| lock(&stream).clone())
            .unwrap_or_default();

        paged(
            from_version.max(1),
            |e: &RecordedEvent| e.stream_version,
            move |cursor, limit| {
                let skip = usize::try_from(cursor - 1).unwrap_or(usize::MAX);
                let log = lock(&self.log);
                let page: Vec<RecordedEvent> = positions
                    .iter()
                    .skip(skip)
                    .take(limit)
                    .filter_map(|p| log.events.get(p).cloned())
                    .collect();
                futures::future::ready(Ok(page))
            },
        )
    }

    fn read_all(&self, from_global_position: u64) -> EventStream<'_> {
        let head = lock(&self.log).committed;

        paged(
            from_global_position.max(1),
            |e: &RecordedEvent| e.global_position,
            move |cursor, limit| {
                let page: Vec<RecordedEvent> = if cursor > head {
                    Vec::new()
                } else {
                    lock(&self.log)
                        .events
                        .range(cursor..=head)
                        .take(limit)
                        .map(|(_, e)| e.clone())
                        .collect()
                };
                futures::future::ready(Ok(page))
            },
        )
    }

    async fn stream_version(&self, stream_id: &str) -> Result<u64, DomainError> {
        Ok(self
            .existing_stream(stream_id)
            .map_or(0, |stream| lock(&stream).len() as u64))
    }
}

#[async_trait]
impl OutboxStore for InMemoryEventStore {
    async fn pending(&self, after: u64, limit: usize) -> Result<Vec<OutboxRecord>, DomainError> {
        let committed = lock(&self.log).committed;
        if after >= committed {
            return Ok(Vec::new());
        }
        Ok(lock(&self.outbox)
            .range(after + 1..=committed)
            .map(|(_, r)| r)
            .filter(|r| !r.published && !r.dead_lettered)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn load_event(&self, record: &OutboxRecord) -> Result<RecordedEvent, DomainError> {
        lock(&self.log)
            .events
            .get(&record.payload_ref)
            .cloned()
            .ok_or_else(|| {
                DomainError::NotFound(format!("event at position {}", record.payload_ref))
            })
    }

    async fn mark_published(&self, global_position: u64) -> Result<(), DomainError> {
        self.update_outbox(global_position, |record| {
            record.published = true;
            record.next_attempt_at = None;
        })
    }

    async fn record_failure(
        &self,
        global_position: u64,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<u32, DomainError> {
        self.update_outbox(global_position, |record| {
            record.attempts += 1;
            record.last_error = Some(error.to_owned());
            record.next_attempt_at = Some(next_attempt_at);
            record.attempts
        })
    }

    async fn mark_dead_lettered(
        &self,
        global_position: u64,
        error: &str,
    ) -> Result<(), DomainError> {
        self.update_outbox(global_position, |record| {
            record.dead_lettered = true;
            record.last_error = Some(error.to_owned());
            record.next_attempt_at = None;
        })
    }

    async fn get(&self, global_position: u64) -> Result<Option<OutboxRecord>, DomainError> {
        Ok(lock(&self.outbox).get(&global_position).cloned())
    }
}
