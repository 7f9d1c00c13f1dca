//! Event store doubles for exercising failure and conflict paths.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use keel_core::error::DomainError;
use keel_core::event::EventDraft;
use keel_core::store::{EventStore, EventStream};

/// An event store that always returns an infrastructure error. Useful for
/// testing error-handling paths.
#[derive(Debug)]
pub struct FailingEventStore;

fn connection_refused() -> DomainError {
    DomainError::Infrastructure("connection refused".into())
}

#[async_trait]
impl EventStore for FailingEventStore {
    async fn append(
        &self,
        _stream_id: &str,
        _expected_version: u64,
        _events: Vec<EventDraft>,
    ) -> Result<u64, DomainError> {
        Err(connection_refused())
    }

    fn read(&self, _stream_id: &str, _from_version: u64) -> EventStream<'_> {
        futures::stream::once(async { Err(connection_refused()) }).boxed()
    }

    fn read_all(&self, _from_global_position: u64) -> EventStream<'_> {
        futures::stream::once(async { Err(connection_refused()) }).boxed()
    }

    async fn stream_version(&self, _stream_id: &str) -> Result<u64, DomainError> {
        Err(connection_refused())
    }
}

type DraftFactory = Box<dyn Fn() -> EventDraft + Send + Sync>;

/// Wraps a real store and lets a simulated concurrent writer win the race
/// for the next `conflicts` appends.
///
/// Before forwarding such an append, the wrapper commits an interfering
/// event to the same stream at its current version, so the caller's append
/// fails with `DomainError::ConcurrencyConflict` exactly as it would against
/// a competing process.
pub struct ConflictingEventStore {
    inner: Arc<dyn EventStore>,
    remaining: AtomicU32,
    append_calls: AtomicU32,
    interfering: DraftFactory,
}

impl std::fmt::Debug for ConflictingEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictingEventStore")
            .field("remaining", &self.remaining)
            .field("append_calls", &self.append_calls)
            .finish_non_exhaustive()
    }
}

impl ConflictingEventStore {
    /// Creates a wrapper that forces `conflicts` appends to conflict by
    /// first writing `interfering()` to the stream.
    pub fn new(
        inner: Arc<dyn EventStore>,
        conflicts: u32,
        interfering: impl Fn() -> EventDraft + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner,
            remaining: AtomicU32::new(conflicts),
            append_calls: AtomicU32::new(0),
            interfering: Box::new(interfering),
        }
    }

    /// Number of appends callers have attempted through this wrapper.
    pub fn append_calls(&self) -> u32 {
        self.append_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventStore for ConflictingEventStore {
    async fn append(
        &self,
        stream_id: &str,
        expected_version: u64,
        events: Vec<EventDraft>,
    ) -> Result<u64, DomainError> {
        self.append_calls.fetch_add(1, Ordering::SeqCst);
        let interfere = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if interfere {
            let current = self.inner.stream_version(stream_id).await?;
            self.inner
                .append(stream_id, current, vec![(self.interfering)()])
                .await?;
        }
        self.inner.append(stream_id, expected_version, events).await
    }

    fn read(&self, stream_id: &str, from_version: u64) -> EventStream<'_> {
        self.inner.read(stream_id, from_version)
    }

    fn read_all(&self, from_global_position: u64) -> EventStream<'_> {
        self.inner.read_all(from_global_position)
    }

    async fn stream_version(&self, stream_id: &str) -> Result<u64, DomainError> {
        self.inner.stream_version(stream_id).await
    }
}
