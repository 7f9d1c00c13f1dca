//! Aggregate repository: loads aggregates from snapshot + events and saves
//! their uncommitted events with optimistic concurrency.

use std::marker::PhantomData;
use std::sync::Arc;

use futures::TryStreamExt;

use crate::aggregate::{AggregateRoot, replay};
use crate::clock::{Clock, SystemClock};
use crate::command::CommandContext;
use crate::config::{DEFAULT_MAX_SAVE_ATTEMPTS, EngineConfig};
use crate::error::DomainError;
use crate::event::{DomainEvent, EventDraft};
use crate::snapshot::{NoSnapshots, Snapshot, SnapshotPolicy, SnapshotStore};
use crate::store::EventStore;
use crate::upcast::UpcasterRegistry;

/// Events decoded and applied per step of a replay.
const REPLAY_CHUNK: usize = 256;

/// An aggregate state together with the stream version it reflects.
#[derive(Debug, Clone, PartialEq)]
pub struct Loaded<A> {
    /// Reconstituted aggregate state.
    pub state: A,
    /// Version after the last applied event (0 for a new stream).
    pub version: u64,
}

/// Result of a successfully handled command.
#[derive(Debug)]
pub struct CommandOutcome<A: AggregateRoot> {
    /// State after the new events were applied.
    pub state: A,
    /// Stream version after the save.
    pub version: u64,
    /// The events produced and persisted.
    pub events: Vec<A::Event>,
    /// Load/execute/save rounds it took (1 when no conflict occurred).
    pub attempts: u32,
}

/// Loads and saves aggregates of type `A`.
pub struct AggregateRepository<A> {
    events: Arc<dyn EventStore>,
    snapshots: Arc<dyn SnapshotStore>,
    upcasters: Arc<UpcasterRegistry>,
    clock: Arc<dyn Clock>,
    policy: SnapshotPolicy,
    max_save_attempts: u32,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A> Clone for AggregateRepository<A> {
    fn clone(&self) -> Self {
        Self {
            events: Arc::clone(&self.events),
            snapshots: Arc::clone(&self.snapshots),
            upcasters: Arc::clone(&self.upcasters),
            clock: Arc::clone(&self.clock),
            policy: self.policy,
            max_save_attempts: self.max_save_attempts,
            _aggregate: PhantomData,
        }
    }
}

impl<A: AggregateRoot> AggregateRepository<A> {
    /// Creates a repository without snapshots or upcasters.
    #[must_use]
    pub fn new(events: Arc<dyn EventStore>) -> Self {
        Self {
            events,
            snapshots: Arc::new(NoSnapshots),
            upcasters: Arc::new(UpcasterRegistry::new()),
            clock: Arc::new(SystemClock),
            policy: SnapshotPolicy::disabled(),
            max_save_attempts: DEFAULT_MAX_SAVE_ATTEMPTS,
            _aggregate: PhantomData,
        }
    }

    /// Creates a repository using the snapshot and retry settings in `config`.
    #[must_use]
    pub fn from_config(
        events: Arc<dyn EventStore>,
        snapshots: Arc<dyn SnapshotStore>,
        config: &EngineConfig,
    ) -> Self {
        Self::new(events)
            .with_snapshots(
                snapshots,
                SnapshotPolicy {
                    every: config.snapshot_every,
                },
            )
            .with_max_save_attempts(config.max_save_attempts)
    }

    /// Uses `snapshots` on load and `policy` after each save.
    #[must_use]
    pub fn with_snapshots(
        mut self,
        snapshots: Arc<dyn SnapshotStore>,
        policy: SnapshotPolicy,
    ) -> Self {
        self.snapshots = snapshots;
        self.policy = policy;
        self
    }

    /// Upcasts events through `upcasters` before applying them.
    #[must_use]
    pub fn with_upcasters(mut self, upcasters: Arc<UpcasterRegistry>) -> Self {
        self.upcasters = upcasters;
        self
    }

    /// Stamps snapshots with `clock`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Bounds [`execute`](Self::execute) to `attempts` save attempts (minimum 1).
    #[must_use]
    pub fn with_max_save_attempts(mut self, attempts: u32) -> Self {
        self.max_save_attempts = attempts.max(1);
        self
    }

    /// Loads the aggregate from its latest snapshot plus the events after it.
    ///
    /// A snapshot that no longer deserializes is ignored and the stream is
    /// replayed from the start.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Upcast` or `DomainError::Serialization` if an
    /// event cannot be brought into the aggregate's shape, and
    /// `DomainError::Infrastructure` on storage failure.
    #[tracing::instrument(skip(self))]
    pub async fn load(&self, stream_id: &str) -> Result<Loaded<A>, DomainError> {
        let (state, version) = match self.snapshots.get_latest(stream_id).await? {
            Some(snapshot) => match serde_json::from_value::<A>(snapshot.state) {
                Ok(state) => (state, snapshot.version),
                Err(e) => {
                    tracing::warn!(
                        snapshot_version = snapshot.version,
                        error = %e,
                        "ignoring undecodable snapshot, replaying full stream"
                    );
                    (A::default(), 0)
                }
            },
            None => (A::default(), 0),
        };
        self.replay_from(stream_id, state, version).await
    }

    /// Loads the aggregate by replaying the whole stream, ignoring snapshots.
    ///
    /// # Errors
    ///
    /// Same as [`load`](Self::load).
    pub async fn load_without_snapshot(&self, stream_id: &str) -> Result<Loaded<A>, DomainError> {
        self.replay_from(stream_id, A::default(), 0).await
    }

    async fn replay_from(
        &self,
        stream_id: &str,
        mut state: A,
        mut version: u64,
    ) -> Result<Loaded<A>, DomainError> {
        let mut chunks = self
            .events
            .read(stream_id, version + 1)
            .try_chunks(REPLAY_CHUNK);
        while let Some(chunk) = chunks.try_next().await.map_err(|e| e.1)? {
            let mut events = Vec::with_capacity(chunk.len());
            for recorded in chunk {
                let recorded = self.upcasters.upcast_to_latest(recorded)?;
                version = recorded.stream_version;
                events.push(A::Event::from_payload(&recorded.event_type, recorded.payload)?);
            }
            state = replay(state, &events);
        }
        tracing::trace!(version, "aggregate loaded");
        Ok(Loaded { state, version })
    }

    /// Appends `events` at `loaded_version`, returning the new version.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ConcurrencyConflict` if the stream moved since
    /// it was loaded.
    pub async fn save(
        &self,
        stream_id: &str,
        loaded_version: u64,
        events: &[A::Event],
    ) -> Result<u64, DomainError> {
        self.save_with_context(stream_id, loaded_version, events, &CommandContext::default())
            .await
    }

    /// [`save`](Self::save) with correlation, causation and actor metadata.
    ///
    /// # Errors
    ///
    /// Same as [`save`](Self::save).
    pub async fn save_with_context(
        &self,
        stream_id: &str,
        loaded_version: u64,
        events: &[A::Event],
        ctx: &CommandContext,
    ) -> Result<u64, DomainError> {
        if events.is_empty() {
            return Ok(loaded_version);
        }
        let new_version = self.append(stream_id, loaded_version, events, ctx).await?;
        self.maybe_snapshot(stream_id, new_version, None).await;
        Ok(new_version)
    }

    #[tracing::instrument(skip(self, events, ctx), fields(event_count = events.len()))]
    async fn append(
        &self,
        stream_id: &str,
        expected_version: u64,
        events: &[A::Event],
        ctx: &CommandContext,
    ) -> Result<u64, DomainError> {
        let drafts = events
            .iter()
            .map(|event| {
                let draft = EventDraft::new(event.event_type(), event.to_payload()?)
                    .with_schema_version(event.schema_version());
                Ok(ctx.stamp(draft))
            })
            .collect::<Result<Vec<_>, DomainError>>()?;
        self.events.append(stream_id, expected_version, drafts).await
    }

    /// Runs a business operation with bounded optimistic retries.
    ///
    /// Loads the aggregate, runs `operation` against it, drains the
    /// uncommitted events and saves them. On a concurrency conflict the whole
    /// cycle is repeated against fresh state, up to the configured number of
    /// attempts. Operations record events without applying them; the
    /// repository applies them once they are committed.
    ///
    /// # Errors
    ///
    /// Returns whatever `operation` returns (not retried),
    /// `DomainError::Conflict` once attempts are exhausted, and any load or
    /// storage error.
    pub async fn execute<F>(
        &self,
        stream_id: &str,
        ctx: &CommandContext,
        mut operation: F,
    ) -> Result<CommandOutcome<A>, DomainError>
    where
        F: FnMut(&mut A) -> Result<(), DomainError> + Send,
    {
        let max_attempts = self.max_save_attempts;
        for attempt in 1..=max_attempts {
            let Loaded { mut state, version } = self.load(stream_id).await?;
            operation(&mut state)?;
            let events = state.take_uncommitted_events();
            if events.is_empty() {
                return Ok(CommandOutcome {
                    state,
                    version,
                    events,
                    attempts: attempt,
                });
            }

            match self.append(stream_id, version, &events, ctx).await {
                Ok(new_version) => {
                    for event in &events {
                        state.apply(event);
                    }
                    self.maybe_snapshot(stream_id, new_version, Some(&state))
                        .await;
                    return Ok(CommandOutcome {
                        state,
                        version: new_version,
                        events,
                        attempts: attempt,
                    });
                }
                Err(err) if err.is_retryable() => {
                    tracing::warn!(
                        stream_id,
                        attempt,
                        max_attempts,
                        error = %err,
                        "save conflicted, reloading and retrying"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Err(DomainError::Conflict {
            stream_id: stream_id.to_owned(),
            attempts: max_attempts,
        })
    }

    /// Takes a snapshot of the current state on explicit request.
    ///
    /// # Errors
    ///
    /// Returns load errors, `DomainError::Serialization` if the state cannot
    /// be serialized, or the snapshot store's error.
    pub async fn snapshot_now(&self, stream_id: &str) -> Result<Snapshot, DomainError> {
        let loaded = self.load(stream_id).await?;
        let snapshot = self.snapshot_of(stream_id, loaded.version, &loaded.state)?;
        self.snapshots.put(snapshot.clone()).await?;
        Ok(snapshot)
    }

    fn snapshot_of(
        &self,
        stream_id: &str,
        version: u64,
        state: &A,
    ) -> Result<Snapshot, DomainError> {
        Ok(Snapshot {
            stream_id: stream_id.to_owned(),
            version,
            state: serde_json::to_value(state)?,
            taken_at: self.clock.now(),
        })
    }

    /// Applies the snapshot policy. Failures are logged and never fail a save.
    async fn maybe_snapshot(&self, stream_id: &str, new_version: u64, state: Option<&A>) {
        if self.policy.every == 0 {
            return;
        }
        let result = async {
            let last = self
                .snapshots
                .get_latest(stream_id)
                .await?
                .map_or(0, |s| s.version);
            if !self.policy.should_snapshot(new_version, last) {
                return Ok(false);
            }
            let snapshot = match state {
                Some(state) => self.snapshot_of(stream_id, new_version, state)?,
                None => {
                    let loaded = self.load(stream_id).await?;
                    self.snapshot_of(stream_id, loaded.version, &loaded.state)?
                }
            };
            self.snapshots.put(snapshot).await?;
            Ok::<_, DomainError>(true)
        }
        .await;

        match result {
            Ok(true) => tracing::debug!(stream_id, new_version, "snapshot taken"),
            Ok(false) => {}
            Err(e) => tracing::warn!(stream_id, error = %e, "snapshot failed"),
        }
    }
}
