//! The projection engine.
//!
//! An engine owns one read model and one checkpoint. Each run takes the
//! next batch from an [`EventSource`], dispatches every event to the
//! handlers registered for its type, and persists the checkpoint covering
//! the events it got through. The checkpoint carries the serialized read
//! model, so both are written in one store call and a restarted engine
//! resumes with the model that matches its position. A handler failure
//! stops the batch at the failing event; the [`FailurePolicy`] decides
//! whether that event is eventually dead-lettered or retried forever.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use keel_core::checkpoint::{Checkpoint, CheckpointStore};
use keel_core::config::ProjectionConfig;
use keel_core::dead_letter::{DeadLetter, DeadLetterSink, DeadLetterSource, TracingDeadLetterSink};
use keel_core::error::{DomainError, ProjectionError};
use keel_core::event::RecordedEvent;
use keel_core::upcast::UpcasterRegistry;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;

use crate::source::EventSource;

/// Applies one event to the read model.
pub type Handler<RM> =
    Box<dyn Fn(&mut RM, &RecordedEvent) -> Result<(), ProjectionError> + Send + Sync>;

/// What to do with an event whose handler keeps failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Dead-letter the event after this many consecutive failures and move on.
    DeadLetterAfter(u32),
    /// Retry the event on every run until it succeeds.
    Block,
}

impl FailurePolicy {
    /// Derives the policy from projection settings.
    #[must_use]
    pub fn from_config(config: &ProjectionConfig) -> Self {
        if config.block_on_failure {
            Self::Block
        } else {
            Self::DeadLetterAfter(config.max_handler_attempts.max(1))
        }
    }
}

/// Errors surfaced when stopping a spawned projection.
#[derive(Debug, Error)]
pub enum ProjectionTaskError {
    /// The projection task panicked.
    #[error("projection task panicked")]
    TaskPanicked,
}

/// What one run of the engine did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProjectionReport {
    /// Events applied to the read model, including ones with no handler.
    pub applied: usize,
    /// Events at or below the checkpoint that were skipped.
    pub duplicates: usize,
    /// Events routed to the dead-letter sink.
    pub dead_lettered: usize,
    /// Whether the run stopped at a failing event.
    pub failed: bool,
    /// Checkpoint after the run.
    pub position: u64,
}

impl ProjectionReport {
    /// Whether the run moved the checkpoint.
    #[must_use]
    pub fn progressed(&self) -> bool {
        self.applied + self.dead_lettered > 0
    }
}

struct State<RM> {
    read_model: RM,
    /// `None` until the checkpoint has been loaded.
    position: Option<u64>,
    /// Global position of the event currently failing, with its
    /// consecutive failure count.
    failing: Option<(u64, u32)>,
}

/// Builds a read model from events in global order.
pub struct ProjectionEngine<RM> {
    consumer_id: String,
    handlers: HashMap<String, Vec<Handler<RM>>>,
    upcasters: UpcasterRegistry,
    checkpoints: Arc<dyn CheckpointStore>,
    dead_letters: Arc<dyn DeadLetterSink>,
    policy: FailurePolicy,
    batch_size: usize,
    poll_interval: Duration,
    state: Mutex<State<RM>>,
}

impl<RM> std::fmt::Debug for ProjectionEngine<RM> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionEngine")
            .field("consumer_id", &self.consumer_id)
            .field("event_types", &self.handlers.keys().collect::<Vec<_>>())
            .field("policy", &self.policy)
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl<RM> ProjectionEngine<RM>
where
    RM: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Creates an engine for the consumer group `consumer_id`.
    ///
    /// `read_model` is the empty model. If `checkpoints` holds a checkpoint
    /// for the consumer, the engine replaces it with the stored model and
    /// resumes after the stored position. A checkpoint without a readable
    /// model is ignored and the projection is rebuilt from the start.
    pub fn new(
        consumer_id: impl Into<String>,
        read_model: RM,
        checkpoints: Arc<dyn CheckpointStore>,
        config: &ProjectionConfig,
    ) -> Self {
        Self {
            consumer_id: consumer_id.into(),
            handlers: HashMap::new(),
            upcasters: UpcasterRegistry::new(),
            checkpoints,
            dead_letters: Arc::new(TracingDeadLetterSink),
            policy: FailurePolicy::from_config(config),
            batch_size: config.batch_size.max(1),
            poll_interval: config.poll_interval,
            state: Mutex::new(State {
                read_model,
                position: None,
                failing: None,
            }),
        }
    }

    /// Adds a handler for `event_type`. Handlers for the same type run in
    /// registration order.
    pub fn register<F>(&mut self, event_type: impl Into<String>, handler: F)
    where
        F: Fn(&mut RM, &RecordedEvent) -> Result<(), ProjectionError> + Send + Sync + 'static,
    {
        self.handlers
            .entry(event_type.into())
            .or_default()
            .push(Box::new(handler));
    }

    /// Builder form of [`register`](Self::register).
    #[must_use]
    pub fn on<F>(mut self, event_type: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut RM, &RecordedEvent) -> Result<(), ProjectionError> + Send + Sync + 'static,
    {
        self.register(event_type, handler);
        self
    }

    /// Upcasts events with `upcasters` before dispatching them.
    #[must_use]
    pub fn with_upcasters(mut self, upcasters: UpcasterRegistry) -> Self {
        self.upcasters = upcasters;
        self
    }

    /// Routes abandoned events to `sink`.
    #[must_use]
    pub fn with_dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = sink;
        self
    }

    /// Overrides the failure policy derived from the configuration.
    #[must_use]
    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The consumer group this engine checkpoints under.
    #[must_use]
    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    /// A copy of the current read model.
    pub async fn read_model(&self) -> RM {
        self.state.lock().await.read_model.clone()
    }

    /// Global position of the last event applied or dead-lettered.
    ///
    /// # Errors
    ///
    /// Returns the checkpoint store's error if the checkpoint has not been
    /// loaded yet and loading it fails.
    pub async fn checkpoint(&self) -> Result<u64, DomainError> {
        let mut state = self.state.lock().await;
        self.resume(&mut state).await
    }

    async fn resume(&self, state: &mut State<RM>) -> Result<u64, DomainError> {
        if let Some(position) = state.position {
            return Ok(position);
        }
        let stored = self.checkpoints.load(&self.consumer_id).await?;
        let position = match stored {
            None
            | Some(Checkpoint {
                last_global_position_applied: 0,
                ..
            }) => 0,
            Some(Checkpoint {
                last_global_position_applied: position,
                read_model: Some(saved),
                ..
            }) => match serde_json::from_value::<RM>(saved) {
                Ok(read_model) => {
                    state.read_model = read_model;
                    position
                }
                Err(e) => {
                    tracing::warn!(
                        consumer_id = %self.consumer_id,
                        position,
                        error = %e,
                        "stored read model unreadable, rebuilding"
                    );
                    0
                }
            },
            Some(Checkpoint {
                last_global_position_applied: position,
                read_model: None,
                ..
            }) => {
                tracing::warn!(
                    consumer_id = %self.consumer_id,
                    position,
                    "checkpoint has no read model, rebuilding"
                );
                0
            }
        };
        tracing::info!(consumer_id = %self.consumer_id, position, "projection resumed");
        state.position = Some(position);
        Ok(position)
    }

    /// Writes `read_model` and `position` to the checkpoint store together.
    async fn persist(&self, read_model: &RM, position: u64) -> Result<(), DomainError> {
        self.checkpoints
            .save(&Checkpoint {
                consumer_id: self.consumer_id.clone(),
                last_global_position_applied: position,
                read_model: Some(serde_json::to_value(read_model)?),
            })
            .await
    }

    fn dispatch(&self, read_model: &mut RM, event: RecordedEvent) -> Result<(), ProjectionError> {
        let Some(handlers) = self.handlers.get(&event.event_type) else {
            return Ok(());
        };
        let event = self.upcasters.upcast_to_latest(event)?;
        for handler in handlers {
            handler(read_model, &event)?;
        }
        Ok(())
    }

    /// Processes the next batch from `source`.
    ///
    /// Events are applied to a working copy of the read model, and an event
    /// whose handlers fail leaves no trace in it. The copy and the
    /// checkpoint covering exactly the events applied or dead-lettered are
    /// persisted together once per run; only then does the engine adopt
    /// them. A failing event stops the run; the next run starts with it
    /// again.
    ///
    /// # Errors
    ///
    /// Returns the source's or the checkpoint store's error, or
    /// `DomainError::Serialization` if the read model cannot be serialized.
    /// The engine's read model and position are unchanged in that case.
    /// Handler failures are reported in [`ProjectionReport::failed`], not as
    /// errors.
    #[tracing::instrument(skip(self, source), fields(consumer_id = %self.consumer_id))]
    pub async fn run_once<S>(&self, source: &mut S) -> Result<ProjectionReport, DomainError>
    where
        S: EventSource + ?Sized,
    {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let start = self.resume(state).await?;
        let batch = source.next_batch(start, self.batch_size).await?;

        let mut working = state.read_model.clone();
        let mut position = start;
        let mut report = ProjectionReport::default();
        for event in batch {
            let global_position = event.global_position;
            if global_position <= position {
                report.duplicates += 1;
                continue;
            }
            let snapshot = event.clone();

            // A failing handler may have touched the model; keep it only
            // once every handler for the event succeeded.
            let mut next = working.clone();
            match self.dispatch(&mut next, event) {
                Ok(()) => {
                    working = next;
                    position = global_position;
                    state.failing = None;
                    report.applied += 1;
                }
                Err(err) => {
                    let attempts = match state.failing {
                        Some((failing, count)) if failing == global_position => count + 1,
                        _ => 1,
                    };
                    match self.policy {
                        FailurePolicy::DeadLetterAfter(max) if attempts >= max => {
                            self.dead_letters
                                .dead_letter(DeadLetter::new(
                                    DeadLetterSource::Projection {
                                        consumer_id: self.consumer_id.clone(),
                                    },
                                    &snapshot,
                                    attempts,
                                    err.message,
                                ))
                                .await;
                            position = global_position;
                            state.failing = None;
                            report.dead_lettered += 1;
                        }
                        _ => {
                            tracing::warn!(
                                global_position,
                                event_type = %snapshot.event_type,
                                attempts,
                                error = %err,
                                "projection handler failed"
                            );
                            state.failing = Some((global_position, attempts));
                            report.failed = true;
                            break;
                        }
                    }
                }
            }
        }

        if position > start {
            self.persist(&working, position).await?;
            state.read_model = working;
            state.position = Some(position);
            tracing::debug!(from = start, to = position, "checkpoint advanced");
        }
        report.position = position;
        Ok(report)
    }

    /// Runs until a batch makes no progress, returning the combined report.
    ///
    /// # Errors
    ///
    /// Same as [`run_once`](Self::run_once).
    pub async fn run_until_idle<S>(&self, source: &mut S) -> Result<ProjectionReport, DomainError>
    where
        S: EventSource + ?Sized,
    {
        let mut total = ProjectionReport::default();
        loop {
            let report = self.run_once(source).await?;
            total.applied += report.applied;
            total.duplicates += report.duplicates;
            total.dead_lettered += report.dead_lettered;
            total.failed = report.failed;
            total.position = report.position;
            if !report.progressed() || report.failed {
                return Ok(total);
            }
        }
    }

    /// Runs the engine on a background task until
    /// [`ProjectionHandle::stop`] is called. Batches run back to back while
    /// the source has events; once caught up, the task polls every
    /// `poll_interval`.
    #[must_use]
    pub fn spawn<S>(self: Arc<Self>, mut source: S) -> ProjectionHandle
    where
        S: EventSource + 'static,
    {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let poll_interval = self.poll_interval;

        let task = tokio::spawn(async move {
            tracing::info!(consumer_id = %self.consumer_id, "projection started");
            loop {
                let busy = match self.run_once(&mut source).await {
                    Ok(report) => report.progressed() && !report.failed,
                    Err(e) => {
                        tracing::warn!(
                            consumer_id = %self.consumer_id,
                            error = %e,
                            "projection run failed"
                        );
                        false
                    }
                };

                if busy {
                    if stop_rx.try_recv().is_ok() {
                        break;
                    }
                    tokio::task::yield_now().await;
                    continue;
                }

                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    () = tokio::time::sleep(poll_interval) => {}
                }
            }
            tracing::info!(consumer_id = %self.consumer_id, "projection stopped");
        });

        ProjectionHandle {
            stop_tx: Some(stop_tx),
            task,
        }
    }
}

/// Handle to a spawned projection.
///
/// Dropping the handle also stops the projection once its current batch
/// is done, but without waiting for it.
#[derive(Debug)]
pub struct ProjectionHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ProjectionHandle {
    /// Signals the projection to stop after its current batch and waits
    /// for it.
    ///
    /// # Errors
    ///
    /// Returns `ProjectionTaskError::TaskPanicked` if the task panicked.
    pub async fn stop(mut self) -> Result<(), ProjectionTaskError> {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        self.task.await.map_err(|_| ProjectionTaskError::TaskPanicked)
    }

    /// Whether the projection task is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}
