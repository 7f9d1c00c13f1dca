//! The outbox relay loop.
//!
//! Each tick pages through pending outbox records in global order and
//! publishes the due ones. A failed record gets a backoff deadline and holds
//! back the rest of its stream until it is delivered or dead-lettered, so
//! per-stream delivery order is preserved while other streams keep flowing.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use chrono::{DateTime, Utc};
use keel_core::channel::MessageChannel;
use keel_core::clock::{Clock, SystemClock};
use keel_core::config::RelayConfig;
use keel_core::dead_letter::{DeadLetter, DeadLetterSink, DeadLetterSource, TracingDeadLetterSink};
use keel_core::error::{DomainError, PublishError};
use keel_core::event::RecordedEvent;
use keel_core::store::{OutboxRecord, OutboxStore};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Errors surfaced when stopping a spawned relay.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The relay task panicked.
    #[error("relay task panicked")]
    TaskPanicked,
}

/// What one relay tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayReport {
    /// Records delivered and marked published.
    pub published: usize,
    /// Records whose delivery failed and were scheduled for retry.
    pub failed: usize,
    /// Records handed to the dead-letter sink.
    pub dead_lettered: usize,
    /// Records skipped because they or an earlier record of their stream
    /// are waiting out a backoff.
    pub deferred: usize,
}

impl RelayReport {
    /// Whether the tick made any delivery attempt.
    #[must_use]
    pub fn attempted(&self) -> bool {
        self.attempts() > 0
    }

    fn attempts(&self) -> usize {
        self.published + self.failed + self.dead_lettered
    }

    fn absorb(&mut self, other: Self) {
        self.published += other.published;
        self.failed += other.failed;
        self.dead_lettered += other.dead_lettered;
        self.deferred = other.deferred;
    }
}

/// Moves committed events from the outbox to a message channel.
pub struct OutboxRelay {
    outbox: Arc<dyn OutboxStore>,
    channel: Arc<dyn MessageChannel>,
    dead_letters: Arc<dyn DeadLetterSink>,
    clock: Arc<dyn Clock>,
    config: RelayConfig,
}

impl std::fmt::Debug for OutboxRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxRelay")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OutboxRelay {
    /// Creates a relay that logs dead letters and uses the system clock.
    #[must_use]
    pub fn new(
        outbox: Arc<dyn OutboxStore>,
        channel: Arc<dyn MessageChannel>,
        config: RelayConfig,
    ) -> Self {
        Self {
            outbox,
            channel,
            dead_letters: Arc::new(TracingDeadLetterSink),
            clock: Arc::new(SystemClock),
            config,
        }
    }

    /// Routes exhausted records to `sink`.
    #[must_use]
    pub fn with_dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = sink;
        self
    }

    /// Reads backoff deadlines from `clock`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Delay before the retry following the `attempts`-th failure.
    fn backoff_delay(&self, attempts: u32) -> Duration {
        ExponentialBuilder::default()
            .with_min_delay(self.config.backoff_min)
            .with_max_delay(self.config.backoff_max)
            .with_max_times(usize::try_from(attempts.max(1)).unwrap_or(usize::MAX))
            .build()
            .last()
            .unwrap_or(self.config.backoff_min)
    }

    fn retry_at(&self, now: DateTime<Utc>, attempts: u32) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.backoff_delay(attempts))
            .unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Runs one relay tick.
    ///
    /// A tick pages through the pending records in global order until it has
    /// made `batch_size` delivery attempts or reached the end of the outbox.
    /// Records held back behind a failure of their stream do not count
    /// towards the batch, so a stuck stream cannot starve the others.
    ///
    /// # Errors
    ///
    /// Returns the outbox store's error. A store failure after a successful
    /// send leaves the record pending, so the event is sent again on a later
    /// tick.
    #[tracing::instrument(skip(self))]
    pub async fn run_once(&self) -> Result<RelayReport, DomainError> {
        let now = self.clock.now();
        let batch_size = self.config.batch_size.max(1);
        let mut report = RelayReport::default();
        let mut held_back: HashSet<String> = HashSet::new();
        let mut cursor = 0;

        loop {
            let page = self.outbox.pending(cursor, batch_size).await?;
            let Some(last) = page.last() else {
                break;
            };
            cursor = last.global_position;
            let exhausted = page.len() < batch_size;

            for record in page {
                if report.attempts() >= batch_size {
                    return Ok(report);
                }
                if held_back.contains(&record.stream_id) || !record.is_due(now) {
                    held_back.insert(record.stream_id.clone());
                    report.deferred += 1;
                    continue;
                }
                self.deliver(&record, now, &mut held_back, &mut report).await?;
            }

            if exhausted {
                break;
            }
        }

        Ok(report)
    }

    async fn deliver(
        &self,
        record: &OutboxRecord,
        now: DateTime<Utc>,
        held_back: &mut HashSet<String>,
        report: &mut RelayReport,
    ) -> Result<(), DomainError> {
        let event = self.outbox.load_event(record).await?;
        match self.channel.send(&event).await {
            Ok(()) => {
                self.outbox.mark_published(record.global_position).await?;
                tracing::debug!(
                    global_position = record.global_position,
                    event_type = %event.event_type,
                    "event published"
                );
                report.published += 1;
            }
            Err(err) => {
                if self.handle_failure(record, &event, &err, now).await? {
                    report.dead_lettered += 1;
                } else {
                    held_back.insert(record.stream_id.clone());
                    report.failed += 1;
                }
            }
        }
        Ok(())
    }

    /// Records a failed send. Returns `true` if the record was dead-lettered.
    async fn handle_failure(
        &self,
        record: &OutboxRecord,
        event: &RecordedEvent,
        err: &PublishError,
        now: DateTime<Utc>,
    ) -> Result<bool, DomainError> {
        let next_attempt_at = self.retry_at(now, record.attempts + 1);
        let attempts = self
            .outbox
            .record_failure(record.global_position, &err.message, next_attempt_at)
            .await?;

        if attempts >= self.config.max_attempts {
            self.dead_letters
                .dead_letter(DeadLetter::new(
                    DeadLetterSource::Outbox,
                    event,
                    attempts,
                    err.message.clone(),
                ))
                .await;
            self.outbox
                .mark_dead_lettered(record.global_position, &err.message)
                .await?;
            return Ok(true);
        }

        tracing::warn!(
            global_position = record.global_position,
            stream_id = %record.stream_id,
            attempts,
            max_attempts = self.config.max_attempts,
            %next_attempt_at,
            error = %err,
            "publish failed, will retry"
        );
        Ok(false)
    }

    /// Runs ticks until one makes no delivery attempt, returning the
    /// combined report. Records still waiting out a backoff are left pending.
    ///
    /// # Errors
    ///
    /// Same as [`run_once`](Self::run_once).
    pub async fn run_until_idle(&self) -> Result<RelayReport, DomainError> {
        let mut total = RelayReport::default();
        loop {
            let report = self.run_once().await?;
            total.absorb(report);
            if !report.attempted() {
                return Ok(total);
            }
        }
    }

    /// Runs the relay on a background task, ticking every
    /// `config.poll_interval`, until [`RelayHandle::stop`] is called.
    ///
    /// A tick in progress always completes before the task exits.
    #[must_use]
    pub fn spawn(self) -> RelayHandle {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let poll_interval = self.config.poll_interval;

        let task = tokio::spawn(async move {
            tracing::info!(?poll_interval, "outbox relay started");
            loop {
                match self.run_once().await {
                    Ok(report) if report.attempted() => {
                        tracing::debug!(?report, "relay tick");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "relay tick failed"),
                }

                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    () = tokio::time::sleep(poll_interval) => {}
                }
            }
            tracing::info!("outbox relay stopped");
        });

        RelayHandle {
            stop_tx: Some(stop_tx),
            task,
        }
    }
}

/// Handle to a spawned relay.
///
/// Dropping the handle also stops the relay once its current tick is done,
/// but without waiting for it. Call [`stop`](Self::stop) for graceful
/// shutdown.
#[derive(Debug)]
pub struct RelayHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl RelayHandle {
    /// Signals the relay to stop after its current tick and waits for it.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::TaskPanicked` if the task panicked.
    pub async fn stop(mut self) -> Result<(), RelayError> {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        self.task.await.map_err(|_| RelayError::TaskPanicked)
    }

    /// Whether the relay task is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;

    struct NoOutbox;

    #[async_trait]
    impl OutboxStore for NoOutbox {
        async fn pending(
            &self,
            _after: u64,
            _limit: usize,
        ) -> Result<Vec<OutboxRecord>, DomainError> {
            Ok(vec![])
        }

        async fn load_event(&self, _record: &OutboxRecord) -> Result<RecordedEvent, DomainError> {
            Err(DomainError::NotFound("event".into()))
        }

        async fn mark_published(&self, _global_position: u64) -> Result<(), DomainError> {
            Ok(())
        }

        async fn record_failure(
            &self,
            _global_position: u64,
            _error: &str,
            _next_attempt_at: DateTime<Utc>,
        ) -> Result<u32, DomainError> {
            Ok(1)
        }

        async fn mark_dead_lettered(
            &self,
            _global_position: u64,
            _error: &str,
        ) -> Result<(), DomainError> {
            Ok(())
        }

        async fn get(&self, _global_position: u64) -> Result<Option<OutboxRecord>, DomainError> {
            Ok(None)
        }
    }

    struct NullChannel;

    #[async_trait]
    impl MessageChannel for NullChannel {
        async fn send(&self, _event: &RecordedEvent) -> Result<(), PublishError> {
            Ok(())
        }
    }

    fn relay(min_ms: u64, max_ms: u64) -> OutboxRelay {
        OutboxRelay::new(
            Arc::new(NoOutbox),
            Arc::new(NullChannel),
            RelayConfig {
                backoff_min: Duration::from_millis(min_ms),
                backoff_max: Duration::from_millis(max_ms),
                ..RelayConfig::default()
            },
        )
    }

    #[test]
    fn test_backoff_doubles_from_minimum() {
        let relay = relay(100, 10_000);

        assert_eq!(relay.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(relay.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(relay.backoff_delay(3), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_is_capped() {
        let relay = relay(100, 1_000);

        assert_eq!(relay.backoff_delay(20), Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn test_empty_outbox_tick_attempts_nothing() {
        let report = relay(1, 1).run_once().await.unwrap();

        assert_eq!(report, RelayReport::default());
        assert!(!report.attempted());
    }

    #[tokio::test]
    async fn test_spawned_relay_stops_cleanly() {
        let handle = relay(1, 1).spawn();
        assert!(handle.is_running());

        handle.stop().await.unwrap();
    }
}
