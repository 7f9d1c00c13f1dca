//! Dead-letter routing for events that exhausted their retries.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::RecordedEvent;

/// Which pipeline stage gave up on the event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeadLetterSource {
    /// The outbox relay could not publish it.
    Outbox,
    /// A projection consumer could not apply it.
    Projection {
        /// The consumer group that gave up.
        consumer_id: String,
    },
}

/// An event that was routed away from normal processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Stage that gave up.
    pub source: DeadLetterSource,
    /// Id of the event.
    pub event_id: Uuid,
    /// Global position of the event.
    pub global_position: u64,
    /// Type tag of the event.
    pub event_type: String,
    /// Attempts made before giving up.
    pub attempts: u32,
    /// Last error seen.
    pub reason: String,
}

impl DeadLetter {
    /// Builds a dead letter for `event`.
    pub fn new(
        source: DeadLetterSource,
        event: &RecordedEvent,
        attempts: u32,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            source,
            event_id: event.event_id,
            global_position: event.global_position,
            event_type: event.event_type.clone(),
            attempts,
            reason: reason.into(),
        }
    }
}

/// Operator-visible destination for dead letters.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Takes ownership of a dead letter. Must not fail: a sink that cannot
    /// persist is expected to log instead.
    async fn dead_letter(&self, letter: DeadLetter);
}

/// Sink that reports dead letters through `tracing` at error level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingDeadLetterSink;

#[async_trait]
impl DeadLetterSink for TracingDeadLetterSink {
    async fn dead_letter(&self, letter: DeadLetter) {
        tracing::error!(
            source = ?letter.source,
            event_id = %letter.event_id,
            global_position = letter.global_position,
            event_type = %letter.event_type,
            attempts = letter.attempts,
            reason = %letter.reason,
            "event dead-lettered"
        );
    }
}

/// Sink that keeps dead letters in memory and logs them.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterSink {
    letters: Mutex<Vec<DeadLetter>>,
}

impl InMemoryDeadLetterSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every dead letter received so far.
    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn dead_letter(&self, letter: DeadLetter) {
        TracingDeadLetterSink.dead_letter(letter.clone()).await;
        self.letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(letter);
    }
}
