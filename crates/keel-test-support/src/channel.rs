//! Message channel doubles: a recorder and a channel that fails on demand.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use keel_core::channel::MessageChannel;
use keel_core::error::PublishError;
use keel_core::event::RecordedEvent;
use uuid::Uuid;

/// A channel that accepts every event and remembers it.
#[derive(Debug, Default)]
pub struct RecordingChannel {
    delivered: Mutex<Vec<RecordedEvent>>,
}

impl RecordingChannel {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event sent so far, in send order (duplicates included).
    pub fn delivered(&self) -> Vec<RecordedEvent> {
        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Global positions of every event sent so far, in send order.
    pub fn delivered_positions(&self) -> Vec<u64> {
        self.delivered().iter().map(|e| e.global_position).collect()
    }
}

#[async_trait]
impl MessageChannel for RecordingChannel {
    async fn send(&self, event: &RecordedEvent) -> Result<(), PublishError> {
        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }
}

/// A channel that rejects the first `failures_per_event` sends of each
/// event, and every send of a poisoned event type.
#[derive(Debug, Default)]
pub struct FlakyChannel {
    failures_per_event: u32,
    poisoned_types: HashSet<String>,
    attempts: Mutex<HashMap<Uuid, u32>>,
    delivered: RecordingChannel,
}

impl FlakyChannel {
    /// Creates a channel failing each event `failures_per_event` times
    /// before accepting it.
    #[must_use]
    pub fn new(failures_per_event: u32) -> Self {
        Self {
            failures_per_event,
            ..Self::default()
        }
    }

    /// Rejects every event of `event_type`, forever.
    #[must_use]
    pub fn poison(mut self, event_type: impl Into<String>) -> Self {
        self.poisoned_types.insert(event_type.into());
        self
    }

    /// Sends attempted for `event_id`, successful or not.
    pub fn attempts_for(&self, event_id: Uuid) -> u32 {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event_id)
            .copied()
            .unwrap_or(0)
    }

    /// Events the channel accepted, in order.
    pub fn delivered(&self) -> Vec<RecordedEvent> {
        self.delivered.delivered()
    }

    /// Global positions of accepted events, in order.
    pub fn delivered_positions(&self) -> Vec<u64> {
        self.delivered.delivered_positions()
    }
}

#[async_trait]
impl MessageChannel for FlakyChannel {
    async fn send(&self, event: &RecordedEvent) -> Result<(), PublishError> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
            let count = attempts.entry(event.event_id).or_insert(0);
            *count += 1;
            *count
        };
        if self.poisoned_types.contains(&event.event_type) {
            return Err(PublishError::new(format!(
                "{} is rejected by the broker",
                event.event_type
            )));
        }
        if attempt <= self.failures_per_event {
            return Err(PublishError::new(format!("broker unavailable (attempt {attempt})")));
        }
        self.delivered.send(event).await
    }
}
