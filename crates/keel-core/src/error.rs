//! Error types shared across the engine.

use thiserror::Error;

/// Top-level error type returned by stores and the aggregate repository.
#[derive(Debug, Error)]
pub enum DomainError {
    /// Optimistic concurrency conflict: the stream moved since it was loaded.
    #[error(
        "concurrency conflict on stream {stream_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        /// The stream that had the conflict.
        stream_id: String,
        /// The version the caller expected.
        expected: u64,
        /// The stream's current version at write time.
        actual: u64,
    },

    /// A command could not commit after exhausting its conflict retries.
    #[error("conflict on stream {stream_id} after {attempts} attempts, please retry")]
    Conflict {
        /// The contended stream.
        stream_id: String,
        /// How many save attempts were made.
        attempts: u32,
    },

    /// A validation error in domain logic or caller input.
    #[error("validation error: {0}")]
    Validation(String),

    /// A requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An infrastructure/persistence error.
    #[error("infrastructure error: {0}")]
    Infrastructure(String),

    /// A payload or snapshot could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An older event could not be brought up to its latest schema.
    #[error(transparent)]
    Upcast(#[from] UpcastError),
}

impl DomainError {
    /// Whether the caller should reload and retry the operation.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Failure translating an event payload between schema versions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpcastError {
    /// The chain for this event type has a hole at `schema_version`.
    #[error(
        "no upcaster registered for {event_type} v{schema_version} (latest known is v{latest})"
    )]
    MissingUpcaster {
        /// Event type tag.
        event_type: String,
        /// The version the chain stopped at.
        schema_version: u32,
        /// Highest version the registry can produce for this type.
        latest: u32,
    },

    /// A registered upcaster rejected the payload.
    #[error("upcasting {event_type} from v{from_version} failed: {reason}")]
    Failed {
        /// Event type tag.
        event_type: String,
        /// Version the failing upcaster starts from.
        from_version: u32,
        /// What went wrong.
        reason: String,
    },
}

/// A message channel refused or failed to accept an event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("publish failed: {message}")]
pub struct PublishError {
    /// Human-readable cause.
    pub message: String,
}

impl PublishError {
    /// Creates a new `PublishError`.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A projection handler failed to apply an event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("projection handler failed: {message}")]
pub struct ProjectionError {
    /// Human-readable cause.
    pub message: String,
}

impl ProjectionError {
    /// Creates a new `ProjectionError`.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<UpcastError> for ProjectionError {
    fn from(err: UpcastError) -> Self {
        Self::new(err.to_string())
    }
}

impl From<serde_json::Error> for ProjectionError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string())
    }
}
