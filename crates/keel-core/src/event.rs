//! Event abstractions: drafts submitted for append and recorded facts.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata key for the correlation id of the originating request.
pub const CORRELATION_ID: &str = "correlation_id";
/// Metadata key for the id of the command or event that caused this event.
pub const CAUSATION_ID: &str = "causation_id";
/// Metadata key for the acting principal.
pub const ACTOR_ID: &str = "actor_id";

/// String-to-string metadata carried by every event.
pub type EventMetadata = BTreeMap<String, String>;

/// An event submitted to [`EventStore::append`](crate::store::EventStore::append).
///
/// Versions, positions and the timestamp are assigned by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDraft {
    /// Caller-chosen id; the store assigns one when `None`.
    pub event_id: Option<Uuid>,
    /// Type tag used for decoding and handler dispatch.
    pub event_type: String,
    /// Schema version of `payload`.
    pub schema_version: u32,
    /// Serialized event body.
    pub payload: serde_json::Value,
    /// Correlation, causation and actor ids.
    pub metadata: EventMetadata,
}

impl EventDraft {
    /// Creates a draft at schema version 1 with empty metadata.
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_id: None,
            event_type: event_type.into(),
            schema_version: 1,
            payload,
            metadata: EventMetadata::new(),
        }
    }

    /// Sets the schema version of the payload.
    #[must_use]
    pub fn with_schema_version(mut self, schema_version: u32) -> Self {
        self.schema_version = schema_version;
        self
    }

    /// Pins the event id instead of letting the store assign one.
    #[must_use]
    pub fn with_event_id(mut self, event_id: Uuid) -> Self {
        self.event_id = Some(event_id);
        self
    }

    /// Adds an arbitrary metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Sets the correlation id.
    #[must_use]
    pub fn with_correlation_id(self, id: Uuid) -> Self {
        self.with_metadata(CORRELATION_ID, id.to_string())
    }

    /// Sets the causation id.
    #[must_use]
    pub fn with_causation_id(self, id: Uuid) -> Self {
        self.with_metadata(CAUSATION_ID, id.to_string())
    }

    /// Sets the actor id.
    #[must_use]
    pub fn with_actor_id(self, actor: impl Into<String>) -> Self {
        self.with_metadata(ACTOR_ID, actor)
    }
}

/// Stored representation of an appended event. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    /// Unique event identifier.
    pub event_id: Uuid,
    /// Stream this event belongs to.
    pub stream_id: String,
    /// 1-based, gap-free version within the stream.
    pub stream_version: u64,
    /// Position in the store-wide total order.
    pub global_position: u64,
    /// Type tag used for decoding and handler dispatch.
    pub event_type: String,
    /// Schema version of `payload`.
    pub schema_version: u32,
    /// Serialized event body.
    pub payload: serde_json::Value,
    /// Time the store accepted the event.
    pub recorded_at: DateTime<Utc>,
    /// Correlation, causation and actor ids.
    pub metadata: EventMetadata,
}

impl RecordedEvent {
    /// Builds the recorded form of `draft` with store-assigned fields.
    #[must_use]
    pub fn from_draft(
        draft: EventDraft,
        stream_id: &str,
        stream_version: u64,
        global_position: u64,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: draft.event_id.unwrap_or_else(Uuid::now_v7),
            stream_id: stream_id.to_owned(),
            stream_version,
            global_position,
            event_type: draft.event_type,
            schema_version: draft.schema_version,
            payload: draft.payload,
            recorded_at,
            metadata: draft.metadata,
        }
    }

    /// Returns the correlation id, if present.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.metadata.get(CORRELATION_ID).map(String::as_str)
    }

    /// Returns the causation id, if present.
    #[must_use]
    pub fn causation_id(&self) -> Option<&str> {
        self.metadata.get(CAUSATION_ID).map(String::as_str)
    }
}

/// Trait that typed aggregate events implement.
///
/// Each implementation is a tagged union of the event kinds an aggregate
/// knows; `event_type` is the tag and `from_payload` maps the tag back.
pub trait DomainEvent: Send + Sync + Clone + std::fmt::Debug + Sized {
    /// Returns the event type name (used for serialization routing).
    fn event_type(&self) -> &'static str;

    /// Schema version this code writes for the event's type.
    fn schema_version(&self) -> u32 {
        1
    }

    /// Serializes the event body.
    ///
    /// # Errors
    ///
    /// Returns a `serde_json::Error` if the body cannot be represented as JSON.
    fn to_payload(&self) -> Result<serde_json::Value, serde_json::Error>;

    /// Decodes an event body written under `event_type`, already upcast to
    /// the latest schema.
    ///
    /// # Errors
    ///
    /// Returns a `serde_json::Error` for unknown tags or malformed payloads.
    fn from_payload(event_type: &str, payload: serde_json::Value)
    -> Result<Self, serde_json::Error>;
}
