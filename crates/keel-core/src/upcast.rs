//! Upcasting of older event payloads to the latest schema.
//!
//! Upcasters are registered per `(event_type, from_schema_version)` and each
//! produces the payload at `from_schema_version + 1`. Both the aggregate
//! repository and projections run events through
//! [`UpcasterRegistry::upcast_to_latest`] so consumers only ever see the
//! newest payload shape.

use std::collections::HashMap;
use std::fmt;

use crate::error::UpcastError;
use crate::event::RecordedEvent;

type UpcastFn = Box<dyn Fn(serde_json::Value) -> Result<serde_json::Value, String> + Send + Sync>;

/// Registry of payload upcasters keyed by event type and source version.
#[derive(Default)]
pub struct UpcasterRegistry {
    upcasters: HashMap<(String, u32), UpcastFn>,
}

impl fmt::Debug for UpcasterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.upcasters.keys().collect();
        keys.sort();
        f.debug_struct("UpcasterRegistry")
            .field("upcasters", &keys)
            .finish()
    }
}

impl UpcasterRegistry {
    /// Creates an empty registry; every event passes through unchanged.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `upcast` to turn a `from_schema_version` payload of
    /// `event_type` into a `from_schema_version + 1` payload. Replaces any
    /// upcaster already registered for the same key.
    pub fn register<F>(
        &mut self,
        event_type: impl Into<String>,
        from_schema_version: u32,
        upcast: F,
    ) where
        F: Fn(serde_json::Value) -> Result<serde_json::Value, String> + Send + Sync + 'static,
    {
        let key = (event_type.into(), from_schema_version);
        if self.upcasters.insert(key.clone(), Box::new(upcast)).is_some() {
            tracing::warn!(
                event_type = %key.0,
                from_schema_version = key.1,
                "replaced existing upcaster"
            );
        }
    }

    /// Builder-style [`register`](Self::register).
    #[must_use]
    pub fn with<F>(
        mut self,
        event_type: impl Into<String>,
        from_schema_version: u32,
        upcast: F,
    ) -> Self
    where
        F: Fn(serde_json::Value) -> Result<serde_json::Value, String> + Send + Sync + 'static,
    {
        self.register(event_type, from_schema_version, upcast);
        self
    }

    /// Highest schema version the registry can produce for `event_type`,
    /// or `None` if no upcaster is registered for it.
    #[must_use]
    pub fn latest_version(&self, event_type: &str) -> Option<u32> {
        self.upcasters
            .keys()
            .filter(|(ty, _)| ty == event_type)
            .map(|(_, from)| from + 1)
            .max()
    }

    /// Applies registered upcasters until none matches the event's version.
    ///
    /// # Errors
    ///
    /// Returns `UpcastError::MissingUpcaster` when the event is older than
    /// the latest known version but the chain has a hole, and
    /// `UpcastError::Failed` when an upcaster rejects the payload.
    pub fn upcast_to_latest(&self, mut event: RecordedEvent) -> Result<RecordedEvent, UpcastError> {
        let Some(latest) = self.latest_version(&event.event_type) else {
            return Ok(event);
        };
        while let Some(upcast) = self
            .upcasters
            .get(&(event.event_type.clone(), event.schema_version))
        {
            let from_version = event.schema_version;
            event.payload = upcast(event.payload).map_err(|reason| UpcastError::Failed {
                event_type: event.event_type.clone(),
                from_version,
                reason,
            })?;
            event.schema_version = from_version + 1;
        }
        if event.schema_version < latest {
            return Err(UpcastError::MissingUpcaster {
                event_type: event.event_type,
                schema_version: event.schema_version,
                latest,
            });
        }
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use super::*;
    use crate::event::EventDraft;

    fn event(event_type: &str, schema_version: u32, payload: serde_json::Value) -> RecordedEvent {
        RecordedEvent::from_draft(
            EventDraft::new(event_type, payload).with_schema_version(schema_version),
            "order-1",
            1,
            1,
            Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap(),
        )
    }

    fn order_registry() -> UpcasterRegistry {
        UpcasterRegistry::new()
            // v1 -> v2: `amount` renamed to `total`.
            .with("OrderPlaced", 1, |mut payload| {
                let amount = payload
                    .as_object_mut()
                    .and_then(|o| o.remove("amount"))
                    .ok_or("missing amount")?;
                payload["total"] = amount;
                Ok(payload)
            })
            // v2 -> v3: currency added with a default.
            .with("OrderPlaced", 2, |mut payload| {
                payload["currency"] = json!("EUR");
                Ok(payload)
            })
    }

    #[test]
    fn test_upcast_applies_chain_to_latest() {
        // Arrange
        let registry = order_registry();

        // Act
        let upcast = registry
            .upcast_to_latest(event("OrderPlaced", 1, json!({"amount": 100})))
            .unwrap();

        // Assert
        assert_eq!(upcast.schema_version, 3);
        assert_eq!(upcast.payload, json!({"total": 100, "currency": "EUR"}));
    }

    #[test]
    fn test_latest_event_passes_through_unchanged() {
        let registry = order_registry();
        let original = event("OrderPlaced", 3, json!({"total": 5, "currency": "USD"}));

        let upcast = registry.upcast_to_latest(original.clone()).unwrap();

        assert_eq!(upcast, original);
    }

    #[test]
    fn test_unregistered_type_passes_through() {
        let registry = order_registry();
        let original = event("OrderCancelled", 1, json!({}));

        assert_eq!(registry.upcast_to_latest(original.clone()).unwrap(), original);
    }

    #[test]
    fn test_hole_in_chain_is_missing_upcaster() {
        // Arrange: only 2 -> 3 registered, event written at v1.
        let registry = UpcasterRegistry::new().with("OrderPlaced", 2, Ok);

        // Act
        let result = registry.upcast_to_latest(event("OrderPlaced", 1, json!({})));

        // Assert
        assert_eq!(
            result.unwrap_err(),
            UpcastError::MissingUpcaster {
                event_type: "OrderPlaced".into(),
                schema_version: 1,
                latest: 3,
            }
        );
    }

    #[test]
    fn test_failing_upcaster_is_reported() {
        let registry = order_registry();

        let result = registry.upcast_to_latest(event("OrderPlaced", 1, json!({"total": 1})));

        match result {
            Err(UpcastError::Failed {
                event_type,
                from_version,
                reason,
            }) => {
                assert_eq!(event_type, "OrderPlaced");
                assert_eq!(from_version, 1);
                assert_eq!(reason, "missing amount");
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn test_latest_version_reports_highest_target() {
        let registry = order_registry();

        assert_eq!(registry.latest_version("OrderPlaced"), Some(3));
        assert_eq!(registry.latest_version("OrderCancelled"), None);
    }
}
