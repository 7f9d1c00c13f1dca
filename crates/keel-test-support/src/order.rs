//! Sample order aggregate. `OrderPlaced` is at schema version 2; version 1
//! carried the total under `amount`.

use keel_core::aggregate::AggregateRoot;
use keel_core::error::DomainError;
use keel_core::event::DomainEvent;
use keel_core::upcast::UpcasterRegistry;
use serde::{Deserialize, Serialize};

/// Payload of `OrderPlaced` (schema version 2).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPlaced {
    /// Business identifier of the order.
    pub order_id: String,
    /// Order total in cents.
    pub total: i64,
}

/// Payload of `OrderCancelled`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCancelled {
    /// Why the order was cancelled.
    pub reason: String,
}

/// Events of the order aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderEvent {
    /// The order was placed.
    Placed(OrderPlaced),
    /// The order was cancelled.
    Cancelled(OrderCancelled),
}

impl DomainEvent for OrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Placed(_) => "OrderPlaced",
            Self::Cancelled(_) => "OrderCancelled",
        }
    }

    fn schema_version(&self) -> u32 {
        match self {
            Self::Placed(_) => 2,
            Self::Cancelled(_) => 1,
        }
    }

    fn to_payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            Self::Placed(p) => serde_json::to_value(p),
            Self::Cancelled(p) => serde_json::to_value(p),
        }
    }

    fn from_payload(
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<Self, serde_json::Error> {
        match event_type {
            "OrderPlaced" => serde_json::from_value(payload).map(Self::Placed),
            "OrderCancelled" => serde_json::from_value(payload).map(Self::Cancelled),
            other => Err(serde::de::Error::custom(format!(
                "unknown order event type {other}"
            ))),
        }
    }
}

/// Upcasters for the order stream: `OrderPlaced` v1 renamed `amount` to `total`.
#[must_use]
pub fn order_upcasters() -> UpcasterRegistry {
    UpcasterRegistry::new().with("OrderPlaced", 1, |mut payload| {
        let amount = payload
            .as_object_mut()
            .and_then(|o| o.remove("amount"))
            .ok_or("OrderPlaced v1 without amount")?;
        payload["total"] = amount;
        Ok(payload)
    })
}

/// Lifecycle of an order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Nothing placed yet.
    #[default]
    New,
    /// Placed and open.
    Placed,
    /// Cancelled.
    Cancelled,
}

/// An order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Business identifier, once placed.
    pub order_id: Option<String>,
    /// Order total in cents.
    pub total: i64,
    /// Current status.
    pub status: OrderStatus,
    #[serde(skip)]
    uncommitted_events: Vec<OrderEvent>,
}

impl Order {
    /// Places the order.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the order was already placed or
    /// the total is negative.
    pub fn place(&mut self, order_id: impl Into<String>, total: i64) -> Result<(), DomainError> {
        if self.status != OrderStatus::New {
            return Err(DomainError::Validation("order already placed".into()));
        }
        if total < 0 {
            return Err(DomainError::Validation(format!(
                "order total must not be negative, got {total}"
            )));
        }
        self.uncommitted_events.push(OrderEvent::Placed(OrderPlaced {
            order_id: order_id.into(),
            total,
        }));
        Ok(())
    }

    /// Cancels a placed order.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` unless the order is placed.
    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<(), DomainError> {
        if self.status != OrderStatus::Placed {
            return Err(DomainError::Validation(format!(
                "cannot cancel an order in status {:?}",
                self.status
            )));
        }
        self.uncommitted_events
            .push(OrderEvent::Cancelled(OrderCancelled {
                reason: reason.into(),
            }));
        Ok(())
    }
}

impl AggregateRoot for Order {
    type Event = OrderEvent;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            OrderEvent::Placed(p) => {
                self.order_id = Some(p.order_id.clone());
                self.total = p.total;
                self.status = OrderStatus::Placed;
            }
            OrderEvent::Cancelled(_) => self.status = OrderStatus::Cancelled,
        }
    }

    fn uncommitted_events(&self) -> &[Self::Event] {
        &self.uncommitted_events
    }

    fn clear_uncommitted_events(&mut self) {
        self.uncommitted_events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_requires_placed_order() {
        let mut order = Order::default();

        let result = order.cancel("changed my mind");

        assert!(matches!(result, Err(DomainError::Validation(_))));
    }

    #[test]
    fn test_placed_event_is_written_at_version_two() {
        let event = OrderEvent::Placed(OrderPlaced {
            order_id: "order-1".into(),
            total: 100,
        });

        assert_eq!(event.schema_version(), 2);
        assert_eq!(
            event.to_payload().unwrap(),
            serde_json::json!({ "order_id": "order-1", "total": 100 })
        );
    }
}
