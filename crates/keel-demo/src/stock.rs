//! Warehouse stock: the demo's aggregate and the read model projected from it.

use std::collections::BTreeMap;

use keel_core::aggregate::AggregateRoot;
use keel_core::error::{DomainError, ProjectionError};
use keel_core::event::{DomainEvent, RecordedEvent};
use serde::{Deserialize, Serialize};

pub const STOCK_RECEIVED_EVENT_TYPE: &str = "StockReceived";
pub const STOCK_SHIPPED_EVENT_TYPE: &str = "StockShipped";

/// Payload shared by both stock events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMoved {
    /// Stock keeping unit.
    pub sku: String,
    /// Units moved.
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StockEvent {
    Received(StockMoved),
    Shipped(StockMoved),
}

impl DomainEvent for StockEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Received(_) => STOCK_RECEIVED_EVENT_TYPE,
            Self::Shipped(_) => STOCK_SHIPPED_EVENT_TYPE,
        }
    }

    fn to_payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            Self::Received(p) | Self::Shipped(p) => serde_json::to_value(p),
        }
    }

    fn from_payload(
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<Self, serde_json::Error> {
        match event_type {
            STOCK_RECEIVED_EVENT_TYPE => serde_json::from_value(payload).map(Self::Received),
            STOCK_SHIPPED_EVENT_TYPE => serde_json::from_value(payload).map(Self::Shipped),
            other => Err(serde::de::Error::custom(format!(
                "unknown stock event type {other}"
            ))),
        }
    }
}

/// Units on hand for one SKU in one warehouse.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StockItem {
    pub sku: Option<String>,
    pub on_hand: u32,
    #[serde(skip)]
    uncommitted_events: Vec<StockEvent>,
}

impl StockItem {
    /// Books incoming units.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` for an empty delivery.
    pub fn receive(&mut self, sku: &str, quantity: u32) -> Result<(), DomainError> {
        if quantity == 0 {
            return Err(DomainError::Validation("quantity must be positive".into()));
        }
        self.uncommitted_events.push(StockEvent::Received(StockMoved {
            sku: sku.to_owned(),
            quantity,
        }));
        Ok(())
    }

    /// Ships units out.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if fewer than `quantity` units are on hand.
    pub fn ship(&mut self, sku: &str, quantity: u32) -> Result<(), DomainError> {
        if quantity > self.on_hand {
            return Err(DomainError::Validation(format!(
                "cannot ship {quantity} of {sku}, only {} on hand",
                self.on_hand
            )));
        }
        self.uncommitted_events.push(StockEvent::Shipped(StockMoved {
            sku: sku.to_owned(),
            quantity,
        }));
        Ok(())
    }
}

impl AggregateRoot for StockItem {
    type Event = StockEvent;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            StockEvent::Received(moved) => {
                self.sku = Some(moved.sku.clone());
                self.on_hand += moved.quantity;
            }
            StockEvent::Shipped(moved) => {
                self.on_hand = self.on_hand.saturating_sub(moved.quantity);
            }
        }
    }

    fn uncommitted_events(&self) -> &[Self::Event] {
        &self.uncommitted_events
    }

    fn clear_uncommitted_events(&mut self) {
        self.uncommitted_events.clear();
    }
}

/// Read model: units on hand and shipped, per SKU across all warehouses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StockLevels {
    pub on_hand: BTreeMap<String, i64>,
    pub shipped: BTreeMap<String, i64>,
}

pub fn on_received(levels: &mut StockLevels, event: &RecordedEvent) -> Result<(), ProjectionError> {
    let moved: StockMoved = serde_json::from_value(event.payload.clone())?;
    *levels.on_hand.entry(moved.sku).or_default() += i64::from(moved.quantity);
    Ok(())
}

pub fn on_shipped(levels: &mut StockLevels, event: &RecordedEvent) -> Result<(), ProjectionError> {
    let moved: StockMoved = serde_json::from_value(event.payload.clone())?;
    *levels.on_hand.entry(moved.sku.clone()).or_default() -= i64::from(moved.quantity);
    *levels.shipped.entry(moved.sku).or_default() += i64::from(moved.quantity);
    Ok(())
}
