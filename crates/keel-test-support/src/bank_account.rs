//! Sample bank account aggregate used across the engine's tests.

use keel_core::aggregate::AggregateRoot;
use keel_core::error::DomainError;
use keel_core::event::DomainEvent;
use serde::{Deserialize, Serialize};

/// Payload of `AccountOpened`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountOpened {
    /// Account holder.
    pub owner: String,
}

/// Payload of `Deposited`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deposited {
    /// Amount credited, in cents.
    pub amount: i64,
}

/// Payload of `Withdrew`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Withdrew {
    /// Amount debited, in cents.
    pub amount: i64,
}

/// Events of the bank account aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BankAccountEvent {
    /// The account was opened.
    Opened(AccountOpened),
    /// Money was deposited.
    Deposited(Deposited),
    /// Money was withdrawn.
    Withdrew(Withdrew),
}

impl DomainEvent for BankAccountEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Opened(_) => "AccountOpened",
            Self::Deposited(_) => "Deposited",
            Self::Withdrew(_) => "Withdrew",
        }
    }

    fn to_payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            Self::Opened(p) => serde_json::to_value(p),
            Self::Deposited(p) => serde_json::to_value(p),
            Self::Withdrew(p) => serde_json::to_value(p),
        }
    }

    fn from_payload(
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<Self, serde_json::Error> {
        match event_type {
            "AccountOpened" => serde_json::from_value(payload).map(Self::Opened),
            "Deposited" => serde_json::from_value(payload).map(Self::Deposited),
            "Withdrew" => serde_json::from_value(payload).map(Self::Withdrew),
            other => Err(serde::de::Error::custom(format!(
                "unknown bank account event type {other}"
            ))),
        }
    }
}

/// A bank account. Operations record events; the repository applies them
/// once they are committed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankAccount {
    /// Account holder, once opened.
    pub owner: Option<String>,
    /// Current balance in cents.
    pub balance: i64,
    /// Deposits and withdrawals applied.
    pub transactions: u64,
    #[serde(skip)]
    uncommitted_events: Vec<BankAccountEvent>,
}

impl BankAccount {
    /// Opens the account for `owner`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the account is already open.
    pub fn open(&mut self, owner: impl Into<String>) -> Result<(), DomainError> {
        if self.owner.is_some() {
            return Err(DomainError::Validation("account already open".into()));
        }
        self.uncommitted_events
            .push(BankAccountEvent::Opened(AccountOpened {
                owner: owner.into(),
            }));
        Ok(())
    }

    /// Deposits `amount` cents.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` for a non-positive amount.
    pub fn deposit(&mut self, amount: i64) -> Result<(), DomainError> {
        if amount <= 0 {
            return Err(DomainError::Validation(format!(
                "deposit must be positive, got {amount}"
            )));
        }
        self.uncommitted_events
            .push(BankAccountEvent::Deposited(Deposited { amount }));
        Ok(())
    }

    /// Withdraws `amount` cents.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` for a non-positive amount or when
    /// the balance does not cover it.
    pub fn withdraw(&mut self, amount: i64) -> Result<(), DomainError> {
        if amount <= 0 {
            return Err(DomainError::Validation(format!(
                "withdrawal must be positive, got {amount}"
            )));
        }
        if amount > self.balance {
            return Err(DomainError::Validation(format!(
                "insufficient funds: balance {}, requested {amount}",
                self.balance
            )));
        }
        self.uncommitted_events
            .push(BankAccountEvent::Withdrew(Withdrew { amount }));
        Ok(())
    }
}

impl AggregateRoot for BankAccount {
    type Event = BankAccountEvent;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            BankAccountEvent::Opened(p) => self.owner = Some(p.owner.clone()),
            BankAccountEvent::Deposited(p) => {
                self.balance += p.amount;
                self.transactions += 1;
            }
            BankAccountEvent::Withdrew(p) => {
                self.balance -= p.amount;
                self.transactions += 1;
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
