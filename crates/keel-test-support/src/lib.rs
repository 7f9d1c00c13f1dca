//! Shared test doubles and sample aggregates for the Keel engine.

mod bank_account;
mod channel;
mod clock;
mod event_store;
mod order;

pub use bank_account::{AccountOpened, BankAccount, BankAccountEvent, Deposited, Withdrew};
pub use channel::{FlakyChannel, RecordingChannel};
pub use clock::{FixedClock, ManualClock};
pub use event_store::{ConflictingEventStore, FailingEventStore};
pub use order::{Order, OrderCancelled, OrderEvent, OrderPlaced, OrderStatus, order_upcasters};
