//! Integration tests for `AggregateRepository` against the in-memory store.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use futures::TryStreamExt;
use keel_core::aggregate::{AggregateRoot, replay};
use keel_core::command::CommandContext;
use keel_core::error::DomainError;
use keel_core::event::{ACTOR_ID, CORRELATION_ID, DomainEvent, EventDraft, RecordedEvent};
use keel_core::repository::AggregateRepository;
use keel_core::snapshot::{Snapshot, SnapshotPolicy, SnapshotStore};
use keel_core::store::EventStore;
use keel_event_store::{InMemoryEventStore, InMemorySnapshotStore};
use keel_test_support::{
    BankAccount, BankAccountEvent, ConflictingEventStore, FailingEventStore, FixedClock, Order,
    OrderStatus, order_upcasters,
};
use serde_json::json;
use uuid::Uuid;

fn deposit_draft(amount: i64) -> EventDraft {
    EventDraft::new("Deposited", json!({ "amount": amount }))
}

fn ctx() -> CommandContext {
    CommandContext::new(Uuid::new_v4())
}

// --- load / execute ---

#[tokio::test]
async fn test_load_of_unknown_stream_is_initial_state() {
    let repo = AggregateRepository::<BankAccount>::new(Arc::new(InMemoryEventStore::new()));

    let loaded = repo.load("account-1").await.unwrap();

    assert_eq!(loaded.version, 0);
    assert_eq!(loaded.state, BankAccount::default());
}

#[tokio::test]
async fn test_execute_commits_and_applies_events() {
    // Arrange
    let store = Arc::new(InMemoryEventStore::new());
    let repo = AggregateRepository::<BankAccount>::new(store.clone());

    // Act
    let outcome = repo
        .execute("account-1", &ctx(), |account| {
            account.open("ada")?;
            account.deposit(100)
        })
        .await
        .unwrap();

    // Assert
    assert_eq!(outcome.version, 2);
    assert_eq!(outcome.attempts, 1);
    assert_eq!(outcome.state.balance, 100);
    assert_eq!(outcome.events.len(), 2);

    let loaded = repo.load("account-1").await.unwrap();
    assert_eq!(loaded.version, 2);
    assert_eq!(loaded.state.owner.as_deref(), Some("ada"));
    assert_eq!(loaded.state.balance, 100);
}

#[tokio::test]
async fn test_rejected_operation_writes_nothing() {
    let store = Arc::new(InMemoryEventStore::new());
    let repo = AggregateRepository::<BankAccount>::new(store.clone());

    let result = repo
        .execute("account-1", &ctx(), |account| account.withdraw(10))
        .await;

    assert!(matches!(result, Err(DomainError::Validation(_))));
    assert_eq!(store.stream_version("account-1").await.unwrap(), 0);
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_operation_without_events_does_not_append() {
    let store = Arc::new(InMemoryEventStore::new());
    let repo = AggregateRepository::<BankAccount>::new(store.clone());

    let outcome = repo.execute("account-1", &ctx(), |_| Ok(())).await.unwrap();

    assert_eq!(outcome.version, 0);
    assert!(outcome.events.is_empty());
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_command_context_is_stamped_on_events() {
    // Arrange
    let store = Arc::new(InMemoryEventStore::new());
    let repo = AggregateRepository::<BankAccount>::new(store.clone());
    let command_id = Uuid::new_v4();
    let ctx = CommandContext::new(command_id).with_actor("teller-3");

    // Act
    repo.execute("account-1", &ctx, |account| account.deposit(5))
        .await
        .unwrap();

    // Assert
    let events: Vec<RecordedEvent> = store.read("account-1", 1).try_collect().await.unwrap();
    assert_eq!(
        events[0].metadata.get(CORRELATION_ID),
        Some(&command_id.to_string())
    );
    assert_eq!(events[0].metadata.get(ACTOR_ID), Some(&"teller-3".to_owned()));
}

#[tokio::test]
async fn test_storage_failure_propagates() {
    let repo = AggregateRepository::<BankAccount>::new(Arc::new(FailingEventStore));

    let result = repo.load("account-1").await;

    assert!(matches!(result, Err(DomainError::Infrastructure(_))));
}

// --- optimistic concurrency ---

#[tokio::test]
async fn test_second_writer_from_same_version_conflicts() {
    // Arrange: order-1 placed, so both handlers load version 1.
    let store = Arc::new(InMemoryEventStore::new());
    let repo = AggregateRepository::<Order>::new(store.clone());
    repo.execute("order-1", &ctx(), |order| order.place("order-1", 100))
        .await
        .unwrap();
    let mut a = repo.load("order-1").await.unwrap();
    let mut b = repo.load("order-1").await.unwrap();
    a.state.cancel("customer request").unwrap();
    b.state.cancel("fraud check").unwrap();

    // Act
    let first = repo
        .save("order-1", a.version, &a.state.take_uncommitted_events())
        .await;
    let second = repo
        .save("order-1", b.version, &b.state.take_uncommitted_events())
        .await;

    // Assert
    assert_eq!(first.unwrap(), 2);
    match second {
        Err(DomainError::ConcurrencyConflict {
            expected, actual, ..
        }) => {
            assert_eq!(expected, 1);
            assert_eq!(actual, 2);
        }
        other => panic!("expected ConcurrencyConflict, got {other:?}"),
    }

    // The loser reloads and sees the order already cancelled.
    let mut reloaded = repo.load("order-1").await.unwrap();
    assert_eq!(reloaded.state.status, OrderStatus::Cancelled);
    assert!(reloaded.state.cancel("fraud check").is_err());
    assert_eq!(store.stream_version("order-1").await.unwrap(), 2);
}

#[tokio::test]
async fn test_execute_retries_through_transient_conflicts() {
    // Arrange: a competing writer wins the first two races.
    let inner = Arc::new(InMemoryEventStore::new());
    let store = Arc::new(ConflictingEventStore::new(inner.clone(), 2, || {
        deposit_draft(1)
    }));
    let repo = AggregateRepository::<BankAccount>::new(store.clone());

    // Act
    let outcome = repo
        .execute("account-1", &ctx(), |account| account.deposit(100))
        .await
        .unwrap();

    // Assert
    assert_eq!(outcome.attempts, 3);
    assert_eq!(store.append_calls(), 3);
    assert_eq!(outcome.state.balance, 102);
    assert_eq!(outcome.version, 3);
}

#[tokio::test]
async fn test_execute_gives_up_after_configured_attempts() {
    // Arrange
    let inner = Arc::new(InMemoryEventStore::new());
    let store = Arc::new(ConflictingEventStore::new(inner.clone(), 10, || {
        deposit_draft(1)
    }));
    let repo = AggregateRepository::<BankAccount>::new(store.clone());

    // Act
    let result = repo
        .execute("account-1", &ctx(), |account| account.deposit(100))
        .await;

    // Assert
    match result {
        Err(DomainError::Conflict { stream_id, attempts }) => {
            assert_eq!(stream_id, "account-1");
            assert_eq!(attempts, 3);
        }
        other => panic!("expected Conflict, got {other:?}"),
    }
    assert_eq!(store.append_calls(), 3);
    // Only the competing writer's events made it in.
    let loaded = repo.load("account-1").await.unwrap();
    assert_eq!(loaded.state.balance, 3);
}

#[tokio::test]
async fn test_max_save_attempts_is_configurable() {
    let inner = Arc::new(InMemoryEventStore::new());
    let store = Arc::new(ConflictingEventStore::new(inner, 10, || deposit_draft(1)));
    let repo = AggregateRepository::<BankAccount>::new(store.clone()).with_max_save_attempts(5);

    let result = repo
        .execute("account-1", &ctx(), |account| account.deposit(100))
        .await;

    assert!(matches!(result, Err(DomainError::Conflict { attempts: 5, .. })));
    assert_eq!(store.append_calls(), 5);
}

// --- snapshots ---

async fn seed_hundred_deposits(store: &InMemoryEventStore) {
    let drafts = (0..100).map(|_| deposit_draft(5)).collect();
    store.append("account-1", 0, drafts).await.unwrap();
}

#[tokio::test]
async fn test_snapshot_and_full_replay_agree() {
    // Arrange: 100 deposits of 5 leave a balance of 500 at version 100.
    let store = Arc::new(InMemoryEventStore::new());
    let snapshots = Arc::new(InMemorySnapshotStore::new());
    seed_hundred_deposits(&store).await;
    let repo = AggregateRepository::<BankAccount>::new(store.clone()).with_snapshots(
        snapshots.clone(),
        SnapshotPolicy::default(),
    );
    let snapshot = repo.snapshot_now("account-1").await.unwrap();
    assert_eq!(snapshot.version, 100);
    assert_eq!(snapshot.state["balance"], json!(500));

    // Act
    repo.execute("account-1", &ctx(), |account| account.deposit(50))
        .await
        .unwrap();
    repo.execute("account-1", &ctx(), |account| account.withdraw(20))
        .await
        .unwrap();
    let with_snapshot = repo.load("account-1").await.unwrap();
    let without_snapshot = repo.load_without_snapshot("account-1").await.unwrap();

    // Assert
    assert_eq!(with_snapshot.state.balance, 530);
    assert_eq!(with_snapshot.version, 102);
    assert_eq!(with_snapshot, without_snapshot);

    snapshots.delete_all().await.unwrap();
    assert_eq!(repo.load("account-1").await.unwrap(), with_snapshot);
}

#[tokio::test]
async fn test_snapshot_taken_when_policy_threshold_crossed() {
    // Arrange
    let store = Arc::new(InMemoryEventStore::new());
    let snapshots = Arc::new(InMemorySnapshotStore::new());
    let taken_at = Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap();
    let repo = AggregateRepository::<BankAccount>::new(store.clone())
        .with_snapshots(snapshots.clone(), SnapshotPolicy { every: 10 })
        .with_clock(Arc::new(FixedClock(taken_at)));

    // Act
    for _ in 0..9 {
        repo.execute("account-1", &ctx(), |account| account.deposit(1))
            .await
            .unwrap();
    }
    assert!(snapshots.get_latest("account-1").await.unwrap().is_none());
    repo.execute("account-1", &ctx(), |account| account.deposit(1))
        .await
        .unwrap();

    // Assert
    let snapshot = snapshots.get_latest("account-1").await.unwrap().unwrap();
    assert_eq!(snapshot.version, 10);
    assert_eq!(snapshot.taken_at, taken_at);
    assert_eq!(snapshot.state["balance"], json!(10));
}

#[tokio::test]
async fn test_plain_save_snapshots_by_reloading() {
    let store = Arc::new(InMemoryEventStore::new());
    let snapshots = Arc::new(InMemorySnapshotStore::new());
    let repo = AggregateRepository::<BankAccount>::new(store.clone())
        .with_snapshots(snapshots.clone(), SnapshotPolicy { every: 2 });
    let mut account = BankAccount::default();
    account.deposit(7).unwrap();
    account.deposit(8).unwrap();

    let version = repo
        .save("account-1", 0, &account.take_uncommitted_events())
        .await
        .unwrap();

    assert_eq!(version, 2);
    let snapshot = snapshots.get_latest("account-1").await.unwrap().unwrap();
    assert_eq!(snapshot.version, 2);
    assert_eq!(snapshot.state["balance"], json!(15));
}

#[tokio::test]
async fn test_undecodable_snapshot_falls_back_to_replay() {
    // Arrange
    let store = Arc::new(InMemoryEventStore::new());
    let snapshots = Arc::new(InMemorySnapshotStore::new());
    seed_hundred_deposits(&store).await;
    snapshots
        .put(Snapshot {
            stream_id: "account-1".into(),
            version: 50,
            state: json!("not an account"),
            taken_at: Utc::now(),
        })
        .await
        .unwrap();
    let repo = AggregateRepository::<BankAccount>::new(store.clone())
        .with_snapshots(snapshots, SnapshotPolicy::disabled());

    // Act
    let loaded = repo.load("account-1").await.unwrap();

    // Assert
    assert_eq!(loaded.version, 100);
    assert_eq!(loaded.state.balance, 500);
}

#[tokio::test]
async fn test_replay_is_deterministic() {
    // Arrange
    let store = Arc::new(InMemoryEventStore::new());
    seed_hundred_deposits(&store).await;
    let recorded: Vec<RecordedEvent> = store.read("account-1", 1).try_collect().await.unwrap();
    let events: Vec<BankAccountEvent> = recorded
        .into_iter()
        .map(|e| BankAccountEvent::from_payload(&e.event_type, e.payload).unwrap())
        .collect();
    let repo = AggregateRepository::<BankAccount>::new(store.clone());

    // Act
    let first = replay(BankAccount::default(), &events);
    let second = replay(BankAccount::default(), &events);
    let loaded = repo.load("account-1").await.unwrap();

    // Assert
    assert_eq!(first, second);
    assert_eq!(first.balance, 500);
    assert_eq!(loaded.state, first);
}

// --- upcasting ---

#[tokio::test]
async fn test_load_upcasts_old_events() {
    // Arrange: an OrderPlaced written before `amount` became `total`.
    let store = Arc::new(InMemoryEventStore::new());
    store
        .append(
            "order-1",
            0,
            vec![
                EventDraft::new("OrderPlaced", json!({ "order_id": "order-1", "amount": 100 }))
                    .with_schema_version(1),
            ],
        )
        .await
        .unwrap();
    let repo = AggregateRepository::<Order>::new(store.clone())
        .with_upcasters(Arc::new(order_upcasters()));

    // Act
    let loaded = repo.load("order-1").await.unwrap();

    // Assert
    assert_eq!(loaded.state.total, 100);
    assert_eq!(loaded.state.status, OrderStatus::Placed);
}

#[tokio::test]
async fn test_load_without_upcaster_fails_to_decode_old_event() {
    let store = Arc::new(InMemoryEventStore::new());
    store
        .append(
            "order-1",
            0,
            vec![
                EventDraft::new("OrderPlaced", json!({ "order_id": "order-1", "amount": 100 }))
                    .with_schema_version(1),
            ],
        )
        .await
        .unwrap();
    let repo = AggregateRepository::<Order>::new(store.clone());

    let result = repo.load("order-1").await;

    assert!(matches!(result, Err(DomainError::Serialization(_))));
}
