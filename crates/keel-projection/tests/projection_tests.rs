//! Integration tests for `ProjectionEngine` against the in-memory store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use futures::TryStreamExt;
use keel_core::checkpoint::{Checkpoint, CheckpointStore};
use keel_core::channel::MessageChannel;
use keel_core::command::CommandContext;
use keel_core::config::{ProjectionConfig, RelayConfig};
use keel_core::dead_letter::{DeadLetterSource, InMemoryDeadLetterSink};
use keel_core::error::ProjectionError;
use keel_core::event::{EventDraft, RecordedEvent};
use keel_core::repository::AggregateRepository;
use keel_core::store::EventStore;
use keel_event_store::{InMemoryCheckpointStore, InMemoryEventStore};
use keel_outbox::OutboxRelay;
use keel_projection::{
    ChannelSource, FailurePolicy, ProjectionChannel, ProjectionEngine, StoreSource,
};
use keel_test_support::{ManualClock, Order, OrderPlaced, order_upcasters};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Read model: order totals by id, plus the positions seen, in order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct OrderBook {
    totals: BTreeMap<String, i64>,
    placed: u32,
    seen: Vec<u64>,
}

fn record_placed(book: &mut OrderBook, event: &RecordedEvent) -> Result<(), ProjectionError> {
    let placed: OrderPlaced = serde_json::from_value(event.payload.clone())?;
    book.totals.insert(placed.order_id, placed.total);
    book.placed += 1;
    book.seen.push(event.global_position);
    Ok(())
}

fn record_seen(book: &mut OrderBook, event: &RecordedEvent) -> Result<(), ProjectionError> {
    book.seen.push(event.global_position);
    Ok(())
}

/// Handler that fails its first `failures` calls, then records the order.
fn flaky_placed(
    failures: u32,
) -> impl Fn(&mut OrderBook, &RecordedEvent) -> Result<(), ProjectionError> + Send + Sync {
    let remaining = AtomicU32::new(failures);
    move |book, event| {
        let fail = remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(ProjectionError::new("read model database unavailable"));
        }
        record_placed(book, event)
    }
}

fn config() -> ProjectionConfig {
    ProjectionConfig {
        batch_size: 100,
        poll_interval: Duration::from_millis(10),
        max_handler_attempts: 3,
        block_on_failure: false,
    }
}

fn relay_config() -> RelayConfig {
    RelayConfig {
        batch_size: 100,
        poll_interval: Duration::from_millis(10),
        max_attempts: 10,
        backoff_min: Duration::from_millis(100),
        backoff_max: Duration::from_secs(5),
    }
}

fn placed(order_id: &str, total: i64) -> EventDraft {
    EventDraft::new("OrderPlaced", json!({ "order_id": order_id, "total": total }))
        .with_schema_version(2)
}

fn order_book(checkpoints: Arc<dyn CheckpointStore>) -> ProjectionEngine<OrderBook> {
    ProjectionEngine::new("order-book", OrderBook::default(), checkpoints, &config())
}

// --- relay-driven projection ---

#[tokio::test]
async fn test_handler_failure_is_retried_through_relay_and_applied_once() {
    // Arrange: an order placed through the repository; the projection's
    // OrderPlaced handler fails on the first delivery.
    let store = Arc::new(InMemoryEventStore::new());
    let repo = AggregateRepository::<Order>::new(store.clone());
    repo.execute("order-1", &CommandContext::new(Uuid::new_v4()), |order| {
        order.place("o-1", 4_200)
    })
    .await
    .unwrap();

    let checkpoints = Arc::new(InMemoryCheckpointStore::new());
    let engine = Arc::new(order_book(checkpoints.clone()).on("OrderPlaced", flaky_placed(1)));
    let channel = Arc::new(ProjectionChannel::new(engine.clone(), store.clone()));
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap(),
    ));
    let relay = OutboxRelay::new(store.clone(), channel.clone(), relay_config())
        .with_clock(clock.clone());

    // Act: first delivery fails, the retry after backoff succeeds.
    let first = relay.run_once().await.unwrap();
    let book_after_failure = engine.read_model().await;
    clock.advance(chrono::Duration::milliseconds(100));
    let second = relay.run_once().await.unwrap();

    // Assert
    assert_eq!(first.failed, 1);
    assert!(book_after_failure.totals.is_empty());
    assert_eq!(second.published, 1);

    let book = engine.read_model().await;
    assert_eq!(book.totals.get("o-1"), Some(&4_200));
    assert_eq!(book.placed, 1);
    assert_eq!(engine.checkpoint().await.unwrap(), 1);
    assert_eq!(
        checkpoints
            .load("order-book")
            .await
            .unwrap()
            .unwrap()
            .last_global_position_applied,
        1
    );
}

#[tokio::test]
async fn test_redelivered_event_is_acknowledged_without_reapplying() {
    let store = Arc::new(InMemoryEventStore::new());
    store.append("order-1", 0, vec![placed("o-1", 10)]).await.unwrap();
    let engine = Arc::new(
        order_book(Arc::new(InMemoryCheckpointStore::new())).on("OrderPlaced", record_placed),
    );
    let channel = ProjectionChannel::new(engine.clone(), store.clone());
    let events: Vec<RecordedEvent> = store.read_all(1).try_collect().await.unwrap();
    let event = events[0].clone();

    channel.send(&event).await.unwrap();
    channel.send(&event).await.unwrap();

    assert_eq!(engine.read_model().await.placed, 1);
}

#[tokio::test]
async fn test_relay_delivering_streams_out_of_order_keeps_global_order() {
    // Arrange: stream a's event fails at the projection once, so the relay
    // holds stream a back while stream b flows.
    let store = Arc::new(InMemoryEventStore::new());
    store.append("a", 0, vec![placed("a-1", 1)]).await.unwrap();
    store.append("b", 0, vec![placed("b-1", 2)]).await.unwrap();
    let engine = Arc::new(
        order_book(Arc::new(InMemoryCheckpointStore::new())).on("OrderPlaced", flaky_placed(1)),
    );
    let channel = Arc::new(ProjectionChannel::new(engine.clone(), store.clone()));
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap(),
    ));
    let relay =
        OutboxRelay::new(store.clone(), channel, relay_config()).with_clock(clock.clone());

    // Act
    let first = relay.run_once().await.unwrap();
    clock.advance(chrono::Duration::milliseconds(100));
    let second = relay.run_once().await.unwrap();

    // Assert: b's delivery pulled a in first; a's redelivery is a duplicate.
    assert_eq!(first.failed, 1);
    assert_eq!(first.published, 1);
    assert_eq!(second.published, 1);
    let book = engine.read_model().await;
    assert_eq!(book.seen, vec![1, 2]);
    assert_eq!(book.placed, 2);
}

// --- store-driven projection ---

#[tokio::test]
async fn test_events_are_applied_in_global_order_across_streams() {
    // Arrange
    let store = Arc::new(InMemoryEventStore::new());
    store.append("a", 0, vec![placed("a-1", 1)]).await.unwrap();
    store.append("b", 0, vec![placed("b-1", 2)]).await.unwrap();
    store
        .append("a", 1, vec![EventDraft::new("OrderCancelled", json!({ "reason": "x" }))])
        .await
        .unwrap();
    store.append("c", 0, vec![placed("c-1", 3)]).await.unwrap();
    let checkpoints = Arc::new(InMemoryCheckpointStore::new());
    let engine = order_book(checkpoints.clone())
        .on("OrderPlaced", record_placed)
        .on("OrderCancelled", record_seen);
    let mut source = StoreSource::new(store.clone());

    // Act
    let report = engine.run_until_idle(&mut source).await.unwrap();

    // Assert
    assert_eq!(report.applied, 4);
    assert_eq!(report.position, 4);
    assert_eq!(engine.read_model().await.seen, vec![1, 2, 3, 4]);
    assert_eq!(
        checkpoints
            .load("order-book")
            .await
            .unwrap()
            .unwrap()
            .last_global_position_applied,
        4
    );
}

#[tokio::test]
async fn test_events_without_handlers_advance_checkpoint() {
    let store = Arc::new(InMemoryEventStore::new());
    store
        .append(
            "s",
            0,
            vec![EventDraft::new("Unrelated", json!({})), placed("o-1", 5)],
        )
        .await
        .unwrap();
    let engine =
        order_book(Arc::new(InMemoryCheckpointStore::new())).on("OrderPlaced", record_placed);

    let report = engine.run_once(&mut StoreSource::new(store)).await.unwrap();

    assert_eq!(report.applied, 2);
    assert_eq!(engine.checkpoint().await.unwrap(), 2);
    assert_eq!(engine.read_model().await.seen, vec![2]);
}

#[tokio::test]
async fn test_batch_size_bounds_one_run() {
    let store = Arc::new(InMemoryEventStore::new());
    store
        .append("s", 0, (1..=7).map(|n| placed(&format!("o-{n}"), n)).collect())
        .await
        .unwrap();
    let engine = ProjectionEngine::new(
        "order-book",
        OrderBook::default(),
        Arc::new(InMemoryCheckpointStore::new()),
        &ProjectionConfig {
            batch_size: 3,
            ..config()
        },
    )
    .on("OrderPlaced", record_placed);
    let mut source = StoreSource::new(store);

    let first = engine.run_once(&mut source).await.unwrap();
    let rest = engine.run_until_idle(&mut source).await.unwrap();

    assert_eq!(first.applied, 3);
    assert_eq!(first.position, 3);
    assert_eq!(rest.applied, 4);
    assert_eq!(engine.read_model().await.placed, 7);
}

#[tokio::test]
async fn test_restarted_engine_resumes_from_checkpoint() {
    // Arrange: a first engine projects three events.
    let store = Arc::new(InMemoryEventStore::new());
    store
        .append("s", 0, vec![placed("o-1", 1), placed("o-2", 2), placed("o-3", 3)])
        .await
        .unwrap();
    let checkpoints = Arc::new(InMemoryCheckpointStore::new());
    let first = order_book(checkpoints.clone()).on("OrderPlaced", record_placed);
    first.run_until_idle(&mut StoreSource::new(store.clone())).await.unwrap();
    drop(first);

    // Act: more events arrive; a new process starts with an empty model.
    store
        .append("s", 3, vec![placed("o-4", 4), placed("o-5", 5)])
        .await
        .unwrap();
    let second = order_book(checkpoints).on("OrderPlaced", record_placed);
    let report = second
        .run_until_idle(&mut StoreSource::new(store))
        .await
        .unwrap();

    // Assert: the stored model was restored, then extended.
    assert_eq!(report.applied, 2);
    let book = second.read_model().await;
    assert_eq!(book.placed, 5);
    assert_eq!(book.seen, vec![1, 2, 3, 4, 5]);
    assert_eq!(book.totals.len(), 5);
}

#[tokio::test]
async fn test_checkpoint_is_stored_with_the_read_model() {
    let store = Arc::new(InMemoryEventStore::new());
    store.append("s", 0, vec![placed("o-1", 7)]).await.unwrap();
    let checkpoints = Arc::new(InMemoryCheckpointStore::new());
    let engine = order_book(checkpoints.clone()).on("OrderPlaced", record_placed);

    engine.run_until_idle(&mut StoreSource::new(store)).await.unwrap();

    let stored = checkpoints.load("order-book").await.unwrap().unwrap();
    assert_eq!(stored.last_global_position_applied, 1);
    let model: OrderBook = serde_json::from_value(stored.read_model.unwrap()).unwrap();
    assert_eq!(model, engine.read_model().await);
}

#[tokio::test]
async fn test_checkpoint_without_read_model_rebuilds_from_start() {
    // Arrange: a position was stored, but no model to go with it.
    let store = Arc::new(InMemoryEventStore::new());
    store.append("s", 0, vec![placed("o-1", 1), placed("o-2", 2)]).await.unwrap();
    let checkpoints = Arc::new(InMemoryCheckpointStore::new());
    checkpoints
        .save(&Checkpoint {
            consumer_id: "order-book".into(),
            last_global_position_applied: 2,
            read_model: None,
        })
        .await
        .unwrap();
    let engine = order_book(checkpoints).on("OrderPlaced", record_placed);

    // Act
    let report = engine.run_until_idle(&mut StoreSource::new(store)).await.unwrap();

    // Assert
    assert_eq!(report.applied, 2);
    assert_eq!(engine.read_model().await.seen, vec![1, 2]);
}

#[tokio::test]
async fn test_consumer_groups_keep_separate_checkpoints() {
    let store = Arc::new(InMemoryEventStore::new());
    store.append("s", 0, vec![placed("o-1", 1), placed("o-2", 2)]).await.unwrap();
    let checkpoints = Arc::new(InMemoryCheckpointStore::new());
    let book = order_book(checkpoints.clone()).on("OrderPlaced", record_placed);
    let audit =
        ProjectionEngine::new("audit", OrderBook::default(), checkpoints.clone(), &config());

    book.run_until_idle(&mut StoreSource::new(store)).await.unwrap();

    assert_eq!(book.checkpoint().await.unwrap(), 2);
    assert_eq!(audit.checkpoint().await.unwrap(), 0);
    assert!(checkpoints.load("audit").await.unwrap().is_none());
}

#[tokio::test]
async fn test_old_schema_is_upcast_before_dispatch() {
    let store = Arc::new(InMemoryEventStore::new());
    store
        .append(
            "order-1",
            0,
            vec![EventDraft::new("OrderPlaced", json!({ "order_id": "o-1", "amount": 900 }))],
        )
        .await
        .unwrap();
    let engine = order_book(Arc::new(InMemoryCheckpointStore::new()))
        .with_upcasters(order_upcasters())
        .on("OrderPlaced", record_placed);

    let report = engine.run_once(&mut StoreSource::new(store)).await.unwrap();

    assert_eq!(report.applied, 1);
    assert_eq!(engine.read_model().await.totals.get("o-1"), Some(&900));
}

// --- failure policies ---

#[tokio::test]
async fn test_failed_event_leaves_no_partial_update() {
    // Arrange: the first handler records the event, the second rejects it.
    let store = Arc::new(InMemoryEventStore::new());
    store.append("s", 0, vec![placed("o-1", 1)]).await.unwrap();
    let checkpoints = Arc::new(InMemoryCheckpointStore::new());
    let engine = order_book(checkpoints.clone())
        .with_policy(FailurePolicy::DeadLetterAfter(1))
        .on("OrderPlaced", record_seen)
        .on("OrderPlaced", |_, _| Err(ProjectionError::new("rejected")));

    // Act
    let report = engine.run_once(&mut StoreSource::new(store)).await.unwrap();

    // Assert: dead-lettered and checkpointed, but the model is untouched.
    assert_eq!(report.dead_lettered, 1);
    assert_eq!(report.position, 1);
    assert_eq!(engine.read_model().await, OrderBook::default());
    let stored = checkpoints.load("order-book").await.unwrap().unwrap();
    assert_eq!(stored.read_model, Some(serde_json::to_value(OrderBook::default()).unwrap()));
}

#[tokio::test]
async fn test_failing_event_is_dead_lettered_after_max_attempts() {
    // Arrange
    let store = Arc::new(InMemoryEventStore::new());
    store
        .append("s", 0, vec![EventDraft::new("Poison", json!({})), placed("o-1", 1)])
        .await
        .unwrap();
    let sink = Arc::new(InMemoryDeadLetterSink::new());
    let engine = order_book(Arc::new(InMemoryCheckpointStore::new()))
        .with_dead_letter_sink(sink.clone())
        .on("Poison", |_, _| Err(ProjectionError::new("cannot apply")))
        .on("OrderPlaced", record_placed);
    let mut source = StoreSource::new(store);

    // Act
    let first = engine.run_once(&mut source).await.unwrap();
    let second = engine.run_once(&mut source).await.unwrap();
    let third = engine.run_once(&mut source).await.unwrap();

    // Assert: checkpoint holds until the third failure, then moves past.
    assert!(first.failed);
    assert_eq!(first.position, 0);
    assert!(second.failed);
    assert_eq!(second.position, 0);
    assert!(!third.failed);
    assert_eq!(third.dead_lettered, 1);
    assert_eq!(third.applied, 1);
    assert_eq!(third.position, 2);

    let letters = sink.letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(
        letters[0].source,
        DeadLetterSource::Projection {
            consumer_id: "order-book".into()
        }
    );
    assert_eq!(letters[0].global_position, 1);
    assert_eq!(letters[0].attempts, 3);
    assert_eq!(letters[0].reason, "cannot apply");
    assert_eq!(engine.read_model().await.seen, vec![2]);
}

#[tokio::test]
async fn test_block_policy_retries_until_handler_recovers() {
    // Arrange
    let store = Arc::new(InMemoryEventStore::new());
    store.append("s", 0, vec![placed("o-1", 1), placed("o-2", 2)]).await.unwrap();
    let sink = Arc::new(InMemoryDeadLetterSink::new());
    let engine = order_book(Arc::new(InMemoryCheckpointStore::new()))
        .with_policy(FailurePolicy::Block)
        .with_dead_letter_sink(sink.clone())
        .on("OrderPlaced", flaky_placed(5));
    let mut source = StoreSource::new(store);

    // Act
    let mut stuck = Vec::new();
    for _ in 0..5 {
        stuck.push(engine.run_once(&mut source).await.unwrap());
    }
    let recovered = engine.run_once(&mut source).await.unwrap();

    // Assert
    assert!(stuck.iter().all(|r| r.failed && r.position == 0));
    assert_eq!(recovered.applied, 2);
    assert_eq!(recovered.position, 2);
    assert!(sink.letters().is_empty());
}

#[tokio::test]
async fn test_failure_midway_checkpoints_events_before_it() {
    let store = Arc::new(InMemoryEventStore::new());
    store
        .append(
            "s",
            0,
            vec![placed("o-1", 1), EventDraft::new("Poison", json!({})), placed("o-2", 2)],
        )
        .await
        .unwrap();
    let checkpoints = Arc::new(InMemoryCheckpointStore::new());
    let engine = order_book(checkpoints.clone())
        .on("Poison", |_, _| Err(ProjectionError::new("cannot apply")))
        .on("OrderPlaced", record_placed);

    let report = engine.run_once(&mut StoreSource::new(store)).await.unwrap();

    assert!(report.failed);
    assert_eq!(report.applied, 1);
    assert_eq!(
        checkpoints
            .load("order-book")
            .await
            .unwrap()
            .unwrap()
            .last_global_position_applied,
        1
    );
}

// --- channel source ---

#[tokio::test]
async fn test_channel_source_reads_announced_range_in_order() {
    // Arrange: deliveries arrive out of global order and one twice.
    let store = Arc::new(InMemoryEventStore::new());
    store.append("a", 0, vec![placed("a-1", 1), placed("a-2", 2)]).await.unwrap();
    store.append("b", 0, vec![placed("b-1", 3)]).await.unwrap();
    let events: Vec<RecordedEvent> = store.read_all(1).try_collect().await.unwrap();
    let (tx, rx) = mpsc::channel(16);
    let mut source = ChannelSource::new(rx, store.clone());
    let engine =
        order_book(Arc::new(InMemoryCheckpointStore::new())).on("OrderPlaced", record_placed);

    // Act
    tx.send(events[2].clone()).await.unwrap();
    tx.send(events[0].clone()).await.unwrap();
    let first = engine.run_once(&mut source).await.unwrap();
    tx.send(events[1].clone()).await.unwrap();
    let duplicate = engine.run_once(&mut source).await.unwrap();

    // Assert
    assert_eq!(first.applied, 3);
    assert_eq!(duplicate.applied, 0);
    assert_eq!(engine.read_model().await.seen, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_channel_source_without_deliveries_is_idle() {
    let store = Arc::new(InMemoryEventStore::new());
    store.append("a", 0, vec![placed("a-1", 1)]).await.unwrap();
    let (tx, rx) = mpsc::channel(1);
    let mut source = ChannelSource::new(rx, store);
    let engine =
        order_book(Arc::new(InMemoryCheckpointStore::new())).on("OrderPlaced", record_placed);

    let report = engine.run_once(&mut source).await.unwrap();
    drop(tx);
    engine.run_once(&mut source).await.unwrap();

    assert!(!report.progressed());
    assert!(source.is_closed());
}

// --- background task ---

#[tokio::test]
async fn test_spawned_projection_catches_up_and_stops() {
    // Arrange
    let store = Arc::new(InMemoryEventStore::new());
    let engine = Arc::new(
        order_book(Arc::new(InMemoryCheckpointStore::new())).on("OrderPlaced", record_placed),
    );
    let handle = engine.clone().spawn(StoreSource::new(store.clone()));

    // Act
    store.append("s", 0, vec![placed("o-1", 1), placed("o-2", 2)]).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while engine.checkpoint().await.unwrap() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    handle.stop().await.unwrap();

    // Assert
    assert_eq!(engine.read_model().await.placed, 2);
}
