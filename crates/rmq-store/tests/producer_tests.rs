//! Producer Tests
//!
//! Tests for:
//! - Virtual queue selection (key hash, round-robin)
//! - Offsets and schedule fields on enqueued messages
//! - Push hints
//! - Queue registry lookups
//! - Cancel and replay through the durable store

use std::sync::Arc;
use std::time::Duration;

use rmq_common::{Keys, Message, MessageStatus, PushHint, Queue, TokioClock};
use rmq_store::{
    MemoryMessageStore, MemoryStore, MessageStore, Producer, QueueStore, StoreError,
};
use serde_json::json;

fn setup() -> (Arc<MemoryStore>, Producer, Keys) {
    let clock = Arc::new(TokioClock::starting_at(1_000_000));
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let keys = Keys::new("test");
    let producer = Producer::new(store.clone(), keys.clone()).with_clock(clock);
    (store, producer, keys)
}

#[tokio::test(start_paused = true)]
async fn test_message_lands_in_exactly_one_virtual_queue() {
    let (store, producer, keys) = setup();
    producer.register_queue(Queue::new("orders", 3)).await.unwrap();

    let sent = producer
        .send(Message::new("orders", json!({"orderId": 1})))
        .await
        .unwrap();

    let mut total = 0;
    for vq in Queue::new("orders", 3).virtual_queues() {
        let count = store.count(&keys.queue(&vq)).await.unwrap();
        if count == 1 {
            assert_eq!(vq, sent.virtual_queue_name);
        }
        total += count;
    }
    assert_eq!(total, 1);
    assert_eq!(sent.offset, Some(1));
    assert_eq!(sent.execute_time, 1_000_000);
    assert_eq!(sent.execute_scope, None);
    assert!(!sent.id.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_same_key_same_virtual_queue() {
    let (_store, producer, _keys) = setup();
    producer.register_queue(Queue::new("orders", 8)).await.unwrap();

    let first = producer
        .send(Message::new("orders", json!(1)).with_key("customer-7"))
        .await
        .unwrap();
    let second = producer
        .send(Message::new("orders", json!(2)).with_key("customer-7"))
        .await
        .unwrap();

    assert_eq!(first.virtual_queue_name, second.virtual_queue_name);
    assert_eq!(second.offset, Some(first.offset.unwrap() + 1));
}

#[tokio::test(start_paused = true)]
async fn test_round_robin_without_key() {
    let (_store, producer, _keys) = setup();
    producer.register_queue(Queue::new("orders", 3)).await.unwrap();

    let mut seen = Vec::new();
    for i in 0..3 {
        let sent = producer.send(Message::new("orders", json!(i))).await.unwrap();
        seen.push(sent.virtual_queue_name);
    }
    seen.sort();
    assert_eq!(seen, vec!["orders#0", "orders#1", "orders#2"]);
}

#[tokio::test(start_paused = true)]
async fn test_delayed_message_score_and_hint() {
    let (store, producer, keys) = setup();
    producer.register_queue(Queue::new("reminders", 1).delayed()).await.unwrap();
    let mut hints = store.subscribe(&[keys.push_channel()]).await.unwrap();

    let sent = producer
        .send_delayed(Message::new("reminders", json!("ping")), Duration::from_secs(5))
        .await
        .unwrap();

    let entries = store.peek(&keys.queue("reminders#0"), 10).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].score, 1_005_000);
    assert_eq!(sent.execute_scope, Some(1_005));

    let received = tokio::time::timeout(Duration::from_secs(1), hints.recv())
        .await
        .unwrap()
        .unwrap();
    let hint = PushHint::parse(&received.payload);
    assert_eq!(hint.queue, "reminders");
    assert_eq!(hint.ready_at, Some(1_005_000));
}

#[tokio::test(start_paused = true)]
async fn test_delay_rejected_on_immediate_queue() {
    let (_store, producer, _keys) = setup();
    producer.register_queue(Queue::new("orders", 1)).await.unwrap();

    let result = producer
        .send_delayed(Message::new("orders", json!(1)), Duration::from_secs(1))
        .await;
    assert!(matches!(result, Err(StoreError::InvalidMessage(_))));
}

#[tokio::test(start_paused = true)]
async fn test_unknown_queue() {
    let (_store, producer, _keys) = setup();
    let result = producer.send(Message::new("missing", json!(1))).await;
    assert!(matches!(result, Err(StoreError::QueueNotFound(_))));
}

#[tokio::test(start_paused = true)]
async fn test_queue_registry_is_shared() {
    let (store, producer, keys) = setup();
    producer.register_queue(Queue::new("orders", 2)).await.unwrap();
    producer.register_queue(Queue::new("audit", 1)).await.unwrap();

    // A second producer on the same store resolves definitions remotely
    let other = Producer::new(store, keys);
    assert_eq!(other.queue("orders").await.unwrap().virtual_count, 2);
    let names: Vec<_> = other.list_queues().await.unwrap().into_iter().map(|q| q.name).collect();
    assert_eq!(names, vec!["audit", "orders"]);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_and_replay() {
    let clock = Arc::new(TokioClock::starting_at(1_000_000));
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let keys = Keys::new("test");
    let durable = Arc::new(MemoryMessageStore::new());
    let producer = Producer::new(store.clone(), keys.clone())
        .with_clock(clock)
        .with_message_store(durable.clone());
    producer.register_queue(Queue::new("orders", 1)).await.unwrap();

    let first = producer.send(Message::new("orders", json!(1))).await.unwrap();
    let second = producer.send(Message::new("orders", json!(2))).await.unwrap();
    assert_eq!(durable.len(), 2);

    assert!(producer.try_cancel(&first).await.unwrap());
    assert!(!producer.try_cancel(&first).await.unwrap());
    assert_eq!(durable.get(&first.id).unwrap().status, MessageStatus::Cancelled);

    // Simulate consumption of the second message, then replay the range
    let vq = keys.queue("orders#0");
    assert!(store.remove(&vq, &second.to_member().unwrap()).await.unwrap());
    let replayed = producer.replay("orders#0", 0, 2, 100).await.unwrap();
    assert_eq!(replayed, 2);
    assert_eq!(store.count(&vq).await.unwrap(), 2);

    let rows = durable.query_by_offset_range("orders#0", 1, 2, 10).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, second.id);
}
