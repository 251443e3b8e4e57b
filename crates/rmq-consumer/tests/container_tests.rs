//! ListenerContainer Tests
//!
//! Tests for:
//! - Manual-ack lock exclusivity between two clients on one virtual queue
//! - Pause blocks polling until the assignment guard is dropped
//! - Stop waits for in-flight handlers, bounded by the shutdown timeout
//! - A lease left by a stopped client is redelivered only after its TTL

use parking_lot::Mutex;
use rmq_common::{AckMode, Keys, Message, Queue, TokioClock};
use rmq_config::ConsumerConfig;
use rmq_consumer::{
    ConsumptionExecutor, ContainerContext, Handler, HandlerResult, InterceptorChain,
    ListenerContainer, RetryPolicy, WakeScheduler,
};
use rmq_store::{MemoryStore, Producer, QueueStore};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn ok() -> HandlerResult {
    Ok(())
}

struct Fixture {
    clock: Arc<TokioClock>,
    store: Arc<MemoryStore>,
    keys: Keys,
}

impl Fixture {
    fn new() -> Self {
        let clock = Arc::new(TokioClock::starting_at(1_000_000));
        Self {
            store: Arc::new(MemoryStore::with_clock(clock.clone())),
            clock,
            keys: Keys::new("test"),
        }
    }

    async fn producer(&self, queue: &Queue) -> Producer {
        let producer =
            Producer::new(self.store.clone(), self.keys.clone()).with_clock(self.clock.clone());
        producer.register_queue(queue.clone()).await.unwrap();
        producer
    }

    fn container(
        &self,
        client_id: &str,
        queue: &Queue,
        config: ConsumerConfig,
        handler: Handler,
    ) -> Arc<ListenerContainer> {
        let executor = ConsumptionExecutor::new(
            queue.name.clone(),
            "*",
            handler,
            Arc::new(InterceptorChain::default()),
            RetryPolicy::default(),
        );
        let ctx = ContainerContext {
            client_id: client_id.to_string(),
            store: self.store.clone(),
            keys: self.keys.clone(),
            clock: self.clock.clone(),
            config,
            scheduler: Arc::new(WakeScheduler::new(self.clock.clone())),
            message_store: None,
        };
        let executors = HashMap::from([("*".to_string(), Arc::new(executor))]);
        Arc::new(ListenerContainer::new(queue.clone(), executors, ctx))
    }
}

fn manual() -> ConsumerConfig {
    ConsumerConfig {
        ack_mode: AckMode::Manual,
        ..ConsumerConfig::default()
    }
}

/// Handler recording which client consumed each message id
fn tracking_handler(client: &'static str, seen: Arc<Mutex<Vec<(String, &'static str)>>>) -> Handler {
    Handler::envelope(move |message: Message| {
        let seen = seen.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            seen.lock().push((message.id, client));
            ok()
        }
    })
}

#[tokio::test(start_paused = true)]
async fn test_manual_lock_is_exclusive() {
    let fixture = Fixture::new();
    let queue = Queue::new("orders", 1).with_max_concurrency(3);
    let producer = fixture.producer(&queue).await;
    let seen = Arc::new(Mutex::new(Vec::new()));

    let a = fixture.container("client-a", &queue, manual(), tracking_handler("a", seen.clone()));
    let b = fixture.container("client-b", &queue, manual(), tracking_handler("b", seen.clone()));
    let owned = vec!["orders#0".to_string()];
    for container in [&a, &b] {
        assert!(container.pause().await.replace(&owned));
        container.start().unwrap();
    }

    let mut sent = Vec::new();
    for i in 0..20 {
        sent.push(producer.send(Message::new("orders", json!(i))).await.unwrap().id);
    }

    tokio::time::timeout(Duration::from_secs(30), async {
        while seen.lock().len() < 20 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    // Let any duplicate delivery surface
    tokio::time::sleep(Duration::from_secs(3)).await;

    let seen = seen.lock().clone();
    assert_eq!(seen.len(), 20);
    let mut ids: Vec<String> = seen.iter().map(|(id, _)| id.clone()).collect();
    ids.sort();
    sent.sort();
    assert_eq!(ids, sent);

    assert_eq!(fixture.store.count(&fixture.keys.queue("orders#0")).await.unwrap(), 0);
    for id in &sent {
        assert_eq!(fixture.store.lock_owner(&fixture.keys.lock(id)), None);
    }

    let claimed = a.stats().await.claimed + b.stats().await.claimed;
    assert_eq!(claimed, 20);

    a.stop().await;
    b.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_pause_blocks_polling() {
    let fixture = Fixture::new();
    let queue = Queue::new("orders", 1);
    let producer = fixture.producer(&queue).await;
    let consumed = Arc::new(AtomicU32::new(0));

    let handler = {
        let consumed = consumed.clone();
        Handler::envelope(move |_message| {
            let consumed = consumed.clone();
            async move {
                consumed.fetch_add(1, Ordering::SeqCst);
                ok()
            }
        })
    };
    let container = fixture.container("client-a", &queue, ConsumerConfig::default(), handler);
    container.pause().await.replace(&["orders#0".to_string()]);
    container.start().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let guard = container.pause().await;
    assert_eq!(guard.current(), ["orders#0".to_string()]);
    producer.send(Message::new("orders", json!(1))).await.unwrap();
    container.wake();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(consumed.load(Ordering::SeqCst), 0);

    drop(guard);
    container.wake();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(consumed.load(Ordering::SeqCst), 1);

    container.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_unassigned_queue_is_left_alone() {
    let fixture = Fixture::new();
    let queue = Queue::new("orders", 2);
    let producer = fixture.producer(&queue).await;
    let consumed = Arc::new(AtomicU32::new(0));

    let handler = {
        let consumed = consumed.clone();
        Handler::envelope(move |_message| {
            let consumed = consumed.clone();
            async move {
                consumed.fetch_add(1, Ordering::SeqCst);
                ok()
            }
        })
    };
    let container = fixture.container("client-a", &queue, ConsumerConfig::default(), handler);
    container.pause().await.replace(&["orders#1".to_string(), "other#0".to_string()]);
    assert_eq!(container.assigned().await, vec!["orders#1".to_string()]);
    container.start().unwrap();

    producer
        .send(Message::new("orders", json!(1)).with_key("k"))
        .await
        .unwrap();
    let target = queue.virtual_queue_for_key("k");
    tokio::time::sleep(Duration::from_secs(3)).await;

    let expected = u32::from(target == "orders#1");
    assert_eq!(consumed.load(Ordering::SeqCst), expected);

    container.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_cancels_after_timeout() {
    let fixture = Fixture::new();
    let queue = Queue::new("orders", 1);
    let producer = fixture.producer(&queue).await;
    let finished = Arc::new(AtomicU32::new(0));

    let handler = {
        let finished = finished.clone();
        Handler::envelope(move |_message| {
            let finished = finished.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                ok()
            }
        })
    };
    let config = ConsumerConfig {
        shutdown_timeout_ms: 2000,
        ..ConsumerConfig::default()
    };
    let container = fixture.container("client-a", &queue, config, handler);
    container.pause().await.replace(&["orders#0".to_string()]);
    container.start().unwrap();

    producer.send(Message::new("orders", json!(1))).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(container.stats().await.in_flight, 1);

    let stopping = tokio::time::Instant::now();
    container.stop().await;
    let waited = stopping.elapsed();
    assert!(waited >= Duration::from_secs(2) && waited < Duration::from_secs(3));
    assert_eq!(finished.load(Ordering::SeqCst), 0);

    let stats = container.stats().await;
    assert!(!stats.running);
    assert_eq!(stats.in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_lease_redelivered_after_ttl() {
    let fixture = Fixture::new();
    let queue = Queue::new("orders", 1);
    let producer = fixture.producer(&queue).await;
    let owned = vec!["orders#0".to_string()];

    let started = Arc::new(AtomicU32::new(0));
    let hanging = {
        let started = started.clone();
        Handler::envelope(move |_message| {
            let started = started.clone();
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(3600)).await;
                ok()
            }
        })
    };
    let a = fixture.container("client-a", &queue, manual(), hanging);
    a.pause().await.replace(&owned);
    a.start().unwrap();

    let sent = producer.send(Message::new("orders", json!(1))).await.unwrap();
    let claimed_at = tokio::time::Instant::now();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(started.load(Ordering::SeqCst), 1);
    let lock = fixture.keys.lock(&sent.id);
    assert_eq!(fixture.store.lock_owner(&lock).as_deref(), Some("client-a"));

    // A dies mid-handler: the lease is neither renewed nor released
    a.stop().await;
    assert_eq!(fixture.store.lock_owner(&lock).as_deref(), Some("client-a"));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let b = fixture.container("client-b", &queue, manual(), tracking_handler("b", seen.clone()));
    b.pause().await.replace(&owned);
    b.start().unwrap();

    tokio::time::sleep_until(claimed_at + Duration::from_secs(30)).await;
    assert!(seen.lock().is_empty());
    assert_eq!(fixture.store.count(&fixture.keys.queue("orders#0")).await.unwrap(), 1);

    tokio::time::sleep_until(claimed_at + Duration::from_secs(70)).await;
    assert_eq!(*seen.lock(), vec![(sent.id.clone(), "b")]);
    assert_eq!(fixture.store.count(&fixture.keys.queue("orders#0")).await.unwrap(), 0);
    assert_eq!(fixture.store.lock_owner(&lock), None);

    b.stop().await;
}
