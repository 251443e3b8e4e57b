//! Manual Ack Lease Tests
//!
//! Tests for:
//! - A handler running longer than the lock TTL keeps its lease through renewal
//! - Lock released and message removed after the handler finishes

use rmq_common::{AckMode, Keys, Message, Queue, TokioClock};
use rmq_config::AppConfig;
use rmq_consumer::{Handler, HandlerResult, ListenerOptions, MqClient};
use rmq_store::{MemoryStore, QueueStore};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn ok() -> HandlerResult {
    Ok(())
}

fn manual_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.redis.key_prefix = "test".to_string();
    config.client.client_id = "client-a".to_string();
    config.consumer.ack_mode = AckMode::Manual;
    config.consumer.lock_ttl_secs = 60;
    config.consumer.lease_warmup_secs = 60;
    config.consumer.lease_renew_interval_secs = 30;
    config
}

#[tokio::test(start_paused = true)]
async fn test_long_handler_keeps_lease() {
    let clock = Arc::new(TokioClock::starting_at(1_000_000));
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let keys = Keys::new("test");
    let started = Arc::new(AtomicU32::new(0));
    let finished = Arc::new(AtomicU32::new(0));

    let handler = {
        let started = started.clone();
        let finished = finished.clone();
        Handler::envelope(move |_message| {
            let started = started.clone();
            let finished = finished.clone();
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(90)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                ok()
            }
        })
    };

    let client = MqClient::builder(manual_config(), store.clone())
        .clock(clock)
        .queue(Queue::new("exports", 1))
        .listener("exports", "*", handler, ListenerOptions::default())
        .build()
        .unwrap();
    client.start().await.unwrap();

    // Claim after the renewer's schedule is anchored
    tokio::time::sleep(Duration::from_secs(1)).await;
    let sent = client
        .producer()
        .send(Message::new("exports", json!({"report": "monthly"})))
        .await
        .unwrap();
    let lock_key = keys.lock(&sent.id);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(started.load(Ordering::SeqCst), 1);
    assert_eq!(store.lock_owner(&lock_key).as_deref(), Some("client-a"));
    // Manual mode leaves the entry in place until the handler finishes
    assert_eq!(store.count(&keys.queue("exports#0")).await.unwrap(), 1);

    // Past the original TTL, held only by renewal
    tokio::time::sleep(Duration::from_secs(72)).await;
    assert_eq!(finished.load(Ordering::SeqCst), 0);
    assert_eq!(store.lock_owner(&lock_key).as_deref(), Some("client-a"));
    let container = client.container("exports").unwrap();
    assert_eq!(container.pending().len(), 1);
    assert!(!container.pending().get(&sent.id).unwrap().lease_lost);

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(started.load(Ordering::SeqCst), 1);
    assert_eq!(store.lock_owner(&lock_key), None);
    assert_eq!(store.count(&keys.queue("exports#0")).await.unwrap(), 0);
    assert!(container.pending().is_empty());

    client.shutdown().await.unwrap();
}
