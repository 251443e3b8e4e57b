//! Delay Queue Tests
//!
//! Tests for:
//! - A delayed message is consumed at its ready time, not before
//! - An earlier send re-arms the wake-up
//! - Immediate queues reject delayed sends

use parking_lot::Mutex;
use rmq_common::{Clock, Message, Queue, TokioClock};
use rmq_config::AppConfig;
use rmq_consumer::{ContainerMode, Handler, HandlerResult, ListenerOptions, MqClient};
use rmq_store::{MemoryStore, StoreError};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_err;

fn ok() -> HandlerResult {
    Ok(())
}

fn config() -> AppConfig {
    let mut config = AppConfig::default();
    config.redis.key_prefix = "test".to_string();
    config.client.client_id = "client-a".to_string();
    config
}

/// Handler recording `(body, consumed at)` for every delivery
fn recording_handler(clock: Arc<TokioClock>, log: Arc<Mutex<Vec<(String, i64)>>>) -> Handler {
    Handler::text(move |body: String| {
        let clock = clock.clone();
        let log = log.clone();
        async move {
            log.lock().push((body, clock.now_millis()));
            ok()
        }
    })
}

async fn wait_for_deliveries(log: &Arc<Mutex<Vec<(String, i64)>>>, count: usize, limit: Duration) -> bool {
    tokio::time::timeout(limit, async {
        while log.lock().len() < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

async fn start_client(clock: Arc<TokioClock>, log: Arc<Mutex<Vec<(String, i64)>>>) -> Arc<MqClient> {
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let client = MqClient::builder(config(), store)
        .clock(clock.clone())
        .queue(Queue::new("reminders", 2).delayed())
        .listener("reminders", "*", recording_handler(clock, log), ListenerOptions::default())
        .build()
        .unwrap();
    client.start().await.unwrap();
    client
}

#[tokio::test(start_paused = true)]
async fn test_delayed_message_consumed_on_time() {
    let clock = Arc::new(TokioClock::starting_at(1_000_000));
    let log = Arc::new(Mutex::new(Vec::new()));
    let client = start_client(clock.clone(), log.clone()).await;
    assert_eq!(client.container("reminders").unwrap().mode(), ContainerMode::Delay);

    let sent_at = clock.now_millis();
    let sent = client
        .producer()
        .send_delayed(Message::new("reminders", json!("ping")), Duration::from_millis(5000))
        .await
        .unwrap();
    assert_eq!(sent.execute_time, sent_at + 5000);

    tokio::time::sleep(Duration::from_millis(4900)).await;
    assert!(log.lock().is_empty(), "consumed before it was ready");

    assert!(wait_for_deliveries(&log, 1, Duration::from_secs(5)).await);
    let delay = log.lock()[0].1 - sent_at;
    assert!((5000..=5250).contains(&delay), "consumed after {delay}ms");

    client.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_earlier_send_rearms_wake() {
    let clock = Arc::new(TokioClock::starting_at(1_000_000));
    let log = Arc::new(Mutex::new(Vec::new()));
    let client = start_client(clock.clone(), log.clone()).await;
    let producer = client.producer();

    let sent_at = clock.now_millis();
    producer
        .send_delayed(Message::new("reminders", json!("late")), Duration::from_secs(10))
        .await
        .unwrap();
    producer
        .send_delayed(Message::new("reminders", json!("early")), Duration::from_secs(2))
        .await
        .unwrap();

    assert!(wait_for_deliveries(&log, 2, Duration::from_secs(15)).await);
    let log = log.lock().clone();
    assert_eq!(log[0].0, "early");
    assert_eq!(log[1].0, "late");

    let early = log[0].1 - sent_at;
    let late = log[1].1 - sent_at;
    assert!((2000..=2250).contains(&early), "early consumed after {early}ms");
    assert!((10_000..=10_250).contains(&late), "late consumed after {late}ms");

    client.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_immediate_queue_rejects_delayed_send() {
    let clock = Arc::new(TokioClock::starting_at(1_000_000));
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let client = MqClient::builder(config(), store)
        .clock(clock)
        .queue(Queue::new("orders", 1))
        .build()
        .unwrap();
    client.start().await.unwrap();

    let error = assert_err!(
        client
            .producer()
            .send_delayed(Message::new("orders", json!(1)), Duration::from_secs(5))
            .await
    );
    assert!(matches!(error, StoreError::InvalidMessage(_)));

    client.shutdown().await.unwrap();
}
