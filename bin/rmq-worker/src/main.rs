//! RedisMQ Worker
//!
//! Joins the consumer cluster for every queue in the configuration and logs
//! each message it receives. Useful as a smoke test against a real Redis and
//! as the starting point for a service with real handlers.
//!
//! Configuration comes from `redismq.toml` (or `REDISMQ_CONFIG`) with
//! `REDISMQ_*` environment overrides. Set `REDISMQ_WORKER_SEED=N` to publish N
//! sample messages into each queue at startup.

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use rmq_common::Message;
use rmq_config::{AppConfig, ConfigLoader};
use rmq_consumer::{Handler, ListenerOptions, MqClient};
use rmq_store::{MemoryMessageStore, MessageStore, RedisStore, SqliteMessageStore};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for local development)
    let _ = dotenvy::dotenv();

    rmq_common::logging::init_logging("rmq-worker");

    info!("Starting RedisMQ worker");

    // 1. Configuration
    let config = ConfigLoader::new().load().context("Failed to load configuration")?;
    if config.queues.is_empty() {
        error!("No queues configured - nothing to consume");
        return Err(anyhow::anyhow!("No [[queues]] entries in configuration"));
    }

    // 2. Prometheus exporter
    if config.metrics.enabled {
        let addr: SocketAddr = config
            .metrics
            .listen
            .parse()
            .with_context(|| format!("Invalid metrics listen address {}", config.metrics.listen))?;
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!(%addr, "Prometheus exporter listening");
    }

    // 3. Redis
    let store = Arc::new(
        RedisStore::connect(&config.redis.url)
            .await
            .with_context(|| format!("Failed to connect to Redis at {}", config.redis.url))?,
    );
    info!(url = %config.redis.url, prefix = %config.redis.key_prefix, "Connected to Redis");

    // 4. Durable message store
    let message_store = durable_store(&config).await?;

    // 5. Client with one logging listener per queue
    let mut builder = MqClient::builder(config.clone(), store);
    if let Some(message_store) = message_store {
        builder = builder.message_store(message_store);
    }
    for queue in &config.queues {
        builder = builder.listener(
            queue.name.clone(),
            "*",
            logging_handler(),
            ListenerOptions::default(),
        );
    }
    let client = builder.build()?;
    client.start().await?;

    // 6. Optional sample traffic
    seed_messages(&client, &config).await;

    log_startup_summary(&client, &config);
    info!("RedisMQ worker started. Press Ctrl+C to shutdown.");

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received...");

    client.shutdown().await?;

    info!("RedisMQ worker shutdown complete");
    Ok(())
}

async fn durable_store(config: &AppConfig) -> Result<Option<Arc<dyn MessageStore>>> {
    if !config.store.enabled {
        info!("Durable message store disabled");
        return Ok(None);
    }

    let store: Arc<dyn MessageStore> = match config.store.backend.as_str() {
        "sqlite" => {
            let store = SqliteMessageStore::connect(&config.store.sqlite_url)
                .await
                .with_context(|| format!("Failed to open {}", config.store.sqlite_url))?;
            info!(url = %config.store.sqlite_url, "Using SQLite message store");
            Arc::new(store)
        }
        "memory" => {
            info!("Using in-memory message store");
            Arc::new(MemoryMessageStore::new())
        }
        other => {
            return Err(anyhow::anyhow!("Unknown store backend '{other}' (expected memory or sqlite)"));
        }
    };
    Ok(Some(store))
}

fn logging_handler() -> Handler {
    Handler::envelope(|message: Message| async move {
        info!(
            queue = %message.queue,
            virtual_queue = %message.virtual_queue_name,
            message_id = %message.id,
            tag = %message.tag,
            offset = ?message.offset,
            body = %message.body,
            "Received message"
        );
        Ok(())
    })
}

async fn seed_messages(client: &MqClient, config: &AppConfig) {
    let count: u32 = std::env::var("REDISMQ_WORKER_SEED")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if count == 0 {
        return;
    }

    let producer = client.producer();
    for queue in &config.queues {
        for i in 0..count {
            let message = Message::new(
                queue.name.clone(),
                serde_json::json!({ "seq": i, "source": "rmq-worker" }),
            );
            if let Err(e) = producer.send(message).await {
                warn!(queue = %queue.name, error = %e, "Failed to seed message");
                break;
            }
        }
        info!(queue = %queue.name, count, "Seeded sample messages");
    }
}

fn log_startup_summary(client: &MqClient, config: &AppConfig) {
    info!("=== RedisMQ Worker Startup Summary ===");
    info!("  Client: {}", client.client_id());
    info!("  Ack mode: {:?}", config.consumer.ack_mode);
    for queue in &config.queues {
        info!(
            "  Queue: {} (virtual={}, delay={}, concurrency={})",
            queue.name, queue.virtual_count, queue.delay, queue.max_concurrency
        );
    }
    info!("  Owned virtual queues: {}", client.assignment().join(", "));
    info!("======================================");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
