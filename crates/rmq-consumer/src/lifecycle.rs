//! Lifecycle Manager - background tasks for a running client
//!
//! Handles:
//! - Heartbeat refresh (re-register and rebalance)
//! - Periodic rebalance check (stale member purge under the cleanup lock)
//! - Rebalance and push-hint events from pub/sub
//! - Durable store retention cleanup (when a message store is configured)
//! - Shutdown coordination

use rmq_config::AppConfig;
use rmq_store::{MessageStore, Subscription};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::client::MqClient;

/// Configuration for the lifecycle manager
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Interval between heartbeat refreshes
    pub heartbeat_interval: Duration,
    /// Interval between stale-member checks
    pub rebalance_check_interval: Duration,
    /// Interval between durable store cleanups
    pub store_cleanup_interval: Duration,
    /// Durable rows older than this are deleted
    pub retention: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            rebalance_check_interval: Duration::from_secs(20),
            store_cleanup_interval: Duration::from_secs(3600),
            retention: Duration::from_secs(72 * 3600),
        }
    }
}

impl From<&AppConfig> for LifecycleConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            heartbeat_interval: config.client.heartbeat_interval(),
            rebalance_check_interval: config.client.rebalance_check_interval(),
            store_cleanup_interval: config.store.cleanup_interval(),
            retention: config.store.retention(),
        }
    }
}

/// Owns the background tasks of one client
pub struct LifecycleManager {
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
}

impl LifecycleManager {
    /// Start all lifecycle tasks
    pub fn start(
        client: Arc<MqClient>,
        subscription: Subscription,
        message_store: Option<Arc<dyn MessageStore>>,
        config: LifecycleConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let mut handles = Vec::new();

        // Heartbeat refresh
        {
            let client = client.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.heartbeat_interval;

            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                // The first tick is immediate and start() already registered
                ticker.tick().await;

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            debug!("Refreshing heartbeat");
                            if let Err(e) = client.rebalance().await {
                                warn!(error = %e, "Heartbeat refresh failed");
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            info!("Heartbeat task shutting down");
                            break;
                        }
                    }
                }
            }));
        }

        // Rebalance check
        {
            let client = client.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.rebalance_check_interval;

            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            match client.registry().run_rebalance_check().await {
                                Ok(true) => info!("Stale clients removed, rebalance published"),
                                Ok(false) => {}
                                Err(e) => warn!(error = %e, "Rebalance check failed"),
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            info!("Rebalance check shutting down");
                            break;
                        }
                    }
                }
            }));
        }

        // Pub/sub events
        {
            let client = client.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let mut subscription = subscription;
            let rebalance_channel = client.keys().rebalance_channel();
            let push_channel = client.keys().push_channel();

            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        received = subscription.recv() => match received {
                            Some(message) if message.channel == rebalance_channel => {
                                debug!(from = %message.payload, "Rebalance event");
                                if let Err(e) = client.rebalance().await {
                                    warn!(error = %e, "Rebalance after event failed");
                                }
                            }
                            Some(message) if message.channel == push_channel => {
                                client.handle_push_hint(&message.payload);
                            }
                            Some(message) => {
                                debug!(channel = %message.channel, "Ignoring message on unexpected channel");
                            }
                            None => {
                                error!("Event subscription closed");
                                break;
                            }
                        },
                        _ = shutdown_rx.recv() => {
                            info!("Event listener shutting down");
                            break;
                        }
                    }
                }
            }));
        }

        // Durable store retention
        if let Some(message_store) = message_store {
            let clock = client.clock().clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.store_cleanup_interval;
            let retention_ms = config.retention.as_millis() as i64;

            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let before = clock.now_millis() - retention_ms;
                            match message_store.clear_expired(before).await {
                                Ok(0) => {}
                                Ok(removed) => info!(removed, "Cleared expired durable messages"),
                                Err(e) => warn!(error = %e, "Durable store cleanup failed"),
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            info!("Durable store cleanup shutting down");
                            break;
                        }
                    }
                }
            }));
        }

        Self {
            shutdown_tx,
            handles,
        }
    }

    /// Signal every task and wait for them to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        for handle in self.handles {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!("Lifecycle task panicked");
                }
            }
        }
    }
}
