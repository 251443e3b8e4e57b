//! Client facade
//!
//! Wires membership, containers and the background lifecycle together:
//!
//! ```text
//! MqClient::builder(config, store)
//!     .listener("orders", "*", Handler::typed(handle_order), ListenerOptions::default())
//!     .build()?
//!     .start().await?
//! ```
//!
//! Every rebalance trigger (startup, heartbeat refresh, broadcast event)
//! re-registers the heartbeat, pauses all containers, recomputes this
//! client's share of the virtual queues and resumes with the new set. Each
//! queue is split only among the live clients listening to it.

use rmq_common::{generate_client_id, Clock, Keys, PushHint, Queue, SystemClock};
use rmq_config::AppConfig;
use rmq_membership::{rebalance, ClientRegistry};
use rmq_store::{MessageStore, Producer, QueueRegistry, QueueStore};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::container::{ContainerContext, ContainerStats, ListenerContainer};
use crate::error::{ConsumerError, Result};
use crate::executor::{ConsumptionExecutor, RetryPolicy};
use crate::handler::Handler;
use crate::interceptor::{ConsumeInterceptor, InterceptorChain};
use crate::lifecycle::{LifecycleConfig, LifecycleManager};
use crate::metrics;
use crate::scheduler::WakeScheduler;

/// Per-listener overrides of the consumer defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerOptions {
    pub retry_max: Option<u32>,
    pub retry_interval: Option<Duration>,
}

impl ListenerOptions {
    pub fn retry_max(mut self, retry_max: u32) -> Self {
        self.retry_max = Some(retry_max);
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = Some(interval);
        self
    }
}

struct ListenerSpec {
    queue: String,
    tag: String,
    handler: Handler,
    options: ListenerOptions,
}

pub struct MqClientBuilder {
    config: AppConfig,
    store: Arc<dyn QueueStore>,
    message_store: Option<Arc<dyn MessageStore>>,
    clock: Arc<dyn Clock>,
    interceptors: Vec<Arc<dyn ConsumeInterceptor>>,
    queues: Vec<Queue>,
    listeners: Vec<ListenerSpec>,
}

impl MqClientBuilder {
    pub fn message_store(mut self, message_store: Arc<dyn MessageStore>) -> Self {
        self.message_store = Some(message_store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn interceptor(mut self, interceptor: Arc<dyn ConsumeInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Declare a queue in addition to the ones in the config file.
    pub fn queue(mut self, queue: Queue) -> Self {
        self.queues.push(queue);
        self
    }

    /// Register `handler` for messages on `queue` carrying `tag` (`*` for any).
    pub fn listener(
        mut self,
        queue: impl Into<String>,
        tag: impl Into<String>,
        handler: Handler,
        options: ListenerOptions,
    ) -> Self {
        self.listeners.push(ListenerSpec {
            queue: queue.into(),
            tag: tag.into(),
            handler,
            options,
        });
        self
    }

    pub fn build(self) -> Result<Arc<MqClient>> {
        let client_id = if self.config.client.client_id.is_empty() {
            generate_client_id()
        } else {
            self.config.client.client_id.clone()
        };
        let keys = Keys::new(self.config.redis.key_prefix.clone());

        let mut queues: BTreeMap<String, Queue> = BTreeMap::new();
        for queue in self.config.queue_definitions().into_iter().chain(self.queues) {
            queue
                .validate()
                .map_err(|e| ConsumerError::Config(e.to_string()))?;
            match queues.get(&queue.name) {
                Some(existing) if *existing != queue => {
                    return Err(ConsumerError::Config(format!(
                        "queue '{}' declared twice with different settings",
                        queue.name
                    )));
                }
                _ => {
                    queues.insert(queue.name.clone(), queue);
                }
            }
        }

        let interceptors = Arc::new(InterceptorChain::new(self.interceptors));
        let mut executors: BTreeMap<String, HashMap<String, Arc<ConsumptionExecutor>>> =
            BTreeMap::new();
        for listener in self.listeners {
            if !queues.contains_key(&listener.queue) {
                return Err(ConsumerError::UnknownQueue(listener.queue));
            }
            let retry = RetryPolicy {
                retry_max: listener
                    .options
                    .retry_max
                    .unwrap_or(self.config.consumer.retry_max),
                interval: listener
                    .options
                    .retry_interval
                    .unwrap_or_else(|| self.config.consumer.retry_interval()),
            };
            let by_tag = executors.entry(listener.queue.clone()).or_default();
            if by_tag.contains_key(&listener.tag) {
                return Err(ConsumerError::Config(format!(
                    "duplicate listener for queue '{}' tag '{}'",
                    listener.queue, listener.tag
                )));
            }
            let executor = ConsumptionExecutor::new(
                listener.queue.clone(),
                listener.tag.clone(),
                listener.handler,
                interceptors.clone(),
                retry,
            );
            by_tag.insert(listener.tag, Arc::new(executor));
        }

        let scheduler = Arc::new(WakeScheduler::new(self.clock.clone()));
        let ctx = ContainerContext {
            client_id: client_id.clone(),
            store: self.store.clone(),
            keys: keys.clone(),
            clock: self.clock.clone(),
            config: self.config.consumer.clone(),
            scheduler: scheduler.clone(),
            message_store: self.message_store.clone(),
        };
        let containers: BTreeMap<String, Arc<ListenerContainer>> = executors
            .into_iter()
            .filter_map(|(name, by_tag)| {
                let queue = queues.get(&name)?.clone();
                let container = ListenerContainer::new(queue, by_tag, ctx.clone());
                Some((name, Arc::new(container)))
            })
            .collect();

        let registry = ClientRegistry::new(
            self.store.clone(),
            keys.clone(),
            self.clock.clone(),
            client_id.clone(),
            &self.config.client,
        )?
        .with_queues(containers.keys());

        Ok(Arc::new(MqClient {
            client_id,
            queue_registry: QueueRegistry::new(self.store.clone(), keys.clone()),
            keys,
            store: self.store,
            clock: self.clock,
            registry,
            local_queues: queues.into_values().collect(),
            containers,
            scheduler,
            message_store: self.message_store,
            lifecycle_config: LifecycleConfig::from(&self.config),
            config: self.config,
            running: AtomicBool::new(false),
            rebalance_lock: tokio::sync::Mutex::new(()),
            assignment: parking_lot::RwLock::new(Vec::new()),
            lifecycle: tokio::sync::Mutex::new(None),
        }))
    }
}

pub struct MqClient {
    client_id: String,
    config: AppConfig,
    keys: Keys,
    store: Arc<dyn QueueStore>,
    clock: Arc<dyn Clock>,
    registry: ClientRegistry,
    queue_registry: QueueRegistry,
    local_queues: Vec<Queue>,
    containers: BTreeMap<String, Arc<ListenerContainer>>,
    scheduler: Arc<WakeScheduler>,
    message_store: Option<Arc<dyn MessageStore>>,
    lifecycle_config: LifecycleConfig,
    running: AtomicBool,
    /// Serializes rebalances from concurrent triggers
    rebalance_lock: tokio::sync::Mutex<()>,
    assignment: parking_lot::RwLock<Vec<String>>,
    lifecycle: tokio::sync::Mutex<Option<LifecycleManager>>,
}

impl MqClient {
    pub fn builder(config: AppConfig, store: Arc<dyn QueueStore>) -> MqClientBuilder {
        MqClientBuilder {
            config,
            store,
            message_store: None,
            clock: Arc::new(SystemClock),
            interceptors: Vec::new(),
            queues: Vec::new(),
            listeners: Vec::new(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Virtual queues owned after the last rebalance, sorted.
    pub fn assignment(&self) -> Vec<String> {
        self.assignment.read().clone()
    }

    pub fn container(&self, queue: &str) -> Option<Arc<ListenerContainer>> {
        self.containers.get(queue).cloned()
    }

    pub async fn container_stats(&self) -> Vec<ContainerStats> {
        let mut stats = Vec::with_capacity(self.containers.len());
        for container in self.containers.values() {
            stats.push(container.stats().await);
        }
        stats
    }

    /// A producer sharing this client's store, key prefix, clock and durable
    /// store.
    pub fn producer(&self) -> Producer {
        let producer = Producer::new(self.store.clone(), self.keys.clone()).with_clock(self.clock.clone());
        match &self.message_store {
            Some(message_store) => producer.with_message_store(message_store.clone()),
            None => producer,
        }
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ConsumerError::AlreadyStarted);
        }

        if let Some(message_store) = &self.message_store {
            message_store.init_schema().await?;
        }
        for queue in &self.local_queues {
            self.queue_registry.register(queue).await?;
        }

        // Subscribe before announcing so no peer event is missed
        let subscription = self
            .store
            .subscribe(&[self.keys.rebalance_channel(), self.keys.push_channel()])
            .await?;

        self.registry.register_client().await?;
        self.registry.publish_rebalance().await?;
        self.rebalance().await?;

        for container in self.containers.values() {
            container.start()?;
        }

        let lifecycle = LifecycleManager::start(
            Arc::clone(self),
            subscription,
            self.message_store.clone(),
            self.lifecycle_config.clone(),
        );
        *self.lifecycle.lock().await = Some(lifecycle);

        info!(
            client_id = %self.client_id,
            containers = self.containers.len(),
            owned = self.assignment.read().len(),
            "Client started"
        );
        Ok(())
    }

    /// Recompute this client's share and apply it to every container.
    pub async fn rebalance(&self) -> Result<Vec<String>> {
        let _serial = self.rebalance_lock.lock().await;
        if !self.is_running() {
            return Err(ConsumerError::ShutdownInProgress);
        }

        if self.registry.register_client().await? {
            // We had been purged as stale; peers must count us again
            warn!(client_id = %self.client_id, "Rejoined membership");
            self.registry.publish_rebalance().await?;
        }

        let mut paused = Vec::with_capacity(self.containers.len());
        for container in self.containers.values() {
            paused.push((container, container.pause().await));
        }

        let live = self.registry.list_live_clients().await?;
        let mut owned = Vec::new();
        let mut virtual_queues = 0;
        for container in self.containers.values() {
            let queue = container.queue();
            let subscribers = self.registry.list_live_subscribers(&queue.name).await?;
            let universe = queue.virtual_queues();
            virtual_queues += universe.len();
            owned.extend(rebalance(&subscribers, &universe, &self.client_id));
        }
        owned.sort();

        let mut changed = Vec::new();
        for (container, guard) in paused.iter_mut() {
            if guard.replace(&owned) {
                changed.push(Arc::clone(*container));
            }
        }
        drop(paused);

        *self.assignment.write() = owned.clone();
        for container in &changed {
            container.wake();
        }

        metrics::record_rebalance(owned.len());
        metrics::set_live_clients(live.len());
        info!(
            client_id = %self.client_id,
            live_clients = live.len(),
            virtual_queues,
            owned = owned.len(),
            changed = changed.len(),
            "Rebalanced"
        );
        Ok(owned)
    }

    /// Route a push hint to the matching container.
    pub fn handle_push_hint(&self, payload: &str) {
        let hint = PushHint::parse(payload);
        match self.containers.get(&hint.queue) {
            Some(container) => container.on_push_hint(hint.ready_at),
            None => debug!(queue = %hint.queue, "Push hint for a queue without listeners"),
        }
    }

    /// Leave the cluster and stop consuming.
    pub async fn shutdown(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!(client_id = %self.client_id, "Client shutting down");

        if let Some(lifecycle) = self.lifecycle.lock().await.take() {
            lifecycle.shutdown().await;
        }

        if let Err(e) = self.registry.deregister_client().await {
            warn!(error = %e, "Failed to deregister client");
        }
        if let Err(e) = self.registry.publish_rebalance().await {
            warn!(error = %e, "Failed to announce departure");
        }

        futures::future::join_all(self.containers.values().map(|c| c.stop())).await;
        self.scheduler.stop();
        self.assignment.write().clear();

        info!(client_id = %self.client_id, "Client stopped");
        Ok(())
    }
}
