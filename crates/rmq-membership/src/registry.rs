//! Heartbeat registry
//!
//! Membership is a sorted set: member = client id, score = last heartbeat in
//! epoch millis. Liveness is decided by score alone, so a crashed client
//! simply stops refreshing and ages out.
//!
//! Each client also heartbeats into one set per queue it listens to, so a
//! queue's virtual queues are only ever split among clients able to consume
//! them.

use rmq_common::{ClientMember, Clock, Keys};
use rmq_config::ClientConfig;
use rmq_store::QueueStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{MembershipError, Result};

pub struct ClientRegistry {
    store: Arc<dyn QueueStore>,
    keys: Keys,
    clock: Arc<dyn Clock>,
    client_id: String,
    queues: Vec<String>,
    staleness: Duration,
    cleanup_lock_ttl: Duration,
}

impl ClientRegistry {
    pub fn new(
        store: Arc<dyn QueueStore>,
        keys: Keys,
        clock: Arc<dyn Clock>,
        client_id: impl Into<String>,
        config: &ClientConfig,
    ) -> Result<Self> {
        let client_id = client_id.into();
        if client_id.is_empty() {
            return Err(MembershipError::Config("client id must not be empty".into()));
        }
        Ok(Self {
            store,
            keys,
            clock,
            client_id,
            queues: Vec::new(),
            staleness: config.staleness_threshold(),
            cleanup_lock_ttl: config.cleanup_lock_ttl(),
        })
    }

    /// Queues this client listens to.
    pub fn with_queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queues = queues.into_iter().map(Into::into).collect();
        self.queues.sort();
        self.queues.dedup();
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn queues(&self) -> &[String] {
        &self.queues
    }

    /// Write or refresh this client's heartbeat, globally and for every queue
    /// it listens to. True when the client was not a member before, i.e.
    /// first start or after being purged as stale.
    pub async fn register_client(&self) -> Result<bool> {
        let now = self.clock.now_millis();
        let joined = self
            .store
            .add(&self.keys.clients(), &self.client_id, now)
            .await?;
        for queue in &self.queues {
            self.store
                .add(&self.keys.subscribers(queue), &self.client_id, now)
                .await?;
        }
        debug!(client_id = %self.client_id, heartbeat = now, joined, "Heartbeat registered");
        Ok(joined)
    }

    /// Remove this client, e.g. on shutdown.
    pub async fn deregister_client(&self) -> Result<bool> {
        for queue in &self.queues {
            self.store
                .remove(&self.keys.subscribers(queue), &self.client_id)
                .await?;
        }
        let removed = self
            .store
            .remove(&self.keys.clients(), &self.client_id)
            .await?;
        info!(client_id = %self.client_id, removed, "Client deregistered");
        Ok(removed)
    }

    /// Clients whose heartbeat age is below the staleness threshold, sorted.
    pub async fn list_live_clients(&self) -> Result<Vec<String>> {
        self.live_members(&self.keys.clients()).await
    }

    /// Live clients listening to `queue`, sorted.
    pub async fn list_live_subscribers(&self, queue: &str) -> Result<Vec<String>> {
        self.live_members(&self.keys.subscribers(queue)).await
    }

    async fn live_members(&self, key: &str) -> Result<Vec<String>> {
        let now = self.clock.now_millis();
        let staleness = self.staleness.as_millis() as i64;
        let members = self.store.range_from_score(key, now - staleness).await?;
        let mut clients: Vec<String> = members
            .into_iter()
            .map(|m| ClientMember {
                client_id: m.member,
                last_heartbeat: m.score,
            })
            .filter(|member| member.is_live(now, staleness))
            .map(|member| member.client_id)
            .collect();
        clients.sort();
        Ok(clients)
    }

    /// Purge stale members from the global set and from the subscriber sets
    /// of this client's queues. Returns how many global members were removed.
    pub async fn remove_expired_clients(&self) -> Result<u64> {
        let newest_stale = self.clock.now_millis() - self.staleness.as_millis() as i64;
        for queue in &self.queues {
            self.store
                .remove_by_score(&self.keys.subscribers(queue), newest_stale)
                .await?;
        }
        let removed = self
            .store
            .remove_by_score(&self.keys.clients(), newest_stale)
            .await?;
        if removed > 0 {
            info!(client_id = %self.client_id, removed, "Removed expired clients");
        }
        Ok(removed)
    }

    /// SET NX with TTL on the cleanup lock. Left to expire rather than
    /// released, so at most one cleanup runs per TTL window.
    pub async fn try_acquire_cleanup_lock(&self) -> Result<bool> {
        let acquired = self
            .store
            .try_lock(&self.keys.cleanup_lock(), &self.client_id, self.cleanup_lock_ttl)
            .await?;
        Ok(acquired)
    }

    /// Tell every client to recompute its assignment.
    pub async fn publish_rebalance(&self) -> Result<()> {
        self.store
            .publish(&self.keys.rebalance_channel(), &self.client_id)
            .await?;
        debug!(client_id = %self.client_id, "Published rebalance");
        Ok(())
    }

    /// Periodic check: under the cleanup lock, purge stale members and
    /// broadcast a rebalance only if membership shrank. Returns whether a
    /// rebalance was published.
    pub async fn run_rebalance_check(&self) -> Result<bool> {
        if !self.try_acquire_cleanup_lock().await? {
            debug!(client_id = %self.client_id, "Cleanup lock held elsewhere");
            return Ok(false);
        }
        if self.remove_expired_clients().await? == 0 {
            return Ok(false);
        }
        self.publish_rebalance().await?;
        Ok(true)
    }
}
