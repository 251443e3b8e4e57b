//! Pending locks and lease renewal (manual ack mode)
//!
//! A claimed message is held by a lock key `{prefix}:lock:{id}` owned by this
//! client. While the handler runs, the renewer extends every tracked lock on a
//! fixed cadence after a warm-up. A lock found missing or owned by someone
//! else is marked lease-lost and dropped from renewal; the handler is left to
//! finish.

use dashmap::DashMap;
use rmq_store::QueueStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::metrics;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub message_id: String,
    pub member: String,
    pub virtual_queue: String,
    pub lock_key: String,
    pub claimed_at: i64,
    pub lease_lost: bool,
}

/// Messages claimed by this client and not yet finished.
#[derive(Debug, Default)]
pub struct PendingLocks {
    entries: DashMap<String, PendingEntry>,
}

impl PendingLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a claim. False when the message is already tracked.
    pub fn track(&self, entry: PendingEntry) -> bool {
        match self.entries.entry(entry.message_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entry);
                true
            }
        }
    }

    pub fn release(&self, message_id: &str) -> Option<PendingEntry> {
        self.entries.remove(message_id).map(|(_, entry)| entry)
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.entries.contains_key(message_id)
    }

    pub fn contains_member(&self, member: &str) -> bool {
        self.entries.iter().any(|e| e.member == member)
    }

    pub fn get(&self, message_id: &str) -> Option<PendingEntry> {
        self.entries.get(message_id).map(|e| e.clone())
    }

    /// Pending messages claimed from `virtual_queue`, used as the poll offset
    /// so a pass skips entries this client already holds.
    pub fn count_for(&self, virtual_queue: &str) -> usize {
        self.entries
            .iter()
            .filter(|e| e.virtual_queue == virtual_queue)
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(message id, lock key)` for every lease still believed held.
    pub fn snapshot(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .filter(|e| !e.lease_lost)
            .map(|e| (e.message_id.clone(), e.lock_key.clone()))
            .collect()
    }

    /// True when this call flipped the flag.
    pub fn mark_lease_lost(&self, message_id: &str) -> bool {
        match self.entries.get_mut(message_id) {
            Some(mut entry) if !entry.lease_lost => {
                entry.lease_lost = true;
                true
            }
            _ => false,
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[derive(Debug, Clone)]
pub struct LeaseSettings {
    pub ttl: Duration,
    pub warmup: Duration,
    pub interval: Duration,
}

/// Extends every renewable lock held by `owner`.
pub struct LeaseRenewer {
    queue: String,
    owner: String,
    store: Arc<dyn QueueStore>,
    pending: Arc<PendingLocks>,
    settings: LeaseSettings,
}

impl LeaseRenewer {
    pub fn new(
        queue: impl Into<String>,
        owner: impl Into<String>,
        store: Arc<dyn QueueStore>,
        pending: Arc<PendingLocks>,
        settings: LeaseSettings,
    ) -> Self {
        Self {
            queue: queue.into(),
            owner: owner.into(),
            store,
            pending,
            settings,
        }
    }

    /// One renewal pass. Returns how many leases were extended.
    pub async fn renew_all(&self) -> usize {
        let mut renewed = 0;
        for (message_id, lock_key) in self.pending.snapshot() {
            match self
                .store
                .extend_lock(&lock_key, &self.owner, self.settings.ttl)
                .await
            {
                Ok(true) => {
                    renewed += 1;
                    metrics::record_lease_renewal(&self.queue, true);
                }
                Ok(false) => {
                    metrics::record_lease_renewal(&self.queue, false);
                    // Released between the snapshot and the extend: not a loss
                    if self.pending.mark_lease_lost(&message_id) {
                        warn!(
                            queue = %self.queue,
                            message_id = %message_id,
                            "Lease lost, message may be redelivered elsewhere"
                        );
                    }
                }
                Err(e) => {
                    warn!(
                        queue = %self.queue,
                        message_id = %message_id,
                        error = %e,
                        "Lease renewal failed, retrying next cycle"
                    );
                }
            }
        }
        if renewed > 0 {
            debug!(queue = %self.queue, renewed, "Leases renewed");
        }
        renewed
    }

    /// Renew after the warm-up, then every interval, until shutdown.
    pub fn spawn(self, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + self.settings.warmup;
            let mut ticker = tokio::time::interval_at(start, self.settings.interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.renew_all().await;
                    }
                    _ = shutdown_rx.recv() => {
                        info!(queue = %self.queue, "Lease renewer shutting down");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmq_common::TokioClock;
    use rmq_store::MemoryStore;

    fn entry(id: &str, vq: &str) -> PendingEntry {
        PendingEntry {
            message_id: id.to_string(),
            member: format!("member-{id}"),
            virtual_queue: vq.to_string(),
            lock_key: format!("test:lock:{id}"),
            claimed_at: 0,
            lease_lost: false,
        }
    }

    #[test]
    fn test_track_and_count() {
        let pending = PendingLocks::new();
        assert!(pending.track(entry("a", "orders#0")));
        assert!(!pending.track(entry("a", "orders#0")));
        assert!(pending.track(entry("b", "orders#0")));
        assert!(pending.track(entry("c", "orders#1")));

        assert_eq!(pending.count_for("orders#0"), 2);
        assert_eq!(pending.count_for("orders#1"), 1);
        assert!(pending.contains_member("member-b"));

        assert!(pending.release("a").is_some());
        assert_eq!(pending.count_for("orders#0"), 1);
    }

    #[test]
    fn test_lease_lost_excluded_from_renewal() {
        let pending = PendingLocks::new();
        pending.track(entry("a", "q#0"));
        pending.track(entry("b", "q#0"));
        assert!(pending.mark_lease_lost("a"));
        assert!(!pending.mark_lease_lost("a"));

        let renewable = pending.snapshot();
        assert_eq!(renewable.len(), 1);
        assert_eq!(renewable[0].0, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_marks_foreign_lock_lost() {
        let clock = Arc::new(TokioClock::starting_at(1_000_000));
        let store = Arc::new(MemoryStore::with_clock(clock));
        let pending = Arc::new(PendingLocks::new());
        let ttl = Duration::from_secs(60);

        store.try_lock("test:lock:mine", "client-a", ttl).await.unwrap();
        store.try_lock("test:lock:theirs", "client-b", ttl).await.unwrap();
        pending.track(entry("mine", "q#0"));
        pending.track(entry("theirs", "q#0"));

        let renewer = LeaseRenewer::new(
            "q",
            "client-a",
            store.clone(),
            pending.clone(),
            LeaseSettings {
                ttl,
                warmup: Duration::from_secs(60),
                interval: Duration::from_secs(30),
            },
        );

        assert_eq!(renewer.renew_all().await, 1);
        assert!(pending.get("theirs").unwrap().lease_lost);
        assert!(!pending.get("mine").unwrap().lease_lost);
        assert_eq!(store.lock_owner("test:lock:theirs").as_deref(), Some("client-b"));
    }
}
