//! In-process [`QueueStore`]
//!
//! Same semantics as the Redis store, including lock expiry measured on the
//! injected [`Clock`] and WRONGTYPE errors when a key is used as two
//! different structures. Several clients sharing one `Arc<MemoryStore>`
//! behave like processes sharing one Redis.

use async_trait::async_trait;
use parking_lot::Mutex;
use rmq_common::{Clock, SystemClock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use crate::{ChannelMessage, QueueStore, Result, ScoredMember, StoreError, Subscription};

#[derive(Default)]
struct Inner {
    sorted_sets: HashMap<String, HashMap<String, i64>>,
    /// key -> (value, expires at epoch millis)
    strings: HashMap<String, (String, Option<i64>)>,
    hashes: HashMap<String, HashMap<String, String>>,
}

impl Inner {
    fn purge_expired(&mut self, now: i64) {
        self.strings
            .retain(|_, (_, expires)| expires.map_or(true, |at| now < at));
    }

    fn check_type(&self, key: &str, expected: KeyType) -> Result<()> {
        let actual = if self.sorted_sets.contains_key(key) {
            Some(KeyType::SortedSet)
        } else if self.strings.contains_key(key) {
            Some(KeyType::String)
        } else if self.hashes.contains_key(key) {
            Some(KeyType::Hash)
        } else {
            None
        };
        match actual {
            Some(actual) if actual != expected => Err(StoreError::WrongType(format!(
                "WRONGTYPE Operation against a key holding the wrong kind of value: {key}"
            ))),
            _ => Ok(()),
        }
    }

    fn sorted(&self, key: &str) -> Vec<ScoredMember> {
        let mut members: Vec<ScoredMember> = self
            .sorted_sets
            .get(key)
            .map(|set| {
                set.iter()
                    .map(|(member, score)| ScoredMember {
                        member: member.clone(),
                        score: *score,
                    })
                    .collect()
            })
            .unwrap_or_default();
        members.sort_by(|a, b| a.score.cmp(&b.score).then_with(|| a.member.cmp(&b.member)));
        members
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyType {
    SortedSet,
    String,
    Hash,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
    channels: broadcast::Sender<ChannelMessage>,
    injected_failures: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let (channels, _) = broadcast::channel(1024);
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
            channels,
            injected_failures: AtomicU32::new(0),
        }
    }

    /// Make the next `count` sorted-set reads fail with a transient error.
    pub fn inject_transient_failures(&self, count: u32) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    /// Current holder of a lock, if it has not expired.
    pub fn lock_owner(&self, key: &str) -> Option<String> {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock();
        inner.purge_expired(now);
        inner.strings.get(key).map(|(value, _)| value.clone())
    }

    fn maybe_fail(&self) -> Result<()> {
        let consumed = self
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match consumed {
            Ok(_) => Err(StoreError::Transient("injected failure".to_string())),
            Err(_) => Ok(()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn add(&self, key: &str, member: &str, score: i64) -> Result<bool> {
        let mut inner = self.inner.lock();
        inner.purge_expired(self.clock.now_millis());
        inner.check_type(key, KeyType::SortedSet)?;
        let set = inner.sorted_sets.entry(key.to_string()).or_default();
        Ok(set.insert(member.to_string(), score).is_none())
    }

    async fn range_by_score(
        &self,
        key: &str,
        max_score: i64,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ScoredMember>> {
        self.maybe_fail()?;
        let mut inner = self.inner.lock();
        inner.purge_expired(self.clock.now_millis());
        inner.check_type(key, KeyType::SortedSet)?;
        Ok(inner
            .sorted(key)
            .into_iter()
            .filter(|m| m.score <= max_score)
            .skip(offset)
            .take(limit)
            .collect())
    }

    async fn range_from_score(&self, key: &str, min_score: i64) -> Result<Vec<ScoredMember>> {
        self.maybe_fail()?;
        let inner = self.inner.lock();
        inner.check_type(key, KeyType::SortedSet)?;
        Ok(inner
            .sorted(key)
            .into_iter()
            .filter(|m| m.score >= min_score)
            .collect())
    }

    async fn peek(&self, key: &str, limit: usize) -> Result<Vec<ScoredMember>> {
        self.maybe_fail()?;
        let inner = self.inner.lock();
        inner.check_type(key, KeyType::SortedSet)?;
        Ok(inner.sorted(key).into_iter().take(limit).collect())
    }

    async fn remove(&self, key: &str, member: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        inner.check_type(key, KeyType::SortedSet)?;
        let Some(set) = inner.sorted_sets.get_mut(key) else {
            return Ok(false);
        };
        let removed = set.remove(member).is_some();
        if set.is_empty() {
            inner.sorted_sets.remove(key);
        }
        Ok(removed)
    }

    async fn remove_by_score(&self, key: &str, max_score: i64) -> Result<u64> {
        let mut inner = self.inner.lock();
        inner.check_type(key, KeyType::SortedSet)?;
        let Some(set) = inner.sorted_sets.get_mut(key) else {
            return Ok(0);
        };
        let before = set.len();
        set.retain(|_, score| *score > max_score);
        let removed = (before - set.len()) as u64;
        if set.is_empty() {
            inner.sorted_sets.remove(key);
        }
        Ok(removed)
    }

    async fn count(&self, key: &str) -> Result<u64> {
        let inner = self.inner.lock();
        inner.check_type(key, KeyType::SortedSet)?;
        Ok(inner.sorted_sets.get(key).map_or(0, |set| set.len() as u64))
    }

    async fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock();
        inner.purge_expired(now);
        inner.check_type(key, KeyType::String)?;
        if inner.strings.contains_key(key) {
            return Ok(false);
        }
        let expires = now + ttl.as_millis() as i64;
        inner
            .strings
            .insert(key.to_string(), (owner.to_string(), Some(expires)));
        Ok(true)
    }

    async fn extend_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock();
        inner.purge_expired(now);
        match inner.strings.get_mut(key) {
            Some((value, expires)) if value == owner => {
                *expires = Some(now + ttl.as_millis() as i64);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lock(&self, key: &str, owner: &str) -> Result<bool> {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock();
        inner.purge_expired(now);
        match inner.strings.get(key) {
            Some((value, _)) if value == owner => {
                inner.strings.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut inner = self.inner.lock();
        inner.check_type(key, KeyType::String)?;
        let entry = inner
            .strings
            .entry(key.to_string())
            .or_insert_with(|| ("0".to_string(), None));
        let next = entry
            .0
            .parse::<i64>()
            .map_err(|_| StoreError::WrongType(format!("value at {key} is not an integer")))?
            + 1;
        entry.0 = next.to_string();
        Ok(next)
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_type(key, KeyType::Hash)?;
        inner
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        let inner = self.inner.lock();
        inner.check_type(key, KeyType::Hash)?;
        Ok(inner.hashes.get(key).and_then(|h| h.get(field).cloned()))
    }

    async fn hash_values(&self, key: &str) -> Result<Vec<String>> {
        let inner = self.inner.lock();
        inner.check_type(key, KeyType::Hash)?;
        Ok(inner
            .hashes
            .get(key)
            .map(|h| h.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        // No receivers is not an error, same as PUBLISH returning 0
        let _ = self.channels.send(ChannelMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut source = self.channels.subscribe();
        let channels = channels.to_vec();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = source.recv() => match received {
                        Ok(message) => {
                            if channels.contains(&message.channel) && tx.send(message).is_err() {
                                return;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                    _ = tx.closed() => return,
                }
            }
        });

        Ok(Subscription::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmq_common::TokioClock;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test(start_paused = true)]
    async fn test_lock_expires_on_clock() {
        let store = MemoryStore::with_clock(Arc::new(TokioClock::starting_at(0)));
        assert!(store.try_lock("l", "a", Duration::from_secs(60)).await.unwrap());
        assert!(!store.try_lock("l", "b", Duration::from_secs(60)).await.unwrap());

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(!store.extend_lock("l", "a", Duration::from_secs(60)).await.unwrap());
        assert!(store.try_lock("l", "b", Duration::from_secs(60)).await.unwrap());
        assert_eq!(store.lock_owner("l").as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_release_checks_owner() {
        let store = MemoryStore::new();
        store.try_lock("l", "a", Duration::from_secs(5)).await.unwrap();
        assert!(!store.release_lock("l", "b").await.unwrap());
        assert!(store.release_lock("l", "a").await.unwrap());
        assert!(store.lock_owner("l").is_none());
    }

    #[tokio::test]
    async fn test_range_respects_score_offset_and_limit() {
        let store = MemoryStore::new();
        for (member, score) in [("a", 10), ("b", 20), ("c", 30), ("d", 40)] {
            store.add("q", member, score).await.unwrap();
        }
        let ready = store.range_by_score("q", 30, 1, 5).await.unwrap();
        let names: Vec<_> = ready.iter().map(|m| m.member.as_str()).collect();
        assert_eq!(names, vec!["b", "c"]);

        assert!(store.remove("q", "b").await.unwrap());
        assert!(!store.remove("q", "b").await.unwrap());
        assert_eq!(store.remove_by_score("q", 30).await.unwrap(), 2);
        assert_eq!(store.count("q").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_wrong_type() {
        let store = MemoryStore::new();
        store.try_lock("k", "a", Duration::from_secs(5)).await.unwrap();
        let err = assert_err!(store.range_by_score("k", 0, 0, 1).await);
        assert!(err.is_wrong_type());
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let store = MemoryStore::new();
        store.inject_transient_failures(1);
        assert!(matches!(
            assert_err!(store.peek("q", 1).await),
            StoreError::Transient(_)
        ));
        assert!(assert_ok!(store.peek("q", 1).await).is_empty());
    }

    #[tokio::test]
    async fn test_pubsub_filters_channels() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe(&["push".to_string()]).await.unwrap();
        store.publish("rebalance", "x").await.unwrap();
        store.publish("push", "orders").await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.payload, "orders");
    }
}
