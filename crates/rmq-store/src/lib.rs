//! RedisMQ store layer
//!
//! - [`QueueStore`]: the atomic primitives every consumer and producer
//!   operation is built from (sorted-set range/remove, conditional locks,
//!   counters, pub/sub). [`RedisStore`] talks to Redis, [`MemoryStore`]
//!   keeps everything in process for tests and single-node development.
//! - [`MessageStore`]: optional durable audit/replay store.
//! - [`Producer`]: enqueue side.
//! - [`QueueRegistry`]: shared queue definitions.
//!
//! Claims are always a single store call (ZREM, SET NX PX, or a Lua script);
//! no operation reads then writes from the client.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

pub mod durable;
pub mod error;
pub mod memory;
pub mod producer;
pub mod queues;
pub mod redis_store;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use durable::{MemoryMessageStore, MessageStore, StoredMessage};
pub use error::StoreError;
pub use memory::MemoryStore;
pub use producer::Producer;
pub use queues::QueueRegistry;
pub use redis_store::RedisStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteMessageStore;

pub type Result<T> = std::result::Result<T, StoreError>;

/// A sorted-set member with its score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMember {
    pub member: String,
    pub score: i64,
}

/// A message received on a pub/sub channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub channel: String,
    pub payload: String,
}

/// Live subscription. Dropping it unsubscribes.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<ChannelMessage>,
}

impl Subscription {
    pub fn new(rx: mpsc::UnboundedReceiver<ChannelMessage>) -> Self {
        Self { rx }
    }

    /// Next message, `None` once the store side closed.
    pub async fn recv(&mut self) -> Option<ChannelMessage> {
        self.rx.recv().await
    }
}

/// Atomic store primitives.
#[async_trait]
pub trait QueueStore: Send + Sync {
    // Sorted sets

    /// ZADD. Returns true when the member was new.
    async fn add(&self, key: &str, member: &str, score: i64) -> Result<bool>;

    /// Members with score in `[-inf, max_score]`, ascending, skipping `offset`.
    async fn range_by_score(
        &self,
        key: &str,
        max_score: i64,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ScoredMember>>;

    /// Members with score in `[min_score, +inf]`, ascending.
    async fn range_from_score(&self, key: &str, min_score: i64) -> Result<Vec<ScoredMember>>;

    /// First `limit` members regardless of score.
    async fn peek(&self, key: &str, limit: usize) -> Result<Vec<ScoredMember>>;

    /// ZREM. Returns true when this call removed the member.
    async fn remove(&self, key: &str, member: &str) -> Result<bool>;

    /// ZREMRANGEBYSCORE `-inf` to `max_score` inclusive, returns the count.
    async fn remove_by_score(&self, key: &str, max_score: i64) -> Result<u64>;

    async fn count(&self, key: &str) -> Result<u64>;

    // Locks

    /// SET NX PX. True when this call created the lock.
    async fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool>;

    /// Extend the TTL only while the lock exists and is held by `owner`.
    async fn extend_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool>;

    /// Delete the lock only while it is held by `owner`.
    async fn release_lock(&self, key: &str, owner: &str) -> Result<bool>;

    // Counters and hashes

    async fn incr(&self, key: &str) -> Result<i64>;

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()>;

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>>;

    async fn hash_values(&self, key: &str) -> Result<Vec<String>>;

    // Pub/sub

    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    async fn subscribe(&self, channels: &[String]) -> Result<Subscription>;
}
