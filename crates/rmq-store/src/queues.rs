//! Shared queue definitions
//!
//! Stored as a hash, queue name -> definition JSON. Consumers rebalance over
//! the union of every registered queue's virtual queues, so all clients see
//! the same set.

use dashmap::DashMap;
use rmq_common::{Keys, Queue};
use std::sync::Arc;
use tracing::info;

use crate::{QueueStore, Result, StoreError};

pub struct QueueRegistry {
    store: Arc<dyn QueueStore>,
    keys: Keys,
    cache: DashMap<String, Queue>,
}

impl QueueRegistry {
    pub fn new(store: Arc<dyn QueueStore>, keys: Keys) -> Self {
        Self {
            store,
            keys,
            cache: DashMap::new(),
        }
    }

    /// Publish a definition. Definitions are immutable: re-registering a
    /// queue with different settings is rejected.
    pub async fn register(&self, queue: &Queue) -> Result<()> {
        queue.validate()?;
        if let Some(existing) = self.fetch(&queue.name).await? {
            if existing != *queue {
                return Err(StoreError::Config(format!(
                    "queue '{}' is already registered with different settings",
                    queue.name
                )));
            }
            return Ok(());
        }

        let definition = serde_json::to_string(queue)?;
        self.store
            .hash_set(&self.keys.queues(), &queue.name, &definition)
            .await?;
        self.cache.insert(queue.name.clone(), queue.clone());
        info!(
            queue = %queue.name,
            virtual_count = queue.virtual_count,
            delay = queue.delay,
            "Registered queue"
        );
        Ok(())
    }

    /// Resolve a queue, local cache first.
    pub async fn get(&self, name: &str) -> Result<Queue> {
        if let Some(queue) = self.cache.get(name) {
            return Ok(queue.clone());
        }
        self.fetch(name)
            .await?
            .ok_or_else(|| StoreError::QueueNotFound(name.to_string()))
    }

    /// Every registered queue, sorted by name.
    pub async fn list(&self) -> Result<Vec<Queue>> {
        let mut queues = Vec::new();
        for definition in self.store.hash_values(&self.keys.queues()).await? {
            queues.push(serde_json::from_str::<Queue>(&definition)?);
        }
        queues.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(queues)
    }

    async fn fetch(&self, name: &str) -> Result<Option<Queue>> {
        let Some(definition) = self.store.hash_get(&self.keys.queues(), name).await? else {
            return Ok(None);
        };
        let queue: Queue = serde_json::from_str(&definition)?;
        self.cache.insert(name.to_string(), queue.clone());
        Ok(Some(queue))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;

    #[tokio::test]
    async fn test_register_is_idempotent_but_immutable() {
        let registry = QueueRegistry::new(Arc::new(MemoryStore::new()), Keys::default());
        let orders = Queue::new("orders", 3);
        registry.register(&orders).await.unwrap();
        registry.register(&orders).await.unwrap();

        let changed = Queue::new("orders", 4);
        assert!(matches!(registry.register(&changed).await, Err(StoreError::Config(_))));
        assert_eq!(registry.get("orders").await.unwrap().virtual_count, 3);
    }

    #[tokio::test]
    async fn test_missing_queue() {
        let registry = QueueRegistry::new(Arc::new(MemoryStore::new()), Keys::default());
        assert!(matches!(registry.get("nope").await, Err(StoreError::QueueNotFound(_))));
        assert!(registry.list().await.unwrap().is_empty());
    }
}
