//! Enqueue side
//!
//! Writes a message into one virtual queue's sorted set (score = ready time)
//! and publishes a push hint so idle consumers wake without waiting for
//! their fallback poll.

use rmq_common::{
    generate_message_id, virtual_queue_name, Clock, Keys, Message, MessageStatus, PushHint, Queue,
    SystemClock,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::{MessageStore, QueueRegistry, QueueStore, Result, StoreError};

pub struct Producer {
    store: Arc<dyn QueueStore>,
    keys: Keys,
    clock: Arc<dyn Clock>,
    queues: QueueRegistry,
    round_robin: AtomicU64,
    message_store: Option<Arc<dyn MessageStore>>,
}

impl Producer {
    pub fn new(store: Arc<dyn QueueStore>, keys: Keys) -> Self {
        Self {
            queues: QueueRegistry::new(store.clone(), keys.clone()),
            store,
            keys,
            clock: Arc::new(SystemClock),
            round_robin: AtomicU64::new(0),
            message_store: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Persist every enqueued message to a durable store first.
    pub fn with_message_store(mut self, message_store: Arc<dyn MessageStore>) -> Self {
        self.message_store = Some(message_store);
        self
    }

    /// Publish a queue definition to the shared registry.
    pub async fn register_queue(&self, queue: Queue) -> Result<()> {
        self.queues.register(&queue).await
    }

    /// Resolve a queue, local cache first, then the shared registry.
    pub async fn queue(&self, name: &str) -> Result<Queue> {
        self.queues.get(name).await
    }

    /// Every queue in the shared registry.
    pub async fn list_queues(&self) -> Result<Vec<Queue>> {
        self.queues.list().await
    }

    /// Ready immediately.
    pub async fn send(&self, message: Message) -> Result<Message> {
        let now = self.clock.now_millis();
        self.enqueue(message, now).await
    }

    pub async fn send_delayed(&self, message: Message, delay: Duration) -> Result<Message> {
        let at = self.clock.now_millis() + delay.as_millis() as i64;
        self.enqueue(message, at).await
    }

    /// Ready at an absolute epoch-millis time.
    pub async fn send_at(&self, message: Message, at_millis: i64) -> Result<Message> {
        self.enqueue(message, at_millis).await
    }

    pub async fn send_batch(&self, messages: Vec<Message>) -> Result<Vec<Message>> {
        let now = self.clock.now_millis();
        let mut sent = Vec::with_capacity(messages.len());
        for message in messages {
            sent.push(self.enqueue(message, now).await?);
        }
        Ok(sent)
    }

    /// Write `message` to its virtual queue with score `ready_at`.
    ///
    /// The virtual queue comes from the message key's stable hash, or
    /// round-robin when there is no key. Returns the message as stored.
    pub async fn enqueue(&self, mut message: Message, ready_at: i64) -> Result<Message> {
        let queue = self.queue(&message.queue).await?;
        let now = self.clock.now_millis();
        if ready_at > now && !queue.delay {
            return Err(StoreError::InvalidMessage(format!(
                "queue '{}' does not accept delayed messages",
                queue.name
            )));
        }

        if message.id.is_empty() {
            message.id = generate_message_id();
        }
        let virtual_queue = match &message.key {
            Some(key) => queue.virtual_queue_for_key(key),
            None => {
                let n = self.round_robin.fetch_add(1, Ordering::Relaxed);
                virtual_queue_name(&queue.name, (n % queue.virtual_count as u64) as u32)
            }
        };

        message.offset = Some(self.store.incr(&self.keys.offset(&virtual_queue)).await?);
        message.virtual_queue_name = virtual_queue;
        message.execute_time = ready_at;
        message.execute_scope = queue.delay.then_some(ready_at / 1000);
        message.status = MessageStatus::Create;

        if let Some(message_store) = &self.message_store {
            message_store.save_messages(std::slice::from_ref(&message)).await?;
        }

        let member = message.to_member()?;
        self.store
            .add(&self.keys.queue(&message.virtual_queue_name), &member, ready_at)
            .await?;

        debug!(
            message_id = %message.id,
            virtual_queue = %message.virtual_queue_name,
            ready_at,
            "Enqueued message"
        );

        self.push_hint(&queue.name, ready_at).await;
        Ok(message)
    }

    /// Remove a not-yet-claimed message. False when it was already taken.
    pub async fn try_cancel(&self, message: &Message) -> Result<bool> {
        let member = message.to_member()?;
        let removed = self
            .store
            .remove(&self.keys.queue(&message.virtual_queue_name), &member)
            .await?;
        if removed {
            if let Some(message_store) = &self.message_store {
                message_store
                    .update_status(std::slice::from_ref(&message.id), MessageStatus::Cancelled)
                    .await?;
            }
        }
        Ok(removed)
    }

    /// Re-enqueue durable rows with `from < offset <= to`, ready now. Returns
    /// how many were written back.
    pub async fn replay(
        &self,
        virtual_queue: &str,
        from_offset: i64,
        to_offset: i64,
        limit: usize,
    ) -> Result<usize> {
        let message_store = self
            .message_store
            .as_ref()
            .ok_or_else(|| StoreError::Config("replay needs a durable message store".into()))?;

        let rows = message_store
            .query_by_offset_range(virtual_queue, from_offset, to_offset, limit)
            .await?;
        let now = self.clock.now_millis();
        let mut replayed = 0;
        let mut queues = Vec::new();

        for row in &rows {
            let mut message = row.to_message()?;
            message.execute_time = now;
            let member = message.to_member()?;
            if self.store.add(&self.keys.queue(virtual_queue), &member, now).await? {
                replayed += 1;
            }
            if !queues.contains(&message.queue) {
                queues.push(message.queue.clone());
            }
        }

        for queue in &queues {
            self.push_hint(queue, now).await;
        }
        info!(virtual_queue, from_offset, to_offset, replayed, "Replayed messages");
        Ok(replayed)
    }

    async fn push_hint(&self, queue: &str, ready_at: i64) {
        let hint = PushHint {
            queue: queue.to_string(),
            ready_at: Some(ready_at),
        };
        let payload = match serde_json::to_string(&hint) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, queue, "Failed to encode push hint");
                return;
            }
        };
        // The message is already stored; consumers fall back to polling
        if let Err(e) = self.store.publish(&self.keys.push_channel(), &payload).await {
            warn!(error = %e, queue, "Failed to publish push hint");
        }
    }
}
