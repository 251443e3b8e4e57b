//! Durable audit/replay store
//!
//! Records every enqueued message with its final status. Live delivery never
//! reads from here; it exists for inspection and offset-range replay.

use async_trait::async_trait;
use dashmap::DashMap;
use rmq_common::{Clock, Message, MessageStatus, SystemClock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{Result, StoreError};

/// A persisted message row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: String,
    pub queue: String,
    pub virtual_queue: String,
    pub offset: i64,
    pub tag: String,
    pub key: Option<String>,
    /// Message body as JSON text
    pub body: String,
    pub header: String,
    pub execute_time: i64,
    /// Ready time in seconds, delay queues only
    pub execute_scope: Option<i64>,
    pub status: MessageStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

impl StoredMessage {
    pub fn from_message(message: &Message, now_millis: i64) -> Result<Self> {
        let offset = message.offset.ok_or_else(|| {
            StoreError::InvalidMessage(format!("message {} has no offset", message.id))
        })?;
        Ok(Self {
            id: message.id.clone(),
            queue: message.queue.clone(),
            virtual_queue: message.virtual_queue_name.clone(),
            offset,
            tag: message.tag.clone(),
            key: message.key.clone(),
            body: serde_json::to_string(&message.body)?,
            header: serde_json::to_string(&message.header)?,
            execute_time: message.execute_time,
            execute_scope: message.execute_scope,
            status: message.status,
            created_at: now_millis,
            updated_at: now_millis,
        })
    }

    /// Rebuild the message envelope, e.g. to re-enqueue it.
    pub fn to_message(&self) -> Result<Message> {
        Ok(Message {
            id: self.id.clone(),
            body: serde_json::from_str(&self.body)?,
            queue: self.queue.clone(),
            tag: self.tag.clone(),
            key: self.key.clone(),
            header: serde_json::from_str(&self.header)?,
            virtual_queue_name: self.virtual_queue.clone(),
            offset: Some(self.offset),
            execute_scope: self.execute_scope,
            execute_time: self.execute_time,
            status: MessageStatus::Create,
        })
    }
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Create tables or indexes if the backend needs them.
    async fn init_schema(&self) -> Result<()> {
        Ok(())
    }

    /// Insert a batch. Ids already present are ignored. Returns rows inserted.
    async fn save_messages(&self, messages: &[Message]) -> Result<u64>;

    /// Set the status of the given ids. Returns rows updated.
    async fn update_status(&self, ids: &[String], status: MessageStatus) -> Result<u64>;

    /// Rows of one virtual queue with `from_offset < offset <= to_offset`,
    /// ascending by offset.
    async fn query_by_offset_range(
        &self,
        virtual_queue: &str,
        from_offset: i64,
        to_offset: i64,
        limit: usize,
    ) -> Result<Vec<StoredMessage>>;

    /// Delete rows created before `before_millis`. Returns rows deleted.
    async fn clear_expired(&self, before_millis: i64) -> Result<u64>;
}

/// [`MessageStore`] kept in a concurrent map. Row timestamps come from the
/// injected clock, the same one retention cutoffs are computed with.
pub struct MemoryMessageStore {
    rows: DashMap<String, StoredMessage>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryMessageStore {
    fn default() -> Self {
        Self {
            rows: DashMap::new(),
            clock: Arc::new(SystemClock),
        }
    }
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            rows: DashMap::new(),
            clock,
        }
    }

    pub fn get(&self, id: &str) -> Option<StoredMessage> {
        self.rows.get(id).map(|row| row.clone())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn save_messages(&self, messages: &[Message]) -> Result<u64> {
        let now = self.clock.now_millis();
        let mut inserted = 0;
        for message in messages {
            let row = StoredMessage::from_message(message, now)?;
            if let dashmap::mapref::entry::Entry::Vacant(slot) = self.rows.entry(row.id.clone()) {
                slot.insert(row);
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn update_status(&self, ids: &[String], status: MessageStatus) -> Result<u64> {
        let now = self.clock.now_millis();
        let mut updated = 0;
        for id in ids {
            if let Some(mut row) = self.rows.get_mut(id) {
                row.status = status;
                row.updated_at = now;
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn query_by_offset_range(
        &self,
        virtual_queue: &str,
        from_offset: i64,
        to_offset: i64,
        limit: usize,
    ) -> Result<Vec<StoredMessage>> {
        let mut rows: Vec<StoredMessage> = self
            .rows
            .iter()
            .filter(|row| {
                row.virtual_queue == virtual_queue
                    && row.offset > from_offset
                    && row.offset <= to_offset
            })
            .map(|row| row.clone())
            .collect();
        rows.sort_by_key(|row| row.offset);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn clear_expired(&self, before_millis: i64) -> Result<u64> {
        let before = self.rows.len();
        self.rows.retain(|_, row| row.created_at >= before_millis);
        Ok((before - self.rows.len()) as u64)
    }
}
