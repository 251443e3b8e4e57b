use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub mod keys;
pub mod logging;
pub mod time;

pub use keys::Keys;
pub use time::{Clock, SystemClock, TokioClock};

/// Tag a listener registers to receive every message of a queue.
pub const ANY_TAG: &str = "*";

/// Separator between a queue name and its shard index.
pub const VIRTUAL_QUEUE_SEPARATOR: char = '#';

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Malformed message member: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Invalid queue definition: {0}")]
    InvalidQueue(String),
}

// ============================================================================
// Core Message Types
// ============================================================================

/// A message stored as a sorted-set member.
///
/// The serialized JSON form is the member identity: claim and release
/// operations must use the exact string read from the store, never a
/// re-serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub body: serde_json::Value,
    pub queue: String,
    #[serde(default = "default_tag")]
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub header: BTreeMap<String, String>,
    #[serde(default)]
    pub virtual_queue_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
    /// Delay bucket, seconds-resolution of `execute_time`. Unset for immediate messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute_scope: Option<i64>,
    #[serde(default)]
    pub execute_time: i64,
    #[serde(default)]
    pub status: MessageStatus,
}

fn default_tag() -> String {
    ANY_TAG.to_string()
}

impl Message {
    /// New message for `queue` with an empty id; the producer fills in id,
    /// virtual queue, offset and schedule when it enqueues.
    pub fn new(queue: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            id: String::new(),
            body,
            queue: queue.into(),
            tag: default_tag(),
            key: None,
            header: BTreeMap::new(),
            virtual_queue_name: String::new(),
            offset: None,
            execute_scope: None,
            execute_time: 0,
            status: MessageStatus::Create,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.header.insert(name.into(), value.into());
        self
    }

    /// Encode as a sorted-set member.
    pub fn to_member(&self) -> Result<String, ModelError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a sorted-set member.
    pub fn from_member(member: &str) -> Result<Self, ModelError> {
        Ok(serde_json::from_str(member)?)
    }
}

/// Delivery status as persisted by the durable store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    #[default]
    Create,
    Consuming,
    Finish,
    Cancelled,
}

impl MessageStatus {
    pub fn code(self) -> i32 {
        match self {
            MessageStatus::Create => 0,
            MessageStatus::Consuming => 1,
            MessageStatus::Finish => 2,
            MessageStatus::Cancelled => 3,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(MessageStatus::Create),
            1 => Some(MessageStatus::Consuming),
            2 => Some(MessageStatus::Finish),
            3 => Some(MessageStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, MessageStatus::Finish | MessageStatus::Cancelled)
    }
}

// ============================================================================
// Queue Types
// ============================================================================

/// A logical queue split into `virtual_count` shards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Queue {
    pub name: String,
    pub virtual_count: u32,
    #[serde(default)]
    pub delay: bool,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,
}

fn default_max_concurrency() -> u32 {
    8
}

impl Queue {
    pub fn new(name: impl Into<String>, virtual_count: u32) -> Self {
        Self {
            name: name.into(),
            virtual_count,
            delay: false,
            max_concurrency: default_max_concurrency(),
        }
    }

    pub fn delayed(mut self) -> Self {
        self.delay = true;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: u32) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if self.name.is_empty() || self.name.contains(VIRTUAL_QUEUE_SEPARATOR) {
            return Err(ModelError::InvalidQueue(format!(
                "queue name '{}' must be non-empty and must not contain '{}'",
                self.name, VIRTUAL_QUEUE_SEPARATOR
            )));
        }
        if self.virtual_count == 0 {
            return Err(ModelError::InvalidQueue(format!(
                "queue '{}' needs at least one virtual queue",
                self.name
            )));
        }
        if self.max_concurrency == 0 {
            return Err(ModelError::InvalidQueue(format!(
                "queue '{}' needs a max_concurrency of at least 1",
                self.name
            )));
        }
        Ok(())
    }

    /// All shard names, `name#0 .. name#(virtual_count - 1)`.
    pub fn virtual_queues(&self) -> Vec<String> {
        (0..self.virtual_count)
            .map(|i| virtual_queue_name(&self.name, i))
            .collect()
    }

    /// Shard for a partition key. Stable across processes and releases.
    pub fn virtual_queue_for_key(&self, key: &str) -> String {
        let index = stable_hash(key) % self.virtual_count.max(1);
        virtual_queue_name(&self.name, index)
    }
}

pub fn virtual_queue_name(queue: &str, index: u32) -> String {
    format!("{queue}{VIRTUAL_QUEUE_SEPARATOR}{index}")
}

/// Split `queue#index` into its parts.
pub fn parse_virtual_queue(name: &str) -> Option<(&str, u32)> {
    let (queue, index) = name.rsplit_once(VIRTUAL_QUEUE_SEPARATOR)?;
    if queue.is_empty() {
        return None;
    }
    index.parse().ok().map(|i| (queue, i))
}

fn stable_hash(key: &str) -> u32 {
    // FNV-1a, 32 bit
    key.bytes().fold(0x811c_9dc5u32, |hash, b| {
        (hash ^ u32::from(b)).wrapping_mul(0x0100_0193)
    })
}

// ============================================================================
// Cluster Types
// ============================================================================

/// A consumer process in the shared membership set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMember {
    pub client_id: String,
    pub last_heartbeat: i64,
}

/// Client id used when none is configured: `HOSTNAME` plus a random suffix,
/// so two processes on one host never share an identity.
pub fn generate_client_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "redismq".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &suffix[..8])
}

pub fn generate_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl ClientMember {
    pub fn is_live(&self, now_millis: i64, staleness_millis: i64) -> bool {
        now_millis - self.last_heartbeat < staleness_millis
    }
}

/// How a container takes ownership of a claimed message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckMode {
    /// Atomic removal from the sorted set.
    #[default]
    Auto,
    /// Time-limited lock, removed from the set after the handler finishes.
    Manual,
}

/// Payload of the push channel, published whenever a producer writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushHint {
    pub queue: String,
    /// Ready time of the message that triggered the hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_at: Option<i64>,
}

impl PushHint {
    /// Accepts both the JSON form and a bare queue name.
    pub fn parse(payload: &str) -> Self {
        serde_json::from_str(payload).unwrap_or_else(|_| PushHint {
            queue: payload.to_string(),
            ready_at: None,
        })
    }
}
