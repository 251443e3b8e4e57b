//! Store key layout
//!
//! Every key and channel lives under one prefix so several deployments can
//! share a Redis instance.

/// Builds the keys and channel names used by producers and consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keys {
    prefix: String,
}

impl Default for Keys {
    fn default() -> Self {
        Self::new("redismq")
    }
}

impl Keys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Sorted set holding the messages of one virtual queue.
    pub fn queue(&self, virtual_queue: &str) -> String {
        format!("{}:queue:{}", self.prefix, virtual_queue)
    }

    /// Manual-ack lease for one message.
    pub fn lock(&self, message_id: &str) -> String {
        format!("{}:lock:{}", self.prefix, message_id)
    }

    /// Membership set, scored by last heartbeat.
    pub fn clients(&self) -> String {
        format!("{}:clients", self.prefix)
    }

    /// Clients listening to one queue, scored by last heartbeat.
    pub fn subscribers(&self, queue: &str) -> String {
        format!("{}:clients:{}", self.prefix, queue)
    }

    /// Mutual exclusion for stale-member cleanup.
    pub fn cleanup_lock(&self) -> String {
        format!("{}:rebalance-lock", self.prefix)
    }

    /// Offset counter of one virtual queue.
    pub fn offset(&self, virtual_queue: &str) -> String {
        format!("{}:offset:{}", self.prefix, virtual_queue)
    }

    /// Hash of queue definitions.
    pub fn queues(&self) -> String {
        format!("{}:queues", self.prefix)
    }

    pub fn rebalance_channel(&self) -> String {
        format!("{}:rebalance", self.prefix)
    }

    pub fn push_channel(&self) -> String {
        format!("{}:push", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let keys = Keys::new("mq");
        assert_eq!(keys.queue("orders#1"), "mq:queue:orders#1");
        assert_eq!(keys.lock("abc"), "mq:lock:abc");
        assert_eq!(keys.clients(), "mq:clients");
        assert_eq!(keys.subscribers("orders"), "mq:clients:orders");
        assert_eq!(keys.push_channel(), "mq:push");
        assert_eq!(Keys::default().prefix(), "redismq");
    }
}
