//! RedisMQ Configuration
//!
//! TOML configuration with environment variable overrides. One [`AppConfig`]
//! is built at startup and handed to every component constructor.

use rmq_common::{AckMode, Queue};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub redis: RedisConfig,
    pub client: ClientConfig,
    pub consumer: ConsumerConfig,
    pub store: StoreConfig,
    pub metrics: MetricsConfig,
    pub queues: Vec<QueueEntry>,
}

/// Redis connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    /// Prefix for every key and channel
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "redismq".to_string(),
        }
    }
}

/// Cluster membership configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Stable id of this process; generated when empty
    pub client_id: String,
    pub heartbeat_interval_secs: u64,
    /// Members whose heartbeat is older than this are stale
    pub staleness_threshold_secs: u64,
    pub rebalance_check_interval_secs: u64,
    pub cleanup_lock_ttl_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            heartbeat_interval_secs: 30,
            staleness_threshold_secs: 40,
            rebalance_check_interval_secs: 20,
            cleanup_lock_ttl_secs: 30,
        }
    }
}

impl ClientConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn staleness_threshold(&self) -> Duration {
        Duration::from_secs(self.staleness_threshold_secs)
    }

    pub fn rebalance_check_interval(&self) -> Duration {
        Duration::from_secs(self.rebalance_check_interval_secs)
    }

    pub fn cleanup_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.cleanup_lock_ttl_secs)
    }
}

/// Listener container and executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub ack_mode: AckMode,
    /// Manual-ack lease length
    pub lock_ttl_secs: u64,
    /// Delay before the first lease renewal
    pub lease_warmup_secs: u64,
    pub lease_renew_interval_secs: u64,
    /// Failed attempts allowed beyond the first
    pub retry_max: u32,
    pub retry_interval_ms: u64,
    /// Bounded wait for in-flight handlers on stop
    pub shutdown_timeout_ms: u64,
    /// Sleep after a transient store error
    pub error_backoff_ms: u64,
    /// Entries inspected when computing the next delay wake
    pub peek_window: usize,
    /// Fallback poll for immediate queues when no push hint arrives
    pub idle_poll_interval_ms: u64,
    /// Re-poll delay when every due entry is locked by another client
    pub contended_retry_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            ack_mode: AckMode::Auto,
            lock_ttl_secs: 60,
            lease_warmup_secs: 60,
            lease_renew_interval_secs: 30,
            retry_max: 2,
            retry_interval_ms: 1000,
            shutdown_timeout_ms: 3000,
            error_backoff_ms: 5000,
            peek_window: 100,
            idle_poll_interval_ms: 1000,
            contended_retry_ms: 200,
        }
    }
}

impl ConsumerConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn lease_warmup(&self) -> Duration {
        Duration::from_secs(self.lease_warmup_secs)
    }

    pub fn lease_renew_interval(&self) -> Duration {
        Duration::from_secs(self.lease_renew_interval_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.idle_poll_interval_ms)
    }

    pub fn contended_retry(&self) -> Duration {
        Duration::from_millis(self.contended_retry_ms)
    }
}

/// Durable audit store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub enabled: bool,
    /// memory or sqlite
    pub backend: String,
    pub sqlite_url: String,
    pub retention_hours: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: "memory".to_string(),
            sqlite_url: "sqlite://./data/redismq.db?mode=rwc".to_string(),
            retention_hours: 72,
            cleanup_interval_secs: 3600,
        }
    }
}

impl StoreConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 3600)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Prometheus exporter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: "0.0.0.0:9090".to_string(),
        }
    }
}

/// A `[[queues]]` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub name: String,
    #[serde(default = "default_virtual_count")]
    pub virtual_count: u32,
    #[serde(default)]
    pub delay: bool,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,
}

fn default_virtual_count() -> u32 {
    1
}

fn default_max_concurrency() -> u32 {
    8
}

impl QueueEntry {
    pub fn to_queue(&self) -> Queue {
        Queue {
            name: self.name.clone(),
            virtual_count: self.virtual_count,
            delay: self.delay,
            max_concurrency: self.max_concurrency,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    pub fn queue_definitions(&self) -> Vec<Queue> {
        self.queues.iter().map(QueueEntry::to_queue).collect()
    }

    /// Reject settings the consumer cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for queue in self.queue_definitions() {
            queue
                .validate()
                .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        }

        let mut names: Vec<&str> = self.queues.iter().map(|q| q.name.as_str()).collect();
        names.sort_unstable();
        if let Some(pair) = names.windows(2).find(|w| w[0] == w[1]) {
            return Err(ConfigError::ValidationError(format!(
                "queue '{}' is defined twice",
                pair[0]
            )));
        }

        if self.client.staleness_threshold_secs <= self.client.heartbeat_interval_secs {
            return Err(ConfigError::ValidationError(
                "client.staleness_threshold_secs must exceed client.heartbeat_interval_secs".into(),
            ));
        }
        if self.consumer.lease_renew_interval_secs >= self.consumer.lock_ttl_secs {
            return Err(ConfigError::ValidationError(
                "consumer.lease_renew_interval_secs must be shorter than consumer.lock_ttl_secs".into(),
            ));
        }
        if self.consumer.lease_warmup_secs > self.consumer.lock_ttl_secs {
            return Err(ConfigError::ValidationError(
                "consumer.lease_warmup_secs must not exceed consumer.lock_ttl_secs".into(),
            ));
        }
        if self.store.enabled && !matches!(self.store.backend.as_str(), "memory" | "sqlite") {
            return Err(ConfigError::ValidationError(format!(
                "unknown store.backend '{}'",
                self.store.backend
            )));
        }
        Ok(())
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# RedisMQ Configuration
# Environment variables (REDISMQ_*) override these settings

[redis]
url = "redis://127.0.0.1:6379"
key_prefix = "redismq"

[client]
client_id = ""  # generated when empty
heartbeat_interval_secs = 30
staleness_threshold_secs = 40
rebalance_check_interval_secs = 20
cleanup_lock_ttl_secs = 30

[consumer]
ack_mode = "auto"  # auto or manual
lock_ttl_secs = 60
lease_warmup_secs = 60
lease_renew_interval_secs = 30
retry_max = 2
retry_interval_ms = 1000
shutdown_timeout_ms = 3000
error_backoff_ms = 5000
peek_window = 100
idle_poll_interval_ms = 1000
contended_retry_ms = 200

[store]
enabled = false
backend = "memory"  # memory or sqlite
sqlite_url = "sqlite://./data/redismq.db?mode=rwc"
retention_hours = 72
cleanup_interval_secs = 3600

[metrics]
enabled = false
listen = "0.0.0.0:9090"

[[queues]]
name = "orders"
virtual_count = 3
delay = false
max_concurrency = 8

[[queues]]
name = "reminders"
virtual_count = 2
delay = true
max_concurrency = 4
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_parses_and_validates() {
        let config = AppConfig::from_toml(&AppConfig::example_toml()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.queues.len(), 2);
        assert!(config.queues[1].delay);
        assert_eq!(config.consumer.ack_mode, AckMode::Auto);
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config.client.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.client.staleness_threshold(), Duration::from_secs(40));
        assert_eq!(config.consumer.lock_ttl(), Duration::from_secs(60));
        assert_eq!(config.consumer.shutdown_timeout(), Duration::from_secs(3));
        assert_eq!(config.consumer.peek_window, 100);
        assert!(config.queues.is_empty());
    }

    #[test]
    fn test_manual_ack_mode_parses() {
        let config = AppConfig::from_toml("[consumer]\nack_mode = \"manual\"\n").unwrap();
        assert_eq!(config.consumer.ack_mode, AckMode::Manual);
    }

    #[test]
    fn test_validation_rejects_bad_queue() {
        let config = AppConfig::from_toml("[[queues]]\nname = \"orders\"\nvirtual_count = 0\n").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_validation_rejects_duplicate_queue() {
        let config = AppConfig::from_toml(
            "[[queues]]\nname = \"orders\"\n[[queues]]\nname = \"orders\"\n",
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_stale_before_heartbeat() {
        let mut config = AppConfig::default();
        config.client.staleness_threshold_secs = 10;
        assert!(config.validate().is_err());
    }
}
