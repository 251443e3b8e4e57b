//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "redismq.toml",
    "config.toml",
    "./config/redismq.toml",
    "/etc/redismq/redismq.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found), apply environment overrides
    /// and validate the result.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = match self.find_config_file()? {
            Some(path) => {
                info!(?path, "Loading configuration from file");
                AppConfig::from_file(&path)?
            }
            None => AppConfig::default(),
        };

        apply_env_overrides(&mut config, |name| env::var(name).ok());
        config.validate()?;

        Ok(config)
    }

    fn find_config_file(&self) -> Result<Option<PathBuf>, ConfigError> {
        // An explicit path that does not exist is a mistake, not a fallback
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Ok(Some(path.clone()));
            }
            return Err(ConfigError::ValidationError(format!(
                "config file {} not found",
                path.display()
            )));
        }

        if let Ok(path) = env::var("REDISMQ_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Ok(Some(path));
            }
        }

        Ok(CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists()))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply `REDISMQ_*` overrides read through `lookup`. Values that fail to
/// parse are ignored.
pub(crate) fn apply_env_overrides<F>(config: &mut AppConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    // Redis
    if let Some(val) = lookup("REDISMQ_REDIS_URL") {
        config.redis.url = val;
    }
    if let Some(val) = lookup("REDISMQ_KEY_PREFIX") {
        config.redis.key_prefix = val;
    }

    // Client
    if let Some(val) = lookup("REDISMQ_CLIENT_ID") {
        config.client.client_id = val;
    }
    if let Some(val) = lookup("REDISMQ_HEARTBEAT_INTERVAL_SECS") {
        if let Ok(secs) = val.parse() {
            config.client.heartbeat_interval_secs = secs;
        }
    }
    if let Some(val) = lookup("REDISMQ_STALENESS_THRESHOLD_SECS") {
        if let Ok(secs) = val.parse() {
            config.client.staleness_threshold_secs = secs;
        }
    }
    if let Some(val) = lookup("REDISMQ_REBALANCE_CHECK_INTERVAL_SECS") {
        if let Ok(secs) = val.parse() {
            config.client.rebalance_check_interval_secs = secs;
        }
    }

    // Consumer
    if let Some(val) = lookup("REDISMQ_ACK_MODE") {
        match val.to_ascii_lowercase().as_str() {
            "auto" => config.consumer.ack_mode = rmq_common::AckMode::Auto,
            "manual" => config.consumer.ack_mode = rmq_common::AckMode::Manual,
            _ => {}
        }
    }
    if let Some(val) = lookup("REDISMQ_LOCK_TTL_SECS") {
        if let Ok(secs) = val.parse() {
            config.consumer.lock_ttl_secs = secs;
        }
    }
    if let Some(val) = lookup("REDISMQ_RETRY_MAX") {
        if let Ok(max) = val.parse() {
            config.consumer.retry_max = max;
        }
    }
    if let Some(val) = lookup("REDISMQ_RETRY_INTERVAL_MS") {
        if let Ok(ms) = val.parse() {
            config.consumer.retry_interval_ms = ms;
        }
    }
    if let Some(val) = lookup("REDISMQ_SHUTDOWN_TIMEOUT_MS") {
        if let Ok(ms) = val.parse() {
            config.consumer.shutdown_timeout_ms = ms;
        }
    }

    // Durable store
    if let Some(val) = lookup("REDISMQ_STORE_ENABLED") {
        config.store.enabled = val.parse().unwrap_or(false);
    }
    if let Some(val) = lookup("REDISMQ_STORE_BACKEND") {
        config.store.backend = val;
    }
    if let Some(val) = lookup("REDISMQ_STORE_SQLITE_URL") {
        config.store.sqlite_url = val;
    }

    // Metrics
    if let Some(val) = lookup("REDISMQ_METRICS_ENABLED") {
        config.metrics.enabled = val.parse().unwrap_or(false);
    }
    if let Some(val) = lookup("REDISMQ_METRICS_LISTEN") {
        config.metrics.listen = val;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmq_common::AckMode;
    use std::collections::HashMap;
    use std::io::Write;

    fn overrides(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AppConfig::default();
        apply_env_overrides(
            &mut config,
            overrides(&[
                ("REDISMQ_REDIS_URL", "redis://cache:6380"),
                ("REDISMQ_CLIENT_ID", "worker-1"),
                ("REDISMQ_ACK_MODE", "MANUAL"),
                ("REDISMQ_RETRY_MAX", "5"),
                ("REDISMQ_LOCK_TTL_SECS", "not-a-number"),
                ("REDISMQ_STORE_ENABLED", "true"),
            ]),
        );

        assert_eq!(config.redis.url, "redis://cache:6380");
        assert_eq!(config.client.client_id, "worker-1");
        assert_eq!(config.consumer.ack_mode, AckMode::Manual);
        assert_eq!(config.consumer.retry_max, 5);
        assert_eq!(config.consumer.lock_ttl_secs, 60);
        assert!(config.store.enabled);
    }

    #[test]
    fn test_load_from_explicit_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[redis]\nkey_prefix = \"mq-test\"\n\n[[queues]]\nname = \"orders\"\nvirtual_count = 3").unwrap();

        let config = ConfigLoader::with_path(file.path()).load().unwrap();
        assert_eq!(config.queues[0].virtual_count, 3);
        assert_eq!(config.queues[0].max_concurrency, 8);
    }

    #[test]
    fn test_missing_explicit_path_is_an_error() {
        let result = ConfigLoader::with_path("/nonexistent/redismq.toml").load();
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }
}
