use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::fs::File;
use std::io::Read;

use crate::dlq::DlqOverflowPolicy;
use crate::topic::TopicConfig;

/// Default cap for each subscriber queue.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 1000;

/// Default topic history retention window in milliseconds (1 hour).
pub const DEFAULT_MESSAGE_RETENTION_MS: u64 = 3_600_000;

/// Default retry cap before a message is dead-lettered.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default redelivery delay for unacknowledged messages in milliseconds.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 5_000;

/// Default cap for the global dead-letter queue.
pub const DEFAULT_DEAD_LETTER_MAX_SIZE: usize = 1000;

/// Default request/reply timeout in milliseconds.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Broker-wide configuration. Per-topic overrides layer on top of the
/// `max_queue_size` / `message_retention_ms` / `max_retries` /
/// `retry_delay_ms` defaults here.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BrokerConfig {
    /// Cap per subscriber queue. Overflow evicts the oldest into the DLQ.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    /// Topic history retention window in milliseconds.
    #[serde(default = "default_message_retention_ms")]
    pub message_retention_ms: u64,
    /// Retry cap before dead-lettering. Default: 3.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Redelivery delay for unacknowledged messages. Default: 5000 ms.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Cap for the global dead-letter queue. Default: 1000.
    #[serde(default = "default_dead_letter_max_size")]
    pub dead_letter_max_size: usize,
    /// Default timeout for `request()` when the caller passes none.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// What to do with the oldest DLQ entry when the DLQ itself overflows.
    #[serde(default)]
    pub dlq_overflow_policy: DlqOverflowPolicy,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            message_retention_ms: DEFAULT_MESSAGE_RETENTION_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            dead_letter_max_size: DEFAULT_DEAD_LETTER_MAX_SIZE,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            dlq_overflow_policy: DlqOverflowPolicy::default(),
        }
    }
}

fn default_max_queue_size() -> usize {
    DEFAULT_MAX_QUEUE_SIZE
}

fn default_message_retention_ms() -> u64 {
    DEFAULT_MESSAGE_RETENTION_MS
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_retry_delay_ms() -> u64 {
    DEFAULT_RETRY_DELAY_MS
}

fn default_dead_letter_max_size() -> usize {
    DEFAULT_DEAD_LETTER_MAX_SIZE
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

impl Display for BrokerConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let yaml = serde_yaml::to_string(self).unwrap();
        write!(f, "\n{}", yaml)
    }
}

impl BrokerConfig {
    /// Loads configuration from a YAML file.
    pub fn load(path: &str) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut content = String::new();
        file.read_to_string(&mut content)?;
        let config: BrokerConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: BrokerConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Builds configuration from `TOPICBUS_*` environment variables layered
    /// over the defaults. Unparseable values are rejected.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = env_u64("TOPICBUS_MAX_QUEUE_SIZE")? {
            config.max_queue_size = v as usize;
        }
        if let Some(v) = env_u64("TOPICBUS_MESSAGE_RETENTION_MS")? {
            config.message_retention_ms = v;
        }
        if let Some(v) = env_u64("TOPICBUS_MAX_RETRIES")? {
            config.max_retries = v as u32;
        }
        if let Some(v) = env_u64("TOPICBUS_RETRY_DELAY_MS")? {
            config.retry_delay_ms = v;
        }
        if let Some(v) = env_u64("TOPICBUS_DEAD_LETTER_MAX_SIZE")? {
            config.dead_letter_max_size = v as usize;
        }
        if let Some(v) = env_u64("TOPICBUS_REQUEST_TIMEOUT_MS")? {
            config.request_timeout_ms = v;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_queue_size == 0 {
            anyhow::bail!("max_queue_size must be at least 1");
        }
        if self.message_retention_ms == 0 {
            anyhow::bail!("message_retention_ms must be positive");
        }
        if self.request_timeout_ms == 0 {
            anyhow::bail!("request_timeout_ms must be positive");
        }
        Ok(())
    }

    /// The per-topic defaults derived from this configuration.
    pub fn topic_defaults(&self) -> TopicConfig {
        TopicConfig {
            max_queue_size: self.max_queue_size,
            message_retention_ms: self.message_retention_ms,
            max_retries: self.max_retries,
            retry_delay_ms: self.retry_delay_ms,
            require_ack: false,
        }
    }
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    match std::env::var(name) {
        Ok(raw) => {
            let v = raw
                .parse::<u64>()
                .map_err(|e| anyhow::anyhow!("{name}={raw:?} is not a number: {e}"))?;
            Ok(Some(v))
        }
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.max_queue_size, 1000);
        assert_eq!(config.message_retention_ms, 3_600_000);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_delay_ms, 5_000);
        assert_eq!(config.dead_letter_max_size, 1000);
        assert_eq!(config.request_timeout_ms, 30_000);
        assert_eq!(config.dlq_overflow_policy, DlqOverflowPolicy::DropOldest);
    }

    #[test]
    fn test_parse_partial_yaml_fills_defaults() {
        let yaml = "max_queue_size: 50\nmax_retries: 5\n";
        let config = BrokerConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.max_queue_size, 50);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.retry_delay_ms, DEFAULT_RETRY_DELAY_MS);
    }

    #[test]
    fn test_parse_overflow_policy() {
        let yaml = "dlq_overflow_policy: drop-oldest-audited\n";
        let config = BrokerConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.dlq_overflow_policy, DlqOverflowPolicy::DropOldestAudited);
    }

    #[test]
    fn test_parse_invalid_yaml() {
        assert!(BrokerConfig::from_yaml("not: valid: yaml: [[[").is_err());
    }

    #[test]
    fn test_validate_rejects_zero_queue_size() {
        let yaml = "max_queue_size: 0\n";
        assert!(BrokerConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_load_config_file() {
        let config = BrokerConfig::load("config.yaml").unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn test_load_nonexistent_file() {
        assert!(BrokerConfig::load("nonexistent.yaml").is_err());
    }

    #[test]
    fn test_topic_defaults_follow_broker_config() {
        let yaml = "max_retries: 7\nretry_delay_ms: 250\n";
        let config = BrokerConfig::from_yaml(yaml).unwrap();
        let defaults = config.topic_defaults();
        assert_eq!(defaults.max_retries, 7);
        assert_eq!(defaults.retry_delay_ms, 250);
        assert!(!defaults.require_ack);
    }
}
