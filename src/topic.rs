//! Topic registry: topic configuration, subscriber membership, and the
//! bounded message history ring.
//!
//! The registry keeps a topic → subscriber-id index so the router can
//! enumerate recipients in O(1) at publish time, and a per-topic history
//! deque trimmed on every append (retention window first, then the hard
//! length cap), so the trim cost stays bounded.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::{
    DEFAULT_MAX_QUEUE_SIZE, DEFAULT_MAX_RETRIES, DEFAULT_MESSAGE_RETENTION_MS,
    DEFAULT_RETRY_DELAY_MS,
};
use crate::error::{BrokerError, Result};
use crate::message::{epoch_ms, Message};

/// Hard cap on the per-topic history length, independent of retention.
pub const HISTORY_MAX_LEN: usize = 1000;

/// Per-topic configuration. Defaults come from the broker config; explicit
/// overrides layer on top at creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicConfig {
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_message_retention_ms")]
    pub message_retention_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub require_ack: bool,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            message_retention_ms: DEFAULT_MESSAGE_RETENTION_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            require_ack: false,
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

/// Partial overrides applied over the broker defaults at topic creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopicOverrides {
    pub max_queue_size: Option<usize>,
    pub message_retention_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub require_ack: Option<bool>,
}

impl TopicConfig {
    /// Applies the given overrides on top of this configuration.
    pub fn with_overrides(&self, overrides: &TopicOverrides) -> Self {
        Self {
            max_queue_size: overrides.max_queue_size.unwrap_or(self.max_queue_size),
            message_retention_ms: overrides
                .message_retention_ms
                .unwrap_or(self.message_retention_ms),
            max_retries: overrides.max_retries.unwrap_or(self.max_retries),
            retry_delay_ms: overrides.retry_delay_ms.unwrap_or(self.retry_delay_ms),
            require_ack: overrides.require_ack.unwrap_or(self.require_ack),
        }
    }
}

/// Snapshot of a topic's metadata, as returned by lookups and listings.
#[derive(Debug, Clone, Serialize)]
pub struct TopicInfo {
    pub name: String,
    pub created_at: u64,
    pub created_by: String,
    pub message_count: u64,
    pub subscriber_count: usize,
    pub config: TopicConfig,
}

/// Registry-wide statistics.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub topic_count: usize,
    pub total_messages: u64,
    pub total_subscriptions: usize,
    /// Top 10 topics by message count, busiest first.
    pub top_topics: Vec<(String, u64)>,
}

struct TopicEntry {
    created_at: u64,
    created_by: String,
    message_count: u64,
    config: TopicConfig,
    subscribers: HashSet<String>,
    history: VecDeque<Message>,
}

impl TopicEntry {
    fn info(&self, name: &str) -> TopicInfo {
        TopicInfo {
            name: name.to_string(),
            created_at: self.created_at,
            created_by: self.created_by.clone(),
            message_count: self.message_count,
            subscriber_count: self.subscribers.len(),
            config: self.config.clone(),
        }
    }

    /// Drops history entries that fell out of the retention window, then
    /// enforces the hard length cap.
    fn trim_history(&mut self, now_ms: u64) -> usize {
        let cutoff = now_ms.saturating_sub(self.config.message_retention_ms);
        let before = self.history.len();
        while self
            .history
            .front()
            .is_some_and(|m| m.timestamp < cutoff)
        {
            self.history.pop_front();
        }
        while self.history.len() > HISTORY_MAX_LEN {
            self.history.pop_front();
        }
        before - self.history.len()
    }
}

/// Returns true if `name` uses only the allowed character set:
/// alphanumerics, `.`, `-`, `_`, and the wildcard tokens `*` and `#`.
pub fn is_valid_topic_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '*' | '#'))
}

/// Glob match of a concrete topic name against a pattern: `.` is a literal
/// separator, `*` matches exactly one segment, `#` matches any remaining
/// suffix. A non-leading `#` requires at least one remaining segment, so
/// `a.#` matches `a.b` but not `a` itself.
pub fn topic_matches(pattern: &str, name: &str) -> bool {
    let mut name_segments = name.split('.');
    for (i, pattern_segment) in pattern.split('.').enumerate() {
        if pattern_segment == "#" {
            return i == 0 || name_segments.next().is_some();
        }
        match name_segments.next() {
            Some(segment) if pattern_segment == "*" || pattern_segment == segment => {}
            _ => return false,
        }
    }
    name_segments.next().is_none()
}

/// The topic registry. One per broker; shared via `Arc`.
pub struct TopicRegistry {
    inner: Mutex<HashMap<String, TopicEntry>>,
    defaults: TopicConfig,
}

impl TopicRegistry {
    pub fn new(defaults: TopicConfig) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            defaults,
        }
    }

    /// Creates a topic. Fails with `AlreadyExists` when the name is in use
    /// and `InvalidName` when it violates the character set.
    pub async fn create(
        &self,
        name: &str,
        creator: &str,
        overrides: Option<&TopicOverrides>,
    ) -> Result<TopicInfo> {
        if !is_valid_topic_name(name) {
            return Err(BrokerError::InvalidName(name.to_string()));
        }
        let mut inner = self.inner.lock().await;
        if inner.contains_key(name) {
            return Err(BrokerError::AlreadyExists(format!("topic {name}")));
        }
        let config = match overrides {
            Some(o) => self.defaults.with_overrides(o),
            None => self.defaults.clone(),
        };
        let entry = TopicEntry {
            created_at: epoch_ms(),
            created_by: creator.to_string(),
            message_count: 0,
            config,
            subscribers: HashSet::new(),
            history: VecDeque::new(),
        };
        let info = entry.info(name);
        inner.insert(name.to_string(), entry);
        debug!(topic = %name, creator = %creator, "Topic created");
        Ok(info)
    }

    /// Returns the topic, creating it with default configuration when
    /// missing. The bool reports whether a new topic was created.
    pub async fn ensure(&self, name: &str, creator: &str) -> Result<(TopicInfo, bool)> {
        if !is_valid_topic_name(name) {
            return Err(BrokerError::InvalidName(name.to_string()));
        }
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.get(name) {
            return Ok((entry.info(name), false));
        }
        let entry = TopicEntry {
            created_at: epoch_ms(),
            created_by: creator.to_string(),
            message_count: 0,
            config: self.defaults.clone(),
            subscribers: HashSet::new(),
            history: VecDeque::new(),
        };
        let info = entry.info(name);
        inner.insert(name.to_string(), entry);
        debug!(topic = %name, creator = %creator, "Topic auto-created");
        Ok((info, true))
    }

    /// Removes a topic together with its history and membership set.
    /// Queued messages already dispatched to subscribers are untouched.
    pub async fn delete(&self, name: &str) -> bool {
        self.inner.lock().await.remove(name).is_some()
    }

    /// Rollback helper for staged creation: removes a topic only if nothing
    /// happened on it yet.
    pub(crate) async fn remove_if_untouched(&self, name: &str) {
        let mut inner = self.inner.lock().await;
        if inner
            .get(name)
            .is_some_and(|e| e.message_count == 0 && e.subscribers.is_empty())
        {
            inner.remove(name);
        }
    }

    pub async fn has(&self, name: &str) -> bool {
        self.inner.lock().await.contains_key(name)
    }

    pub async fn get(&self, name: &str) -> Option<TopicInfo> {
        self.inner.lock().await.get(name).map(|e| e.info(name))
    }

    pub async fn list_all(&self) -> Vec<TopicInfo> {
        let inner = self.inner.lock().await;
        let mut topics: Vec<TopicInfo> = inner.iter().map(|(n, e)| e.info(n)).collect();
        topics.sort_by(|a, b| a.name.cmp(&b.name));
        topics
    }

    pub async fn topic_config(&self, name: &str) -> Option<TopicConfig> {
        self.inner.lock().await.get(name).map(|e| e.config.clone())
    }

    /// Adds a subscriber to the topic's membership set. Returns false when
    /// the topic does not exist.
    pub async fn add_subscriber(&self, name: &str, subscriber_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.get_mut(name) {
            Some(entry) => {
                entry.subscribers.insert(subscriber_id.to_string());
                true
            }
            None => false,
        }
    }

    pub async fn remove_subscriber(&self, name: &str, subscriber_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.get_mut(name) {
            Some(entry) => entry.subscribers.remove(subscriber_id),
            None => false,
        }
    }

    /// Removes the subscriber from every topic. Returns the topics it was
    /// actually a member of.
    pub async fn remove_subscriber_everywhere(&self, subscriber_id: &str) -> Vec<String> {
        let mut inner = self.inner.lock().await;
        let mut removed = Vec::new();
        for (name, entry) in inner.iter_mut() {
            if entry.subscribers.remove(subscriber_id) {
                removed.push(name.clone());
            }
        }
        removed
    }

    /// Snapshot of the subscriber ids for a topic.
    pub async fn subscribers_of(&self, name: &str) -> Vec<String> {
        match self.inner.lock().await.get(name) {
            Some(entry) => entry.subscribers.iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Records a published message: bumps the counter, appends to history,
    /// and trims. No-op when the topic is unknown.
    pub async fn record_message(&self, message: &Message) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.get_mut(&message.topic) {
            entry.message_count += 1;
            entry.history.push_back(message.clone());
            entry.trim_history(epoch_ms());
        }
    }

    /// The last `limit` messages for a topic, oldest first.
    pub async fn get_history(&self, name: &str, limit: usize) -> Vec<Message> {
        match self.inner.lock().await.get(name) {
            Some(entry) => {
                let skip = entry.history.len().saturating_sub(limit);
                entry.history.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Trims every topic's history against its retention window. Returns
    /// the number of messages dropped.
    pub async fn trim_all_history(&self) -> usize {
        let now = epoch_ms();
        let mut inner = self.inner.lock().await;
        inner.values_mut().map(|e| e.trim_history(now)).sum()
    }

    /// Concrete topic names matching a glob pattern. This is a listing
    /// facility only; routing treats `#` as a literal catch-all topic.
    pub async fn match_topics(&self, pattern: &str) -> Vec<String> {
        let inner = self.inner.lock().await;
        let mut names: Vec<String> = inner
            .keys()
            .filter(|name| topic_matches(pattern, name))
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub async fn stats(&self) -> RegistryStats {
        let inner = self.inner.lock().await;
        let mut by_count: Vec<(String, u64)> = inner
            .iter()
            .map(|(n, e)| (n.clone(), e.message_count))
            .collect();
        by_count.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        by_count.truncate(10);
        RegistryStats {
            topic_count: inner.len(),
            total_messages: inner.values().map(|e| e.message_count).sum(),
            total_subscriptions: inner.values().map(|e| e.subscribers.len()).sum(),
            top_topics: by_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Payload;
    use serde_json::json;

    fn registry() -> TopicRegistry {
        TopicRegistry::new(TopicConfig::default())
    }

    fn msg(topic: &str) -> Message {
        Message::new(topic, Payload::Json(json!({})), "pub-1")
    }

    #[tokio::test]
    async fn test_create_and_duplicate() {
        let reg = registry();
        reg.create("orders.created", "alice", None).await.unwrap();
        let err = reg.create("orders.created", "bob", None).await.unwrap_err();
        assert!(matches!(err, BrokerError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_invalid_name_rejected() {
        let reg = registry();
        for bad in ["", "orders/created", "orders created", "ördérs"] {
            let err = reg.create(bad, "alice", None).await.unwrap_err();
            assert!(matches!(err, BrokerError::InvalidName(_)), "{bad:?}");
        }
        // wildcard tokens are part of the allowed set
        reg.create("#", "alice", None).await.unwrap();
        reg.create("orders.*", "alice", None).await.unwrap();
    }

    #[tokio::test]
    async fn test_overrides_layer_on_defaults() {
        let reg = registry();
        let overrides = TopicOverrides {
            max_queue_size: Some(5),
            require_ack: Some(true),
            ..Default::default()
        };
        let info = reg.create("t", "alice", Some(&overrides)).await.unwrap();
        assert_eq!(info.config.max_queue_size, 5);
        assert!(info.config.require_ack);
        assert_eq!(info.config.max_retries, DEFAULT_MAX_RETRIES);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let reg = registry();
        reg.create("t", "alice", None).await.unwrap();
        assert!(reg.delete("t").await);
        assert!(!reg.delete("t").await);
    }

    #[tokio::test]
    async fn test_subscriber_membership() {
        let reg = registry();
        reg.create("a", "x", None).await.unwrap();
        reg.create("b", "x", None).await.unwrap();
        reg.add_subscriber("a", "sub-1").await;
        reg.add_subscriber("b", "sub-1").await;
        reg.add_subscriber("a", "sub-2").await;

        assert_eq!(reg.subscribers_of("a").await.len(), 2);
        let mut removed = reg.remove_subscriber_everywhere("sub-1").await;
        removed.sort();
        assert_eq!(removed, vec!["a", "b"]);
        assert_eq!(reg.subscribers_of("a").await, vec!["sub-2"]);
    }

    #[tokio::test]
    async fn test_history_tail_and_order() {
        let reg = registry();
        reg.create("t", "x", None).await.unwrap();
        for _ in 0..5 {
            reg.record_message(&msg("t")).await;
        }
        assert_eq!(reg.get_history("t", 3).await.len(), 3);
        assert_eq!(reg.get_history("t", 100).await.len(), 5);
        let info = reg.get("t").await.unwrap();
        assert_eq!(info.message_count, 5);
    }

    #[tokio::test]
    async fn test_history_cap() {
        let reg = registry();
        reg.create("t", "x", None).await.unwrap();
        for _ in 0..(HISTORY_MAX_LEN + 20) {
            reg.record_message(&msg("t")).await;
        }
        let history = reg.get_history("t", usize::MAX).await;
        assert_eq!(history.len(), HISTORY_MAX_LEN);
        let info = reg.get("t").await.unwrap();
        // the counter is monotone even though history is trimmed
        assert_eq!(info.message_count, (HISTORY_MAX_LEN + 20) as u64);
    }

    #[tokio::test]
    async fn test_retention_trim() {
        let reg = TopicRegistry::new(TopicConfig {
            message_retention_ms: 50,
            ..Default::default()
        });
        reg.create("t", "x", None).await.unwrap();
        let mut old = msg("t");
        old.timestamp = epoch_ms() - 10_000;
        reg.record_message(&old).await;
        reg.record_message(&msg("t")).await;
        // the stale entry was trimmed by the second append
        let history = reg.get_history("t", 100).await;
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_topic_matches_literal() {
        assert!(topic_matches("orders.created", "orders.created"));
        assert!(!topic_matches("orders.created", "orders.updated"));
        assert!(!topic_matches("orders", "orders.created"));
        assert!(!topic_matches("orders.created", "orders"));
    }

    #[test]
    fn test_topic_matches_star_single_segment() {
        assert!(topic_matches("orders.*", "orders.created"));
        assert!(!topic_matches("orders.*", "orders.created.eu"));
        assert!(!topic_matches("orders.*", "orders"));
        assert!(topic_matches("*.created", "orders.created"));
    }

    #[test]
    fn test_topic_matches_hash_suffix() {
        assert!(topic_matches("#", "anything"));
        assert!(topic_matches("#", "a.b.c"));
        assert!(topic_matches("orders.#", "orders.created"));
        assert!(topic_matches("orders.#", "orders.created.eu"));
        assert!(!topic_matches("orders.#", "orders"));
        assert!(!topic_matches("orders.#", "invoices.created"));
    }

    #[tokio::test]
    async fn test_match_topics_lists_concrete_names() {
        let reg = registry();
        for name in ["orders.created", "orders.updated", "invoices.created"] {
            reg.create(name, "x", None).await.unwrap();
        }
        assert_eq!(
            reg.match_topics("orders.*").await,
            vec!["orders.created", "orders.updated"]
        );
        assert_eq!(reg.match_topics("#").await.len(), 3);
    }

    #[tokio::test]
    async fn test_stats_top_topics() {
        let reg = registry();
        reg.create("busy", "x", None).await.unwrap();
        reg.create("quiet", "x", None).await.unwrap();
        for _ in 0..3 {
            reg.record_message(&msg("busy")).await;
        }
        reg.record_message(&msg("quiet")).await;
        let stats = reg.stats().await;
        assert_eq!(stats.topic_count, 2);
        assert_eq!(stats.total_messages, 4);
        assert_eq!(stats.top_topics[0].0, "busy");
    }
}
