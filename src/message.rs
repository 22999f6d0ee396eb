//! Message types shared across the broker.
//!
//! A [`Message`] is immutable once published. Copies placed on subscriber
//! queues are wrapped in a [`QueuedMessage`] that carries the delivery
//! bookkeeping (attempt counter, retry schedule) without touching the
//! original.

use std::collections::HashMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::topic::TopicConfig;

/// Backoff cap for nack retry scheduling (60 seconds).
pub const MAX_BACKOFF_MS: u64 = 60_000;

/// Base delay for the first retry step (1 second, doubled per attempt).
pub const BASE_BACKOFF_MS: u64 = 1_000;

/// Returns current time as milliseconds since UNIX epoch.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

/// Exponential backoff for the given attempt count: `min(1000 * 2^attempts, 60000)`.
pub fn retry_backoff_ms(attempts: u32) -> u64 {
    // 2^17 already exceeds the cap, so clamp the shift before it can overflow.
    let exp = attempts.min(17);
    BASE_BACKOFF_MS.saturating_mul(1u64 << exp).min(MAX_BACKOFF_MS)
}

/// Opaque message payload: either a structured JSON-like value or raw bytes.
///
/// The core never parses payloads except for sticky-key extraction and
/// payload filters, both of which inspect top-level keys of a `Json` object
/// and fall back gracefully for anything else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Payload {
    Json(serde_json::Value),
    Bytes(Vec<u8>),
}

impl Payload {
    /// The payload as a JSON object, if it is one.
    pub fn as_object(&self) -> Option<&serde_json::Map<String, serde_json::Value>> {
        match self {
            Payload::Json(serde_json::Value::Object(map)) => Some(map),
            _ => None,
        }
    }

    /// Looks up a top-level field of a JSON object payload.
    pub fn field(&self, key: &str) -> Option<&serde_json::Value> {
        self.as_object().and_then(|m| m.get(key))
    }

    /// Best-effort textual rendering, used for substring search.
    pub fn to_search_text(&self) -> String {
        match self {
            Payload::Json(value) => value.to_string(),
            Payload::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        }
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Json(value)
    }
}

/// Generates a message id: publish timestamp in base36 plus a random base36
/// suffix. Sorts roughly by publish time while staying collision-resistant.
pub fn generate_message_id() -> String {
    let mut id = to_base36(epoch_ms());
    let suffix: u64 = rand::thread_rng().gen();
    id.push_str(&to_base36(suffix));
    id
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut buf = Vec::new();
    while n > 0 {
        buf.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    buf.reverse();
    String::from_utf8(buf).unwrap()
}

/// A published message. Immutable after publication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Stable unique id (base36 timestamp + random suffix).
    pub id: String,
    /// Topic the message was published to.
    pub topic: String,
    pub payload: Payload,
    pub publisher_id: String,
    /// Publication time as milliseconds since UNIX epoch.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    /// Optional TTL relative to `timestamp`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: Payload, publisher_id: impl Into<String>) -> Self {
        Self {
            id: generate_message_id(),
            topic: topic.into(),
            payload,
            publisher_id: publisher_id.into(),
            timestamp: epoch_ms(),
            headers: HashMap::new(),
            ttl_ms: None,
            correlation_id: None,
            reply_to: None,
        }
    }

    /// Returns true if this message has expired based on the current time.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        match self.ttl_ms {
            Some(ttl) if ttl > 0 => now_ms >= self.timestamp + ttl,
            _ => false,
        }
    }
}

/// A message sitting on one subscriber's queue, with delivery bookkeeping.
#[derive(Debug, Clone, Serialize)]
pub struct QueuedMessage {
    pub message: Message,
    pub subscriber_id: String,
    pub queued_at: u64,
    /// Delivery attempts recorded so far (nacks and ack-pending redeliveries).
    pub attempts: u32,
    /// Retry cap copied from the topic config at enqueue time.
    pub max_retries: u32,
    /// Redelivery delay for unacknowledged messages, from the topic config.
    pub retry_delay_ms: u64,
    /// Whether the topic requires an explicit ack to settle delivery.
    pub require_ack: bool,
    /// When set, the message is not eligible for delivery before this time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<u64>,
}

impl QueuedMessage {
    pub fn new(message: Message, subscriber_id: impl Into<String>, config: &TopicConfig) -> Self {
        Self {
            message,
            subscriber_id: subscriber_id.into(),
            queued_at: epoch_ms(),
            attempts: 0,
            max_retries: config.max_retries,
            retry_delay_ms: config.retry_delay_ms,
            require_ack: config.require_ack,
            next_retry_at: None,
        }
    }

    /// Eligible for delivery: no pending backoff, or the backoff has elapsed.
    pub fn is_ready(&self, now_ms: u64) -> bool {
        match self.next_retry_at {
            Some(at) => at <= now_ms,
            None => true,
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.message.is_expired(now_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_then_caps() {
        assert_eq!(retry_backoff_ms(0), 1_000);
        assert_eq!(retry_backoff_ms(1), 2_000);
        assert_eq!(retry_backoff_ms(2), 4_000);
        assert_eq!(retry_backoff_ms(5), 32_000);
        assert_eq!(retry_backoff_ms(6), 60_000);
        assert_eq!(retry_backoff_ms(40), 60_000);
    }

    #[test]
    fn test_message_id_is_unique_and_time_prefixed() {
        let a = generate_message_id();
        let b = generate_message_id();
        assert_ne!(a, b);
        // 8-char base36 timestamp prefix plus a non-empty random suffix
        assert!(a.len() > 8);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_base36_round_trip() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(u64::from_str_radix(&to_base36(1_234_567_890), 36).unwrap(), 1_234_567_890);
    }

    #[test]
    fn test_message_expiry() {
        let mut msg = Message::new("t", Payload::Json(serde_json::json!({})), "p");
        assert!(!msg.is_expired(msg.timestamp + 1_000_000));
        msg.ttl_ms = Some(500);
        assert!(!msg.is_expired(msg.timestamp + 499));
        assert!(msg.is_expired(msg.timestamp + 500));
    }

    #[test]
    fn test_queued_message_readiness() {
        let msg = Message::new("t", Payload::Json(serde_json::json!({})), "p");
        let mut queued = QueuedMessage::new(msg, "sub-1", &TopicConfig::default());
        let now = epoch_ms();
        assert!(queued.is_ready(now));
        queued.next_retry_at = Some(now + 5_000);
        assert!(!queued.is_ready(now));
        assert!(queued.is_ready(now + 5_000));
    }

    #[test]
    fn test_payload_field_lookup() {
        let payload = Payload::Json(serde_json::json!({"userId": "u-1"}));
        assert_eq!(payload.field("userId").unwrap(), "u-1");
        assert!(payload.field("missing").is_none());
        let bytes = Payload::Bytes(vec![1, 2, 3]);
        assert!(bytes.field("userId").is_none());
    }
}
