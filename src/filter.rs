//! Subscription filters.
//!
//! A subscriber may attach a filter at subscribe time. The serde-facing
//! [`FilterSpec`] is compiled once into a [`SubscriptionFilter`] whose header
//! patterns are pre-built `Regex` values, so nothing is re-parsed per
//! message.
//!
//! Matching rules:
//! - Every declared header key must exist on the message and match its
//!   predicate (string equality or regex).
//! - Every declared payload key must exist at the top level of a JSON object
//!   payload with an equal value. A byte payload never matches a non-empty
//!   payload filter.
//! - An empty filter accepts all messages.

use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, Result};
use crate::message::Message;

/// Serde-facing filter description, as carried on a subscribe call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterSpec {
    /// Header predicates keyed by header name.
    #[serde(default)]
    pub headers: HashMap<String, HeaderMatchSpec>,
    /// Exact-equality predicates over top-level payload fields.
    #[serde(default)]
    pub payload: HashMap<String, serde_json::Value>,
}

/// A single header predicate: bare strings mean equality, the `pattern` form
/// is compiled to a regex.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderMatchSpec {
    Literal(String),
    Pattern { pattern: String },
}

impl FilterSpec {
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty() && self.payload.is_empty()
    }

    /// Validates the spec and compiles patterns. Fails with `InvalidFilter`
    /// on a malformed regex.
    pub fn compile(self) -> Result<SubscriptionFilter> {
        let mut headers = HashMap::with_capacity(self.headers.len());
        for (key, spec) in self.headers {
            let predicate = match spec {
                HeaderMatchSpec::Literal(value) => HeaderPredicate::Literal(value),
                HeaderMatchSpec::Pattern { pattern } => {
                    let regex = Regex::new(&pattern).map_err(|e| {
                        BrokerError::InvalidFilter(format!("header {key:?}: {e}"))
                    })?;
                    HeaderPredicate::Pattern(regex)
                }
            };
            headers.insert(key, predicate);
        }
        Ok(SubscriptionFilter {
            headers,
            payload: self.payload,
        })
    }
}

#[derive(Debug)]
enum HeaderPredicate {
    Literal(String),
    Pattern(Regex),
}

/// A validated filter, ready for per-message evaluation.
#[derive(Debug)]
pub struct SubscriptionFilter {
    headers: HashMap<String, HeaderPredicate>,
    payload: HashMap<String, serde_json::Value>,
}

impl SubscriptionFilter {
    /// Returns true when the message satisfies every declared predicate.
    pub fn matches(&self, message: &Message) -> bool {
        for (key, predicate) in &self.headers {
            let Some(actual) = message.headers.get(key) else {
                return false;
            };
            let ok = match predicate {
                HeaderPredicate::Literal(expected) => actual == expected,
                HeaderPredicate::Pattern(regex) => regex.is_match(actual),
            };
            if !ok {
                return false;
            }
        }

        if self.payload.is_empty() {
            return true;
        }
        let Some(object) = message.payload.as_object() else {
            return false;
        };
        for (key, expected) in &self.payload {
            if object.get(key) != Some(expected) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Payload;
    use serde_json::json;

    fn test_message() -> Message {
        let mut msg = Message::new(
            "orders.created",
            Payload::Json(json!({"orderId": "ORD-1", "amount": 42})),
            "pub-1",
        );
        msg.headers.insert("region".to_string(), "eu-west".to_string());
        msg.headers.insert("priority".to_string(), "high".to_string());
        msg
    }

    #[test]
    fn test_empty_filter_accepts_all() {
        let filter = FilterSpec::default().compile().unwrap();
        assert!(filter.matches(&test_message()));
    }

    #[test]
    fn test_header_literal_match() {
        let mut spec = FilterSpec::default();
        spec.headers.insert(
            "region".to_string(),
            HeaderMatchSpec::Literal("eu-west".to_string()),
        );
        let filter = spec.compile().unwrap();
        assert!(filter.matches(&test_message()));
    }

    #[test]
    fn test_header_literal_mismatch() {
        let mut spec = FilterSpec::default();
        spec.headers.insert(
            "region".to_string(),
            HeaderMatchSpec::Literal("us-east".to_string()),
        );
        let filter = spec.compile().unwrap();
        assert!(!filter.matches(&test_message()));
    }

    #[test]
    fn test_header_missing_fails() {
        let mut spec = FilterSpec::default();
        spec.headers.insert(
            "tenant".to_string(),
            HeaderMatchSpec::Literal("acme".to_string()),
        );
        let filter = spec.compile().unwrap();
        assert!(!filter.matches(&test_message()));
    }

    #[test]
    fn test_header_pattern_match() {
        let mut spec = FilterSpec::default();
        spec.headers.insert(
            "region".to_string(),
            HeaderMatchSpec::Pattern {
                pattern: "^eu-".to_string(),
            },
        );
        let filter = spec.compile().unwrap();
        assert!(filter.matches(&test_message()));
    }

    #[test]
    fn test_invalid_pattern_rejected_at_compile() {
        let mut spec = FilterSpec::default();
        spec.headers.insert(
            "region".to_string(),
            HeaderMatchSpec::Pattern {
                pattern: "([".to_string(),
            },
        );
        assert!(matches!(
            spec.compile(),
            Err(BrokerError::InvalidFilter(_))
        ));
    }

    #[test]
    fn test_payload_equality() {
        let mut spec = FilterSpec::default();
        spec.payload.insert("orderId".to_string(), json!("ORD-1"));
        spec.payload.insert("amount".to_string(), json!(42));
        let filter = spec.compile().unwrap();
        assert!(filter.matches(&test_message()));

        let mut spec = FilterSpec::default();
        spec.payload.insert("amount".to_string(), json!(7));
        let filter = spec.compile().unwrap();
        assert!(!filter.matches(&test_message()));
    }

    #[test]
    fn test_payload_filter_rejects_byte_payloads() {
        let mut spec = FilterSpec::default();
        spec.payload.insert("orderId".to_string(), json!("ORD-1"));
        let filter = spec.compile().unwrap();
        let msg = Message::new("t", Payload::Bytes(b"ORD-1".to_vec()), "p");
        assert!(!filter.matches(&msg));
    }

    #[test]
    fn test_spec_deserializes_both_header_forms() {
        let spec: FilterSpec = serde_json::from_value(json!({
            "headers": {
                "region": "eu-west",
                "trace": {"pattern": "^[0-9a-f]+$"}
            },
            "payload": {"orderId": "ORD-1"}
        }))
        .unwrap();
        assert_eq!(spec.headers.len(), 2);
        let filter = spec.compile().unwrap();
        let mut msg = test_message();
        msg.headers.insert("trace".to_string(), "deadbeef".to_string());
        assert!(filter.matches(&msg));
    }
}
