//! Request/reply correlation.
//!
//! `request()` turns asynchronous delivery into a synchronous await: the
//! correlator allocates a correlation id and a transient reply topic,
//! registers a one-shot resolver, and the broker subscribes a hidden
//! [`ReplySink`] that settles the resolver when a message with the matching
//! correlation id arrives.
//!
//! Settlement is exactly-once by construction: whichever path removes the
//! pending entry — reply, cancel, or the requester's timeout — is the one
//! that settles it, and the requester path performs all teardown
//! (unsubscribe, reply-topic deletion) regardless of which way the entry
//! was settled.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::error::BrokerError;
use crate::message::{epoch_ms, Message};
use crate::subscriber::SubscriberSink;

/// Prefix of transient reply topics: `_reply.<requester>.<correlation-id>`.
pub const REPLY_TOPIC_PREFIX: &str = "_reply";

/// Bookkeeping for one in-flight request.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub correlation_id: String,
    pub requester_id: String,
    pub topic: String,
    pub reply_topic: String,
    pub sent_at: u64,
    pub timeout_ms: u64,
}

type Settlement = Result<Message, BrokerError>;

struct PendingEntry {
    request: PendingRequest,
    tx: oneshot::Sender<Settlement>,
}

/// Pending-request table. Uses a plain mutex so replies can settle from the
/// synchronous sink path.
pub struct RequestCorrelator {
    inner: Mutex<HashMap<String, PendingEntry>>,
}

impl Default for RequestCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Allocates a correlation id and reply topic and registers the pending
    /// entry. The receiver settles with the reply, a cancellation error, or
    /// not at all (timeout handling belongs to the requester).
    pub fn register(
        &self,
        requester_id: &str,
        topic: &str,
        timeout_ms: u64,
    ) -> (PendingRequest, oneshot::Receiver<Settlement>) {
        let correlation_id = Uuid::new_v4().to_string();
        let reply_topic = format!("{REPLY_TOPIC_PREFIX}.{requester_id}.{correlation_id}");
        let request = PendingRequest {
            correlation_id: correlation_id.clone(),
            requester_id: requester_id.to_string(),
            topic: topic.to_string(),
            reply_topic,
            sent_at: epoch_ms(),
            timeout_ms,
        };
        let (tx, rx) = oneshot::channel();
        let entry = PendingEntry {
            request: request.clone(),
            tx,
        };
        self.inner
            .lock()
            .unwrap()
            .insert(correlation_id, entry);
        (request, rx)
    }

    /// Settles a pending request with its reply. Returns false when no
    /// entry exists (already settled, timed out, or unknown).
    pub fn resolve(&self, correlation_id: &str, reply: Message) -> bool {
        let entry = self.inner.lock().unwrap().remove(correlation_id);
        match entry {
            Some(entry) => {
                debug!(correlation_id = %correlation_id, "Request resolved");
                // the receiver may already be gone after a timeout race
                let _ = entry.tx.send(Ok(reply));
                true
            }
            None => false,
        }
    }

    /// Settles a pending request as cancelled.
    pub fn cancel(&self, correlation_id: &str) -> bool {
        let entry = self.inner.lock().unwrap().remove(correlation_id);
        match entry {
            Some(entry) => {
                debug!(correlation_id = %correlation_id, "Request cancelled");
                let _ = entry.tx.send(Err(BrokerError::Cancelled));
                true
            }
            None => false,
        }
    }

    /// Removes a pending entry without settling it — the timeout path.
    /// Returns false when the entry was already settled by a racing reply.
    pub fn take(&self, correlation_id: &str) -> bool {
        self.inner.lock().unwrap().remove(correlation_id).is_some()
    }

    pub fn get(&self, correlation_id: &str) -> Option<PendingRequest> {
        self.inner
            .lock()
            .unwrap()
            .get(correlation_id)
            .map(|e| e.request.clone())
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

/// The hidden sink subscribed to a request's reply topic.
pub(crate) struct ReplySink {
    pub correlator: std::sync::Arc<RequestCorrelator>,
    pub correlation_id: String,
}

impl SubscriberSink for ReplySink {
    fn deliver(&self, message: &Message) -> anyhow::Result<()> {
        if message.correlation_id.as_deref() == Some(self.correlation_id.as_str()) {
            self.correlator.resolve(&self.correlation_id, message.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Payload;
    use serde_json::json;

    fn reply_for(correlation_id: &str) -> Message {
        let mut msg = Message::new("_reply.x.y", Payload::Json(json!({"ok": true})), "replier");
        msg.correlation_id = Some(correlation_id.to_string());
        msg
    }

    #[tokio::test]
    async fn test_resolve_settles_receiver() {
        let correlator = RequestCorrelator::new();
        let (request, rx) = correlator.register("cli", "svc.q", 1000);
        assert_eq!(correlator.pending_count(), 1);
        assert!(correlator.resolve(&request.correlation_id, reply_for(&request.correlation_id)));
        let settled = rx.await.unwrap().unwrap();
        assert_eq!(settled.correlation_id.as_deref(), Some(request.correlation_id.as_str()));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_resolve_is_exactly_once() {
        let correlator = RequestCorrelator::new();
        let (request, _rx) = correlator.register("cli", "svc.q", 1000);
        assert!(correlator.resolve(&request.correlation_id, reply_for(&request.correlation_id)));
        assert!(!correlator.resolve(&request.correlation_id, reply_for(&request.correlation_id)));
        assert!(!correlator.cancel(&request.correlation_id));
    }

    #[tokio::test]
    async fn test_cancel_settles_with_cancelled() {
        let correlator = RequestCorrelator::new();
        let (request, rx) = correlator.register("cli", "svc.q", 1000);
        assert!(correlator.cancel(&request.correlation_id));
        assert!(matches!(rx.await.unwrap(), Err(BrokerError::Cancelled)));
    }

    #[tokio::test]
    async fn test_take_wins_over_late_resolve() {
        let correlator = RequestCorrelator::new();
        let (request, _rx) = correlator.register("cli", "svc.q", 1000);
        assert!(correlator.take(&request.correlation_id));
        assert!(!correlator.resolve(&request.correlation_id, reply_for(&request.correlation_id)));
    }

    #[tokio::test]
    async fn test_reply_topic_shape() {
        let correlator = RequestCorrelator::new();
        let (request, _rx) = correlator.register("cli-9", "svc.q", 1000);
        assert!(request.reply_topic.starts_with("_reply.cli-9."));
        assert!(request.reply_topic.ends_with(&request.correlation_id));
    }

    #[tokio::test]
    async fn test_reply_sink_ignores_other_correlations() {
        let correlator = std::sync::Arc::new(RequestCorrelator::new());
        let (request, mut rx) = correlator.register("cli", "svc.q", 1000);
        let sink = ReplySink {
            correlator: correlator.clone(),
            correlation_id: request.correlation_id.clone(),
        };
        sink.deliver(&reply_for("someone-else")).unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(correlator.pending_count(), 1);
        sink.deliver(&reply_for(&request.correlation_id)).unwrap();
        assert!(rx.try_recv().unwrap().is_ok());
    }
}
