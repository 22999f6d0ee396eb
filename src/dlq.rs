//! Global dead-letter queue.
//!
//! Bounded FIFO of messages that exhausted their retries, timed out waiting
//! for an ack, or were evicted from a full subscriber queue. Entries are
//! mirrored to the persistence store on append and removal; mirror failures
//! are logged and never block the in-memory path, since dead-lettering
//! happens mid-delivery where aborting would lose the message outright.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::message::{epoch_ms, Message};
use crate::persistence::{AuditRecord, Store};

/// What to do with the oldest entry when the DLQ itself is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DlqOverflowPolicy {
    /// Drop the oldest entry silently (the original source behavior).
    #[default]
    DropOldest,
    /// Drop the oldest entry, log at warn, and append an audit record.
    DropOldestAudited,
}

/// A dead-lettered message together with its failure context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub message: Message,
    pub subscriber_id: String,
    pub original_topic: String,
    pub reason: String,
    pub failed_at: u64,
}

impl DeadLetterEntry {
    pub fn new(message: Message, subscriber_id: impl Into<String>, reason: impl Into<String>) -> Self {
        let original_topic = message.topic.clone();
        Self {
            message,
            subscriber_id: subscriber_id.into(),
            original_topic,
            reason: reason.into(),
            failed_at: epoch_ms(),
        }
    }
}

/// Bounded global dead-letter store. One per broker; shared via `Arc`.
pub struct DeadLetterStore {
    inner: Mutex<VecDeque<DeadLetterEntry>>,
    max_size: usize,
    policy: DlqOverflowPolicy,
    store: Arc<dyn Store>,
}

impl DeadLetterStore {
    pub fn new(max_size: usize, policy: DlqOverflowPolicy, store: Arc<dyn Store>) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            max_size,
            policy,
            store,
        }
    }

    /// Appends an entry, evicting the oldest when at capacity.
    pub async fn push(&self, entry: DeadLetterEntry) {
        if let Err(e) = self.store.append_dead_letter(&entry) {
            warn!(message_id = %entry.message.id, error = %e, "Dead-letter persist failed");
        }
        let dropped = {
            let mut inner = self.inner.lock().await;
            let dropped = if self.max_size > 0 && inner.len() >= self.max_size {
                inner.pop_front()
            } else {
                None
            };
            inner.push_back(entry);
            dropped
        };
        if let Some(dropped) = dropped {
            self.discard_dropped(dropped);
        }
    }

    fn discard_dropped(&self, dropped: DeadLetterEntry) {
        if let Err(e) = self.store.take_dead_letter(&dropped.message.id) {
            warn!(message_id = %dropped.message.id, error = %e, "Dead-letter mirror removal failed");
        }
        match self.policy {
            DlqOverflowPolicy::DropOldest => {
                debug!(message_id = %dropped.message.id, "DLQ full, oldest entry dropped");
            }
            DlqOverflowPolicy::DropOldestAudited => {
                warn!(
                    message_id = %dropped.message.id,
                    topic = %dropped.original_topic,
                    "DLQ full, oldest entry dropped"
                );
                let record = AuditRecord::new(
                    "dlq:overflow-drop",
                    &dropped.subscriber_id,
                    Some(dropped.original_topic.clone()),
                    format!("dropped {} ({})", dropped.message.id, dropped.reason),
                );
                if let Err(e) = self.store.append_audit(&record) {
                    warn!(error = %e, "Audit append failed");
                }
            }
        }
    }

    pub async fn list(&self) -> Vec<DeadLetterEntry> {
        self.inner.lock().await.iter().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Removes an entry by message id.
    pub async fn remove(&self, message_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let before = inner.len();
        inner.retain(|e| e.message.id != message_id);
        let removed = inner.len() < before;
        drop(inner);
        if removed {
            if let Err(e) = self.store.take_dead_letter(message_id) {
                warn!(message_id = %message_id, error = %e, "Dead-letter mirror removal failed");
            }
        }
        removed
    }

    /// Pops an entry for re-routing. The broker re-enqueues the contained
    /// message as a fresh delivery, so its attempt counter starts at zero.
    pub async fn retrieve_for_retry(&self, message_id: &str) -> Option<DeadLetterEntry> {
        let entry = {
            let mut inner = self.inner.lock().await;
            let idx = inner.iter().position(|e| e.message.id == message_id)?;
            inner.remove(idx)
        };
        if let Some(entry) = &entry {
            if let Err(e) = self.store.take_dead_letter(&entry.message.id) {
                warn!(message_id = %message_id, error = %e, "Dead-letter mirror removal failed");
            }
        }
        entry
    }

    /// Drops every entry, returning how many were removed.
    pub async fn clear(&self) -> usize {
        let drained: Vec<DeadLetterEntry> = {
            let mut inner = self.inner.lock().await;
            inner.drain(..).collect()
        };
        for entry in &drained {
            if let Err(e) = self.store.take_dead_letter(&entry.message.id) {
                warn!(message_id = %entry.message.id, error = %e, "Dead-letter mirror removal failed");
            }
        }
        drained.len()
    }
}
