//! Per-subscriber bounded FIFO queues with retry scheduling.
//!
//! One `SubscriberQueue` instance holds every subscriber's queue, keyed by
//! subscriber id. A queued message is in at most one queue; acknowledgment
//! and dead-letter promotion are the only exits.
//!
//! Messages carrying a pending backoff (`next_retry_at` in the future) are
//! skipped by `dequeue`/`peek`, not reordered: queue order stays FIFO and a
//! retried message is simply picked up once its backoff elapses.
//!
//! Dead-letter promotions are collected while holding the queue lock and
//! pushed to the DLQ after releasing it, which keeps the queue → DLQ lock
//! order acyclic with the overflow-eviction path.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::dlq::{DeadLetterEntry, DeadLetterStore};
use crate::message::{epoch_ms, retry_backoff_ms, QueuedMessage};

/// Reason recorded when a full queue evicts its oldest message.
pub const REASON_QUEUE_OVERFLOW: &str = "queue overflow";

/// Reason recorded when an ack-required message runs out of redeliveries.
pub const REASON_ACK_TIMEOUT: &str = "ack timeout";

/// Outcome of a nack or a recorded delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// The message stays queued and becomes eligible again at this time.
    Scheduled { attempts: u32, next_retry_at: u64 },
    /// The retry cap was reached; the message moved to the DLQ.
    DeadLettered,
}

pub struct SubscriberQueue {
    inner: Mutex<HashMap<String, VecDeque<QueuedMessage>>>,
    dead_letters: Arc<DeadLetterStore>,
}

impl SubscriberQueue {
    pub fn new(dead_letters: Arc<DeadLetterStore>) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            dead_letters,
        }
    }

    /// Appends a message to its subscriber's queue. When the queue is at
    /// `max_queue_size`, the oldest message is evicted into the DLQ first.
    /// Returns `(message_id, topic)` for each eviction so the broker can
    /// emit `message:failed`.
    pub async fn enqueue(
        &self,
        queued: QueuedMessage,
        max_queue_size: usize,
    ) -> Vec<(String, String)> {
        let subscriber_id = queued.subscriber_id.clone();
        let mut promoted = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            let queue = inner.entry(subscriber_id.clone()).or_default();
            while max_queue_size > 0 && queue.len() >= max_queue_size {
                if let Some(evicted) = queue.pop_front() {
                    promoted.push(DeadLetterEntry::new(
                        evicted.message,
                        evicted.subscriber_id,
                        REASON_QUEUE_OVERFLOW,
                    ));
                }
            }
            queue.push_back(queued);
        }
        let mut evicted = Vec::with_capacity(promoted.len());
        for entry in promoted {
            debug!(
                subscriber = %subscriber_id,
                message_id = %entry.message.id,
                "Queue overflow, oldest message dead-lettered"
            );
            evicted.push((entry.message.id.clone(), entry.original_topic.clone()));
            self.dead_letters.push(entry).await;
        }
        evicted
    }

    /// Removes and returns the first delivery-ready message, skipping any
    /// that are still waiting out a backoff.
    pub async fn dequeue(&self, subscriber_id: &str) -> Option<QueuedMessage> {
        let now = epoch_ms();
        let mut inner = self.inner.lock().await;
        let queue = inner.get_mut(subscriber_id)?;
        let idx = queue.iter().position(|m| m.is_ready(now))?;
        queue.remove(idx)
    }

    /// Like `dequeue`, but non-destructive.
    pub async fn peek(&self, subscriber_id: &str) -> Option<QueuedMessage> {
        let now = epoch_ms();
        let inner = self.inner.lock().await;
        inner
            .get(subscriber_id)?
            .iter()
            .find(|m| m.is_ready(now))
            .cloned()
    }

    pub async fn get_all(&self, subscriber_id: &str) -> Vec<QueuedMessage> {
        match self.inner.lock().await.get(subscriber_id) {
            Some(queue) => queue.iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    pub async fn depth(&self, subscriber_id: &str) -> usize {
        self.inner
            .lock()
            .await
            .get(subscriber_id)
            .map_or(0, VecDeque::len)
    }

    pub async fn total_depth(&self) -> usize {
        self.inner.lock().await.values().map(VecDeque::len).sum()
    }

    /// Settles a message by id. Returns whether it was found.
    pub async fn ack(&self, subscriber_id: &str, message_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(queue) = inner.get_mut(subscriber_id) else {
            return false;
        };
        let before = queue.len();
        queue.retain(|m| m.message.id != message_id);
        queue.len() < before
    }

    /// Negative acknowledgment: bumps the attempt counter and either
    /// schedules an exponential-backoff retry or promotes to the DLQ once
    /// the cap is reached. Returns `None` when the message is unknown.
    pub async fn nack(
        &self,
        subscriber_id: &str,
        message_id: &str,
        reason: &str,
    ) -> Option<RetryOutcome> {
        self.record_attempt(subscriber_id, message_id, reason, None)
            .await
    }

    /// Records a delivery attempt for an ack-required message: the message
    /// stays queued and becomes eligible for redelivery after `delay_ms`,
    /// or is dead-lettered with reason "ack timeout" at the retry cap.
    pub async fn mark_delivery_attempt(
        &self,
        subscriber_id: &str,
        message_id: &str,
        delay_ms: u64,
    ) -> Option<RetryOutcome> {
        self.record_attempt(subscriber_id, message_id, REASON_ACK_TIMEOUT, Some(delay_ms))
            .await
    }

    async fn record_attempt(
        &self,
        subscriber_id: &str,
        message_id: &str,
        reason: &str,
        fixed_delay_ms: Option<u64>,
    ) -> Option<RetryOutcome> {
        let now = epoch_ms();
        let (outcome, promoted) = {
            let mut inner = self.inner.lock().await;
            let queue = inner.get_mut(subscriber_id)?;
            let idx = queue.iter().position(|m| m.message.id == message_id)?;
            let queued = &mut queue[idx];
            queued.attempts += 1;
            if queued.attempts >= queued.max_retries {
                let removed = queue.remove(idx)?;
                let entry =
                    DeadLetterEntry::new(removed.message, removed.subscriber_id, reason);
                (RetryOutcome::DeadLettered, Some(entry))
            } else {
                let delay = fixed_delay_ms.unwrap_or_else(|| retry_backoff_ms(queued.attempts));
                let next_retry_at = now + delay;
                queued.next_retry_at = Some(next_retry_at);
                (
                    RetryOutcome::Scheduled {
                        attempts: queued.attempts,
                        next_retry_at,
                    },
                    None,
                )
            }
        };
        if let Some(entry) = promoted {
            debug!(
                subscriber = %subscriber_id,
                message_id = %message_id,
                reason = %reason,
                "Retries exhausted, message dead-lettered"
            );
            self.dead_letters.push(entry).await;
        }
        Some(outcome)
    }

    /// Drops a subscriber's queue entirely. Returns how many messages it held.
    pub async fn clear(&self, subscriber_id: &str) -> usize {
        self.inner
            .lock()
            .await
            .remove(subscriber_id)
            .map_or(0, |q| q.len())
    }

    /// Removes expired messages (TTL elapsed) from every queue. Expired
    /// messages are discarded, not dead-lettered.
    pub async fn purge_expired(&self) -> usize {
        let now = epoch_ms();
        let mut inner = self.inner.lock().await;
        let mut purged = 0;
        for queue in inner.values_mut() {
            let before = queue.len();
            queue.retain(|m| !m.is_expired(now));
            purged += before - queue.len();
        }
        purged
    }
}
