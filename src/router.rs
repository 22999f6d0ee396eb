//! Message routing: recipient computation and dispatch.
//!
//! For each published message the router unions the topic's direct
//! subscribers with the literal `#` catch-all subscribers, applies each
//! subscriber's filter, folds consumer-group members into a single
//! group-level recipient, and then either invokes the subscriber's sink
//! (online) or parks the message on its queue (offline, or after a sink
//! failure).
//!
//! Routing never returns an error: delivery problems are absorbed into
//! queues and the DLQ, and reported back to the broker as a [`RouteReport`]
//! so it can emit the matching events.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::group::{ConsumerGroupManager, Selection};
use crate::message::{epoch_ms, retry_backoff_ms, Message, QueuedMessage};
use crate::queue::{RetryOutcome, SubscriberQueue, REASON_ACK_TIMEOUT};
use crate::subscriber::SubscriberDirectory;
use crate::topic::{TopicConfig, TopicRegistry};

/// Nack reason recorded when a subscriber sink returns an error.
pub const REASON_DELIVERY_FAILED: &str = "delivery failed";

/// What happened to one recipient of a routed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DeliveryOutcome {
    /// The sink accepted the message.
    Delivered,
    /// The subscriber was offline; the message was queued.
    Queued,
    /// The sink failed; the message was queued for retry.
    Failed { reason: String },
    /// The message went to the DLQ (retry cap on the ack path).
    DeadLettered { reason: String },
}

#[derive(Debug, Clone)]
pub(crate) struct DeliveryRecord {
    pub subscriber_id: String,
    pub outcome: DeliveryOutcome,
}

/// Routing results for one published message.
#[derive(Debug, Default)]
pub(crate) struct RouteReport {
    pub deliveries: Vec<DeliveryRecord>,
    /// Messages evicted from full queues while enqueueing, as
    /// `(subscriber_id, message_id, topic)`.
    pub evictions: Vec<(String, String, String)>,
    /// Current offsets advanced by group selections, for persistence.
    pub group_offsets: Vec<(String, u64)>,
}

pub(crate) struct Router {
    topics: Arc<TopicRegistry>,
    queues: Arc<SubscriberQueue>,
    groups: Arc<ConsumerGroupManager>,
    directory: Arc<SubscriberDirectory>,
    defaults: TopicConfig,
}

impl Router {
    pub fn new(
        topics: Arc<TopicRegistry>,
        queues: Arc<SubscriberQueue>,
        groups: Arc<ConsumerGroupManager>,
        directory: Arc<SubscriberDirectory>,
        defaults: TopicConfig,
    ) -> Self {
        Self {
            topics,
            queues,
            groups,
            directory,
            defaults,
        }
    }

    /// Computes the recipient set for a message and dispatches to each.
    pub async fn route(&self, message: &Message) -> RouteReport {
        let mut candidates = self.topics.subscribers_of(&message.topic).await;
        // subscribers of the literal "#" topic see every message
        for id in self.topics.subscribers_of("#").await {
            if !candidates.contains(&id) {
                candidates.push(id);
            }
        }

        let config = match self.topics.topic_config(&message.topic).await {
            Some(config) => config,
            None => self.defaults.clone(),
        };

        let mut report = RouteReport::default();
        let mut handled_groups: HashSet<String> = HashSet::new();

        for subscriber_id in candidates {
            let Some(target) = self.directory.delivery_target(&subscriber_id) else {
                // stale membership entry; unsubscribe will reconcile
                continue;
            };
            if let Some(filter) = &target.filter {
                if !filter.matches(message) {
                    continue;
                }
            }

            // A subscriber in a group bound to this topic hands delivery
            // over to the group; the first member encountered triggers the
            // selection, the rest are folded into it.
            if let Some(group) = self
                .groups
                .group_bound_to(&subscriber_id, &message.topic)
                .await
            {
                if !handled_groups.insert(group.clone()) {
                    continue;
                }
                match self.groups.select(&group, message).await {
                    Some((Selection::Member(chosen), offset)) => {
                        report.group_offsets.push((group, offset));
                        self.dispatch(&chosen, message, &config, &mut report).await;
                    }
                    Some((Selection::All(members), offset)) => {
                        report.group_offsets.push((group, offset));
                        for member in members {
                            self.dispatch(&member, message, &config, &mut report).await;
                        }
                    }
                    None => {
                        debug!(group = %group, topic = %message.topic, "Group has no members, message dropped");
                    }
                }
            } else {
                self.dispatch(&subscriber_id, message, &config, &mut report)
                    .await;
            }
        }
        report
    }

    /// Delivers to one recipient, or queues per the delivery policy.
    async fn dispatch(
        &self,
        subscriber_id: &str,
        message: &Message,
        config: &TopicConfig,
        report: &mut RouteReport,
    ) {
        let Some(target) = self.directory.delivery_target(subscriber_id) else {
            return;
        };

        if !target.online {
            let queued = QueuedMessage::new(message.clone(), subscriber_id, config);
            self.enqueue(queued, config, report).await;
            report.deliveries.push(DeliveryRecord {
                subscriber_id: subscriber_id.to_string(),
                outcome: DeliveryOutcome::Queued,
            });
            return;
        }

        if config.require_ack {
            // park first, deliver second: the queue entry is the ack state
            let queued = QueuedMessage::new(message.clone(), subscriber_id, config);
            self.enqueue(queued, config, report).await;
            match target.sink.deliver(message) {
                Ok(()) => {
                    let outcome = self
                        .queues
                        .mark_delivery_attempt(subscriber_id, &message.id, config.retry_delay_ms)
                        .await;
                    self.directory.record_delivery(subscriber_id);
                    report.deliveries.push(DeliveryRecord {
                        subscriber_id: subscriber_id.to_string(),
                        outcome: DeliveryOutcome::Delivered,
                    });
                    if outcome == Some(RetryOutcome::DeadLettered) {
                        report.deliveries.push(DeliveryRecord {
                            subscriber_id: subscriber_id.to_string(),
                            outcome: DeliveryOutcome::DeadLettered {
                                reason: REASON_ACK_TIMEOUT.to_string(),
                            },
                        });
                    }
                }
                Err(e) => {
                    warn!(subscriber = %subscriber_id, error = %e, "Sink delivery failed");
                    let outcome = self
                        .queues
                        .nack(subscriber_id, &message.id, REASON_DELIVERY_FAILED)
                        .await;
                    report
                        .deliveries
                        .push(failure_record(subscriber_id, &e, outcome));
                }
            }
            return;
        }

        match target.sink.deliver(message) {
            Ok(()) => {
                self.directory.record_delivery(subscriber_id);
                report.deliveries.push(DeliveryRecord {
                    subscriber_id: subscriber_id.to_string(),
                    outcome: DeliveryOutcome::Delivered,
                });
            }
            Err(e) => {
                warn!(subscriber = %subscriber_id, error = %e, "Sink delivery failed, queueing for retry");
                let mut queued = QueuedMessage::new(message.clone(), subscriber_id, config);
                queued.attempts = 1;
                queued.next_retry_at = Some(epoch_ms() + retry_backoff_ms(1));
                self.enqueue(queued, config, report).await;
                report.deliveries.push(DeliveryRecord {
                    subscriber_id: subscriber_id.to_string(),
                    outcome: DeliveryOutcome::Failed {
                        reason: format!("{REASON_DELIVERY_FAILED}: {e}"),
                    },
                });
            }
        }
    }

    async fn enqueue(&self, queued: QueuedMessage, config: &TopicConfig, report: &mut RouteReport) {
        let subscriber_id = queued.subscriber_id.clone();
        let evicted = self.queues.enqueue(queued, config.max_queue_size).await;
        for (message_id, topic) in evicted {
            report.evictions.push((subscriber_id.clone(), message_id, topic));
        }
    }
}

fn failure_record(
    subscriber_id: &str,
    error: &anyhow::Error,
    outcome: Option<RetryOutcome>,
) -> DeliveryRecord {
    let reason = format!("{REASON_DELIVERY_FAILED}: {error}");
    let outcome = match outcome {
        Some(RetryOutcome::DeadLettered) => DeliveryOutcome::DeadLettered { reason },
        _ => DeliveryOutcome::Failed { reason },
    };
    DeliveryRecord {
        subscriber_id: subscriber_id.to_string(),
        outcome,
    }
}
