//! The broker facade.
//!
//! Owns every core component and exposes the public operations: topic CRUD,
//! publish/subscribe, ack/nack, request/reply, dead-letter management,
//! consumer groups, and stats. Transports and observers attach through the
//! [`SubscriberSink`] / [`EventSink`] capabilities; durability goes through
//! the [`Store`] collaborator.
//!
//! Persistence staging: broker-originated writes (topic create/delete,
//! publish, group create, offset commit) hit the store first and commit
//! in-memory state only on success, so a failing store never leaves the
//! broker claiming state it cannot reload. Mirror writes that happen
//! mid-route (DLQ appends, current-offset advances, topic stat refreshes)
//! are logged on failure instead — aborting a half-routed message would
//! lose it outright.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::correlator::{PendingRequest, ReplySink, RequestCorrelator};
use crate::dlq::{DeadLetterEntry, DeadLetterStore};
use crate::error::{BrokerError, Result};
use crate::events::{BrokerEvent, EventSink};
use crate::filter::FilterSpec;
use crate::group::{ConsumerGroupManager, GroupInfo, GroupMember, GroupStrategy, MEMBER_TIMEOUT_MS};
use crate::message::{epoch_ms, Message, Payload, QueuedMessage};
use crate::persistence::{GroupRecord, MemoryStore, Store};
use crate::queue::{RetryOutcome, SubscriberQueue, REASON_QUEUE_OVERFLOW};
use crate::router::{DeliveryOutcome, RouteReport, Router, REASON_DELIVERY_FAILED};
use crate::subscriber::{Publisher, SubscriberInfo, SubscriberSink};
use crate::topic::{RegistryStats, TopicInfo, TopicOverrides, TopicRegistry};

/// Tick for the redelivery pump that drains ready queued messages.
const REDELIVERY_TICK: Duration = Duration::from_secs(1);

/// Tick for the TTL purge and history trim job.
const CLEANUP_TICK: Duration = Duration::from_secs(60);

/// Tick for the consumer-group heartbeat reaper.
const REAPER_TICK: Duration = Duration::from_secs(10);

/// Window for the messages-per-second gauge.
const RATE_WINDOW_MS: u64 = 60_000;

/// Per-publish options.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub headers: HashMap<String, String>,
    pub ttl_ms: Option<u64>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

/// Broker-wide statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerStats {
    pub uptime_ms: u64,
    pub total_messages: u64,
    pub messages_per_second: f64,
    pub topic_count: usize,
    pub subscriber_count: usize,
    pub publisher_count: usize,
    pub queued_messages: usize,
    pub dead_letter_count: usize,
    pub pending_requests: usize,
    pub consumer_group_count: usize,
    /// Top 10 topics by message count, busiest first.
    pub top_topics: Vec<(String, u64)>,
}

pub struct Broker {
    config: BrokerConfig,
    topics: Arc<TopicRegistry>,
    queues: Arc<SubscriberQueue>,
    dead_letters: Arc<DeadLetterStore>,
    groups: Arc<ConsumerGroupManager>,
    correlator: Arc<RequestCorrelator>,
    directory: Arc<crate::subscriber::SubscriberDirectory>,
    router: Router,
    store: Arc<dyn Store>,
    publishers: Mutex<HashMap<String, Publisher>>,
    event_sinks: Mutex<Vec<Arc<dyn EventSink>>>,
    started_at: u64,
    total_messages: AtomicU64,
    publish_times: Mutex<VecDeque<u64>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Broker {
    /// Creates a broker backed by an in-memory store.
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryStore::new()))
    }

    /// Creates a broker backed by the given store.
    pub fn with_store(config: BrokerConfig, store: Arc<dyn Store>) -> Self {
        let defaults = config.topic_defaults();
        let topics = Arc::new(TopicRegistry::new(defaults.clone()));
        let dead_letters = Arc::new(DeadLetterStore::new(
            config.dead_letter_max_size,
            config.dlq_overflow_policy,
            store.clone(),
        ));
        let queues = Arc::new(SubscriberQueue::new(dead_letters.clone()));
        let groups = Arc::new(ConsumerGroupManager::new());
        let directory = Arc::new(crate::subscriber::SubscriberDirectory::new());
        let router = Router::new(
            topics.clone(),
            queues.clone(),
            groups.clone(),
            directory.clone(),
            defaults,
        );
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            topics,
            queues,
            dead_letters,
            groups,
            correlator: Arc::new(RequestCorrelator::new()),
            directory,
            router,
            store,
            publishers: Mutex::new(HashMap::new()),
            event_sinks: Mutex::new(Vec::new()),
            started_at: epoch_ms(),
            total_messages: AtomicU64::new(0),
            publish_times: Mutex::new(VecDeque::new()),
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Registers an observer for lifecycle events.
    pub fn add_event_sink(&self, sink: Arc<dyn EventSink>) {
        self.event_sinks.lock().unwrap().push(sink);
    }

    fn emit(&self, event: BrokerEvent) {
        let sinks = self.event_sinks.lock().unwrap().clone();
        for sink in sinks {
            if let Err(e) = sink.on_event(&event) {
                warn!(kind = event.kind(), error = %e, "Event sink failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Topics
    // ------------------------------------------------------------------

    /// Creates a topic explicitly. Fails with `AlreadyExists` or
    /// `InvalidName`; persistence failure rolls the creation back.
    pub async fn create_topic(
        &self,
        name: &str,
        creator: &str,
        overrides: Option<TopicOverrides>,
    ) -> Result<TopicInfo> {
        let info = self.topics.create(name, creator, overrides.as_ref()).await?;
        if let Err(e) = self.store.save_topic(&info) {
            self.topics.remove_if_untouched(name).await;
            return Err(e.into());
        }
        self.emit(BrokerEvent::TopicCreated {
            name: name.to_string(),
        });
        Ok(info)
    }

    /// Deletes a topic, its history, and its membership set. Queued
    /// messages already dispatched stay queued. Returns whether it existed.
    pub async fn delete_topic(&self, name: &str) -> Result<bool> {
        if !self.topics.has(name).await {
            return Ok(false);
        }
        self.store.delete_topic(name)?;
        let existed = self.topics.delete(name).await;
        if existed {
            self.emit(BrokerEvent::TopicDeleted {
                name: name.to_string(),
            });
        }
        Ok(existed)
    }

    pub async fn get_topic(&self, name: &str) -> Option<TopicInfo> {
        self.topics.get(name).await
    }

    pub async fn list_topics(&self) -> Vec<TopicInfo> {
        self.topics.list_all().await
    }

    /// Concrete topic names matching a glob pattern (listing facility).
    pub async fn match_topics(&self, pattern: &str) -> Vec<String> {
        self.topics.match_topics(pattern).await
    }

    /// The last `limit` messages recorded for a topic, oldest first.
    pub async fn topic_history(&self, name: &str, limit: usize) -> Vec<Message> {
        self.topics.get_history(name, limit).await
    }

    pub async fn registry_stats(&self) -> RegistryStats {
        self.topics.stats().await
    }

    /// Ensures a topic exists, persisting and announcing an auto-creation.
    async fn ensure_topic(&self, name: &str, creator: &str) -> Result<TopicInfo> {
        let (info, created) = self.topics.ensure(name, creator).await?;
        if created {
            if let Err(e) = self.store.save_topic(&info) {
                self.topics.remove_if_untouched(name).await;
                return Err(e.into());
            }
            self.emit(BrokerEvent::TopicCreated {
                name: name.to_string(),
            });
        }
        Ok(info)
    }

    // ------------------------------------------------------------------
    // Publish / subscribe
    // ------------------------------------------------------------------

    /// Publishes a message: auto-creates the topic, persists, records
    /// history and publisher stats, routes to subscribers, and emits
    /// events. Never blocks on delivery.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Payload,
        publisher_id: &str,
        opts: PublishOptions,
    ) -> Result<Message> {
        self.ensure_topic(topic, publisher_id).await?;

        let mut message = Message::new(topic, payload, publisher_id);
        message.headers = opts.headers;
        message.ttl_ms = opts.ttl_ms;
        message.correlation_id = opts.correlation_id;
        message.reply_to = opts.reply_to;

        // staged write: nothing commits in memory if the store rejects it
        self.store.save_message(&message)?;

        self.topics.record_message(&message).await;
        self.record_publisher(publisher_id);
        self.total_messages.fetch_add(1, Ordering::Relaxed);
        self.record_publish_time();

        let report = self.router.route(&message).await;
        self.apply_route_report(&message, report);

        if let Some(info) = self.topics.get(topic).await {
            if let Err(e) =
                self.store
                    .update_topic_stats(topic, info.message_count, info.subscriber_count)
            {
                warn!(topic = %topic, error = %e, "Topic stats persist failed");
            }
        }

        debug!(topic = %topic, message_id = %message.id, publisher = %publisher_id, "Message published");
        self.emit(BrokerEvent::MessagePublished {
            message: message.clone(),
        });
        Ok(message)
    }

    fn apply_route_report(&self, message: &Message, report: RouteReport) {
        for (group, offset) in report.group_offsets {
            if let Err(e) = self.store.set_group_offset(&group, offset) {
                warn!(group = %group, error = %e, "Group offset persist failed");
            }
        }
        for (subscriber_id, message_id, topic) in report.evictions {
            self.emit(BrokerEvent::MessageFailed {
                subscriber_id,
                message_id,
                topic,
                reason: REASON_QUEUE_OVERFLOW.to_string(),
            });
        }
        for record in report.deliveries {
            let event = match record.outcome {
                DeliveryOutcome::Delivered => BrokerEvent::MessageDelivered {
                    subscriber_id: record.subscriber_id,
                    message_id: message.id.clone(),
                    topic: message.topic.clone(),
                },
                DeliveryOutcome::Queued => BrokerEvent::MessageQueued {
                    subscriber_id: record.subscriber_id,
                    message_id: message.id.clone(),
                    topic: message.topic.clone(),
                },
                DeliveryOutcome::Failed { reason }
                | DeliveryOutcome::DeadLettered { reason } => BrokerEvent::MessageFailed {
                    subscriber_id: record.subscriber_id,
                    message_id: message.id.clone(),
                    topic: message.topic.clone(),
                    reason,
                },
            };
            self.emit(event);
        }
    }

    /// Registers a subscriber over a set of topics (wildcard patterns are
    /// stored as literal topic entries), compiles its filter, and drains
    /// any queued backlog.
    pub async fn subscribe(
        &self,
        client_id: &str,
        topic_names: &[String],
        sink: Arc<dyn SubscriberSink>,
        filter: Option<FilterSpec>,
    ) -> Result<SubscriberInfo> {
        let filter = match filter {
            Some(spec) if !spec.is_empty() => Some(Arc::new(spec.compile()?)),
            _ => None,
        };
        for name in topic_names {
            self.ensure_topic(name, client_id).await?;
        }
        let topics: HashSet<String> = topic_names.iter().cloned().collect();
        let info = self.directory.insert(client_id, topics, filter, sink);
        for name in topic_names {
            self.topics.add_subscriber(name, &info.id).await;
        }
        info!(subscriber = %info.id, client = %client_id, topics = ?topic_names, "Subscribed");
        self.emit(BrokerEvent::SubscriberConnected {
            subscriber_id: info.id.clone(),
            client_id: client_id.to_string(),
        });
        self.drain_subscriber(&info.id).await;
        Ok(self.directory.get(&info.id).unwrap_or(info))
    }

    /// Removes a subscriber from the given topics, or entirely when
    /// `topics` is `None` (dropping its queue and group membership).
    pub async fn unsubscribe(&self, subscriber_id: &str, topics: Option<&[String]>) -> Result<bool> {
        match topics {
            Some(names) => {
                if !self.directory.contains(subscriber_id) {
                    return Ok(false);
                }
                for name in names {
                    self.topics.remove_subscriber(name, subscriber_id).await;
                }
                let _ = self.directory.remove_topics(subscriber_id, names);
                Ok(true)
            }
            None => {
                let Some(info) = self.directory.remove(subscriber_id) else {
                    return Ok(false);
                };
                self.topics.remove_subscriber_everywhere(subscriber_id).await;
                self.queues.clear(subscriber_id).await;
                self.groups.leave(subscriber_id).await;
                info!(subscriber = %subscriber_id, client = %info.client_id, "Unsubscribed");
                self.emit(BrokerEvent::SubscriberDisconnected {
                    subscriber_id: subscriber_id.to_string(),
                    client_id: info.client_id,
                });
                Ok(true)
            }
        }
    }

    /// Flips a subscriber's online flag. The offline→online transition
    /// drains its queued backlog.
    pub async fn set_online(&self, subscriber_id: &str, online: bool) -> Result<()> {
        let was = self
            .directory
            .set_online(subscriber_id, online)
            .ok_or_else(|| BrokerError::NotFound(format!("subscriber {subscriber_id}")))?;
        let client_id = self
            .directory
            .get(subscriber_id)
            .map(|s| s.client_id)
            .unwrap_or_default();
        if online && !was {
            self.emit(BrokerEvent::SubscriberConnected {
                subscriber_id: subscriber_id.to_string(),
                client_id,
            });
            self.drain_subscriber(subscriber_id).await;
        } else if !online && was {
            self.emit(BrokerEvent::SubscriberDisconnected {
                subscriber_id: subscriber_id.to_string(),
                client_id,
            });
        }
        Ok(())
    }

    /// Positive acknowledgment: settles a queued message by id.
    pub async fn ack(&self, subscriber_id: &str, message_id: &str) -> bool {
        self.directory.touch(subscriber_id);
        self.queues.ack(subscriber_id, message_id).await
    }

    /// Negative acknowledgment: schedules a backoff retry or dead-letters
    /// at the retry cap. Returns whether the message was found.
    pub async fn nack(&self, subscriber_id: &str, message_id: &str, reason: &str) -> bool {
        self.directory.touch(subscriber_id);
        let topic = self
            .queues
            .get_all(subscriber_id)
            .await
            .iter()
            .find(|m| m.message.id == message_id)
            .map(|m| m.message.topic.clone());
        match self.queues.nack(subscriber_id, message_id, reason).await {
            Some(RetryOutcome::DeadLettered) => {
                self.emit(BrokerEvent::MessageFailed {
                    subscriber_id: subscriber_id.to_string(),
                    message_id: message_id.to_string(),
                    topic: topic.unwrap_or_default(),
                    reason: reason.to_string(),
                });
                true
            }
            Some(RetryOutcome::Scheduled { .. }) => true,
            None => false,
        }
    }

    /// Delivers every ready queued message to an online subscriber's sink.
    /// Stops at the first sink failure; the failed message gets a backoff.
    async fn drain_subscriber(&self, subscriber_id: &str) {
        loop {
            let Some(target) = self.directory.delivery_target(subscriber_id) else {
                break;
            };
            if !target.online {
                break;
            }
            let Some(queued) = self.queues.peek(subscriber_id).await else {
                break;
            };
            match target.sink.deliver(&queued.message) {
                Ok(()) => {
                    self.directory.record_delivery(subscriber_id);
                    if queued.require_ack {
                        let outcome = self
                            .queues
                            .mark_delivery_attempt(
                                subscriber_id,
                                &queued.message.id,
                                queued.retry_delay_ms,
                            )
                            .await;
                        if outcome == Some(RetryOutcome::DeadLettered) {
                            self.emit(BrokerEvent::MessageFailed {
                                subscriber_id: subscriber_id.to_string(),
                                message_id: queued.message.id.clone(),
                                topic: queued.message.topic.clone(),
                                reason: crate::queue::REASON_ACK_TIMEOUT.to_string(),
                            });
                        }
                    } else {
                        self.queues.ack(subscriber_id, &queued.message.id).await;
                    }
                    self.emit(BrokerEvent::MessageDelivered {
                        subscriber_id: subscriber_id.to_string(),
                        message_id: queued.message.id.clone(),
                        topic: queued.message.topic.clone(),
                    });
                }
                Err(e) => {
                    warn!(subscriber = %subscriber_id, error = %e, "Drain delivery failed");
                    if let Some(RetryOutcome::DeadLettered) = self
                        .queues
                        .nack(subscriber_id, &queued.message.id, REASON_DELIVERY_FAILED)
                        .await
                    {
                        self.emit(BrokerEvent::MessageFailed {
                            subscriber_id: subscriber_id.to_string(),
                            message_id: queued.message.id.clone(),
                            topic: queued.message.topic.clone(),
                            reason: format!("{REASON_DELIVERY_FAILED}: {e}"),
                        });
                    }
                    break;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Request / reply
    // ------------------------------------------------------------------

    /// Publishes a request and suspends until the correlated reply arrives
    /// or the timeout elapses. The transient reply subscription and topic
    /// are torn down on every exit path.
    pub async fn request(
        &self,
        topic: &str,
        payload: Payload,
        requester_id: &str,
        timeout_ms: Option<u64>,
    ) -> Result<Message> {
        let timeout_ms = timeout_ms.unwrap_or(self.config.request_timeout_ms);
        let (pending, mut rx) = self.correlator.register(requester_id, topic, timeout_ms);

        let sink = Arc::new(ReplySink {
            correlator: self.correlator.clone(),
            correlation_id: pending.correlation_id.clone(),
        });
        let reply_sub = match self
            .subscribe(requester_id, &[pending.reply_topic.clone()], sink, None)
            .await
        {
            Ok(info) => info,
            Err(e) => {
                self.correlator.take(&pending.correlation_id);
                return Err(e);
            }
        };

        let opts = PublishOptions {
            correlation_id: Some(pending.correlation_id.clone()),
            reply_to: Some(pending.reply_topic.clone()),
            ..Default::default()
        };
        if let Err(e) = self.publish(topic, payload, requester_id, opts).await {
            self.correlator.take(&pending.correlation_id);
            self.teardown_request(&reply_sub.id, &pending.reply_topic).await;
            return Err(e);
        }

        let result = match tokio::time::timeout(Duration::from_millis(timeout_ms), &mut rx).await {
            Ok(Ok(settlement)) => settlement,
            // the sender is gone without settling; treat as cancellation
            Ok(Err(_)) => Err(BrokerError::Cancelled),
            Err(_elapsed) => {
                if self.correlator.take(&pending.correlation_id) {
                    Err(BrokerError::Timeout(timeout_ms))
                } else {
                    // a reply raced the timeout and already settled the slot
                    match rx.try_recv() {
                        Ok(settlement) => settlement,
                        Err(_) => Err(BrokerError::Timeout(timeout_ms)),
                    }
                }
            }
        };

        self.teardown_request(&reply_sub.id, &pending.reply_topic).await;
        result
    }

    /// Cancels a pending request. The suspended `request()` call settles
    /// with `Cancelled` and performs its own teardown.
    pub fn cancel_request(&self, correlation_id: &str) -> bool {
        self.correlator.cancel(correlation_id)
    }

    /// Publishes a reply correlated to `original`. Returns `None` when the
    /// original carries no `reply_to`/`correlation_id`.
    pub async fn reply(
        &self,
        original: &Message,
        payload: Payload,
        replier_id: &str,
    ) -> Result<Option<Message>> {
        let (Some(reply_to), Some(correlation_id)) =
            (original.reply_to.as_ref(), original.correlation_id.as_ref())
        else {
            return Ok(None);
        };
        let opts = PublishOptions {
            correlation_id: Some(correlation_id.clone()),
            ..Default::default()
        };
        let message = self.publish(reply_to, payload, replier_id, opts).await?;
        Ok(Some(message))
    }

    async fn teardown_request(&self, subscriber_id: &str, reply_topic: &str) {
        let _ = self.unsubscribe(subscriber_id, None).await;
        if self.topics.delete(reply_topic).await {
            if let Err(e) = self.store.delete_topic(reply_topic) {
                warn!(topic = %reply_topic, error = %e, "Reply topic delete persist failed");
            }
            self.emit(BrokerEvent::TopicDeleted {
                name: reply_topic.to_string(),
            });
        }
    }

    /// Pending requests currently awaiting replies.
    pub fn pending_request(&self, correlation_id: &str) -> Option<PendingRequest> {
        self.correlator.get(correlation_id)
    }

    // ------------------------------------------------------------------
    // Dead letters
    // ------------------------------------------------------------------

    pub async fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.dead_letters.list().await
    }

    /// Re-routes a dead-lettered message with its attempt counter reset.
    /// Returns whether the entry existed.
    pub async fn retry_dead_letter(&self, message_id: &str) -> Result<bool> {
        let Some(entry) = self.dead_letters.retrieve_for_retry(message_id).await else {
            return Ok(false);
        };
        info!(message_id = %message_id, topic = %entry.original_topic, "Retrying dead-lettered message");
        let report = self.router.route(&entry.message).await;
        self.apply_route_report(&entry.message, report);
        self.audit("dlq:retry", &entry.subscriber_id, Some(entry.original_topic.clone()), message_id);
        Ok(true)
    }

    /// Re-routes every dead-lettered message. Returns how many were retried.
    pub async fn retry_all_dead_letters(&self) -> Result<usize> {
        let ids: Vec<String> = self
            .dead_letters
            .list()
            .await
            .into_iter()
            .map(|e| e.message.id)
            .collect();
        let mut retried = 0;
        for id in ids {
            if self.retry_dead_letter(&id).await? {
                retried += 1;
            }
        }
        Ok(retried)
    }

    pub async fn delete_dead_letter(&self, message_id: &str) -> bool {
        let removed = self.dead_letters.remove(message_id).await;
        if removed {
            self.audit("dlq:delete", "operator", None, message_id);
        }
        removed
    }

    fn audit(&self, action: &str, actor: &str, topic: Option<String>, detail: &str) {
        let record = crate::persistence::AuditRecord::new(action, actor, topic, detail);
        if let Err(e) = self.store.append_audit(&record) {
            warn!(action = %action, error = %e, "Audit append failed");
        }
    }

    // ------------------------------------------------------------------
    // Consumer groups
    // ------------------------------------------------------------------

    /// Creates a consumer group bound to a topic.
    pub async fn create_group(
        &self,
        name: &str,
        topic: &str,
        strategy: GroupStrategy,
    ) -> Result<GroupInfo> {
        let info = self.groups.create(name, topic, strategy).await?;
        let record = GroupRecord {
            name: name.to_string(),
            topic: topic.to_string(),
            strategy,
            current_offset: 0,
            committed_offset: 0,
            created_at: epoch_ms(),
        };
        if let Err(e) = self.store.create_group(&record) {
            self.groups.remove_if_empty(name).await;
            return Err(e.into());
        }
        Ok(info)
    }

    pub async fn join_group(
        &self,
        name: &str,
        subscriber_id: &str,
        client_id: &str,
    ) -> Result<GroupMember> {
        if !self.directory.contains(subscriber_id) {
            return Err(BrokerError::NotFound(format!("subscriber {subscriber_id}")));
        }
        self.groups.join(name, subscriber_id, client_id).await
    }

    pub async fn leave_group(&self, subscriber_id: &str) -> Option<String> {
        self.groups.leave(subscriber_id).await
    }

    pub async fn heartbeat(&self, subscriber_id: &str) -> bool {
        self.groups.heartbeat(subscriber_id).await
    }

    /// Commits a consumer-group offset, persisting it first.
    pub async fn commit_offset(&self, group: &str, offset: u64) -> Result<()> {
        if self.groups.get(group).await.is_none() {
            return Err(BrokerError::NotFound(format!("consumer group {group}")));
        }
        self.store.commit_group_offset(group, offset)?;
        self.groups.commit_offset(group, offset).await
    }

    pub async fn group(&self, name: &str) -> Option<GroupInfo> {
        self.groups.get(name).await
    }

    pub async fn consumer_groups(&self) -> Vec<GroupInfo> {
        self.groups.list().await
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn subscribers(&self) -> Vec<SubscriberInfo> {
        self.directory.list()
    }

    pub fn get_subscriber(&self, subscriber_id: &str) -> Option<SubscriberInfo> {
        self.directory.get(subscriber_id)
    }

    pub fn publishers(&self) -> Vec<Publisher> {
        let publishers = self.publishers.lock().unwrap();
        let mut list: Vec<Publisher> = publishers.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub async fn queue_depth(&self, subscriber_id: &str) -> usize {
        self.queues.depth(subscriber_id).await
    }

    /// Snapshot of a subscriber's queue, including backoff-waiting entries.
    pub async fn queued_messages(&self, subscriber_id: &str) -> Vec<QueuedMessage> {
        self.queues.get_all(subscriber_id).await
    }

    /// Substring search over persisted messages.
    pub fn search_messages(&self, query: &str, limit: usize) -> Result<Vec<Message>> {
        Ok(self.store.search_messages(query, limit)?)
    }

    pub async fn stats(&self) -> BrokerStats {
        let registry = self.topics.stats().await;
        BrokerStats {
            uptime_ms: epoch_ms().saturating_sub(self.started_at),
            total_messages: self.total_messages.load(Ordering::Relaxed),
            messages_per_second: self.messages_per_second(),
            topic_count: registry.topic_count,
            subscriber_count: self.directory.count(),
            publisher_count: self.publishers.lock().unwrap().len(),
            queued_messages: self.queues.total_depth().await,
            dead_letter_count: self.dead_letters.count().await,
            pending_requests: self.correlator.pending_count(),
            consumer_group_count: self.groups.count().await,
            top_topics: registry.top_topics,
        }
    }

    fn record_publisher(&self, publisher_id: &str) {
        let now = epoch_ms();
        let mut publishers = self.publishers.lock().unwrap();
        publishers
            .entry(publisher_id.to_string())
            .and_modify(|p| {
                p.published_count += 1;
                p.last_published = now;
            })
            .or_insert_with(|| Publisher {
                id: publisher_id.to_string(),
                published_count: 1,
                first_seen: now,
                last_published: now,
            });
    }

    fn record_publish_time(&self) {
        let now = epoch_ms();
        let mut times = self.publish_times.lock().unwrap();
        times.push_back(now);
        while times.front().is_some_and(|t| t + RATE_WINDOW_MS < now) {
            times.pop_front();
        }
    }

    fn messages_per_second(&self) -> f64 {
        let now = epoch_ms();
        let mut times = self.publish_times.lock().unwrap();
        while times.front().is_some_and(|t| t + RATE_WINDOW_MS < now) {
            times.pop_front();
        }
        times.len() as f64 / (RATE_WINDOW_MS as f64 / 1000.0)
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Spawns the periodic jobs: the redelivery pump (1s), the TTL purge +
    /// history trim (60s), and the group heartbeat reaper (10s). Each task
    /// exits within one tick of `shutdown()`.
    pub fn spawn_maintenance(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(Self::redelivery_loop(self.clone())),
            tokio::spawn(Self::cleanup_loop(self.clone())),
            tokio::spawn(Self::reaper_loop(self)),
        ]
    }

    /// Signals every maintenance task to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    async fn redelivery_loop(broker: Arc<Self>) {
        let mut shutdown = broker.shutdown_tx.subscribe();
        while !*shutdown.borrow_and_update() {
            tokio::select! {
                _ = tokio::time::sleep(REDELIVERY_TICK) => {
                    for subscriber_id in broker.directory.online_ids() {
                        broker.drain_subscriber(&subscriber_id).await;
                    }
                }
                _ = shutdown.changed() => {}
            }
        }
        debug!("Redelivery loop stopped");
    }

    async fn cleanup_loop(broker: Arc<Self>) {
        let mut shutdown = broker.shutdown_tx.subscribe();
        while !*shutdown.borrow_and_update() {
            tokio::select! {
                _ = tokio::time::sleep(CLEANUP_TICK) => {
                    let purged = broker.queues.purge_expired().await;
                    let trimmed = broker.topics.trim_all_history().await;
                    let cutoff = epoch_ms().saturating_sub(broker.config.message_retention_ms);
                    match broker.store.delete_messages_older_than(cutoff) {
                        Ok(deleted) => {
                            debug!(purged, trimmed, deleted, "Cleanup pass finished");
                        }
                        Err(e) => warn!(error = %e, "Message retention sweep failed"),
                    }
                }
                _ = shutdown.changed() => {}
            }
        }
        debug!("Cleanup loop stopped");
    }

    async fn reaper_loop(broker: Arc<Self>) {
        let mut shutdown = broker.shutdown_tx.subscribe();
        while !*shutdown.borrow_and_update() {
            tokio::select! {
                _ = tokio::time::sleep(REAPER_TICK) => {
                    let evicted = broker.groups.evict_stale(MEMBER_TIMEOUT_MS).await;
                    if !evicted.is_empty() {
                        debug!(count = evicted.len(), "Evicted stale group members");
                    }
                }
                _ = shutdown.changed() => {}
            }
        }
        debug!("Group reaper stopped");
    }
}
