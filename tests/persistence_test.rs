mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::json;
use topicbus::persistence::{ApiKeyRecord, AuditFilter, AuditRecord, GroupRecord, StoreResult};
use topicbus::{
    Broker, BrokerConfig, BrokerError, DeadLetterEntry, GroupStrategy, MemoryStore, Message,
    Payload, PublishOptions, Store, TopicInfo,
};

use common::CollectingSink;

fn msg(topic: &str, body: serde_json::Value) -> Message {
    Message::new(topic, Payload::Json(body), "pub-1")
}

#[test]
fn test_topic_round_trip_and_stats() {
    let store = MemoryStore::new();
    let info = TopicInfo {
        name: "t".to_string(),
        created_at: 1,
        created_by: "op".to_string(),
        message_count: 0,
        subscriber_count: 0,
        config: Default::default(),
    };
    store.save_topic(&info).unwrap();
    assert!(store.get_topic("t").unwrap().is_some());
    assert_eq!(store.get_all_topics().unwrap().len(), 1);

    store.update_topic_stats("t", 7, 2).unwrap();
    let reloaded = store.get_topic("t").unwrap().unwrap();
    assert_eq!(reloaded.message_count, 7);
    assert_eq!(reloaded.subscriber_count, 2);

    assert!(store.delete_topic("t").unwrap());
    assert!(!store.delete_topic("t").unwrap());
    assert!(store.update_topic_stats("t", 1, 1).is_err());
}

#[test]
fn test_message_queries() {
    let store = MemoryStore::new();
    let a = msg("orders", json!({"orderId": "ORD-77"}));
    let b = msg("invoices", json!({"ref": "INV-1"}));
    store.save_message(&a).unwrap();
    store.save_message(&b).unwrap();

    assert_eq!(store.message_count().unwrap(), 2);
    assert_eq!(store.messages_by_topic("orders", 10).unwrap().len(), 1);
    assert_eq!(
        store.message_by_id(&a.id).unwrap().unwrap().topic,
        "orders"
    );
    assert!(store.message_by_id("missing").unwrap().is_none());

    // substring search spans topic, payload, and publisher
    assert_eq!(store.search_messages("ord-77", 10).unwrap().len(), 1);
    assert_eq!(store.search_messages("invoices", 10).unwrap().len(), 1);
    assert_eq!(store.search_messages("pub-1", 10).unwrap().len(), 2);
    assert!(store.search_messages("nothing", 10).unwrap().is_empty());
}

#[test]
fn test_delete_messages_older_than() {
    let store = MemoryStore::new();
    let mut old = msg("t", json!({}));
    old.timestamp = 1_000;
    let fresh = msg("t", json!({}));
    store.save_message(&old).unwrap();
    store.save_message(&fresh).unwrap();

    assert_eq!(store.delete_messages_older_than(2_000).unwrap(), 1);
    assert_eq!(store.message_count().unwrap(), 1);
}

#[test]
fn test_group_records_and_offsets() {
    let store = MemoryStore::new();
    let record = GroupRecord {
        name: "g".to_string(),
        topic: "t".to_string(),
        strategy: GroupStrategy::Sticky,
        current_offset: 0,
        committed_offset: 0,
        created_at: 1,
    };
    store.create_group(&record).unwrap();
    assert!(store.create_group(&record).is_err());

    store.set_group_offset("g", 5).unwrap();
    store.commit_group_offset("g", 4).unwrap();
    let reloaded = store.get_group("g").unwrap().unwrap();
    assert_eq!(reloaded.current_offset, 5);
    assert_eq!(reloaded.committed_offset, 4);
    assert_eq!(store.get_all_groups().unwrap().len(), 1);
    assert!(store.set_group_offset("missing", 1).is_err());
}

#[test]
fn test_dead_letter_mirror_ops() {
    let store = MemoryStore::new();
    let entry = DeadLetterEntry::new(msg("t", json!({})), "sub", "boom");
    let id = entry.message.id.clone();
    store.append_dead_letter(&entry).unwrap();
    assert_eq!(store.dead_letter_count().unwrap(), 1);
    assert_eq!(store.list_dead_letters(10).unwrap().len(), 1);

    let taken = store.take_dead_letter(&id).unwrap().unwrap();
    assert_eq!(taken.message.id, id);
    assert!(store.take_dead_letter(&id).unwrap().is_none());
    assert_eq!(store.dead_letter_count().unwrap(), 0);
}

#[test]
fn test_api_keys() {
    let store = MemoryStore::new();
    let record = ApiKeyRecord {
        key: "key-abc".to_string(),
        name: "ci".to_string(),
        created_at: 1,
        last_used_at: None,
    };
    store.save_api_key(&record).unwrap();
    assert_eq!(store.get_api_key("key-abc").unwrap().unwrap().name, "ci");
    assert!(store.get_api_key("other").unwrap().is_none());

    store.touch_api_key("key-abc", 99).unwrap();
    assert_eq!(
        store.get_api_key("key-abc").unwrap().unwrap().last_used_at,
        Some(99)
    );
    assert_eq!(store.get_all_api_keys().unwrap().len(), 1);
    assert!(store.touch_api_key("other", 1).is_err());
}

#[test]
fn test_audit_sequencing_and_filters() {
    let store = MemoryStore::new();
    store
        .append_audit(&AuditRecord::new("dlq:retry", "op", Some("t".to_string()), "m-1"))
        .unwrap();
    store
        .append_audit(&AuditRecord::new("dlq:delete", "op", None, "m-2"))
        .unwrap();

    let all = store.list_audit(&AuditFilter::default(), 10).unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].seq, 1);
    assert_eq!(all[1].seq, 2);

    let retries = store
        .list_audit(
            &AuditFilter {
                action: Some("dlq:retry".to_string()),
                ..Default::default()
            },
            10,
        )
        .unwrap();
    assert_eq!(retries.len(), 1);
    assert_eq!(retries[0].topic.as_deref(), Some("t"));
}

/// Store wrapper that can be told to reject message saves, for the staged
/// write contract.
struct FlakyStore {
    inner: MemoryStore,
    fail_message_saves: AtomicBool,
}

impl FlakyStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            fail_message_saves: AtomicBool::new(false),
        }
    }
}

impl Store for FlakyStore {
    fn save_topic(&self, topic: &TopicInfo) -> StoreResult<()> {
        self.inner.save_topic(topic)
    }
    fn get_topic(&self, name: &str) -> StoreResult<Option<TopicInfo>> {
        self.inner.get_topic(name)
    }
    fn get_all_topics(&self) -> StoreResult<Vec<TopicInfo>> {
        self.inner.get_all_topics()
    }
    fn delete_topic(&self, name: &str) -> StoreResult<bool> {
        self.inner.delete_topic(name)
    }
    fn update_topic_stats(&self, name: &str, mc: u64, sc: usize) -> StoreResult<()> {
        self.inner.update_topic_stats(name, mc, sc)
    }
    fn save_message(&self, message: &Message) -> StoreResult<()> {
        if self.fail_message_saves.load(Ordering::SeqCst) {
            return Err(topicbus::StoreError::Unexpected(anyhow::anyhow!(
                "disk full"
            )));
        }
        self.inner.save_message(message)
    }
    fn messages_by_topic(&self, topic: &str, limit: usize) -> StoreResult<Vec<Message>> {
        self.inner.messages_by_topic(topic, limit)
    }
    fn message_by_id(&self, id: &str) -> StoreResult<Option<Message>> {
        self.inner.message_by_id(id)
    }
    fn search_messages(&self, query: &str, limit: usize) -> StoreResult<Vec<Message>> {
        self.inner.search_messages(query, limit)
    }
    fn delete_messages_older_than(&self, cutoff_ms: u64) -> StoreResult<usize> {
        self.inner.delete_messages_older_than(cutoff_ms)
    }
    fn message_count(&self) -> StoreResult<usize> {
        self.inner.message_count()
    }
    fn create_group(&self, group: &GroupRecord) -> StoreResult<()> {
        self.inner.create_group(group)
    }
    fn get_group(&self, name: &str) -> StoreResult<Option<GroupRecord>> {
        self.inner.get_group(name)
    }
    fn get_all_groups(&self) -> StoreResult<Vec<GroupRecord>> {
        self.inner.get_all_groups()
    }
    fn set_group_offset(&self, name: &str, offset: u64) -> StoreResult<()> {
        self.inner.set_group_offset(name, offset)
    }
    fn commit_group_offset(&self, name: &str, offset: u64) -> StoreResult<()> {
        self.inner.commit_group_offset(name, offset)
    }
    fn append_dead_letter(&self, entry: &DeadLetterEntry) -> StoreResult<()> {
        self.inner.append_dead_letter(entry)
    }
    fn list_dead_letters(&self, limit: usize) -> StoreResult<Vec<DeadLetterEntry>> {
        self.inner.list_dead_letters(limit)
    }
    fn take_dead_letter(&self, message_id: &str) -> StoreResult<Option<DeadLetterEntry>> {
        self.inner.take_dead_letter(message_id)
    }
    fn dead_letter_count(&self) -> StoreResult<usize> {
        self.inner.dead_letter_count()
    }
    fn save_api_key(&self, record: &ApiKeyRecord) -> StoreResult<()> {
        self.inner.save_api_key(record)
    }
    fn get_api_key(&self, key: &str) -> StoreResult<Option<ApiKeyRecord>> {
        self.inner.get_api_key(key)
    }
    fn get_all_api_keys(&self) -> StoreResult<Vec<ApiKeyRecord>> {
        self.inner.get_all_api_keys()
    }
    fn touch_api_key(&self, key: &str, at_ms: u64) -> StoreResult<()> {
        self.inner.touch_api_key(key, at_ms)
    }
    fn append_audit(&self, record: &AuditRecord) -> StoreResult<()> {
        self.inner.append_audit(record)
    }
    fn list_audit(&self, filter: &AuditFilter, limit: usize) -> StoreResult<Vec<AuditRecord>> {
        self.inner.list_audit(filter, limit)
    }
}

#[tokio::test]
async fn test_publish_aborts_before_memory_commit_on_store_failure() {
    let store = Arc::new(FlakyStore::new());
    let broker = Broker::with_store(BrokerConfig::default(), store.clone());
    let sink = CollectingSink::new();
    broker
        .subscribe("cli", &["t".to_string()], sink.clone(), None)
        .await
        .unwrap();

    store.fail_message_saves.store(true, Ordering::SeqCst);
    let err = broker
        .publish("t", Payload::Json(json!({})), "p", PublishOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Persistence(_)));

    // nothing committed: no delivery, no history, no counters
    assert_eq!(sink.count(), 0);
    assert!(broker.topic_history("t", 10).await.is_empty());
    assert_eq!(broker.stats().await.total_messages, 0);

    // the store recovers and publishing resumes
    store.fail_message_saves.store(false, Ordering::SeqCst);
    broker
        .publish("t", Payload::Json(json!({})), "p", PublishOptions::default())
        .await
        .unwrap();
    assert_eq!(sink.count(), 1);
}

#[tokio::test]
async fn test_broker_mirrors_state_into_store() {
    let store = Arc::new(MemoryStore::new());
    let broker = Broker::with_store(BrokerConfig::default(), store.clone());
    broker.create_topic("t", "op", None).await.unwrap();
    broker
        .publish("t", Payload::Json(json!({"q": 1})), "p", PublishOptions::default())
        .await
        .unwrap();
    broker
        .create_group("g", "t", GroupStrategy::RoundRobin)
        .await
        .unwrap();

    assert!(store.get_topic("t").unwrap().is_some());
    assert_eq!(store.message_count().unwrap(), 1);
    assert!(store.get_group("g").unwrap().is_some());
    assert_eq!(store.get_topic("t").unwrap().unwrap().message_count, 1);

    assert_eq!(broker.search_messages("q", 10).unwrap().len(), 1);
}
