//! Persistence abstraction.
//!
//! The broker treats its store as an opaque, synchronous collaborator: every
//! call either succeeds or surfaces a [`StoreError`], and broker operations
//! stage their writes so in-memory state commits only after the store call
//! succeeded. [`MemoryStore`] is the in-process implementation used for
//! tests and for deployments that do not need durability; durable backends
//! implement the same trait.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dlq::DeadLetterEntry;
use crate::group::GroupStrategy;
use crate::message::{epoch_ms, Message};
use crate::topic::TopicInfo;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable form of a consumer group: membership is runtime state and is not
/// persisted, offsets are.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupRecord {
    pub name: String,
    pub topic: String,
    pub strategy: GroupStrategy,
    pub current_offset: u64,
    pub committed_offset: u64,
    pub created_at: u64,
}

/// An API key record, managed by the auth collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub key: String,
    pub name: String,
    pub created_at: u64,
    pub last_used_at: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Store-assigned sequence number; zero until appended.
    pub seq: u64,
    pub action: String,
    pub actor: String,
    pub topic: Option<String>,
    pub detail: String,
    pub at: u64,
}

impl AuditRecord {
    pub fn new(
        action: impl Into<String>,
        actor: impl Into<String>,
        topic: Option<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            seq: 0,
            action: action.into(),
            actor: actor.into(),
            topic,
            detail: detail.into(),
            at: epoch_ms(),
        }
    }
}

/// Criteria for audit listing. Empty criteria match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub action: Option<String>,
    pub topic: Option<String>,
    pub actor: Option<String>,
}

impl AuditFilter {
    fn matches(&self, record: &AuditRecord) -> bool {
        self.action.as_deref().is_none_or(|a| a == record.action)
            && self.actor.as_deref().is_none_or(|a| a == record.actor)
            && self
                .topic
                .as_deref()
                .is_none_or(|t| record.topic.as_deref() == Some(t))
    }
}

/// The key/value-ish store the broker persists through.
pub trait Store: Send + Sync {
    // topics
    fn save_topic(&self, topic: &TopicInfo) -> StoreResult<()>;
    fn get_topic(&self, name: &str) -> StoreResult<Option<TopicInfo>>;
    fn get_all_topics(&self) -> StoreResult<Vec<TopicInfo>>;
    fn delete_topic(&self, name: &str) -> StoreResult<bool>;
    fn update_topic_stats(
        &self,
        name: &str,
        message_count: u64,
        subscriber_count: usize,
    ) -> StoreResult<()>;

    // messages
    fn save_message(&self, message: &Message) -> StoreResult<()>;
    fn messages_by_topic(&self, topic: &str, limit: usize) -> StoreResult<Vec<Message>>;
    fn message_by_id(&self, id: &str) -> StoreResult<Option<Message>>;
    /// Case-insensitive substring search across topic, payload text, and
    /// publisher id.
    fn search_messages(&self, query: &str, limit: usize) -> StoreResult<Vec<Message>>;
    fn delete_messages_older_than(&self, cutoff_ms: u64) -> StoreResult<usize>;
    fn message_count(&self) -> StoreResult<usize>;

    // consumer groups
    fn create_group(&self, group: &GroupRecord) -> StoreResult<()>;
    fn get_group(&self, name: &str) -> StoreResult<Option<GroupRecord>>;
    fn get_all_groups(&self) -> StoreResult<Vec<GroupRecord>>;
    fn set_group_offset(&self, name: &str, offset: u64) -> StoreResult<()>;
    fn commit_group_offset(&self, name: &str, offset: u64) -> StoreResult<()>;

    // dead letters
    fn append_dead_letter(&self, entry: &DeadLetterEntry) -> StoreResult<()>;
    fn list_dead_letters(&self, limit: usize) -> StoreResult<Vec<DeadLetterEntry>>;
    fn take_dead_letter(&self, message_id: &str) -> StoreResult<Option<DeadLetterEntry>>;
    fn dead_letter_count(&self) -> StoreResult<usize>;

    // api keys (auth collaborator surface)
    fn save_api_key(&self, record: &ApiKeyRecord) -> StoreResult<()>;
    fn get_api_key(&self, key: &str) -> StoreResult<Option<ApiKeyRecord>>;
    fn get_all_api_keys(&self) -> StoreResult<Vec<ApiKeyRecord>>;
    fn touch_api_key(&self, key: &str, at_ms: u64) -> StoreResult<()>;

    // audit
    fn append_audit(&self, record: &AuditRecord) -> StoreResult<()>;
    fn list_audit(&self, filter: &AuditFilter, limit: usize) -> StoreResult<Vec<AuditRecord>>;
}

#[derive(Default)]
struct MemoryInner {
    topics: HashMap<String, TopicInfo>,
    messages: Vec<Message>,
    groups: HashMap<String, GroupRecord>,
    dead_letters: Vec<DeadLetterEntry>,
    api_keys: HashMap<String, ApiKeyRecord>,
    audit: Vec<AuditRecord>,
    next_audit_seq: u64,
}

/// In-memory store. Not durable; consistent within one process.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn save_topic(&self, topic: &TopicInfo) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.topics.insert(topic.name.clone(), topic.clone());
        Ok(())
    }

    fn get_topic(&self, name: &str) -> StoreResult<Option<TopicInfo>> {
        Ok(self.inner.lock().unwrap().topics.get(name).cloned())
    }

    fn get_all_topics(&self) -> StoreResult<Vec<TopicInfo>> {
        let inner = self.inner.lock().unwrap();
        let mut topics: Vec<TopicInfo> = inner.topics.values().cloned().collect();
        topics.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(topics)
    }

    fn delete_topic(&self, name: &str) -> StoreResult<bool> {
        Ok(self.inner.lock().unwrap().topics.remove(name).is_some())
    }

    fn update_topic_stats(
        &self,
        name: &str,
        message_count: u64,
        subscriber_count: usize,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let topic = inner
            .topics
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(format!("topic {name}")))?;
        topic.message_count = message_count;
        topic.subscriber_count = subscriber_count;
        Ok(())
    }

    fn save_message(&self, message: &Message) -> StoreResult<()> {
        self.inner.lock().unwrap().messages.push(message.clone());
        Ok(())
    }

    fn messages_by_topic(&self, topic: &str, limit: usize) -> StoreResult<Vec<Message>> {
        let inner = self.inner.lock().unwrap();
        let matching: Vec<&Message> =
            inner.messages.iter().filter(|m| m.topic == topic).collect();
        let skip = matching.len().saturating_sub(limit);
        Ok(matching.into_iter().skip(skip).cloned().collect())
    }

    fn message_by_id(&self, id: &str) -> StoreResult<Option<Message>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .messages
            .iter()
            .find(|m| m.id == id)
            .cloned())
    }

    fn search_messages(&self, query: &str, limit: usize) -> StoreResult<Vec<Message>> {
        let needle = query.to_lowercase();
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .messages
            .iter()
            .filter(|m| {
                m.topic.to_lowercase().contains(&needle)
                    || m.publisher_id.to_lowercase().contains(&needle)
                    || m.payload.to_search_text().to_lowercase().contains(&needle)
            })
            .take(limit)
            .cloned()
            .collect())
    }

    fn delete_messages_older_than(&self, cutoff_ms: u64) -> StoreResult<usize> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.messages.len();
        inner.messages.retain(|m| m.timestamp >= cutoff_ms);
        Ok(before - inner.messages.len())
    }

    fn message_count(&self) -> StoreResult<usize> {
        Ok(self.inner.lock().unwrap().messages.len())
    }

    fn create_group(&self, group: &GroupRecord) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.groups.contains_key(&group.name) {
            return Err(StoreError::Conflict(format!("group {}", group.name)));
        }
        inner.groups.insert(group.name.clone(), group.clone());
        Ok(())
    }

    fn get_group(&self, name: &str) -> StoreResult<Option<GroupRecord>> {
        Ok(self.inner.lock().unwrap().groups.get(name).cloned())
    }

    fn get_all_groups(&self) -> StoreResult<Vec<GroupRecord>> {
        let inner = self.inner.lock().unwrap();
        let mut groups: Vec<GroupRecord> = inner.groups.values().cloned().collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(groups)
    }

    fn set_group_offset(&self, name: &str, offset: u64) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let group = inner
            .groups
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(format!("group {name}")))?;
        group.current_offset = offset;
        Ok(())
    }

    fn commit_group_offset(&self, name: &str, offset: u64) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let group = inner
            .groups
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(format!("group {name}")))?;
        group.committed_offset = offset;
        Ok(())
    }

    fn append_dead_letter(&self, entry: &DeadLetterEntry) -> StoreResult<()> {
        self.inner.lock().unwrap().dead_letters.push(entry.clone());
        Ok(())
    }

    fn list_dead_letters(&self, limit: usize) -> StoreResult<Vec<DeadLetterEntry>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .dead_letters
            .iter()
            .take(limit)
            .cloned()
            .collect())
    }

    fn take_dead_letter(&self, message_id: &str) -> StoreResult<Option<DeadLetterEntry>> {
        let mut inner = self.inner.lock().unwrap();
        let idx = inner
            .dead_letters
            .iter()
            .position(|e| e.message.id == message_id);
        Ok(idx.map(|i| inner.dead_letters.remove(i)))
    }

    fn dead_letter_count(&self) -> StoreResult<usize> {
        Ok(self.inner.lock().unwrap().dead_letters.len())
    }

    fn save_api_key(&self, record: &ApiKeyRecord) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.api_keys.insert(record.key.clone(), record.clone());
        Ok(())
    }

    fn get_api_key(&self, key: &str) -> StoreResult<Option<ApiKeyRecord>> {
        Ok(self.inner.lock().unwrap().api_keys.get(key).cloned())
    }

    fn get_all_api_keys(&self) -> StoreResult<Vec<ApiKeyRecord>> {
        let inner = self.inner.lock().unwrap();
        let mut keys: Vec<ApiKeyRecord> = inner.api_keys.values().cloned().collect();
        keys.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(keys)
    }

    fn touch_api_key(&self, key: &str, at_ms: u64) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner
            .api_keys
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(format!("api key {key}")))?;
        record.last_used_at = Some(at_ms);
        Ok(())
    }

    fn append_audit(&self, record: &AuditRecord) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_audit_seq += 1;
        let mut record = record.clone();
        record.seq = inner.next_audit_seq;
        inner.audit.push(record);
        Ok(())
    }

    fn list_audit(&self, filter: &AuditFilter, limit: usize) -> StoreResult<Vec<AuditRecord>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .audit
            .iter()
            .filter(|r| filter.matches(r))
            .take(limit)
            .cloned()
            .collect())
    }
}
