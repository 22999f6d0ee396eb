//! Consumer groups: membership, heartbeats, leader election, virtual
//! partition assignment, and delivery-target selection.
//!
//! A group is bound to one topic and owns the delivery decision for that
//! topic: when a routed subscriber belongs to a group bound to the message's
//! topic, the group's strategy picks the member (or all members, for
//! broadcast) instead of the subscriber itself.
//!
//! Leadership is purely positional: the first member of the list leads, and
//! whoever becomes head after a leave or eviction is promoted. Partitions
//! are informational — 16 virtual slots spread as evenly as possible so
//! operators can see the balance — and are not used to shard storage.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{BrokerError, Result};
use crate::message::{epoch_ms, Message};

/// Number of virtual partitions spread across group members.
pub const VIRTUAL_PARTITIONS: u32 = 16;

/// Heartbeat age beyond which a member is considered dead.
pub const MEMBER_TIMEOUT_MS: u64 = 30_000;

/// How a group picks the delivery target among its members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GroupStrategy {
    RoundRobin,
    Sticky,
    Random,
    Broadcast,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupMember {
    pub subscriber_id: String,
    pub client_id: String,
    pub joined_at: u64,
    pub last_heartbeat: u64,
    /// Virtual partition ids currently assigned to this member.
    pub partitions: Vec<u32>,
    pub processed_count: u64,
    pub leader: bool,
}

/// Snapshot of a group's state.
#[derive(Debug, Clone, Serialize)]
pub struct GroupInfo {
    pub name: String,
    pub topic: String,
    pub strategy: GroupStrategy,
    pub members: Vec<GroupMember>,
    pub current_offset: u64,
    pub committed_offset: u64,
}

/// Delivery target chosen by `select`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Deliver to this member.
    Member(String),
    /// Broadcast: deliver to every member.
    All(Vec<String>),
}

struct GroupState {
    topic: String,
    strategy: GroupStrategy,
    members: Vec<GroupMember>,
    cursor: usize,
    sticky_assignments: HashMap<String, String>,
    current_offset: u64,
    committed_offset: u64,
}

impl GroupState {
    fn info(&self, name: &str) -> GroupInfo {
        GroupInfo {
            name: name.to_string(),
            topic: self.topic.clone(),
            strategy: self.strategy,
            members: self.members.clone(),
            current_offset: self.current_offset,
            committed_offset: self.committed_offset,
        }
    }

    /// Spreads the 16 virtual partitions across members in join order; the
    /// first `16 mod n` members carry one extra.
    fn rebalance(&mut self) {
        let n = self.members.len() as u32;
        if n == 0 {
            return;
        }
        let base = VIRTUAL_PARTITIONS / n;
        let extra = VIRTUAL_PARTITIONS % n;
        let mut next = 0u32;
        for (i, member) in self.members.iter_mut().enumerate() {
            let take = base + if (i as u32) < extra { 1 } else { 0 };
            member.partitions = (next..next + take).collect();
            next += take;
        }
    }

    fn member_ids(&self) -> Vec<String> {
        self.members.iter().map(|m| m.subscriber_id.clone()).collect()
    }
}

fn hash_key(key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// Derives the sticky routing key for a message: the first non-empty of the
/// well-known payload fields, the correlation id, or a publisher fallback.
fn sticky_key(message: &Message) -> String {
    for field in ["userId", "orderId", "sessionId"] {
        if let Some(value) = message.payload.field(field) {
            let text = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if !text.is_empty() {
                return text;
            }
        }
    }
    if let Some(correlation_id) = &message.correlation_id {
        if !correlation_id.is_empty() {
            return correlation_id.clone();
        }
    }
    format!("publisher:{}", message.publisher_id)
}

struct GroupsInner {
    groups: HashMap<String, GroupState>,
    /// Reverse index: subscriber id → group name. A subscriber belongs to
    /// at most one group.
    by_subscriber: HashMap<String, String>,
}

/// Manages every consumer group of a broker. Shared via `Arc`.
pub struct ConsumerGroupManager {
    inner: Mutex<GroupsInner>,
}

impl Default for ConsumerGroupManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumerGroupManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(GroupsInner {
                groups: HashMap::new(),
                by_subscriber: HashMap::new(),
            }),
        }
    }

    /// Creates a group bound to a topic. Fails with `AlreadyExists` when the
    /// name is taken.
    pub async fn create(&self, name: &str, topic: &str, strategy: GroupStrategy) -> Result<GroupInfo> {
        let mut inner = self.inner.lock().await;
        if inner.groups.contains_key(name) {
            return Err(BrokerError::AlreadyExists(format!("consumer group {name}")));
        }
        let state = GroupState {
            topic: topic.to_string(),
            strategy,
            members: Vec::new(),
            cursor: 0,
            sticky_assignments: HashMap::new(),
            current_offset: 0,
            committed_offset: 0,
        };
        let info = state.info(name);
        inner.groups.insert(name.to_string(), state);
        info!(group = %name, topic = %topic, strategy = ?strategy, "Consumer group created");
        Ok(info)
    }

    /// Rollback helper for staged creation.
    pub(crate) async fn remove_if_empty(&self, name: &str) {
        let mut inner = self.inner.lock().await;
        if inner.groups.get(name).is_some_and(|g| g.members.is_empty()) {
            inner.groups.remove(name);
        }
    }

    /// Adds a subscriber to a group. Joining a group you are already in
    /// refreshes the heartbeat; the first member becomes leader; every
    /// membership change rebalances partitions.
    pub async fn join(&self, name: &str, subscriber_id: &str, client_id: &str) -> Result<GroupMember> {
        let now = epoch_ms();
        let mut inner = self.inner.lock().await;

        if let Some(existing) = inner.by_subscriber.get(subscriber_id).cloned() {
            if existing != name {
                return Err(BrokerError::AlreadyExists(format!(
                    "subscriber {subscriber_id} is already in group {existing}"
                )));
            }
            let group = inner.groups.get_mut(name).ok_or_else(|| {
                BrokerError::NotFound(format!("consumer group {name}"))
            })?;
            let member = group
                .members
                .iter_mut()
                .find(|m| m.subscriber_id == subscriber_id)
                .expect("reverse index points at a member");
            member.last_heartbeat = now;
            return Ok(member.clone());
        }

        let group = inner
            .groups
            .get_mut(name)
            .ok_or_else(|| BrokerError::NotFound(format!("consumer group {name}")))?;
        let member = GroupMember {
            subscriber_id: subscriber_id.to_string(),
            client_id: client_id.to_string(),
            joined_at: now,
            last_heartbeat: now,
            partitions: Vec::new(),
            processed_count: 0,
            leader: group.members.is_empty(),
        };
        group.members.push(member);
        group.rebalance();
        let joined = group.members.last().cloned().expect("member just pushed");
        inner
            .by_subscriber
            .insert(subscriber_id.to_string(), name.to_string());
        debug!(group = %name, subscriber = %subscriber_id, leader = joined.leader, "Member joined");
        Ok(joined)
    }

    /// Removes a subscriber from its group, promoting the new head to
    /// leader if the leader left. Returns the group name, if any.
    pub async fn leave(&self, subscriber_id: &str) -> Option<String> {
        let mut inner = self.inner.lock().await;
        let name = inner.by_subscriber.remove(subscriber_id)?;
        if let Some(group) = inner.groups.get_mut(&name) {
            let was_leader = group
                .members
                .iter()
                .find(|m| m.subscriber_id == subscriber_id)
                .is_some_and(|m| m.leader);
            group.members.retain(|m| m.subscriber_id != subscriber_id);
            group
                .sticky_assignments
                .retain(|_, assignee| assignee != subscriber_id);
            if was_leader {
                if let Some(head) = group.members.first_mut() {
                    head.leader = true;
                }
            }
            if group.cursor >= group.members.len() {
                group.cursor = 0;
            }
            group.rebalance();
            debug!(group = %name, subscriber = %subscriber_id, "Member left");
        }
        Some(name)
    }

    /// Refreshes a member's heartbeat. Returns false for unknown members.
    pub async fn heartbeat(&self, subscriber_id: &str) -> bool {
        let now = epoch_ms();
        let mut inner = self.inner.lock().await;
        let Some(name) = inner.by_subscriber.get(subscriber_id).cloned() else {
            return false;
        };
        if let Some(group) = inner.groups.get_mut(&name) {
            if let Some(member) = group
                .members
                .iter_mut()
                .find(|m| m.subscriber_id == subscriber_id)
            {
                member.last_heartbeat = now;
                return true;
            }
        }
        false
    }

    /// Evicts members whose heartbeat is older than `timeout_ms` and
    /// rebalances the affected groups. Returns `(group, subscriber)` pairs
    /// for each eviction.
    pub async fn evict_stale(&self, timeout_ms: u64) -> Vec<(String, String)> {
        let now = epoch_ms();
        let mut inner = self.inner.lock().await;
        let mut evicted = Vec::new();
        for (name, group) in inner.groups.iter_mut() {
            let stale: Vec<String> = group
                .members
                .iter()
                .filter(|m| now.saturating_sub(m.last_heartbeat) > timeout_ms)
                .map(|m| m.subscriber_id.clone())
                .collect();
            if stale.is_empty() {
                continue;
            }
            let leader_lost = group
                .members
                .iter()
                .any(|m| m.leader && stale.contains(&m.subscriber_id));
            group.members.retain(|m| !stale.contains(&m.subscriber_id));
            group
                .sticky_assignments
                .retain(|_, assignee| !stale.contains(assignee));
            if leader_lost {
                if let Some(head) = group.members.first_mut() {
                    head.leader = true;
                }
            }
            if group.cursor >= group.members.len() {
                group.cursor = 0;
            }
            group.rebalance();
            for subscriber_id in stale {
                info!(group = %name, subscriber = %subscriber_id, "Member evicted: heartbeat timeout");
                evicted.push((name.clone(), subscriber_id));
            }
        }
        for (_, subscriber_id) in &evicted {
            inner.by_subscriber.remove(subscriber_id);
        }
        evicted
    }

    /// The group a subscriber belongs to, if that group is bound to `topic`.
    pub async fn group_bound_to(&self, subscriber_id: &str, topic: &str) -> Option<String> {
        let inner = self.inner.lock().await;
        let name = inner.by_subscriber.get(subscriber_id)?;
        let group = inner.groups.get(name)?;
        (group.topic == topic).then(|| name.clone())
    }

    /// Picks the delivery target(s) for a message according to the group's
    /// strategy, and advances the group's current offset. Returns `None`
    /// for an unknown or empty group; the second tuple element is the
    /// current offset after the selection, for offset persistence.
    pub async fn select(&self, name: &str, message: &Message) -> Option<(Selection, u64)> {
        let mut inner = self.inner.lock().await;
        let group = inner.groups.get_mut(name)?;
        if group.members.is_empty() {
            return None;
        }
        group.current_offset += 1;
        let offset = group.current_offset;
        let selection = match group.strategy {
            GroupStrategy::RoundRobin => {
                let idx = group.cursor % group.members.len();
                group.cursor = (group.cursor + 1) % group.members.len();
                let member = &mut group.members[idx];
                member.processed_count += 1;
                Selection::Member(member.subscriber_id.clone())
            }
            GroupStrategy::Sticky => {
                let key = sticky_key(message);
                let assigned = group
                    .sticky_assignments
                    .get(&key)
                    .filter(|id| group.members.iter().any(|m| &m.subscriber_id == *id))
                    .cloned();
                let chosen = match assigned {
                    Some(id) => id,
                    None => {
                        let idx = (hash_key(&key) % group.members.len() as u64) as usize;
                        let id = group.members[idx].subscriber_id.clone();
                        group.sticky_assignments.insert(key, id.clone());
                        id
                    }
                };
                if let Some(member) = group
                    .members
                    .iter_mut()
                    .find(|m| m.subscriber_id == chosen)
                {
                    member.processed_count += 1;
                }
                Selection::Member(chosen)
            }
            GroupStrategy::Random => {
                let idx = rand::thread_rng().gen_range(0..group.members.len());
                let member = &mut group.members[idx];
                member.processed_count += 1;
                Selection::Member(member.subscriber_id.clone())
            }
            GroupStrategy::Broadcast => {
                for member in group.members.iter_mut() {
                    member.processed_count += 1;
                }
                Selection::All(group.member_ids())
            }
        };
        Some((selection, offset))
    }

    /// Marks an offset committed. Fails with `NotFound` for unknown groups.
    pub async fn commit_offset(&self, name: &str, offset: u64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let group = inner
            .groups
            .get_mut(name)
            .ok_or_else(|| BrokerError::NotFound(format!("consumer group {name}")))?;
        group.committed_offset = offset;
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Option<GroupInfo> {
        self.inner.lock().await.groups.get(name).map(|g| g.info(name))
    }

    pub async fn list(&self) -> Vec<GroupInfo> {
        let inner = self.inner.lock().await;
        let mut groups: Vec<GroupInfo> = inner.groups.iter().map(|(n, g)| g.info(n)).collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        groups
    }

    pub async fn count(&self) -> usize {
        self.inner.lock().await.groups.len()
    }
}
