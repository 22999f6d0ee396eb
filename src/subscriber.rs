//! Subscriber and publisher records, the delivery sink capability, and the
//! directory that maps subscriber ids to their live state.
//!
//! Transports attach by implementing [`SubscriberSink`] — typically a thin
//! wrapper around a per-connection outbound channel. `deliver` is invoked
//! synchronously on the routing path, so implementations must be
//! non-blocking or own backpressure for their connection.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use uuid::Uuid;

use crate::filter::SubscriptionFilter;
use crate::message::{epoch_ms, Message};

/// Consumes messages on behalf of one subscriber.
pub trait SubscriberSink: Send + Sync {
    fn deliver(&self, message: &Message) -> anyhow::Result<()>;
}

/// Snapshot of a subscriber's metadata.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriberInfo {
    pub id: String,
    pub client_id: String,
    pub topics: Vec<String>,
    pub created_at: u64,
    pub last_activity: u64,
    pub online: bool,
    pub delivered_count: u64,
}

/// A publisher, tracked for stats only.
#[derive(Debug, Clone, Serialize)]
pub struct Publisher {
    pub id: String,
    pub published_count: u64,
    pub first_seen: u64,
    pub last_published: u64,
}

pub(crate) struct SubscriberState {
    pub client_id: String,
    pub topics: HashSet<String>,
    pub created_at: u64,
    pub last_activity: u64,
    pub online: bool,
    pub delivered_count: u64,
    pub filter: Option<Arc<SubscriptionFilter>>,
    pub sink: Arc<dyn SubscriberSink>,
}

impl SubscriberState {
    fn info(&self, id: &str) -> SubscriberInfo {
        let mut topics: Vec<String> = self.topics.iter().cloned().collect();
        topics.sort();
        SubscriberInfo {
            id: id.to_string(),
            client_id: self.client_id.clone(),
            topics,
            created_at: self.created_at,
            last_activity: self.last_activity,
            online: self.online,
            delivered_count: self.delivered_count,
        }
    }
}

/// What the router needs to attempt a delivery, snapshotted so no directory
/// lock is held across the sink call.
pub(crate) struct DeliveryTarget {
    pub id: String,
    pub online: bool,
    pub filter: Option<Arc<SubscriptionFilter>>,
    pub sink: Arc<dyn SubscriberSink>,
}

/// Live subscriber registry. Guarded by a plain mutex: every operation is a
/// short map access, and delivery happens on snapshots outside the lock.
pub(crate) struct SubscriberDirectory {
    inner: Mutex<HashMap<String, SubscriberState>>,
}

impl SubscriberDirectory {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(
        &self,
        client_id: &str,
        topics: HashSet<String>,
        filter: Option<Arc<SubscriptionFilter>>,
        sink: Arc<dyn SubscriberSink>,
    ) -> SubscriberInfo {
        let id = Uuid::new_v4().to_string();
        let now = epoch_ms();
        let state = SubscriberState {
            client_id: client_id.to_string(),
            topics,
            created_at: now,
            last_activity: now,
            online: true,
            delivered_count: 0,
            filter,
            sink,
        };
        let info = state.info(&id);
        self.inner.lock().unwrap().insert(id, state);
        info
    }

    pub fn remove(&self, id: &str) -> Option<SubscriberInfo> {
        self.inner.lock().unwrap().remove(id).map(|s| s.info(id))
    }

    pub fn get(&self, id: &str) -> Option<SubscriberInfo> {
        self.inner.lock().unwrap().get(id).map(|s| s.info(id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().unwrap().contains_key(id)
    }

    pub fn delivery_target(&self, id: &str) -> Option<DeliveryTarget> {
        let inner = self.inner.lock().unwrap();
        inner.get(id).map(|s| DeliveryTarget {
            id: id.to_string(),
            online: s.online,
            filter: s.filter.clone(),
            sink: s.sink.clone(),
        })
    }

    /// Sets the online flag; returns the previous value, or `None` for an
    /// unknown subscriber.
    pub fn set_online(&self, id: &str, online: bool) -> Option<bool> {
        let mut inner = self.inner.lock().unwrap();
        let state = inner.get_mut(id)?;
        let was = state.online;
        state.online = online;
        state.last_activity = epoch_ms();
        Some(was)
    }

    pub fn touch(&self, id: &str) {
        if let Some(state) = self.inner.lock().unwrap().get_mut(id) {
            state.last_activity = epoch_ms();
        }
    }

    pub fn record_delivery(&self, id: &str) {
        if let Some(state) = self.inner.lock().unwrap().get_mut(id) {
            state.delivered_count += 1;
            state.last_activity = epoch_ms();
        }
    }

    /// Removes topics from a subscriber's set; returns the remaining count,
    /// or `None` for an unknown subscriber.
    pub fn remove_topics(&self, id: &str, topics: &[String]) -> Option<usize> {
        let mut inner = self.inner.lock().unwrap();
        let state = inner.get_mut(id)?;
        for topic in topics {
            state.topics.remove(topic);
        }
        Some(state.topics.len())
    }

    /// Snapshot of ids for subscribers currently online. Taken before any
    /// drain walk so delivery never iterates the live map.
    pub fn online_ids(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, s)| s.online)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn list(&self) -> Vec<SubscriberInfo> {
        let inner = self.inner.lock().unwrap();
        let mut subscribers: Vec<SubscriberInfo> =
            inner.iter().map(|(id, s)| s.info(id)).collect();
        subscribers.sort_by(|a, b| a.id.cmp(&b.id));
        subscribers
    }

    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}
