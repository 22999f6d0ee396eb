//! Broker lifecycle events.
//!
//! Observers (metrics exporters, the dashboard feed, audit hooks) register
//! an [`EventSink`]; the broker calls it inline on the emitting operation.
//! Sink errors are logged and never propagate back into the operation that
//! raised the event.

use crate::message::Message;

#[derive(Debug, Clone)]
pub enum BrokerEvent {
    MessagePublished {
        message: Message,
    },
    MessageDelivered {
        subscriber_id: String,
        message_id: String,
        topic: String,
    },
    MessageQueued {
        subscriber_id: String,
        message_id: String,
        topic: String,
    },
    MessageFailed {
        subscriber_id: String,
        message_id: String,
        topic: String,
        reason: String,
    },
    SubscriberConnected {
        subscriber_id: String,
        client_id: String,
    },
    SubscriberDisconnected {
        subscriber_id: String,
        client_id: String,
    },
    TopicCreated {
        name: String,
    },
    TopicDeleted {
        name: String,
    },
}

impl BrokerEvent {
    /// The wire tag for this event, as carried in transport frames.
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerEvent::MessagePublished { .. } => "message:published",
            BrokerEvent::MessageDelivered { .. } => "message:delivered",
            BrokerEvent::MessageQueued { .. } => "message:queued",
            BrokerEvent::MessageFailed { .. } => "message:failed",
            BrokerEvent::SubscriberConnected { .. } => "subscriber:connected",
            BrokerEvent::SubscriberDisconnected { .. } => "subscriber:disconnected",
            BrokerEvent::TopicCreated { .. } => "topic:created",
            BrokerEvent::TopicDeleted { .. } => "topic:deleted",
        }
    }
}

/// Receives broker events. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: &BrokerEvent) -> anyhow::Result<()>;
}
