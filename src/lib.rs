//! Topic-based publish/subscribe broker core.
//!
//! The broker fans published messages out to matching subscribers with
//! per-subscriber durability: each subscriber owns a bounded FIFO queue
//! with TTL, acknowledgment, retry-with-backoff, and dead-letter promotion.
//! Consumer groups load-balance a topic across members (round-robin,
//! sticky, random, or broadcast), and a request/reply correlator turns
//! asynchronous delivery into a synchronous await with timeouts.
//!
//! Transports, persistence backends, and observers attach through three
//! capabilities: [`SubscriberSink`] consumes deliveries, [`Store`] provides
//! durability, and [`EventSink`] receives lifecycle events. The crate ships
//! no network surface of its own.
//!
//! ```no_run
//! use std::sync::Arc;
//! use topicbus::{Broker, BrokerConfig, Message, Payload, PublishOptions, SubscriberSink};
//!
//! struct PrintSink;
//!
//! impl SubscriberSink for PrintSink {
//!     fn deliver(&self, message: &Message) -> anyhow::Result<()> {
//!         println!("{}: {:?}", message.topic, message.payload);
//!         Ok(())
//!     }
//! }
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let broker = Arc::new(Broker::new(BrokerConfig::default()));
//! let tasks = broker.clone().spawn_maintenance();
//!
//! broker
//!     .subscribe("cli-1", &["orders.created".to_string()], Arc::new(PrintSink), None)
//!     .await?;
//! broker
//!     .publish(
//!         "orders.created",
//!         Payload::Json(serde_json::json!({"orderId": "ORD-1"})),
//!         "pub-1",
//!         PublishOptions::default(),
//!     )
//!     .await?;
//!
//! broker.shutdown();
//! for task in tasks {
//!     task.await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod correlator;
pub mod dlq;
pub mod error;
pub mod events;
pub mod filter;
pub mod group;
pub mod message;
pub mod persistence;
pub mod queue;
pub mod router;
pub mod subscriber;
pub mod topic;

pub use broker::{Broker, BrokerStats, PublishOptions};
pub use config::BrokerConfig;
pub use correlator::PendingRequest;
pub use dlq::{DeadLetterEntry, DlqOverflowPolicy};
pub use error::{BrokerError, Result};
pub use events::{BrokerEvent, EventSink};
pub use filter::{FilterSpec, HeaderMatchSpec};
pub use group::{GroupInfo, GroupMember, GroupStrategy};
pub use message::{Message, Payload, QueuedMessage};
pub use persistence::{MemoryStore, Store, StoreError};
pub use queue::RetryOutcome;
pub use subscriber::{Publisher, SubscriberInfo, SubscriberSink};
pub use topic::{TopicConfig, TopicInfo, TopicOverrides};
