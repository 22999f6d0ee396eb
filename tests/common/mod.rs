//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use topicbus::{BrokerEvent, EventSink, Message, SubscriberSink};

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .try_init();
}

/// Sink that records every delivered message.
pub struct CollectingSink {
    messages: Mutex<Vec<Message>>,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            messages: Mutex::new(Vec::new()),
        })
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    pub fn first(&self) -> Option<Message> {
        self.messages.lock().unwrap().first().cloned()
    }
}

impl SubscriberSink for CollectingSink {
    fn deliver(&self, message: &Message) -> anyhow::Result<()> {
        self.messages.lock().unwrap().push(message.clone());
        Ok(())
    }
}

/// Sink that rejects the first `failures` deliveries, then accepts.
pub struct FlakySink {
    remaining_failures: AtomicUsize,
    accepted: Mutex<Vec<Message>>,
}

impl FlakySink {
    pub fn new(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            remaining_failures: AtomicUsize::new(failures),
            accepted: Mutex::new(Vec::new()),
        })
    }

    pub fn accepted(&self) -> Vec<Message> {
        self.accepted.lock().unwrap().clone()
    }
}

impl SubscriberSink for FlakySink {
    fn deliver(&self, message: &Message) -> anyhow::Result<()> {
        let remaining = self.remaining_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.remaining_failures.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("connection reset");
        }
        self.accepted.lock().unwrap().push(message.clone());
        Ok(())
    }
}

/// Sink that always fails.
pub struct FailingSink;

impl SubscriberSink for FailingSink {
    fn deliver(&self, _message: &Message) -> anyhow::Result<()> {
        anyhow::bail!("sink is down")
    }
}

/// Event sink that records event kinds in order.
pub struct EventCollector {
    kinds: Mutex<Vec<String>>,
}

impl EventCollector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            kinds: Mutex::new(Vec::new()),
        })
    }

    pub fn kinds(&self) -> Vec<String> {
        self.kinds.lock().unwrap().clone()
    }

    pub fn count_of(&self, kind: &str) -> usize {
        self.kinds.lock().unwrap().iter().filter(|k| *k == kind).count()
    }
}

impl EventSink for EventCollector {
    fn on_event(&self, event: &BrokerEvent) -> anyhow::Result<()> {
        self.kinds.lock().unwrap().push(event.kind().to_string());
        Ok(())
    }
}

/// Event sink that always errors, for the never-propagate contract.
pub struct PanickyEventSink;

impl EventSink for PanickyEventSink {
    fn on_event(&self, _event: &BrokerEvent) -> anyhow::Result<()> {
        anyhow::bail!("observer crashed")
    }
}

/// Polls until `probe` returns `Some`, or panics after ~2 seconds.
pub async fn wait_for<T>(mut probe: impl FnMut() -> Option<T>) -> T {
    for _ in 0..200 {
        if let Some(value) = probe() {
            return value;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}
