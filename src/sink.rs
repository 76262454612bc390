//! Downstream consumer abstraction
//!
//! Adapters hand every accepted record to an `EventSink`. The sink owns its
//! own back-pressure: `submit` may block, and it must tolerate concurrent
//! callers since the listener and all pollers share one instance.

use crate::error::{IngestError, Result};
use crate::types::InternalEvent;
use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};

/// Core trait for downstream consumers
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Submit one record; returns once the consumer has taken ownership
    ///
    /// Errors are treated as transient by callers and retried per their
    /// own policy.
    async fn submit(&self, event: InternalEvent) -> Result<()>;

    /// Sink name for logging (e.g., "channel", "memory")
    fn name(&self) -> &str;
}

/// Bounded channel sink
///
/// `submit` waits for capacity, so a slow receiver throttles every adapter.
pub struct ChannelSink {
    tx: mpsc::Sender<InternalEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiving half with the given capacity
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<InternalEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn submit(&self, event: InternalEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|e| IngestError::Sink(format!("receiver dropped, event {} lost", e.0.id)))
    }

    fn name(&self) -> &str {
        "channel"
    }
}

/// In-memory sink for development and testing
///
/// Stores submitted records in a `Vec` with configurable max capacity;
/// the oldest records are drained first.
pub struct MemorySink {
    events: RwLock<Vec<InternalEvent>>,
    max_events: usize,
}

impl MemorySink {
    pub fn new(max_events: usize) -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            max_events,
        }
    }

    /// Number of records currently held
    pub async fn count(&self) -> usize {
        self.events.read().await.len()
    }

    /// Snapshot of held records in submission order
    pub async fn events(&self) -> Vec<InternalEvent> {
        self.events.read().await.clone()
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn submit(&self, event: InternalEvent) -> Result<()> {
        let mut events = self.events.write().await;
        events.push(event);

        // Enforce max capacity
        if self.max_events > 0 && events.len() > self.max_events {
            let drain_count = events.len() - self.max_events;
            events.drain(..drain_count);
        }

        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
