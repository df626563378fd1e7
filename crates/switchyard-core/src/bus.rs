//! Message bus contract shared by every backend

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::Message;

/// Bounded per-agent queue the bus delivers into
pub type Inbox = mpsc::Sender<Message>;

/// Which transport a bus runs on
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BusBackend {
    InProcess,
    Broker,
}

impl std::fmt::Display for BusBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InProcess => write!(f, "in_process"),
            Self::Broker => write!(f, "broker"),
        }
    }
}

/// Snapshot of bus-level counters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusMetrics {
    pub backend: BusBackend,
    pub messages_published: u64,
    pub messages_delivered: u64,
    /// Deliveries with no subscriber or a full inbox
    pub messages_dropped: u64,
    pub active_subscribers: usize,
    /// Pending deliveries (in-process backend only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_size: Option<usize>,
    /// Transport failures (broker backend only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_errors: Option<u64>,
}

/// Pub/sub transport. Backends are interchangeable: agents only see this trait.
///
/// Delivery is best-effort and at-most-once. `publish` never reports a missing
/// subscriber; such deliveries are logged and counted in `messages_dropped`.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Begin delivering messages
    async fn start(&self) -> Result<()>;

    /// Drain pending deliveries, then release resources
    async fn stop(&self) -> Result<()>;

    /// Queue a message for delivery to `receiver_id`, or to every subscriber
    /// except the sender when `receiver_id` is empty
    async fn publish(&self, message: Message) -> Result<()>;

    /// Route messages for `subscriber_id` into `inbox`, replacing any previous inbox
    async fn subscribe(&self, subscriber_id: &str, inbox: Inbox) -> Result<()>;

    async fn unsubscribe(&self, subscriber_id: &str) -> Result<()>;

    fn metrics(&self) -> BusMetrics;

    fn backend(&self) -> BusBackend;
}
