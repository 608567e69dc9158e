// src/rabbitmq/transport.rs
// Broker client seam. The supervisor and everything above it only talk to
// these traits; `lapin_transport` and `memory` provide the implementations.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

use super::errors::Result;

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Value of the `x-queue-type` queue argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueType {
    Classic,
    Quorum,
}

impl QueueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueType::Classic => "classic",
            QueueType::Quorum => "quorum",
        }
    }
}

/// Attributes a queue is declared with. Redeclaring a queue with different
/// attributes is rejected by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub queue_type: QueueType,
}

impl QueueSpec {
    /// Durable quorum queue owned by a tenant
    pub fn tenant() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
            queue_type: QueueType::Quorum,
        }
    }
}

impl Default for QueueSpec {
    fn default() -> Self {
        Self::tenant()
    }
}

/// Configuration options for a broker channel
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Number of unacknowledged messages allowed per consumer (0 means unlimited)
    pub prefetch_count: u16,

    /// Whether publishes wait for a broker ack
    pub publisher_confirms: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            prefetch_count: 10,
            publisher_confirms: false,
        }
    }
}

impl ChannelConfig {
    /// Settings for short-lived channels used for a single topology operation
    pub fn one_shot() -> Self {
        Self {
            prefetch_count: 0,
            publisher_confirms: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PublishProperties {
    pub content_type: &'static str,
    pub message_id: String,
    pub timestamp: u64,
    pub persistent: bool,
}

impl PublishProperties {
    pub fn json() -> Self {
        Self {
            content_type: JSON_CONTENT_TYPE,
            message_id: Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().timestamp().max(0) as u64,
            persistent: true,
        }
    }
}

/// Settles a single delivery with the broker
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self) -> Result<()>;

    async fn reject(&self, requeue: bool) -> Result<()>;
}

/// A message handed to a consumer. Settling consumes the delivery, so a
/// delivery tag can be acknowledged or rejected at most once.
pub struct Delivery {
    pub delivery_tag: u64,
    pub data: Vec<u8>,
    pub redelivered: bool,
    acker: Box<dyn DeliveryAcker>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        data: Vec<u8>,
        redelivered: bool,
        acker: Box<dyn DeliveryAcker>,
    ) -> Self {
        Self {
            delivery_tag,
            data,
            redelivered,
            acker,
        }
    }

    pub fn body_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn reject(self, requeue: bool) -> Result<()> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("bytes", &self.data.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// One logical channel multiplexed over a connection
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn id(&self) -> u16;

    /// False once either the channel or its connection has closed
    fn is_open(&self) -> bool;

    /// Declare (or with `passive`, only look up) a queue. Returns the number
    /// of ready messages.
    async fn queue_declare(&self, queue: &str, spec: &QueueSpec, passive: bool) -> Result<u32>;

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Unconditional delete. Returns the number of messages discarded.
    async fn queue_delete(&self, queue: &str) -> Result<u32>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> Result<()>;

    /// Register a manual-ack, non-exclusive consumer
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn create_channel(&self, config: &ChannelConfig) -> Result<Arc<dyn BrokerChannel>>;

    async fn close(&self) -> Result<()>;
}

/// Dials the broker
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_queues_are_durable_quorum_queues() {
        let spec = QueueSpec::tenant();
        assert!(spec.durable);
        assert!(!spec.exclusive);
        assert!(!spec.auto_delete);
        assert_eq!(spec.queue_type.as_str(), "quorum");
    }

    #[test]
    fn json_properties_carry_a_fresh_message_id() {
        let first = PublishProperties::json();
        let second = PublishProperties::json();
        assert_eq!(first.content_type, "application/json");
        assert!(first.persistent);
        assert_ne!(first.message_id, second.message_id);
    }
}
