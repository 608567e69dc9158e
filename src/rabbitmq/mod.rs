// src/rabbitmq/mod.rs
// Broker supervision and tenant queue lifecycle

pub mod broker;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod lapin_transport;
pub mod memory;
pub mod monitor;
pub mod publisher;
pub mod queues;
pub mod transport;

// Re-export specific items to simplify imports elsewhere
pub use broker::TenantBroker;
pub use connection::{ChannelLease, ConnectionState, ConnectionSupervisor};
pub use consumer::{ConsumerSupervisor, DeliveryHandler, LoggingHandler};
pub use errors::{RabbitMQError, Result};
pub use lapin_transport::LapinConnector;
pub use memory::InMemoryBroker;
pub use monitor::{HealthMonitor, DEFAULT_HEALTH_CHECK_INTERVAL};
pub use publisher::Publisher;
pub use queues::{QueueLifecycleManager, TENANT_EXCHANGE};
pub use transport::{ChannelConfig, Delivery, QueueSpec, QueueType, JSON_CONTENT_TYPE};
