// src/rabbitmq/broker.rs
// Inbound boundary used by the tenant and HTTP layers

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::info;

use super::connection::{ConnectionState, ConnectionSupervisor};
use super::consumer::{ConsumerSupervisor, DeliveryHandler, LoggingHandler};
use super::errors::Result;
use super::lapin_transport::LapinConnector;
use super::monitor::HealthMonitor;
use super::publisher::Publisher;
use super::queues::QueueLifecycleManager;
use super::transport::{ChannelConfig, Connector};

pub struct TenantBroker {
    supervisor: Arc<ConnectionSupervisor>,
    queues: QueueLifecycleManager,
    publisher: Publisher,
    consumers: ConsumerSupervisor,
    monitor: Mutex<Option<HealthMonitor>>,
}

impl TenantBroker {
    pub fn new(
        connector: Arc<dyn Connector>,
        channel_config: ChannelConfig,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Self {
        let supervisor = Arc::new(ConnectionSupervisor::new(connector, channel_config));
        Self {
            queues: QueueLifecycleManager::new(supervisor.clone()),
            publisher: Publisher::new(supervisor.clone()),
            consumers: ConsumerSupervisor::new(supervisor.clone(), handler),
            supervisor,
            monitor: Mutex::new(None),
        }
    }

    /// lapin-backed broker that logs consumed messages
    pub fn lapin(channel_config: ChannelConfig) -> Self {
        Self::new(
            Arc::new(LapinConnector),
            channel_config,
            Arc::new(LoggingHandler),
        )
    }

    /// Bind tenant queues to `exchange` instead of `amq.direct`
    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.queues = self.queues.with_exchange(exchange);
        self
    }

    /// Exchange tenant queues are bound to
    pub fn exchange(&self) -> &str {
        self.queues.exchange()
    }

    pub fn supervisor(&self) -> &Arc<ConnectionSupervisor> {
        &self.supervisor
    }

    pub fn queues(&self) -> &QueueLifecycleManager {
        &self.queues
    }

    pub fn state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    pub async fn establish_connection(&self, uri: &str) -> Result<()> {
        self.supervisor.connect(uri).await
    }

    pub fn healthy(&self) -> bool {
        self.supervisor.is_healthy()
    }

    pub async fn provision_queue(&self, tenant: &str) -> Result<()> {
        self.queues.provision_queue(tenant).await
    }

    pub async fn decommission_queue(&self, tenant: &str) -> Result<u32> {
        self.queues.decommission_queue(tenant).await
    }

    pub async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()> {
        self.publisher.publish(exchange, routing_key, payload).await
    }

    pub async fn publish_json<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &T,
    ) -> Result<()> {
        self.publisher
            .publish_json(exchange, routing_key, message)
            .await
    }

    pub async fn start_consuming(&self, queue: &str) -> Result<()> {
        self.consumers.start_consuming(queue).await
    }

    pub async fn stop_consuming(&self, queue: &str) -> bool {
        self.consumers.stop_consuming(queue).await
    }

    pub async fn active_consumers(&self) -> Vec<String> {
        self.consumers.active_queues().await
    }

    /// Start the reconnect loop, replacing any running one
    pub async fn start_health_monitor(&self, uri: &str, period: Duration) {
        let mut monitor = self.monitor.lock().await;
        if let Some(previous) = monitor.take() {
            previous.stop().await;
        }
        *monitor = Some(HealthMonitor::spawn(
            self.supervisor.clone(),
            uri.to_string(),
            period,
        ));
    }

    /// Health monitor, then consumers, then channel and connection
    pub async fn shutdown(&self) {
        info!("Shutting down tenant broker");
        if let Some(monitor) = self.monitor.lock().await.take() {
            monitor.stop().await;
        }
        self.consumers.shutdown().await;
        self.supervisor.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rabbitmq::errors::RabbitMQError;
    use crate::rabbitmq::memory::InMemoryBroker;

    #[tokio::test]
    async fn configured_exchange_routes_to_tenant_queues() {
        let broker = InMemoryBroker::new();
        broker.declare_direct_exchange("tenants.direct");
        let tenants = TenantBroker::new(
            Arc::new(broker.clone()),
            ChannelConfig::default(),
            Arc::new(LoggingHandler),
        )
        .with_exchange("tenants.direct");
        tenants.establish_connection("amqp://memory").await.unwrap();

        tenants.provision_queue("tenantA").await.unwrap();
        tenants.publish(tenants.exchange(), "tenantA", b"{}").await.unwrap();

        assert_eq!(tenants.exchange(), "tenants.direct");
        assert_eq!(broker.ready_count("tenantA"), Some(1));
        tenants.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_everything_in_order() {
        let broker = InMemoryBroker::new();
        let tenants = TenantBroker::new(
            Arc::new(broker.clone()),
            ChannelConfig::default(),
            Arc::new(LoggingHandler),
        );
        tenants.establish_connection("amqp://memory").await.unwrap();
        tenants
            .start_health_monitor("amqp://memory", Duration::from_secs(10))
            .await;
        tenants.provision_queue("tenantA").await.unwrap();
        tenants.start_consuming("tenantA").await.unwrap();

        tenants.shutdown().await;

        assert_eq!(tenants.state(), ConnectionState::Disconnected);
        assert!(!tenants.healthy());
        assert!(tenants.active_consumers().await.is_empty());
        assert_eq!(broker.consumer_count("tenantA"), 0);
        assert_eq!(broker.open_connections(), 0);
        assert!(matches!(
            tenants.publish("amq.direct", "tenantA", b"{}").await,
            Err(RabbitMQError::NotConnected)
        ));
    }
}
