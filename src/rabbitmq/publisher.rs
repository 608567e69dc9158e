// src/rabbitmq/publisher.rs

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info};

use super::connection::ConnectionSupervisor;
use super::errors::Result;
use super::transport::PublishProperties;

/// Publishes JSON payloads on the shared channel.
///
/// Publishes are neither mandatory nor immediate: a routing key with no bound
/// queue drops the message silently. Unless publisher confirms are enabled
/// on the channel, success only means the broker accepted the frame.
pub struct Publisher {
    supervisor: Arc<ConnectionSupervisor>,
}

impl Publisher {
    pub fn new(supervisor: Arc<ConnectionSupervisor>) -> Self {
        Self { supervisor }
    }

    pub async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()> {
        let lease = self.supervisor.lease().map_err(|e| {
            error!(exchange, routing_key, error = %e, "Channel is not available");
            e
        })?;

        let properties = PublishProperties::json();
        lease
            .channel()?
            .publish(exchange, routing_key, payload, &properties)
            .await
            .map_err(|e| {
                error!(exchange, routing_key, error = %e, "Failed to publish message");
                e
            })?;

        info!(
            exchange,
            routing_key,
            message_id = %properties.message_id,
            bytes = payload.len(),
            "Message published successfully"
        );
        debug!(routing_key, body = %String::from_utf8_lossy(payload), "Published body");
        Ok(())
    }

    pub async fn publish_json<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &T,
    ) -> Result<()> {
        let payload = serde_json::to_vec(message)?;
        self.publish(exchange, routing_key, &payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rabbitmq::errors::RabbitMQError;
    use crate::rabbitmq::memory::InMemoryBroker;
    use crate::rabbitmq::queues::{QueueLifecycleManager, TENANT_EXCHANGE};
    use crate::rabbitmq::transport::ChannelConfig;
    use serde_json::json;

    async fn connected(broker: &InMemoryBroker) -> Arc<ConnectionSupervisor> {
        let supervisor = Arc::new(ConnectionSupervisor::new(
            Arc::new(broker.clone()),
            ChannelConfig::default(),
        ));
        supervisor.connect("amqp://memory").await.unwrap();
        supervisor
    }

    #[tokio::test]
    async fn publish_routes_only_to_the_tenant_queue() {
        let broker = InMemoryBroker::new();
        let supervisor = connected(&broker).await;
        let queues = QueueLifecycleManager::new(supervisor.clone());
        queues.provision_queue("tenantA").await.unwrap();
        queues.provision_queue("tenantB").await.unwrap();

        let publisher = Publisher::new(supervisor);
        publisher
            .publish_json(TENANT_EXCHANGE, "tenantA", &json!({"x": 1}))
            .await
            .unwrap();

        assert_eq!(broker.ready_count("tenantA"), Some(1));
        assert_eq!(broker.ready_count("tenantB"), Some(0));
    }

    #[tokio::test]
    async fn unbound_routing_key_is_accepted_and_dropped() {
        let broker = InMemoryBroker::new();
        let publisher = Publisher::new(connected(&broker).await);

        publisher
            .publish(TENANT_EXCHANGE, "nobody", b"{}")
            .await
            .unwrap();

        assert!(broker.queue_names().is_empty());
    }

    #[tokio::test]
    async fn publish_without_a_channel_is_not_connected() {
        let broker = InMemoryBroker::new();
        let supervisor = connected(&broker).await;
        let publisher = Publisher::new(supervisor.clone());
        broker.sever_connections();

        let result = publisher.publish(TENANT_EXCHANGE, "tenantA", b"{}").await;
        assert!(matches!(result, Err(RabbitMQError::NotConnected)));
    }
}
