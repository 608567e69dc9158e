// src/rabbitmq/queues.rs
// Tenant queue lifecycle: one durable quorum queue per tenant, bound to the
// shared direct exchange under the tenant's name.

use std::sync::Arc;

use tracing::{error, info, warn};

use super::connection::ConnectionSupervisor;
use super::errors::{RabbitMQError, Result};
use super::transport::{BrokerChannel, QueueSpec};

pub const TENANT_EXCHANGE: &str = "amq.direct";

const MAX_QUEUE_NAME_LEN: usize = 255;
const RESERVED_PREFIX: &str = "amq.";

/// Reject names the broker would refuse as a queue name
pub fn validate_queue_name(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        "name is empty"
    } else if name.len() > MAX_QUEUE_NAME_LEN {
        "name is longer than 255 bytes"
    } else if name.starts_with(RESERVED_PREFIX) {
        "the amq. prefix is reserved"
    } else {
        return Ok(());
    };

    Err(RabbitMQError::InvalidQueueName {
        name: name.to_string(),
        reason,
    })
}

pub struct QueueLifecycleManager {
    supervisor: Arc<ConnectionSupervisor>,
    exchange: String,
    spec: QueueSpec,
}

impl QueueLifecycleManager {
    pub fn new(supervisor: Arc<ConnectionSupervisor>) -> Self {
        Self {
            supervisor,
            exchange: TENANT_EXCHANGE.to_string(),
            spec: QueueSpec::tenant(),
        }
    }

    /// Declare queues with different attributes
    pub fn with_queue_spec(mut self, spec: QueueSpec) -> Self {
        self.spec = spec;
        self
    }

    /// Bind tenant queues to a pre-declared direct exchange other than
    /// `amq.direct`
    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Declare the tenant's queue and bind it under the tenant name.
    /// Redeclaring an identical queue is a no-op.
    pub async fn provision_queue(&self, tenant: &str) -> Result<()> {
        validate_queue_name(tenant)?;
        let lease = self.supervisor.lease()?;

        let ready = lease
            .channel()?
            .queue_declare(tenant, &self.spec, false)
            .await
            .map_err(|e| {
                error!(queue = tenant, error = %e, "Failed to declare queue");
                e
            })?;
        info!(
            queue = tenant,
            queue_type = self.spec.queue_type.as_str(),
            message_count = ready,
            "Queue declared successfully"
        );

        lease
            .channel()?
            .queue_bind(tenant, &self.exchange, tenant)
            .await
            .map_err(|e| {
                error!(
                    queue = tenant,
                    exchange = %self.exchange,
                    routing_key = tenant,
                    error = %e,
                    "Failed to bind queue to exchange"
                );
                e
            })?;
        info!(
            queue = tenant,
            exchange = %self.exchange,
            routing_key = tenant,
            "Queue bound to exchange successfully"
        );

        Ok(())
    }

    /// Delete the tenant's queue whatever it still holds. Returns the number
    /// of messages discarded. A missing queue is an error.
    pub async fn decommission_queue(&self, tenant: &str) -> Result<u32> {
        validate_queue_name(tenant)?;
        let channel = self.supervisor.open_dedicated_channel().await?;

        let result = self.delete_on(channel.as_ref(), tenant).await;
        release(channel.as_ref(), tenant).await;

        match result {
            Ok(message_count) => {
                info!(queue = tenant, message_count, "Queue deleted successfully");
                Ok(message_count)
            }
            Err(e) => {
                error!(queue = tenant, error = %e, "Failed to delete queue");
                Err(e)
            }
        }
    }

    async fn delete_on(&self, channel: &dyn BrokerChannel, tenant: &str) -> Result<u32> {
        // queue.delete succeeds on a missing queue, so look it up first
        channel
            .queue_declare(tenant, &self.spec, true)
            .await
            .map_err(|e| not_found_as(e, tenant))?;
        channel.queue_delete(tenant).await
    }

    /// Ready messages in the tenant's queue
    pub async fn queue_depth(&self, tenant: &str) -> Result<u32> {
        validate_queue_name(tenant)?;
        let channel = self.supervisor.open_dedicated_channel().await?;

        let result = channel
            .queue_declare(tenant, &self.spec, true)
            .await
            .map_err(|e| not_found_as(e, tenant));
        release(channel.as_ref(), tenant).await;

        result
    }
}

fn not_found_as(error: RabbitMQError, queue: &str) -> RabbitMQError {
    match error {
        RabbitMQError::QueueNotFound(_) => RabbitMQError::QueueNotFound(queue.to_string()),
        other => other,
    }
}

/// Close a one-shot channel unless the broker already did
async fn release(channel: &dyn BrokerChannel, queue: &str) {
    if !channel.is_open() {
        return;
    }
    if let Err(e) = channel.close().await {
        warn!(queue, channel_id = channel.id(), error = %e, "Failed to close dedicated channel");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rabbitmq::memory::InMemoryBroker;
    use crate::rabbitmq::transport::{ChannelConfig, PublishProperties, QueueType};

    async fn connected(broker: &InMemoryBroker) -> Arc<ConnectionSupervisor> {
        let supervisor = Arc::new(ConnectionSupervisor::new(
            Arc::new(broker.clone()),
            ChannelConfig::default(),
        ));
        supervisor.connect("amqp://memory").await.unwrap();
        supervisor
    }

    #[test]
    fn queue_names_are_validated() {
        assert!(validate_queue_name("tenantA").is_ok());
        assert!(validate_queue_name("").is_err());
        assert!(validate_queue_name("amq.tenant").is_err());
        assert!(validate_queue_name(&"x".repeat(256)).is_err());
        assert!(validate_queue_name(&"x".repeat(255)).is_ok());
    }

    #[tokio::test]
    async fn provision_declares_and_binds() {
        let broker = InMemoryBroker::new();
        let manager = QueueLifecycleManager::new(connected(&broker).await);

        manager.provision_queue("tenantA").await.unwrap();

        assert_eq!(broker.queue_spec("tenantA"), Some(QueueSpec::tenant()));
        assert_eq!(
            broker.bindings_for("tenantA"),
            vec![("amq.direct".to_string(), "tenantA".to_string())]
        );
    }

    #[tokio::test]
    async fn provision_binds_to_the_configured_exchange() {
        let broker = InMemoryBroker::new();
        broker.declare_direct_exchange("tenants.direct");
        let manager =
            QueueLifecycleManager::new(connected(&broker).await).with_exchange("tenants.direct");
        assert_eq!(manager.exchange(), "tenants.direct");

        manager.provision_queue("tenantA").await.unwrap();

        assert_eq!(
            broker.bindings_for("tenantA"),
            vec![("tenants.direct".to_string(), "tenantA".to_string())]
        );
    }

    #[tokio::test]
    async fn provision_is_idempotent() {
        let broker = InMemoryBroker::new();
        let manager = QueueLifecycleManager::new(connected(&broker).await);

        manager.provision_queue("tenantA").await.unwrap();
        manager.provision_queue("tenantA").await.unwrap();

        assert_eq!(broker.queue_names(), vec!["tenantA".to_string()]);
        assert_eq!(broker.bindings_for("tenantA").len(), 1);
    }

    #[tokio::test]
    async fn conflicting_attributes_are_a_conflict() {
        let broker = InMemoryBroker::new();
        let supervisor = connected(&broker).await;
        QueueLifecycleManager::new(supervisor.clone())
            .provision_queue("tenantA")
            .await
            .unwrap();

        let classic = QueueLifecycleManager::new(supervisor.clone()).with_queue_spec(QueueSpec {
            queue_type: QueueType::Classic,
            ..QueueSpec::tenant()
        });
        let result = classic.provision_queue("tenantA").await;

        assert!(matches!(result, Err(RabbitMQError::Conflict(_))));
        // the broker closed the shared channel
        assert!(!supervisor.is_healthy());
    }

    #[tokio::test]
    async fn decommission_returns_the_discarded_count() {
        let broker = InMemoryBroker::new();
        let supervisor = connected(&broker).await;
        let manager = QueueLifecycleManager::new(supervisor.clone());
        manager.provision_queue("tenantA").await.unwrap();

        let channel = supervisor.lease().unwrap().channel().unwrap().clone();
        for _ in 0..3 {
            channel
                .publish(TENANT_EXCHANGE, "tenantA", b"{}", &PublishProperties::json())
                .await
                .unwrap();
        }
        assert_eq!(manager.queue_depth("tenantA").await.unwrap(), 3);

        assert_eq!(manager.decommission_queue("tenantA").await.unwrap(), 3);
        assert!(!broker.has_queue("tenantA"));
        assert!(broker.bindings_for("tenantA").is_empty());
        assert!(supervisor.is_healthy());
    }

    #[tokio::test]
    async fn decommissioning_a_missing_queue_fails() {
        let broker = InMemoryBroker::new();
        let supervisor = connected(&broker).await;
        let manager = QueueLifecycleManager::new(supervisor.clone());

        let result = manager.decommission_queue("ghost").await;

        match result {
            Err(RabbitMQError::QueueNotFound(queue)) => assert_eq!(queue, "ghost"),
            other => panic!("unexpected result: {:?}", other),
        }
        // only the dedicated channel was lost
        assert!(supervisor.is_healthy());
    }

    #[tokio::test]
    async fn operations_fail_fast_without_a_connection() {
        let broker = InMemoryBroker::new();
        let supervisor = Arc::new(ConnectionSupervisor::new(
            Arc::new(broker.clone()),
            ChannelConfig::default(),
        ));
        let manager = QueueLifecycleManager::new(supervisor);

        assert!(matches!(
            manager.provision_queue("tenantA").await,
            Err(RabbitMQError::NotConnected)
        ));
        assert!(matches!(
            manager.decommission_queue("tenantA").await,
            Err(RabbitMQError::NotConnected)
        ));
    }
}
