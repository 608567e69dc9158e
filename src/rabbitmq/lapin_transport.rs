// src/rabbitmq/lapin_transport.rs
// Broker seam implemented over lapin

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, QueueBindOptions, QueueDeclareOptions,
    QueueDeleteOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::debug;

use super::errors::{RabbitMQError, Result};
use super::transport::{
    BrokerChannel, BrokerConnection, ChannelConfig, Connector, Delivery, DeliveryAcker,
    DeliveryStream, PublishProperties, QueueSpec,
};

const REPLY_SUCCESS: u16 = 200;
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Dials RabbitMQ with lapin
#[derive(Debug, Default, Clone)]
pub struct LapinConnector;

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>> {
        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(|e| RabbitMQError::Connection(format!("Failed to connect: {}", e)))?;

        Ok(Arc::new(LapinConnection { inner: connection }))
    }
}

pub struct LapinConnection {
    inner: Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    fn is_connected(&self) -> bool {
        self.inner.status().connected()
    }

    async fn create_channel(&self, config: &ChannelConfig) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self
            .inner
            .create_channel()
            .await
            .map_err(|e| RabbitMQError::Connection(format!("Failed to create channel: {}", e)))?;

        if config.prefetch_count > 0 {
            channel
                .basic_qos(config.prefetch_count, BasicQosOptions::default())
                .await?;
        }

        if config.publisher_confirms {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await?;
        }

        debug!(
            channel_id = channel.id(),
            prefetch = config.prefetch_count,
            confirm = config.publisher_confirms,
            "Channel configured"
        );

        Ok(Arc::new(LapinChannel {
            inner: channel,
            confirms: config.publisher_confirms,
        }))
    }

    async fn close(&self) -> Result<()> {
        self.inner
            .close(REPLY_SUCCESS, "Closing connection")
            .await
            .map_err(RabbitMQError::from)
    }
}

pub struct LapinChannel {
    inner: Channel,
    confirms: bool,
}

fn queue_arguments(spec: &QueueSpec) -> FieldTable {
    let mut arguments = FieldTable::default();
    arguments.insert(
        "x-queue-type".into(),
        AMQPValue::LongString(spec.queue_type.as_str().into()),
    );
    arguments
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    fn id(&self) -> u16 {
        self.inner.id()
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn queue_declare(&self, queue: &str, spec: &QueueSpec, passive: bool) -> Result<u32> {
        let options = QueueDeclareOptions {
            passive,
            durable: spec.durable,
            exclusive: spec.exclusive,
            auto_delete: spec.auto_delete,
            nowait: false,
        };

        let declared = self
            .inner
            .queue_declare(queue, options, queue_arguments(spec))
            .await?;

        Ok(declared.message_count())
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(RabbitMQError::from)
    }

    async fn queue_delete(&self, queue: &str) -> Result<u32> {
        self.inner
            .queue_delete(queue, QueueDeleteOptions::default())
            .await
            .map_err(RabbitMQError::from)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> Result<()> {
        let mut amqp_properties = BasicProperties::default()
            .with_content_type(properties.content_type.into())
            .with_message_id(properties.message_id.as_str().into())
            .with_timestamp(properties.timestamp);
        if properties.persistent {
            amqp_properties = amqp_properties.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
        }

        // mandatory and immediate stay off: unroutable messages are dropped
        let confirm = self
            .inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                amqp_properties,
            )
            .await?;

        if self.confirms {
            let confirmation = confirm.await?;
            if confirmation.is_nack() {
                return Err(RabbitMQError::BrokerOperation(format!(
                    "Broker nacked message {}",
                    properties.message_id
                )));
            }
        }

        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    exclusive: false,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        Ok(consumer
            .map(|result| result.map(LapinAcker::wrap).map_err(RabbitMQError::from))
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.inner
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(RabbitMQError::from)
    }

    async fn close(&self) -> Result<()> {
        self.inner
            .close(REPLY_SUCCESS, "Closing channel")
            .await
            .map_err(RabbitMQError::from)
    }
}

/// Keeps the lapin delivery (minus its body) for its acker
struct LapinAcker {
    delivery: lapin::message::Delivery,
}

impl LapinAcker {
    fn wrap(mut delivery: lapin::message::Delivery) -> Delivery {
        let data = std::mem::take(&mut delivery.data);
        Delivery::new(
            delivery.delivery_tag,
            data,
            delivery.redelivered,
            Box::new(LapinAcker { delivery }),
        )
    }
}

#[async_trait]
impl DeliveryAcker for LapinAcker {
    async fn ack(&self) -> Result<()> {
        self.delivery
            .acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(RabbitMQError::from)
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.delivery
            .acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map(|_| ())
            .map_err(RabbitMQError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rabbitmq::transport::QueueType;
    use lapin::types::ShortString;

    fn queue_type(arguments: &FieldTable) -> Option<&AMQPValue> {
        arguments.inner().get(&ShortString::from("x-queue-type"))
    }

    #[test]
    fn queue_arguments_carry_queue_type() {
        let arguments = queue_arguments(&QueueSpec::tenant());
        assert_eq!(
            queue_type(&arguments),
            Some(&AMQPValue::LongString("quorum".into()))
        );

        let classic = QueueSpec {
            queue_type: QueueType::Classic,
            ..QueueSpec::tenant()
        };
        let arguments = queue_arguments(&classic);
        assert_eq!(
            queue_type(&arguments),
            Some(&AMQPValue::LongString("classic".into()))
        );
    }
}
