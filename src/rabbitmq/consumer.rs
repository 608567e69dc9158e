// src/rabbitmq/consumer.rs
// Per-queue consumption loops on the shared channel.
//
// Acknowledgement is best effort: a failed ack is logged and the loop moves
// on. The broker redelivers such a message only once the channel closes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::connection::ConnectionSupervisor;
use super::errors::{RabbitMQError, Result};
use super::queues::validate_queue_name;
use super::transport::{BrokerChannel, Delivery, DeliveryStream};

/// Processes a delivery before it is acknowledged. An error rejects the
/// delivery without requeueing it.
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    async fn handle(&self, queue: &str, delivery: &Delivery) -> anyhow::Result<()>;
}

/// Logs each body and accepts it
#[derive(Debug, Default, Clone)]
pub struct LoggingHandler;

#[async_trait]
impl DeliveryHandler for LoggingHandler {
    async fn handle(&self, queue: &str, delivery: &Delivery) -> anyhow::Result<()> {
        info!(
            queue,
            delivery_tag = delivery.delivery_tag,
            body = %delivery.body_lossy(),
            "Processing message"
        );
        Ok(())
    }
}

struct ActiveConsumer {
    consumer_tag: String,
    channel: Arc<dyn BrokerChannel>,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ActiveConsumer {
    async fn stop(self, queue: &str) {
        let _ = self.stop.send(true);
        if let Err(e) = self.handle.await {
            error!(queue, error = %e, "Consumer task failed");
        }

        if self.channel.is_open() {
            if let Err(e) = self.channel.cancel(&self.consumer_tag).await {
                warn!(queue, consumer_tag = %self.consumer_tag, error = %e, "Failed to cancel consumer");
            }
        }
        info!(queue, consumer_tag = %self.consumer_tag, "Consumer stopped");
    }
}

/// At most one live consumer per queue
pub struct ConsumerSupervisor {
    supervisor: Arc<ConnectionSupervisor>,
    handler: Arc<dyn DeliveryHandler>,
    consumers: Mutex<HashMap<String, ActiveConsumer>>,
}

impl ConsumerSupervisor {
    pub fn new(supervisor: Arc<ConnectionSupervisor>, handler: Arc<dyn DeliveryHandler>) -> Self {
        Self {
            supervisor,
            handler,
            consumers: Mutex::new(HashMap::new()),
        }
    }

    /// Register a manual-ack consumer on `queue` and spawn its loop
    pub async fn start_consuming(&self, queue: &str) -> Result<()> {
        validate_queue_name(queue)?;
        let mut consumers = self.consumers.lock().await;

        if let Some(existing) = consumers.get(queue) {
            if !existing.handle.is_finished() {
                warn!(queue, "Queue already has an active consumer");
                return Err(RabbitMQError::Conflict(format!(
                    "queue '{}' already has an active consumer",
                    queue
                )));
            }
            consumers.remove(queue);
        }

        let lease = self.supervisor.lease()?;
        let channel = lease.channel()?.clone();
        let consumer_tag = format!("{}-{}", queue, &Uuid::new_v4().simple().to_string()[..8]);

        let deliveries = channel.consume(queue, &consumer_tag).await.map_err(|e| {
            error!(queue, error = %e, "Failed to register consumer");
            e
        })?;
        info!(queue, consumer_tag = %consumer_tag, "Consumer started successfully");

        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(consume_loop(
            queue.to_string(),
            deliveries,
            self.handler.clone(),
            stop_rx,
        ));

        consumers.insert(
            queue.to_string(),
            ActiveConsumer {
                consumer_tag,
                channel,
                stop,
                handle,
            },
        );
        Ok(())
    }

    /// Stop the loop for `queue`. Returns false if none was running.
    pub async fn stop_consuming(&self, queue: &str) -> bool {
        let removed = self.consumers.lock().await.remove(queue);
        match removed {
            Some(consumer) => {
                consumer.stop(queue).await;
                true
            }
            None => false,
        }
    }

    /// Queues with a running loop
    pub async fn active_queues(&self) -> Vec<String> {
        let consumers = self.consumers.lock().await;
        let mut queues: Vec<String> = consumers
            .iter()
            .filter(|(_, c)| !c.handle.is_finished())
            .map(|(queue, _)| queue.clone())
            .collect();
        queues.sort();
        queues
    }

    /// Stop every loop. Must run before the channel is closed.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, ActiveConsumer)> =
            self.consumers.lock().await.drain().collect();
        for (queue, consumer) in drained {
            consumer.stop(&queue).await;
        }
    }
}

async fn consume_loop(
    queue: String,
    mut deliveries: DeliveryStream,
    handler: Arc<dyn DeliveryHandler>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let next = tokio::select! {
            biased;
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
                continue;
            }
            next = deliveries.next() => next,
        };

        match next {
            Some(Ok(delivery)) => process(&queue, delivery, handler.as_ref()).await,
            Some(Err(e)) => {
                error!(queue = %queue, error = %e, "Error receiving message");
                break;
            }
            None => {
                info!(queue = %queue, "Consumer stream ended");
                break;
            }
        }
    }
    debug!(queue = %queue, "Consumer loop exited");
}

async fn process(queue: &str, delivery: Delivery, handler: &dyn DeliveryHandler) {
    let delivery_tag = delivery.delivery_tag;

    match handler.handle(queue, &delivery).await {
        Ok(()) => match delivery.ack().await {
            Ok(()) => info!(queue, delivery_tag, "Message acknowledged"),
            Err(e) => error!(queue, delivery_tag, error = %e, "Failed to acknowledge message"),
        },
        Err(e) => {
            warn!(queue, delivery_tag, error = %e, "Handler failed, rejecting message");
            if let Err(e) = delivery.reject(false).await {
                error!(queue, delivery_tag, error = %e, "Failed to reject message");
            }
        }
    }
}
