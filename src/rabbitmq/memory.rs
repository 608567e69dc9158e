// src/rabbitmq/memory.rs
// In-process broker for tests and local demos. It follows the AMQP 0-9-1
// behaviour the supervisor relies on: soft errors close the channel, closing
// a channel requeues its unacked messages, unroutable publishes are dropped
// and queue.delete on a missing queue succeeds with a count of zero.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use tracing::debug;

use super::errors::{RabbitMQError, Result};
use super::transport::{
    BrokerChannel, BrokerConnection, ChannelConfig, Connector, Delivery, DeliveryAcker,
    DeliveryStream, PublishProperties, QueueSpec,
};

const DEFAULT_EXCHANGE: &str = "";
const DIRECT_EXCHANGE: &str = "amq.direct";

#[derive(Clone)]
struct StoredMessage {
    body: Vec<u8>,
    redelivered: bool,
}

struct MemConsumer {
    tag: String,
    channel_key: u64,
    channel_open: Arc<AtomicBool>,
    connection_open: Arc<AtomicBool>,
    sender: UnboundedSender<Result<Delivery>>,
}

struct MemQueue {
    spec: QueueSpec,
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, (u64, StoredMessage)>,
    consumers: Vec<MemConsumer>,
    next_consumer: usize,
}

impl MemQueue {
    fn new(spec: QueueSpec) -> Self {
        Self {
            spec,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            consumers: Vec::new(),
            next_consumer: 0,
        }
    }

    /// Round-robin ready messages to consumers until one side runs dry
    fn dispatch(&mut self, name: &str, next_tag: &mut u64, broker: &InMemoryBroker) {
        while !self.consumers.is_empty() {
            let Some(message) = self.ready.pop_front() else {
                break;
            };

            let index = self.next_consumer % self.consumers.len();
            *next_tag += 1;
            let tag = *next_tag;

            let consumer = &self.consumers[index];
            let channel_key = consumer.channel_key;
            let acker = MemAcker {
                broker: broker.clone(),
                queue: name.to_string(),
                tag,
                channel_open: consumer.channel_open.clone(),
                connection_open: consumer.connection_open.clone(),
            };
            let delivery = Delivery::new(
                tag,
                message.body.clone(),
                message.redelivered,
                Box::new(acker),
            );

            if consumer.sender.unbounded_send(Ok(delivery)).is_err() {
                // receiver went away without a cancel
                self.consumers.remove(index);
                self.ready.push_front(message);
                continue;
            }

            self.unacked.insert(tag, (channel_key, message));
            self.next_consumer = index + 1;
        }
    }
}

struct Binding {
    exchange: String,
    routing_key: String,
    queue: String,
}

struct ConnectionRecord {
    open: Arc<AtomicBool>,
    channels: Vec<(u64, Arc<AtomicBool>)>,
}

#[derive(Default)]
struct BrokerState {
    unreachable: bool,
    queues: HashMap<String, MemQueue>,
    bindings: Vec<Binding>,
    // declared on top of the built-in amq.direct
    direct_exchanges: HashSet<String>,
    connections: HashMap<u64, ConnectionRecord>,
    next_key: u64,
    next_delivery_tag: u64,
}

impl BrokerState {
    fn is_direct_exchange(&self, exchange: &str) -> bool {
        exchange == DIRECT_EXCHANGE || self.direct_exchanges.contains(exchange)
    }
}

/// Shared in-process broker. Clones share state.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Declare a durable direct exchange next to `amq.direct`
    pub fn declare_direct_exchange(&self, exchange: &str) {
        self.lock().direct_exchanges.insert(exchange.to_string());
    }

    /// While unreachable every dial fails
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().unreachable = !reachable;
    }

    /// Drop every open connection, the way a network partition or broker
    /// restart would.
    pub fn sever_connections(&self) {
        let mut state = self.lock();
        let records: Vec<ConnectionRecord> = state.connections.drain().map(|(_, r)| r).collect();
        for record in records {
            record.open.store(false, Ordering::SeqCst);
            for (channel_key, channel_open) in record.channels {
                channel_open.store(false, Ordering::SeqCst);
                self.release_channel(&mut state, channel_key);
            }
        }
        debug!("In-memory broker severed all connections");
    }

    pub fn open_connections(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn queue_spec(&self, queue: &str) -> Option<QueueSpec> {
        self.lock().queues.get(queue).map(|q| q.spec.clone())
    }

    /// Messages waiting for a consumer
    pub fn ready_count(&self, queue: &str) -> Option<usize> {
        self.lock().queues.get(queue).map(|q| q.ready.len())
    }

    /// Messages delivered but not yet settled
    pub fn unacked_count(&self, queue: &str) -> Option<usize> {
        self.lock().queues.get(queue).map(|q| q.unacked.len())
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    /// (exchange, routing key) pairs bound to `queue`
    pub fn bindings_for(&self, queue: &str) -> Vec<(String, String)> {
        self.lock()
            .bindings
            .iter()
            .filter(|b| b.queue == queue)
            .map(|b| (b.exchange.clone(), b.routing_key.clone()))
            .collect()
    }

    fn next_key(state: &mut BrokerState) -> u64 {
        state.next_key += 1;
        state.next_key
    }

    /// Cancel the channel's consumers and requeue what it left unacked
    fn release_channel(&self, state: &mut BrokerState, channel_key: u64) {
        let BrokerState {
            queues,
            next_delivery_tag,
            ..
        } = state;

        for (name, queue) in queues.iter_mut() {
            queue.consumers.retain(|c| c.channel_key != channel_key);

            let mut orphaned: Vec<u64> = queue
                .unacked
                .iter()
                .filter(|(_, (key, _))| *key == channel_key)
                .map(|(tag, _)| *tag)
                .collect();
            orphaned.sort_unstable();

            for tag in orphaned.into_iter().rev() {
                if let Some((_, mut message)) = queue.unacked.remove(&tag) {
                    message.redelivered = true;
                    queue.ready.push_front(message);
                }
            }

            queue.dispatch(name, next_delivery_tag, self);
        }
    }

    fn settle(&self, queue: &str, tag: u64, requeue: Option<bool>) -> Result<()> {
        let mut state = self.lock();
        let BrokerState {
            queues,
            next_delivery_tag,
            ..
        } = &mut *state;

        let unknown_tag = || {
            RabbitMQError::BrokerOperation(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                tag
            ))
        };

        let target = queues.get_mut(queue).ok_or_else(unknown_tag)?;
        let (_, mut message) = target.unacked.remove(&tag).ok_or_else(unknown_tag)?;

        if requeue == Some(true) {
            message.redelivered = true;
            target.ready.push_front(message);
            target.dispatch(queue, next_delivery_tag, self);
        }

        Ok(())
    }
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn connect(&self, _uri: &str) -> Result<Arc<dyn BrokerConnection>> {
        let mut state = self.lock();
        if state.unreachable {
            return Err(RabbitMQError::Connection(
                "Failed to connect: connection refused".to_string(),
            ));
        }

        let key = Self::next_key(&mut state);
        let open = Arc::new(AtomicBool::new(true));
        state.connections.insert(
            key,
            ConnectionRecord {
                open: open.clone(),
                channels: Vec::new(),
            },
        );

        Ok(Arc::new(MemConnection {
            broker: self.clone(),
            key,
            open,
            next_channel_id: AtomicU16::new(0),
        }))
    }
}

struct MemConnection {
    broker: InMemoryBroker,
    key: u64,
    open: Arc<AtomicBool>,
    next_channel_id: AtomicU16,
}

#[async_trait]
impl BrokerConnection for MemConnection {
    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn create_channel(&self, _config: &ChannelConfig) -> Result<Arc<dyn BrokerChannel>> {
        let mut state = self.broker.lock();
        if !self.is_connected() {
            return Err(RabbitMQError::Connection(
                "Failed to create channel: connection is closed".to_string(),
            ));
        }

        let key = InMemoryBroker::next_key(&mut state);
        let channel_open = Arc::new(AtomicBool::new(true));
        if let Some(record) = state.connections.get_mut(&self.key) {
            record.channels.push((key, channel_open.clone()));
        }

        Ok(Arc::new(MemChannel {
            broker: self.broker.clone(),
            key,
            id: self.next_channel_id.fetch_add(1, Ordering::SeqCst) + 1,
            open: channel_open,
            connection_open: self.open.clone(),
        }))
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.broker.lock();
        if !self.open.swap(false, Ordering::SeqCst) {
            return Err(RabbitMQError::NotConnected);
        }

        if let Some(record) = state.connections.remove(&self.key) {
            for (channel_key, channel_open) in record.channels {
                channel_open.store(false, Ordering::SeqCst);
                self.broker.release_channel(&mut state, channel_key);
            }
        }
        Ok(())
    }
}

struct MemChannel {
    broker: InMemoryBroker,
    key: u64,
    id: u16,
    open: Arc<AtomicBool>,
    connection_open: Arc<AtomicBool>,
}

impl MemChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(RabbitMQError::NotConnected)
        }
    }

    /// Channel-level exception: the broker closes the channel
    fn fail(&self, state: &mut BrokerState, error: RabbitMQError) -> RabbitMQError {
        self.open.store(false, Ordering::SeqCst);
        self.broker.release_channel(state, self.key);
        error
    }
}

#[async_trait]
impl BrokerChannel for MemChannel {
    fn id(&self) -> u16 {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.connection_open.load(Ordering::SeqCst)
    }

    async fn queue_declare(&self, queue: &str, spec: &QueueSpec, passive: bool) -> Result<u32> {
        self.ensure_open()?;
        let mut state = self.broker.lock();

        let existing = state
            .queues
            .get(queue)
            .map(|q| (q.spec == *spec, q.ready.len() as u32));

        match existing {
            Some((equivalent, ready)) if passive || equivalent => Ok(ready),
            Some(_) => Err(self.fail(
                &mut state,
                RabbitMQError::Conflict(format!(
                    "PRECONDITION_FAILED - inequivalent arguments for queue '{}'",
                    queue
                )),
            )),
            None if passive => Err(self.fail(
                &mut state,
                RabbitMQError::QueueNotFound(format!("NOT_FOUND - no queue '{}'", queue)),
            )),
            None => {
                state
                    .queues
                    .insert(queue.to_string(), MemQueue::new(spec.clone()));
                Ok(0)
            }
        }
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.lock();

        if exchange == DEFAULT_EXCHANGE {
            return Err(self.fail(
                &mut state,
                RabbitMQError::BrokerOperation(
                    "ACCESS_REFUSED - operation not permitted on the default exchange".to_string(),
                ),
            ));
        }
        if !state.is_direct_exchange(exchange) {
            return Err(self.fail(
                &mut state,
                RabbitMQError::BrokerOperation(format!("NOT_FOUND - no exchange '{}'", exchange)),
            ));
        }
        if !state.queues.contains_key(queue) {
            return Err(self.fail(
                &mut state,
                RabbitMQError::QueueNotFound(format!("NOT_FOUND - no queue '{}'", queue)),
            ));
        }

        let exists = state
            .bindings
            .iter()
            .any(|b| b.exchange == exchange && b.routing_key == routing_key && b.queue == queue);
        if !exists {
            state.bindings.push(Binding {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                queue: queue.to_string(),
            });
        }
        Ok(())
    }

    async fn queue_delete(&self, queue: &str) -> Result<u32> {
        self.ensure_open()?;
        let mut state = self.broker.lock();

        state.bindings.retain(|b| b.queue != queue);
        Ok(state
            .queues
            .remove(queue)
            .map_or(0, |removed| removed.ready.len() as u32))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        _properties: &PublishProperties,
    ) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.lock();

        let targets: Vec<String> = match exchange {
            DEFAULT_EXCHANGE => state
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect(),
            _ if state.is_direct_exchange(exchange) => state
                .bindings
                .iter()
                .filter(|b| b.exchange == exchange && b.routing_key == routing_key)
                .map(|b| b.queue.clone())
                .collect(),
            _ => {
                return Err(self.fail(
                    &mut state,
                    RabbitMQError::BrokerOperation(format!(
                        "NOT_FOUND - no exchange '{}'",
                        exchange
                    )),
                ))
            }
        };

        let BrokerState {
            queues,
            next_delivery_tag,
            ..
        } = &mut *state;
        for name in targets {
            if let Some(queue) = queues.get_mut(&name) {
                queue.ready.push_back(StoredMessage {
                    body: payload.to_vec(),
                    redelivered: false,
                });
                queue.dispatch(&name, next_delivery_tag, &self.broker);
            }
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        self.ensure_open()?;
        let mut state = self.broker.lock();

        if !state.queues.contains_key(queue) {
            return Err(self.fail(
                &mut state,
                RabbitMQError::QueueNotFound(format!("NOT_FOUND - no queue '{}'", queue)),
            ));
        }

        let duplicate = state.queues.values().any(|q| {
            q.consumers
                .iter()
                .any(|c| c.channel_key == self.key && c.tag == consumer_tag)
        });
        if duplicate {
            return Err(RabbitMQError::BrokerOperation(format!(
                "NOT_ALLOWED - attempt to reuse consumer tag '{}'",
                consumer_tag
            )));
        }

        let (sender, receiver) = unbounded();
        let BrokerState {
            queues,
            next_delivery_tag,
            ..
        } = &mut *state;
        if let Some(target) = queues.get_mut(queue) {
            target.consumers.push(MemConsumer {
                tag: consumer_tag.to_string(),
                channel_key: self.key,
                channel_open: self.open.clone(),
                connection_open: self.connection_open.clone(),
                sender,
            });
            target.dispatch(queue, next_delivery_tag, &self.broker);
        }

        Ok(receiver.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        for queue in state.queues.values_mut() {
            queue
                .consumers
                .retain(|c| !(c.channel_key == self.key && c.tag == consumer_tag));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        self.open.store(false, Ordering::SeqCst);
        self.broker.release_channel(&mut state, self.key);
        Ok(())
    }
}

struct MemAcker {
    broker: InMemoryBroker,
    queue: String,
    tag: u64,
    channel_open: Arc<AtomicBool>,
    connection_open: Arc<AtomicBool>,
}

impl MemAcker {
    fn ensure_open(&self) -> Result<()> {
        if self.channel_open.load(Ordering::SeqCst) && self.connection_open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RabbitMQError::NotConnected)
        }
    }
}

#[async_trait]
impl DeliveryAcker for MemAcker {
    async fn ack(&self) -> Result<()> {
        self.ensure_open()?;
        self.broker.settle(&self.queue, self.tag, None)
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.ensure_open()?;
        self.broker.settle(&self.queue, self.tag, Some(requeue))
    }
}
