//! In-process broker with AMQP 0-9-1 routing and acknowledgement semantics.
//!
//! All state lives behind one `parking_lot::Mutex`; every operation is synchronous
//! under the lock and never awaits while holding it. Consumers receive deliveries
//! over unbounded channels, so publishing never blocks.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use autobus_core::hash::weighted_slot;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use super::topic::topic_matches;
use super::{
    BasicProperties, BrokerChannel, BrokerConnection, BrokerConnector, BrokerExchangeKind,
    ConsumeOptions, Delivery, DeliveryStream, ExchangeDeclareOptions, QueueDeclareOptions,
};
use crate::config::BrokerConnectionConfig;
use crate::error::BrokerError;

/// Default channel limit per connection, matching RabbitMQ's default `channel_max`.
pub const DEFAULT_CHANNEL_MAX: u16 = 2047;

/// Argument naming the header a consistent-hash exchange hashes on.
pub const HASH_HEADER_ARGUMENT: &str = "hash-header";

type ChannelKey = (u64, u16);

// ---------------------------------------------------------------------------
// Broker state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Exchange {
    kind: BrokerExchangeKind,
    auto_delete: bool,
    arguments: BTreeMap<String, String>,
    bindings: Vec<Binding>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    queue: String,
    routing_key: String,
}

#[derive(Debug, Clone)]
struct QueuedMessage {
    exchange: String,
    routing_key: String,
    redelivered: bool,
    properties: BasicProperties,
    body: Bytes,
}

#[derive(Debug)]
struct Consumer {
    tag: String,
    channel: ChannelKey,
    no_ack: bool,
    unacked: usize,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Debug)]
struct Queue {
    durable: bool,
    owner: Option<u64>,
    messages: VecDeque<QueuedMessage>,
    consumers: Vec<Consumer>,
    cursor: usize,
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    consumer_tag: String,
    message: QueuedMessage,
}

#[derive(Debug, Default)]
struct ChannelState {
    prefetch_count: u16,
    next_tag: u64,
    next_consumer: u64,
    unacked: BTreeMap<u64, Unacked>,
}

#[derive(Debug, Default)]
struct Topology {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    channels: HashMap<ChannelKey, ChannelState>,
    connections: HashSet<u64>,
}

impl Exchange {
    /// Queues a message should be delivered to.
    fn route(&self, routing_key: &str, properties: &BasicProperties) -> Vec<String> {
        let mut targets: Vec<String> = Vec::new();
        let mut push = |queue: &str| {
            if !targets.iter().any(|q| q == queue) {
                targets.push(queue.to_string());
            }
        };

        match self.kind {
            BrokerExchangeKind::Direct => self
                .bindings
                .iter()
                .filter(|b| b.routing_key == routing_key)
                .for_each(|b| push(&b.queue)),
            BrokerExchangeKind::Topic => self
                .bindings
                .iter()
                .filter(|b| topic_matches(&b.routing_key, routing_key))
                .for_each(|b| push(&b.queue)),
            BrokerExchangeKind::Fanout => self.bindings.iter().for_each(|b| push(&b.queue)),
            BrokerExchangeKind::ConsistentHash => {
                let mut queues: Vec<&str> = Vec::new();
                let mut weights: Vec<u32> = Vec::new();
                for binding in &self.bindings {
                    let weight = binding.routing_key.parse::<u32>().unwrap_or(1);
                    if let Some(index) = queues.iter().position(|q| *q == binding.queue) {
                        weights[index] = weights[index].saturating_add(weight);
                    } else {
                        queues.push(&binding.queue);
                        weights.push(weight);
                    }
                }
                let key = self
                    .arguments
                    .get(HASH_HEADER_ARGUMENT)
                    .and_then(|header| properties.headers.get(header))
                    .map_or(routing_key, String::as_str);
                if let Some(slot) = weighted_slot(key.as_bytes(), &weights) {
                    push(queues[slot]);
                }
            }
        }
        targets
    }
}

impl Queue {
    /// Next consumer, in round-robin order, that is under its prefetch limit.
    fn next_ready_consumer(&self, channels: &HashMap<ChannelKey, ChannelState>) -> Option<usize> {
        let count = self.consumers.len();
        (0..count)
            .map(|offset| (self.cursor + offset) % count)
            .find(|&index| {
                let consumer = &self.consumers[index];
                let limit = channels
                    .get(&consumer.channel)
                    .map_or(0, |c| usize::from(c.prefetch_count));
                consumer.no_ack || limit == 0 || consumer.unacked < limit
            })
    }
}

impl Topology {
    fn channel(&mut self, key: ChannelKey) -> Result<&mut ChannelState, BrokerError> {
        self.channels.get_mut(&key).ok_or(BrokerError::ChannelClosed)
    }

    fn exchange(&mut self, name: &str) -> Result<&mut Exchange, BrokerError> {
        self.exchanges
            .get_mut(name)
            .ok_or_else(|| BrokerError::ExchangeNotFound {
                name: name.to_string(),
            })
    }

    fn queue(&mut self, name: &str) -> Result<&mut Queue, BrokerError> {
        self.queues
            .get_mut(name)
            .ok_or_else(|| BrokerError::QueueNotFound {
                name: name.to_string(),
            })
    }

    fn check_owner(&self, queue: &str, connection: u64) -> Result<(), BrokerError> {
        match self.queues.get(queue).and_then(|q| q.owner) {
            Some(owner) if owner != connection => Err(BrokerError::ResourceLocked {
                name: queue.to_string(),
            }),
            _ => Ok(()),
        }
    }

    fn enqueue(&mut self, queue_name: &str, message: QueuedMessage) {
        if let Some(queue) = self.queues.get_mut(queue_name) {
            queue.messages.push_back(message);
            self.dispatch(queue_name);
        }
    }

    /// Hands queued messages to ready consumers until either runs out.
    fn dispatch(&mut self, queue_name: &str) {
        let Self {
            queues, channels, ..
        } = self;
        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };

        while !queue.messages.is_empty() {
            let Some(index) = queue.next_ready_consumer(channels) else {
                return;
            };
            let key = queue.consumers[index].channel;
            let Some(channel) = channels.get_mut(&key) else {
                queue.consumers.remove(index);
                continue;
            };
            let Some(message) = queue.messages.pop_front() else {
                return;
            };

            channel.next_tag += 1;
            let tag = channel.next_tag;
            let delivery = Delivery {
                delivery_tag: tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                properties: message.properties.clone(),
                body: message.body.clone(),
            };

            let consumer = &mut queue.consumers[index];
            if consumer.tx.send(delivery).is_err() {
                // Receiver dropped without a cancel.
                queue.consumers.remove(index);
                queue.messages.push_front(message);
                continue;
            }

            if !consumer.no_ack {
                consumer.unacked += 1;
                channel.unacked.insert(
                    tag,
                    Unacked {
                        queue: queue_name.to_string(),
                        consumer_tag: consumer.tag.clone(),
                        message,
                    },
                );
            }
            queue.cursor = index + 1;
        }
    }

    /// Settles one unacknowledged delivery; requeues it at the head when asked to.
    fn settle(&mut self, key: ChannelKey, tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let unacked = self
            .channel(key)?
            .unacked
            .remove(&tag)
            .ok_or(BrokerError::UnknownDeliveryTag { tag })?;

        if let Some(queue) = self.queues.get_mut(&unacked.queue) {
            if let Some(consumer) = queue
                .consumers
                .iter_mut()
                .find(|c| c.tag == unacked.consumer_tag)
            {
                consumer.unacked = consumer.unacked.saturating_sub(1);
            }
            if requeue {
                let mut message = unacked.message;
                message.redelivered = true;
                queue.messages.push_front(message);
            }
        }
        self.dispatch(&unacked.queue);
        Ok(())
    }

    fn remove_bindings_to(&mut self, queue: &str) {
        for exchange in self.exchanges.values_mut() {
            exchange.bindings.retain(|b| b.queue != queue);
        }
        self.exchanges
            .retain(|_, e| !(e.auto_delete && e.bindings.is_empty()));
    }

    fn delete_queue(&mut self, name: &str) -> u32 {
        let Some(queue) = self.queues.remove(name) else {
            return 0;
        };
        for channel in self.channels.values_mut() {
            channel.unacked.retain(|_, u| u.queue != name);
        }
        self.remove_bindings_to(name);
        u32::try_from(queue.messages.len()).unwrap_or(u32::MAX)
    }

    /// Drops a channel's consumers and requeues its unacknowledged deliveries.
    fn close_channel(&mut self, key: ChannelKey) {
        let Some(channel) = self.channels.remove(&key) else {
            return;
        };

        let mut touched: Vec<String> = Vec::new();
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.channel != key);
        }
        // Reverse tag order so the oldest delivery ends up at the head.
        for (_, unacked) in channel.unacked.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                let mut message = unacked.message;
                message.redelivered = true;
                queue.messages.push_front(message);
                if !touched.contains(&unacked.queue) {
                    touched.push(unacked.queue);
                }
            }
        }
        for queue in touched {
            self.dispatch(&queue);
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryBroker
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct BrokerState {
    topology: Mutex<Topology>,
    next_connection: AtomicU64,
    channel_max: u16,
}

/// Snapshot of one queue, for inspection in tests and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub durable: bool,
    pub exclusive: bool,
    pub messages: usize,
    pub consumers: usize,
}

/// In-process AMQP-style broker. Cloning shares the same broker.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::with_channel_max(DEFAULT_CHANNEL_MAX)
    }

    /// Broker that allows at most `channel_max` channels per connection.
    #[must_use]
    pub fn with_channel_max(channel_max: u16) -> Self {
        Self {
            state: Arc::new(BrokerState {
                topology: Mutex::new(Topology::default()),
                next_connection: AtomicU64::new(0),
                channel_max: channel_max.max(1),
            }),
        }
    }

    #[must_use]
    pub fn queue_info(&self, name: &str) -> Option<QueueInfo> {
        self.state.topology.lock().queues.get(name).map(|q| QueueInfo {
            durable: q.durable,
            exclusive: q.owner.is_some(),
            messages: q.messages.len(),
            consumers: q.consumers.len(),
        })
    }

    #[must_use]
    pub fn exchange_kind(&self, name: &str) -> Option<BrokerExchangeKind> {
        self.state.topology.lock().exchanges.get(name).map(|e| e.kind)
    }

    /// `(queue, routing_key)` pairs bound to `exchange`.
    #[must_use]
    pub fn bindings(&self, exchange: &str) -> Vec<(String, String)> {
        self.state
            .topology
            .lock()
            .exchanges
            .get(exchange)
            .map(|e| {
                e.bindings
                    .iter()
                    .map(|b| (b.queue.clone(), b.routing_key.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Deliveries handed out and not yet acknowledged, across all channels.
    #[must_use]
    pub fn unacked_count(&self) -> usize {
        self.state
            .topology
            .lock()
            .channels
            .values()
            .map(|c| c.unacked.len())
            .sum()
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.state.topology.lock().connections.len()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(
        &self,
        config: &BrokerConnectionConfig,
    ) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let id = self.state.next_connection.fetch_add(1, Ordering::Relaxed) + 1;
        self.state.topology.lock().connections.insert(id);
        trace!(connection = id, host = %config.host, virtual_host = %config.virtual_host, "memory broker connection opened");
        Ok(Arc::new(MemoryConnection {
            state: Arc::clone(&self.state),
            id,
            next_channel: AtomicU16::new(0),
        }))
    }
}

// ---------------------------------------------------------------------------
// MemoryConnection
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct MemoryConnection {
    state: Arc<BrokerState>,
    id: u64,
    next_channel: AtomicU16,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let mut topology = self.state.topology.lock();
        if !topology.connections.contains(&self.id) {
            return Err(BrokerError::ConnectionClosed);
        }
        let open = topology
            .channels
            .keys()
            .filter(|(connection, _)| *connection == self.id)
            .count();
        if open >= usize::from(self.state.channel_max) {
            return Err(BrokerError::ChannelLimit {
                max: self.state.channel_max,
            });
        }

        let id = self.next_channel.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let key = (self.id, id);
        topology.channels.insert(key, ChannelState::default());
        Ok(Arc::new(MemoryChannel {
            state: Arc::clone(&self.state),
            key,
        }))
    }

    fn channel_max(&self) -> u16 {
        self.state.channel_max
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut topology = self.state.topology.lock();
        if !topology.connections.remove(&self.id) {
            return Err(BrokerError::ConnectionClosed);
        }

        let channels: Vec<ChannelKey> = topology
            .channels
            .keys()
            .filter(|(connection, _)| *connection == self.id)
            .copied()
            .collect();
        for key in channels {
            topology.close_channel(key);
        }

        let exclusive: Vec<String> = topology
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(self.id))
            .map(|(name, _)| name.clone())
            .collect();
        for name in exclusive {
            topology.delete_queue(&name);
        }
        trace!(connection = self.id, "memory broker connection closed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryChannel
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct MemoryChannel {
    state: Arc<BrokerState>,
    key: ChannelKey,
}

impl MemoryChannel {
    fn topology(&self) -> Result<parking_lot::MutexGuard<'_, Topology>, BrokerError> {
        let topology = self.state.topology.lock();
        if topology.channels.contains_key(&self.key) {
            Ok(topology)
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn id(&self) -> u16 {
        self.key.1
    }

    async fn exchange_declare(
        &self,
        name: &str,
        kind: BrokerExchangeKind,
        options: ExchangeDeclareOptions,
    ) -> Result<(), BrokerError> {
        if name.is_empty() {
            return Err(BrokerError::PreconditionFailed {
                reason: "the default exchange cannot be redeclared".to_string(),
            });
        }
        let mut topology = self.topology()?;
        if let Some(existing) = topology.exchanges.get(name) {
            if existing.kind != kind {
                return Err(BrokerError::PreconditionFailed {
                    reason: format!(
                        "exchange {name} already declared as {}, not {kind}",
                        existing.kind
                    ),
                });
            }
            return Ok(());
        }
        topology.exchanges.insert(
            name.to_string(),
            Exchange {
                kind,
                auto_delete: options.auto_delete,
                arguments: options.arguments,
                bindings: Vec::new(),
            },
        );
        Ok(())
    }

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
    ) -> Result<String, BrokerError> {
        let mut topology = self.topology()?;
        let name = if name.is_empty() {
            format!("amq.gen-{}", uuid::Uuid::new_v4().simple())
        } else {
            name.to_string()
        };

        if topology.queues.contains_key(&name) {
            topology.check_owner(&name, self.key.0)?;
            return Ok(name);
        }
        topology.queues.insert(
            name.clone(),
            Queue {
                durable: options.durable,
                owner: options.exclusive.then_some(self.key.0),
                messages: VecDeque::new(),
                consumers: Vec::new(),
                cursor: 0,
            },
        );
        Ok(name)
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut topology = self.topology()?;
        topology.queue(queue)?;
        topology.check_owner(queue, self.key.0)?;
        let binding = Binding {
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        };
        let exchange = topology.exchange(exchange)?;
        if !exchange.bindings.contains(&binding) {
            exchange.bindings.push(binding);
        }
        Ok(())
    }

    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut topology = self.topology()?;
        let target = topology.exchange(exchange)?;
        target
            .bindings
            .retain(|b| !(b.queue == queue && b.routing_key == routing_key));
        if target.auto_delete && target.bindings.is_empty() {
            topology.exchanges.remove(exchange);
        }
        Ok(())
    }

    async fn queue_delete(&self, queue: &str, if_unused: bool) -> Result<u32, BrokerError> {
        let mut topology = self.topology()?;
        let Some(existing) = topology.queues.get(queue) else {
            return Ok(0);
        };
        if if_unused && !existing.consumers.is_empty() {
            return Err(BrokerError::PreconditionFailed {
                reason: format!("queue {queue} is in use"),
            });
        }
        topology.check_owner(queue, self.key.0)?;
        Ok(topology.delete_queue(queue))
    }

    async fn basic_qos(&self, _prefetch_size: u32, prefetch_count: u16) -> Result<(), BrokerError> {
        let mut topology = self.topology()?;
        topology.channel(self.key)?.prefetch_count = prefetch_count;
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<(String, DeliveryStream), BrokerError> {
        let mut topology = self.topology()?;
        topology.queue(queue)?;
        topology.check_owner(queue, self.key.0)?;

        let channel = topology.channel(self.key)?;
        channel.next_consumer += 1;
        let tag = format!("ctag-{}.{}-{}", self.key.0, self.key.1, channel.next_consumer);

        let (tx, rx) = mpsc::unbounded_channel();
        topology.queue(queue)?.consumers.push(Consumer {
            tag: tag.clone(),
            channel: self.key,
            no_ack: options.no_ack,
            unacked: 0,
            tx,
        });
        topology.dispatch(queue);
        Ok((tag, rx))
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        let mut topology = self.topology()?;
        let key = self.key;
        for queue in topology.queues.values_mut() {
            if let Some(index) = queue
                .consumers
                .iter()
                .position(|c| c.tag == consumer_tag && c.channel == key)
            {
                queue.consumers.remove(index);
                return Ok(());
            }
        }
        Err(BrokerError::UnknownConsumer {
            tag: consumer_tag.to_string(),
        })
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        body: Bytes,
    ) -> Result<(), BrokerError> {
        let mut topology = self.topology()?;

        let targets = if exchange.is_empty() {
            if topology.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            }
        } else {
            let target = topology
                .exchanges
                .get(exchange)
                .ok_or_else(|| BrokerError::ExchangeNotFound {
                    name: exchange.to_string(),
                })?;
            target.route(routing_key, &properties)
        };

        if targets.is_empty() {
            trace!(exchange, routing_key, "unroutable message dropped");
        }
        for queue in targets {
            topology.enqueue(
                &queue,
                QueuedMessage {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    redelivered: false,
                    properties: properties.clone(),
                    body: body.clone(),
                },
            );
        }
        Ok(())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.topology()?.settle(self.key, delivery_tag, false)
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.topology()?.settle(self.key, delivery_tag, requeue)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.topology()?.close_channel(self.key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
