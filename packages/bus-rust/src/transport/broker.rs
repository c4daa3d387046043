//! [`Transport`] backed by an AMQP-style broker.
//!
//! Topology per contract: a topic exchange `"{contract}"` for requests, commands and
//! responses, and a fanout exchange `"{contract}.Events"` when the contract has
//! events. Requests and commands are bound one of two ways:
//!
//! - shared-queue mode (default): every process serving a contract consumes the
//!   durable `"{contract}.Requests"` queue. The queue is declared on the first bind
//!   and reference counted; at zero references it is deleted if unused.
//! - consistent-hashing mode: the topic exchange is declared as `x-consistent-hash`
//!   and each binding targets this process's exclusive request queue.
//!
//! Events always arrive on this process's exclusive event queue; replies on its
//! exclusive reply queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use autobus_core::{CorrelationId, ExchangeKind, ServiceExchangeModel};
use bytes::Bytes;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::pending::PendingRequests;
use super::publisher::{Publishable, PublisherPool};
use super::{
    DeliveryHandler, InboundDelivery, SenderToken, ServiceRequest, ServiceResponse, Transport,
};
use crate::broker::memory::HASH_HEADER_ARGUMENT;
use crate::broker::{
    BasicProperties, BrokerChannel, BrokerConnection, BrokerConnector, BrokerExchangeKind,
    ConsumeOptions, Delivery, DeliveryStream, ExchangeDeclareOptions, QueueDeclareOptions,
};
use crate::config::BrokerTransportConfig;
use crate::error::{BrokerError, TransportError};

// ---------------------------------------------------------------------------
// Delivery record carried by SenderToken
// ---------------------------------------------------------------------------

/// What this transport needs to reply to and settle one delivery.
struct BrokerDelivery {
    channel: Arc<dyn BrokerChannel>,
    delivery_tag: u64,
    correlation_id: Option<String>,
    reply_to: Option<String>,
    auto_ack: bool,
    settled: AtomicBool,
}

impl BrokerDelivery {
    fn token(channel: &Arc<dyn BrokerChannel>, delivery: &Delivery, auto_ack: bool) -> SenderToken {
        SenderToken::new(Self {
            channel: Arc::clone(channel),
            delivery_tag: delivery.delivery_tag,
            correlation_id: delivery.properties.correlation_id.clone(),
            reply_to: delivery.properties.reply_to.clone(),
            auto_ack,
            settled: AtomicBool::new(false),
        })
    }

    /// Returns `true` the first time it is called for an ack-mode delivery.
    fn claim_settlement(&self) -> bool {
        !self.auto_ack && !self.settled.swap(true, Ordering::AcqRel)
    }
}

#[derive(Debug, Clone, Copy)]
enum ConsumerRole {
    /// Requests, commands or events, handed to the delivery handler.
    Deliveries { auto_ack: bool },
    /// Replies, matched against pending requests.
    Replies,
}

#[derive(Debug)]
struct SharedQueue {
    refs: usize,
    consumer_tag: String,
}

// ---------------------------------------------------------------------------
// BrokerTransport
// ---------------------------------------------------------------------------

/// Broker-backed transport: one connection, three consumption channels and a pool
/// of publisher channels.
pub struct BrokerTransport {
    config: BrokerTransportConfig,
    connection: Arc<dyn BrokerConnection>,
    /// Consumes requests and commands; also used for topology changes.
    request_channel: Arc<dyn BrokerChannel>,
    event_channel: Arc<dyn BrokerChannel>,
    reply_channel: Arc<dyn BrokerChannel>,
    event_queue: String,
    reply_queue: String,
    /// Exclusive request queue, consistent-hashing mode only.
    request_queue: Option<String>,
    publishers: PublisherPool,
    pending: Arc<PendingRequests>,
    /// Serializes topology changes and guards the shared-queue reference counts.
    shared_queues: Mutex<HashMap<String, SharedQueue>>,
    handler: OnceLock<Arc<dyn DeliveryHandler>>,
    consumers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
}

impl BrokerTransport {
    /// Connects and declares this process's private queues. Consumption starts with
    /// `Transport::start`.
    ///
    /// # Errors
    ///
    /// Returns the broker error if the connection, a channel or a queue cannot be
    /// opened.
    pub async fn connect(
        connector: &dyn BrokerConnector,
        config: BrokerTransportConfig,
    ) -> Result<Self, TransportError> {
        let connection = connector.connect(&config.connection).await?;

        let request_channel = connection.create_channel().await?;
        request_channel
            .basic_qos(config.prefetch_size, config.prefetch_count)
            .await?;
        let event_channel = connection.create_channel().await?;
        let reply_channel = connection.create_channel().await?;

        let exclusive = QueueDeclareOptions {
            durable: false,
            exclusive: true,
        };
        let event_queue = event_channel.queue_declare("", exclusive).await?;
        let reply_queue = reply_channel.queue_declare("", exclusive).await?;
        let request_queue = if config.use_consistent_hashing {
            Some(request_channel.queue_declare("", exclusive).await?)
        } else {
            None
        };

        let publishers = PublisherPool::new(&connection, config.publisher_pool_size).await?;
        let (shutdown, _) = watch::channel(false);

        info!(
            host = %config.connection.host,
            port = config.connection.port,
            virtual_host = %config.connection.virtual_host,
            consistent_hashing = config.use_consistent_hashing,
            publishers = publishers.size(),
            "broker transport connected"
        );

        Ok(Self {
            config,
            connection,
            request_channel,
            event_channel,
            reply_channel,
            event_queue,
            reply_queue,
            request_queue,
            publishers,
            pending: Arc::new(PendingRequests::new()),
            shared_queues: Mutex::new(HashMap::new()),
            handler: OnceLock::new(),
            consumers: parking_lot::Mutex::new(Vec::new()),
            shutdown,
            closed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn config(&self) -> &BrokerTransportConfig {
        &self.config
    }

    /// Name of the exclusive queue replies are addressed to.
    #[must_use]
    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    #[must_use]
    pub fn event_queue(&self) -> &str {
        &self.event_queue
    }

    #[must_use]
    pub fn publisher_count(&self) -> usize {
        self.publishers.size()
    }

    /// Current reference count of a shared request queue; 0 if this process does not
    /// hold it.
    pub async fn queue_refs(&self, queue: &str) -> usize {
        self.shared_queues
            .lock()
            .await
            .get(queue)
            .map_or(0, |q| q.refs)
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn handler(&self) -> Result<Arc<dyn DeliveryHandler>, TransportError> {
        self.handler.get().cloned().ok_or(TransportError::NotStarted)
    }

    fn record(sender: &SenderToken) -> Result<&BrokerDelivery, TransportError> {
        sender
            .downcast_ref::<BrokerDelivery>()
            .ok_or(TransportError::ForeignSenderToken)
    }

    fn enqueue(
        &self,
        exchange: &ServiceExchangeModel,
        routing_key: &str,
        mut properties: BasicProperties,
        body: Bytes,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        if self.config.use_consistent_hashing && exchange.kind() == ExchangeKind::Topic {
            properties.headers.insert(
                self.config.hash_header.clone(),
                uuid::Uuid::new_v4().to_string(),
            );
        }
        self.publishers.enqueue(Publishable {
            exchange: exchange.name(),
            routing_key: routing_key.to_string(),
            properties,
            body,
        })
    }

    async fn consume(
        &self,
        channel: &Arc<dyn BrokerChannel>,
        queue: &str,
        role: ConsumerRole,
    ) -> Result<String, TransportError> {
        let no_ack = match role {
            ConsumerRole::Deliveries { auto_ack } => auto_ack,
            ConsumerRole::Replies => true,
        };
        let (tag, stream) = channel
            .basic_consume(queue, ConsumeOptions { no_ack })
            .await?;
        self.spawn_consumer(Arc::clone(channel), queue, stream, role)?;
        Ok(tag)
    }

    fn spawn_consumer(
        &self,
        channel: Arc<dyn BrokerChannel>,
        queue: &str,
        mut stream: DeliveryStream,
        role: ConsumerRole,
    ) -> Result<(), TransportError> {
        let handler = self.handler()?;
        let pending = Arc::clone(&self.pending);
        let mut shutdown = self.shutdown.subscribe();
        let queue = queue.to_string();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    delivery = stream.recv() => {
                        let Some(delivery) = delivery else { break };
                        match role {
                            ConsumerRole::Deliveries { auto_ack } => {
                                let sender = BrokerDelivery::token(&channel, &delivery, auto_ack);
                                handler.on_delivery(InboundDelivery {
                                    name: delivery.routing_key,
                                    body: delivery.body,
                                    sender,
                                    redelivered: delivery.redelivered,
                                });
                            }
                            ConsumerRole::Replies => complete_reply(&pending, &channel, delivery),
                        }
                    }
                }
            }
            debug!(queue = %queue, "consumer stopped");
        });

        let mut consumers = self.consumers.lock();
        consumers.retain(|h| !h.is_finished());
        consumers.push(handle);
        Ok(())
    }

    async fn bind_shared(
        &self,
        exchange: &ServiceExchangeModel,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        let queue = exchange.request_queue_name();
        let mut shared = self.shared_queues.lock().await;

        if !shared.contains_key(&queue) {
            self.request_channel
                .queue_declare(
                    &queue,
                    QueueDeclareOptions {
                        durable: true,
                        exclusive: false,
                    },
                )
                .await?;
            let consumer_tag = self
                .consume(
                    &self.request_channel,
                    &queue,
                    ConsumerRole::Deliveries { auto_ack: false },
                )
                .await?;
            shared.insert(
                queue.clone(),
                SharedQueue {
                    refs: 0,
                    consumer_tag,
                },
            );
        }

        self.request_channel
            .queue_bind(&queue, &exchange.name(), routing_key)
            .await?;
        if let Some(entry) = shared.get_mut(&queue) {
            entry.refs += 1;
            debug!(queue = %queue, routing_key, refs = entry.refs, "bound to shared queue");
        }
        Ok(())
    }

    /// Drops one reference. The routing key stays bound: other processes may still
    /// serve it from the same queue.
    async fn unbind_shared(&self, exchange: &ServiceExchangeModel) -> Result<(), TransportError> {
        let queue = exchange.request_queue_name();
        let mut shared = self.shared_queues.lock().await;

        let Some(entry) = shared.get_mut(&queue) else {
            warn!(queue = %queue, "unbind without a matching bind");
            return Ok(());
        };
        entry.refs = entry.refs.saturating_sub(1);
        debug!(queue = %queue, refs = entry.refs, "released shared queue");
        if entry.refs > 0 {
            return Ok(());
        }

        let consumer_tag = entry.consumer_tag.clone();
        shared.remove(&queue);

        match self.request_channel.basic_cancel(&consumer_tag).await {
            Ok(()) | Err(BrokerError::UnknownConsumer { .. }) => {}
            Err(e) => return Err(e.into()),
        }
        match self.request_channel.queue_delete(&queue, true).await {
            Ok(dropped) => debug!(queue = %queue, dropped, "shared queue deleted"),
            Err(BrokerError::PreconditionFailed { reason }) => {
                debug!(queue = %queue, reason = %reason, "shared queue still in use");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}

/// Resolves the pending request a reply belongs to. Unmatched replies are dropped.
fn complete_reply(pending: &PendingRequests, channel: &Arc<dyn BrokerChannel>, delivery: Delivery) {
    let Some(id) = delivery
        .properties
        .correlation_id
        .as_deref()
        .and_then(|raw| raw.parse::<CorrelationId>().ok())
    else {
        debug!(
            correlation_id = ?delivery.properties.correlation_id,
            "dropping reply without a valid correlation id"
        );
        return;
    };

    let sender = BrokerDelivery::token(channel, &delivery, true);
    let response = ServiceResponse {
        data: delivery.body,
        sender,
    };
    if !pending.complete(id, response) {
        debug!(correlation_id = %id, "dropping reply with no pending request");
    }
}

#[async_trait]
impl Transport for BrokerTransport {
    async fn start(&self, handler: Arc<dyn DeliveryHandler>) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.handler
            .set(handler)
            .map_err(|_| TransportError::AlreadyStarted)?;

        self.consume(
            &self.event_channel,
            &self.event_queue,
            ConsumerRole::Deliveries { auto_ack: true },
        )
        .await?;
        self.consume(&self.reply_channel, &self.reply_queue, ConsumerRole::Replies)
            .await?;
        if let Some(queue) = &self.request_queue {
            self.consume(
                &self.request_channel,
                queue,
                ConsumerRole::Deliveries { auto_ack: false },
            )
            .await?;
        }
        info!(reply_queue = %self.reply_queue, "broker transport started");
        Ok(())
    }

    async fn declare_exchange(&self, exchange: &ServiceExchangeModel) -> Result<(), TransportError> {
        self.ensure_open()?;
        let (kind, arguments) = match exchange.kind() {
            ExchangeKind::Fanout => (BrokerExchangeKind::Fanout, Default::default()),
            ExchangeKind::Topic if self.config.use_consistent_hashing => {
                let mut arguments = crate::broker::FieldTable::new();
                arguments.insert(
                    HASH_HEADER_ARGUMENT.to_string(),
                    self.config.hash_header.clone(),
                );
                (BrokerExchangeKind::ConsistentHash, arguments)
            }
            ExchangeKind::Topic => (BrokerExchangeKind::Topic, Default::default()),
        };

        let _topology = self.shared_queues.lock().await;
        self.request_channel
            .exchange_declare(
                &exchange.name(),
                kind,
                ExchangeDeclareOptions {
                    durable: false,
                    auto_delete: false,
                    arguments,
                },
            )
            .await?;
        debug!(exchange = %exchange, kind = %kind, "exchange declared");
        Ok(())
    }

    async fn bind(
        &self,
        exchange: &ServiceExchangeModel,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.handler()?;
        match (exchange.kind(), &self.request_queue) {
            (ExchangeKind::Fanout, _) => {
                let _topology = self.shared_queues.lock().await;
                self.request_channel
                    .queue_bind(&self.event_queue, &exchange.name(), routing_key)
                    .await?;
            }
            (ExchangeKind::Topic, Some(queue)) => {
                let _topology = self.shared_queues.lock().await;
                self.request_channel
                    .queue_bind(queue, &exchange.name(), routing_key)
                    .await?;
            }
            (ExchangeKind::Topic, None) => self.bind_shared(exchange, routing_key).await?,
        }
        debug!(exchange = %exchange, routing_key, "bound");
        Ok(())
    }

    async fn unbind(
        &self,
        exchange: &ServiceExchangeModel,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        match (exchange.kind(), &self.request_queue) {
            (ExchangeKind::Fanout, _) => {
                let _topology = self.shared_queues.lock().await;
                self.request_channel
                    .queue_unbind(&self.event_queue, &exchange.name(), routing_key)
                    .await?;
            }
            (ExchangeKind::Topic, Some(queue)) => {
                let _topology = self.shared_queues.lock().await;
                self.request_channel
                    .queue_unbind(queue, &exchange.name(), routing_key)
                    .await?;
            }
            (ExchangeKind::Topic, None) => self.unbind_shared(exchange).await?,
        }
        debug!(exchange = %exchange, routing_key, "unbound");
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &ServiceExchangeModel,
        routing_key: &str,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        self.enqueue(exchange, routing_key, BasicProperties::default(), payload)
    }

    async fn publish_request(
        &self,
        exchange: &ServiceExchangeModel,
        routing_key: &str,
        payload: Bytes,
        request: &ServiceRequest,
    ) -> Result<(), TransportError> {
        let properties = BasicProperties {
            correlation_id: Some(request.id.to_string()),
            reply_to: Some(self.reply_queue.clone()),
            ..BasicProperties::default()
        };
        self.enqueue(exchange, routing_key, properties, payload)
    }

    async fn publish_reply(
        &self,
        sender: &SenderToken,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let record = Self::record(sender)?;
        let Some(reply_to) = &record.reply_to else {
            debug!(
                correlation_id = ?record.correlation_id,
                "request carried no reply address, reply dropped"
            );
            return Ok(());
        };
        self.publishers.enqueue(Publishable {
            exchange: String::new(),
            routing_key: reply_to.clone(),
            properties: BasicProperties {
                correlation_id: record.correlation_id.clone(),
                ..BasicProperties::default()
            },
            body: payload,
        })
    }

    async fn acknowledge(&self, sender: &SenderToken) -> Result<(), TransportError> {
        let record = Self::record(sender)?;
        if record.claim_settlement() {
            record.channel.basic_ack(record.delivery_tag).await?;
        }
        Ok(())
    }

    async fn reject(&self, sender: &SenderToken) -> Result<(), TransportError> {
        let record = Self::record(sender)?;
        if record.claim_settlement() {
            // Always requeue; there is no redelivery cap.
            record.channel.basic_reject(record.delivery_tag, true).await?;
        }
        Ok(())
    }

    fn create_request(&self, id: CorrelationId) -> Result<ServiceRequest, TransportError> {
        self.pending.insert(id)
    }

    fn discard_request(&self, request: &ServiceRequest) -> bool {
        self.pending.discard(request.id)
    }

    fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _ = self.shutdown.send(true);

        let consumers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.consumers.lock());
        for handle in consumers {
            let _ = handle.await;
        }

        self.publishers.stop().await;
        let abandoned = self.pending.clear();

        for channel in [&self.request_channel, &self.event_channel, &self.reply_channel] {
            if let Err(e) = channel.close().await {
                debug!(channel = channel.id(), error = %e, "channel close failed");
            }
        }
        self.connection.close().await?;
        info!(abandoned, "broker transport closed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
