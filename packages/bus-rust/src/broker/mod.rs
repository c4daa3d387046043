//! AMQP 0-9-1 primitives used by `BrokerTransport`.
//!
//! The transport only talks to these traits. [`memory::MemoryBroker`] implements them
//! in-process. With the `amqp` feature, `amqp::AmqpConnector` implements them over a
//! network broker.

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;
pub mod topic;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::config::BrokerConnectionConfig;
use crate::error::BrokerError;

#[cfg(feature = "amqp")]
pub use amqp::AmqpConnector;
pub use memory::MemoryBroker;

/// String-valued header and argument table.
pub type FieldTable = BTreeMap<String, String>;

/// Receiving end of a consumer.
pub type DeliveryStream = mpsc::UnboundedReceiver<Delivery>;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Exchange types understood by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerExchangeKind {
    Direct,
    Topic,
    Fanout,
    /// `x-consistent-hash`: binding keys are weights.
    ConsistentHash,
}

impl fmt::Display for BrokerExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Direct => "direct",
            Self::Topic => "topic",
            Self::Fanout => "fanout",
            Self::ConsistentHash => "x-consistent-hash",
        };
        f.write_str(s)
    }
}

/// The subset of AMQP basic properties the bus uses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BasicProperties {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub headers: FieldTable,
}

/// One message handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Channel-scoped tag used to ack or reject.
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub body: Bytes,
}

#[derive(Debug, Clone, Default)]
pub struct ExchangeDeclareOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub arguments: FieldTable,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueDeclareOptions {
    pub durable: bool,
    /// Owned by the declaring connection and deleted when it closes.
    pub exclusive: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConsumeOptions {
    /// Deliveries count as acknowledged as soon as they are sent.
    pub no_ack: bool,
}

// ---------------------------------------------------------------------------
// Broker traits
// ---------------------------------------------------------------------------

/// Opens connections to a broker.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// # Errors
    ///
    /// Returns a `BrokerError` if the broker refuses the connection.
    async fn connect(
        &self,
        config: &BrokerConnectionConfig,
    ) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

/// One broker connection, multiplexing channels.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// # Errors
    ///
    /// Returns `BrokerError::ChannelLimit` when `channel_max` channels are open and
    /// `BrokerError::ConnectionClosed` after `close`.
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    /// Maximum number of channels the broker allows on this connection.
    fn channel_max(&self) -> u16;

    /// Closes every channel and deletes the connection's exclusive queues.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::ConnectionClosed` if already closed.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// A broker channel. Not meant for concurrent writers; callers serialize use.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn id(&self) -> u16;

    async fn exchange_declare(
        &self,
        name: &str,
        kind: BrokerExchangeKind,
        options: ExchangeDeclareOptions,
    ) -> Result<(), BrokerError>;

    /// Declares a queue and returns its name. An empty `name` asks the broker to
    /// generate one.
    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
    ) -> Result<String, BrokerError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Deletes a queue, returning the number of messages dropped with it.
    async fn queue_delete(&self, queue: &str, if_unused: bool) -> Result<u32, BrokerError>;

    async fn basic_qos(&self, prefetch_size: u32, prefetch_count: u16) -> Result<(), BrokerError>;

    /// Starts a consumer and returns its tag and delivery stream.
    async fn basic_consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<(String, DeliveryStream), BrokerError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        body: Bytes,
    ) -> Result<(), BrokerError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    /// Closes the channel. Unacknowledged deliveries are requeued.
    async fn close(&self) -> Result<(), BrokerError>;
}
