//! Broker traits over a network AMQP 0-9-1 broker, using `lapin`.
//!
//! Enabled with the `amqp` feature. Connections are opened from
//! [`BrokerConnectionConfig::uri`]. Two broker behaviors are adapted here so the
//! transport sees the same semantics as with `MemoryBroker`:
//!
//! - a failed `queue.delete if-unused` closes the channel it ran on, so deletes run on
//!   a short-lived side channel;
//! - `x-consistent-hash` bindings take a numeric weight as binding key, so a
//!   non-numeric key binds the queue once with weight 1 and is reference counted per
//!   queue and exchange.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
    BasicQosOptions, BasicRejectOptions, ExchangeDeclareOptions as LapinExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions as LapinQueueDeclareOptions, QueueDeleteOptions,
};
use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::types::{AMQPValue, FieldTable as LapinFieldTable, LongString, ShortString};
use lapin::{Connection, ConnectionProperties, ExchangeKind};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{
    BasicProperties, BrokerChannel, BrokerConnection, BrokerConnector, BrokerExchangeKind,
    ConsumeOptions, Delivery, DeliveryStream, ExchangeDeclareOptions, FieldTable,
    QueueDeclareOptions,
};
use crate::config::BrokerConnectionConfig;
use crate::error::BrokerError;

/// Binding key used for consistent-hash bindings made with a non-numeric key.
const DEFAULT_HASH_WEIGHT: &str = "1";

const REPLY_SUCCESS: u16 = 200;

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// Opens `lapin` connections.
#[derive(Debug, Clone, Default)]
pub struct AmqpConnector;

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(
        &self,
        config: &BrokerConnectionConfig,
    ) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let connection = Connection::connect(&config.uri(), ConnectionProperties::default())
            .await
            .map_err(broker_error)?;
        info!(
            host = %config.host,
            port = config.port,
            virtual_host = %config.virtual_host,
            "amqp connection opened"
        );
        Ok(Arc::new(AmqpConnection {
            inner: Arc::new(connection),
            hash_bindings: Arc::new(Mutex::new(HashBindings::default())),
        }))
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

struct AmqpConnection {
    inner: Arc<Connection>,
    hash_bindings: Arc<Mutex<HashBindings>>,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let channel = self.inner.create_channel().await.map_err(broker_error)?;
        Ok(Arc::new(AmqpChannel {
            channel,
            connection: Arc::clone(&self.inner),
            hash_bindings: Arc::clone(&self.hash_bindings),
        }))
    }

    fn channel_max(&self) -> u16 {
        self.inner.configuration().channel_max()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(broker_error)
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

struct AmqpChannel {
    channel: lapin::Channel,
    connection: Arc<Connection>,
    hash_bindings: Arc<Mutex<HashBindings>>,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn id(&self) -> u16 {
        self.channel.id()
    }

    async fn exchange_declare(
        &self,
        name: &str,
        kind: BrokerExchangeKind,
        options: ExchangeDeclareOptions,
    ) -> Result<(), BrokerError> {
        let lapin_kind = match kind {
            BrokerExchangeKind::Direct => ExchangeKind::Direct,
            BrokerExchangeKind::Topic => ExchangeKind::Topic,
            BrokerExchangeKind::Fanout => ExchangeKind::Fanout,
            BrokerExchangeKind::ConsistentHash => ExchangeKind::Custom(kind.to_string()),
        };
        self.channel
            .exchange_declare(
                name,
                lapin_kind,
                LapinExchangeDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    ..LapinExchangeDeclareOptions::default()
                },
                to_field_table(&options.arguments),
            )
            .await
            .map_err(broker_error)?;
        if kind == BrokerExchangeKind::ConsistentHash {
            self.hash_bindings.lock().declare(name);
        }
        Ok(())
    }

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
    ) -> Result<String, BrokerError> {
        let queue = self
            .channel
            .queue_declare(
                name,
                LapinQueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    ..LapinQueueDeclareOptions::default()
                },
                LapinFieldTable::default(),
            )
            .await
            .map_err(broker_error)?;
        Ok(queue.name().as_str().to_string())
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let Some(key) = self.hash_bindings.lock().bind(queue, exchange, routing_key) else {
            return Ok(());
        };
        let bound = self
            .channel
            .queue_bind(
                queue,
                exchange,
                &key,
                QueueBindOptions::default(),
                LapinFieldTable::default(),
            )
            .await;
        if let Err(e) = bound {
            self.hash_bindings.lock().unbind(queue, exchange, routing_key);
            return Err(broker_error(e));
        }
        Ok(())
    }

    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let Some(key) = self.hash_bindings.lock().unbind(queue, exchange, routing_key) else {
            return Ok(());
        };
        self.channel
            .queue_unbind(queue, exchange, &key, LapinFieldTable::default())
            .await
            .map_err(broker_error)
    }

    async fn queue_delete(&self, queue: &str, if_unused: bool) -> Result<u32, BrokerError> {
        let side = self.connection.create_channel().await.map_err(broker_error)?;
        let deleted = side
            .queue_delete(
                queue,
                QueueDeleteOptions {
                    if_unused,
                    ..QueueDeleteOptions::default()
                },
            )
            .await
            .map_err(broker_error);
        if deleted.is_ok() {
            if let Err(e) = side.close(REPLY_SUCCESS, "done").await {
                debug!(queue, error = %e, "side channel close failed");
            }
        }
        deleted
    }

    async fn basic_qos(&self, prefetch_size: u32, prefetch_count: u16) -> Result<(), BrokerError> {
        if prefetch_size != 0 {
            debug!(prefetch_size, "prefetch size is not supported by the client, ignored");
        }
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(broker_error)
    }

    async fn basic_consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<(String, DeliveryStream), BrokerError> {
        let tag = format!("autobus-{}", uuid::Uuid::new_v4());
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions {
                    no_ack: options.no_ack,
                    ..BasicConsumeOptions::default()
                },
                LapinFieldTable::default(),
            )
            .await
            .map_err(broker_error)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let queue = queue.to_string();
        tokio::spawn(async move {
            while let Some(next) = consumer.next().await {
                match next {
                    Ok(delivery) => {
                        if tx.send(from_lapin_delivery(delivery)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(queue = %queue, error = %e, "amqp consumer failed");
                        break;
                    }
                }
            }
            debug!(queue = %queue, "amqp consumer ended");
        });
        Ok((tag, rx))
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(broker_error)
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        body: Bytes,
    ) -> Result<(), BrokerError> {
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                to_lapin_properties(&properties),
            )
            .await
            .map_err(broker_error)?;
        Ok(())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(broker_error)
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(broker_error)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.channel
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(broker_error)
    }
}

// ---------------------------------------------------------------------------
// Consistent-hash binding weights
// ---------------------------------------------------------------------------

/// Tracks consistent-hash exchanges and how many routing keys each queue has bound
/// to them.
#[derive(Debug, Default)]
struct HashBindings {
    exchanges: HashSet<String>,
    refs: HashMap<(String, String), usize>,
}

impl HashBindings {
    fn declare(&mut self, exchange: &str) {
        self.exchanges.insert(exchange.to_string());
    }

    fn passes_through(&self, exchange: &str, routing_key: &str) -> bool {
        !self.exchanges.contains(exchange) || routing_key.parse::<u32>().is_ok()
    }

    /// Binding key to send to the broker, or `None` if the queue is already bound.
    fn bind(&mut self, queue: &str, exchange: &str, routing_key: &str) -> Option<String> {
        if self.passes_through(exchange, routing_key) {
            return Some(routing_key.to_string());
        }
        let refs = self
            .refs
            .entry((queue.to_string(), exchange.to_string()))
            .or_insert(0);
        *refs += 1;
        (*refs == 1).then(|| DEFAULT_HASH_WEIGHT.to_string())
    }

    /// Binding key to remove from the broker, or `None` while other keys still use it.
    fn unbind(&mut self, queue: &str, exchange: &str, routing_key: &str) -> Option<String> {
        if self.passes_through(exchange, routing_key) {
            return Some(routing_key.to_string());
        }
        let key = (queue.to_string(), exchange.to_string());
        let refs = self.refs.get_mut(&key)?;
        *refs -= 1;
        if *refs > 0 {
            return None;
        }
        self.refs.remove(&key);
        Some(DEFAULT_HASH_WEIGHT.to_string())
    }
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

fn broker_error(error: lapin::Error) -> BrokerError {
    match &error {
        lapin::Error::ProtocolError(amqp) => match amqp.kind() {
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                BrokerError::PreconditionFailed {
                    reason: amqp.get_message().as_str().to_string(),
                }
            }
            AMQPErrorKind::Soft(AMQPSoftError::RESOURCELOCKED) => BrokerError::ResourceLocked {
                name: amqp.get_message().as_str().to_string(),
            },
            _ => BrokerError::Client {
                reason: error.to_string(),
            },
        },
        lapin::Error::InvalidChannelState(_) => BrokerError::ChannelClosed,
        lapin::Error::InvalidConnectionState(_) => BrokerError::ConnectionClosed,
        _ => BrokerError::Client {
            reason: error.to_string(),
        },
    }
}

fn to_field_table(table: &FieldTable) -> LapinFieldTable {
    let mut out = LapinFieldTable::default();
    for (key, value) in table {
        out.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }
    out
}

fn from_field_table(table: &LapinFieldTable) -> FieldTable {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
                AMQPValue::ShortString(s) => s.as_str().to_string(),
                _ => return None,
            };
            Some((key.as_str().to_string(), value))
        })
        .collect::<BTreeMap<_, _>>()
}

fn to_lapin_properties(properties: &BasicProperties) -> lapin::BasicProperties {
    let mut out = lapin::BasicProperties::default();
    if let Some(id) = &properties.correlation_id {
        out = out.with_correlation_id(ShortString::from(id.clone()));
    }
    if let Some(reply_to) = &properties.reply_to {
        out = out.with_reply_to(ShortString::from(reply_to.clone()));
    }
    if !properties.headers.is_empty() {
        out = out.with_headers(to_field_table(&properties.headers));
    }
    out
}

fn from_lapin_properties(properties: &lapin::BasicProperties) -> BasicProperties {
    BasicProperties {
        correlation_id: properties
            .correlation_id()
            .as_ref()
            .map(|s| s.as_str().to_string()),
        reply_to: properties.reply_to().as_ref().map(|s| s.as_str().to_string()),
        headers: properties
            .headers()
            .as_ref()
            .map(from_field_table)
            .unwrap_or_default(),
    }
}

fn from_lapin_delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        properties: from_lapin_properties(&delivery.properties),
        body: Bytes::from(delivery.data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_exchanges_bind_keys_as_given() {
        let mut bindings = HashBindings::default();
        assert_eq!(bindings.bind("q", "Orders", "PlaceOrder").as_deref(), Some("PlaceOrder"));
        assert_eq!(bindings.unbind("q", "Orders", "PlaceOrder").as_deref(), Some("PlaceOrder"));
    }

    #[test]
    fn hash_exchange_binds_each_queue_once_with_unit_weight() {
        let mut bindings = HashBindings::default();
        bindings.declare("Orders");

        assert_eq!(bindings.bind("q", "Orders", "PlaceOrder").as_deref(), Some("1"));
        assert_eq!(bindings.bind("q", "Orders", "CancelOrder"), None);
        assert_eq!(bindings.bind("other", "Orders", "PlaceOrder").as_deref(), Some("1"));

        assert_eq!(bindings.unbind("q", "Orders", "PlaceOrder"), None);
        assert_eq!(bindings.unbind("q", "Orders", "CancelOrder").as_deref(), Some("1"));
        assert_eq!(bindings.unbind("q", "Orders", "CancelOrder"), None);
    }

    #[test]
    fn numeric_keys_on_hash_exchange_are_weights() {
        let mut bindings = HashBindings::default();
        bindings.declare("Orders");
        assert_eq!(bindings.bind("q", "Orders", "10").as_deref(), Some("10"));
        assert_eq!(bindings.unbind("q", "Orders", "10").as_deref(), Some("10"));
    }

    #[test]
    fn properties_carry_correlation_reply_and_headers() {
        let mut headers = FieldTable::new();
        headers.insert("hash-on".to_string(), "abc".to_string());
        let properties = BasicProperties {
            correlation_id: Some("42".to_string()),
            reply_to: Some("amq.gen-reply".to_string()),
            headers,
        };

        let lapin_properties = to_lapin_properties(&properties);
        assert_eq!(
            lapin_properties.correlation_id().as_ref().map(ShortString::as_str),
            Some("42")
        );
        assert_eq!(from_lapin_properties(&lapin_properties), properties);
    }

    #[test]
    fn empty_properties_send_no_headers() {
        let lapin_properties = to_lapin_properties(&BasicProperties::default());
        assert!(lapin_properties.headers().is_none());
        assert_eq!(
            from_lapin_properties(&lapin_properties),
            BasicProperties::default()
        );
    }
}
