//! Broker-facing contract used by the bus runtime.
//!
//! The runtime never touches broker primitives. It declares topology, binds routing
//! keys, publishes and settles deliveries through [`Transport`], and receives
//! inbound traffic through the [`DeliveryHandler`] it passes to `start`.

pub mod broker;
pub mod pending;
pub mod publisher;

#[cfg(test)]
pub(crate) mod recording;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use autobus_core::{CorrelationId, ServiceExchangeModel};
use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::TransportError;

pub use broker::BrokerTransport;
pub use pending::PendingRequests;
pub use publisher::{Publishable, PublisherPool};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Opaque handle to one inbound delivery.
///
/// Issued by a transport and handed back to it to reply to, acknowledge or reject
/// that delivery. Cloning shares the same delivery.
#[derive(Clone)]
pub struct SenderToken(Arc<dyn Any + Send + Sync>);

impl SenderToken {
    #[must_use]
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// The transport-specific delivery record, if this token carries a `T`.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for SenderToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SenderToken(..)")
    }
}

/// A request waiting for its reply. `completion` resolves at most once.
#[derive(Debug)]
pub struct ServiceRequest {
    pub id: CorrelationId,
    pub completion: oneshot::Receiver<ServiceResponse>,
}

/// Reply payload plus the token of the delivery that carried it.
#[derive(Debug, Clone)]
pub struct ServiceResponse {
    pub data: Bytes,
    pub sender: SenderToken,
}

/// A request, command or event handed to the runtime.
#[derive(Debug, Clone)]
pub struct InboundDelivery {
    /// Wire name of the message (the routing key).
    pub name: String,
    pub body: Bytes,
    pub sender: SenderToken,
    pub redelivered: bool,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Receives inbound deliveries. Called from consumer loops and must not block.
pub trait DeliveryHandler: Send + Sync {
    fn on_delivery(&self, delivery: InboundDelivery);
}

/// Broker-facing operations the bus runtime depends on.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Starts consuming and routes every inbound delivery to `handler`.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::AlreadyStarted` on a second call.
    async fn start(&self, handler: Arc<dyn DeliveryHandler>) -> Result<(), TransportError>;

    async fn declare_exchange(&self, exchange: &ServiceExchangeModel) -> Result<(), TransportError>;

    /// Routes `routing_key` on `exchange` to this process.
    async fn bind(
        &self,
        exchange: &ServiceExchangeModel,
        routing_key: &str,
    ) -> Result<(), TransportError>;

    /// Undoes one `bind`.
    async fn unbind(
        &self,
        exchange: &ServiceExchangeModel,
        routing_key: &str,
    ) -> Result<(), TransportError>;

    /// Fire-and-forget publish.
    async fn publish(
        &self,
        exchange: &ServiceExchangeModel,
        routing_key: &str,
        payload: Bytes,
    ) -> Result<(), TransportError>;

    /// Publishes a request carrying this process's reply address and `request.id`.
    async fn publish_request(
        &self,
        exchange: &ServiceExchangeModel,
        routing_key: &str,
        payload: Bytes,
        request: &ServiceRequest,
    ) -> Result<(), TransportError>;

    /// Publishes a reply to the sender of the delivery behind `sender`.
    async fn publish_reply(&self, sender: &SenderToken, payload: Bytes)
        -> Result<(), TransportError>;

    async fn acknowledge(&self, sender: &SenderToken) -> Result<(), TransportError>;

    /// Rejects a delivery; the broker requeues it.
    async fn reject(&self, sender: &SenderToken) -> Result<(), TransportError>;

    /// Registers a pending request under `id`.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::DuplicateRequestId` if `id` is already pending.
    fn create_request(&self, id: CorrelationId) -> Result<ServiceRequest, TransportError>;

    /// Forgets a pending request. Returns `true` if it was still pending.
    fn discard_request(&self, request: &ServiceRequest) -> bool;

    fn pending_requests(&self) -> usize;

    async fn close(&self) -> Result<(), TransportError>;
}
