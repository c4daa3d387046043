//! In-memory `Transport` that records every call, for runtime unit tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use autobus_core::{CorrelationId, ServiceExchangeModel};
use bytes::Bytes;
use parking_lot::Mutex;

use super::pending::PendingRequests;
use super::{
    DeliveryHandler, InboundDelivery, SenderToken, ServiceRequest, ServiceResponse, Transport,
};
use crate::error::{BrokerError, TransportError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    DeclareExchange(String),
    Bind { exchange: String, routing_key: String },
    Unbind { exchange: String, routing_key: String },
    Publish { exchange: String, routing_key: String },
    PublishRequest { exchange: String, routing_key: String, id: CorrelationId },
    Reply { tag: u64, payload: Bytes },
    Ack(u64),
    Reject(u64),
    Close,
}

struct RecordedDelivery {
    tag: u64,
}

#[derive(Default)]
pub(crate) struct RecordingTransport {
    pending: Arc<PendingRequests>,
    handler: OnceLock<Arc<dyn DeliveryHandler>>,
    calls: Mutex<Vec<Call>>,
    next_tag: AtomicU64,
    failing_bind: Mutex<Option<String>>,
    reply_on_discard: Mutex<Option<Bytes>>,
}

impl RecordingTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub(crate) fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub(crate) fn acks(&self) -> Vec<u64> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Ack(tag) => Some(tag),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn rejects(&self) -> Vec<u64> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Reject(tag) => Some(tag),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn replies(&self) -> Vec<(u64, Bytes)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Reply { tag, payload } => Some((tag, payload)),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn binds(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Bind { routing_key, .. } => Some(routing_key),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn unbinds(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Unbind { routing_key, .. } => Some(routing_key),
                _ => None,
            })
            .collect()
    }

    /// Makes every later bind of `routing_key` fail.
    pub(crate) fn fail_bind_of(&self, routing_key: &str) {
        *self.failing_bind.lock() = Some(routing_key.to_string());
    }

    /// Makes the next `discard_request` lose to a reply carrying `body`: the entry is
    /// reported as already claimed and the reply lands one scheduler turn later.
    pub(crate) fn reply_on_discard(&self, body: impl Into<Bytes>) {
        *self.reply_on_discard.lock() = Some(body.into());
    }

    /// Builds a delivery with a fresh tag, without handing it to anyone.
    pub(crate) fn inbound(&self, name: &str, body: impl Into<Bytes>) -> (u64, InboundDelivery) {
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed) + 1;
        let delivery = InboundDelivery {
            name: name.to_string(),
            body: body.into(),
            sender: SenderToken::new(RecordedDelivery { tag }),
            redelivered: false,
        };
        (tag, delivery)
    }

    /// Hands a delivery to the started handler, as a consumer loop would.
    pub(crate) fn deliver(&self, name: &str, body: impl Into<Bytes>) -> u64 {
        let (tag, delivery) = self.inbound(name, body);
        if let Some(handler) = self.handler.get() {
            handler.on_delivery(delivery);
        }
        tag
    }

    /// Resolves a pending request as if a reply had arrived.
    pub(crate) fn reply_to(&self, id: CorrelationId, body: impl Into<Bytes>) -> bool {
        self.pending.complete(
            id,
            ServiceResponse {
                data: body.into(),
                sender: SenderToken::new(()),
            },
        )
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }

    fn tag(sender: &SenderToken) -> Result<u64, TransportError> {
        sender
            .downcast_ref::<RecordedDelivery>()
            .map(|d| d.tag)
            .ok_or(TransportError::ForeignSenderToken)
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn start(&self, handler: Arc<dyn DeliveryHandler>) -> Result<(), TransportError> {
        self.handler
            .set(handler)
            .map_err(|_| TransportError::AlreadyStarted)
    }

    async fn declare_exchange(&self, exchange: &ServiceExchangeModel) -> Result<(), TransportError> {
        self.record(Call::DeclareExchange(exchange.name()));
        Ok(())
    }

    async fn bind(
        &self,
        exchange: &ServiceExchangeModel,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        if self.failing_bind.lock().as_deref() == Some(routing_key) {
            return Err(BrokerError::ChannelClosed.into());
        }
        self.record(Call::Bind {
            exchange: exchange.name(),
            routing_key: routing_key.to_string(),
        });
        Ok(())
    }

    async fn unbind(
        &self,
        exchange: &ServiceExchangeModel,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.record(Call::Unbind {
            exchange: exchange.name(),
            routing_key: routing_key.to_string(),
        });
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &ServiceExchangeModel,
        routing_key: &str,
        _payload: Bytes,
    ) -> Result<(), TransportError> {
        self.record(Call::Publish {
            exchange: exchange.name(),
            routing_key: routing_key.to_string(),
        });
        Ok(())
    }

    async fn publish_request(
        &self,
        exchange: &ServiceExchangeModel,
        routing_key: &str,
        _payload: Bytes,
        request: &ServiceRequest,
    ) -> Result<(), TransportError> {
        self.record(Call::PublishRequest {
            exchange: exchange.name(),
            routing_key: routing_key.to_string(),
            id: request.id,
        });
        Ok(())
    }

    async fn publish_reply(
        &self,
        sender: &SenderToken,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        let tag = Self::tag(sender)?;
        self.record(Call::Reply { tag, payload });
        Ok(())
    }

    async fn acknowledge(&self, sender: &SenderToken) -> Result<(), TransportError> {
        let tag = Self::tag(sender)?;
        self.record(Call::Ack(tag));
        Ok(())
    }

    async fn reject(&self, sender: &SenderToken) -> Result<(), TransportError> {
        let tag = Self::tag(sender)?;
        self.record(Call::Reject(tag));
        Ok(())
    }

    fn create_request(&self, id: CorrelationId) -> Result<ServiceRequest, TransportError> {
        self.pending.insert(id)
    }

    fn discard_request(&self, request: &ServiceRequest) -> bool {
        if let Some(body) = self.reply_on_discard.lock().take() {
            let pending = Arc::clone(&self.pending);
            let id = request.id;
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                pending.complete(
                    id,
                    ServiceResponse {
                        data: body,
                        sender: SenderToken::new(()),
                    },
                );
            });
            return false;
        }
        self.pending.discard(request.id)
    }

    fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.pending.clear();
        self.record(Call::Close);
        Ok(())
    }
}
