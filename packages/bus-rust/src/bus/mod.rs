//! The bus runtime.
//!
//! A [`Bus`] owns the service registry, the subscription tables and a transport.
//! It turns typed `publish`/`request`/`subscribe_*`/`bind` calls into transport
//! bindings and publishes, and routes inbound deliveries back to typed handlers.
//!
//! Binding state per message type is `Unbound -> Bound -> Unbound`: the transport
//! binding is created with the first handler and removed with the last one. All
//! subscription changes are serialized by one async lock; inbound dispatch reads
//! the tables without taking it.

pub mod binding;
pub mod builder;
pub(crate) mod dispatch;
pub mod handler;
pub(crate) mod subscriptions;


use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use autobus_core::message::short_type_name;
use autobus_core::{
    CorrelationIdProvider, JsonSerializationProvider, Message, MessageBehavior, MessageModel,
    SerializationProvider, ServiceContract, ServiceRegistry,
};
use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::client::ServiceClient;
use crate::config::BusConfig;
use crate::error::BusError;
use crate::shutdown::{BusState, LifecycleController};
use crate::transport::{ServiceRequest, Transport};

pub use binding::{BindingId, ServiceImplementation};
pub use builder::BusBuilder;
pub use handler::{HandlerId, MessageHandler, RequestHandler};

use subscriptions::{Subscription, SubscriptionTable};

// ---------------------------------------------------------------------------
// BusInner
// ---------------------------------------------------------------------------

pub(crate) struct BusInner<S> {
    pub(crate) config: BusConfig,
    pub(crate) registry: ServiceRegistry,
    pub(crate) serializer: Arc<S>,
    pub(crate) ids: Arc<dyn CorrelationIdProvider>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) subscriptions: SubscriptionTable,
    pub(crate) bindings: DashMap<BindingId, Vec<(MessageModel, HandlerId)>>,
    pub(crate) next_binding: AtomicU64,
    pub(crate) lifecycle: LifecycleController,
    /// Serializes subscription table changes with their transport bind/unbind.
    pub(crate) topology: tokio::sync::Mutex<()>,
}

impl<S: SerializationProvider> BusInner<S> {
    fn ensure_running(&self) -> Result<(), BusError> {
        if self.lifecycle.is_running() {
            Ok(())
        } else {
            Err(BusError::ShuttingDown)
        }
    }

    fn contract_of(&self, model: &MessageModel) -> Result<&Arc<ServiceContract>, BusError> {
        self.registry
            .owning_service(model)
            .ok_or(BusError::UnknownMessageName {
                name: model.name().to_string(),
            })
    }

    async fn bind_transport(&self, model: &MessageModel) -> Result<(), BusError> {
        let exchange = self.contract_of(model)?.exchange_for(model);
        self.transport.bind(&exchange, model.name()).await?;
        debug!(message = %model.name(), exchange = %exchange, "bound");
        Ok(())
    }

    async fn unbind_transport(&self, model: &MessageModel) -> Result<(), BusError> {
        let exchange = self.contract_of(model)?.exchange_for(model);
        self.transport.unbind(&exchange, model.name()).await?;
        debug!(message = %model.name(), exchange = %exchange, "unbound");
        Ok(())
    }

    /// Registers the single handler of a request or command type and binds it.
    pub(crate) async fn subscribe_single(
        &self,
        model: &MessageModel,
        subscription: Subscription,
    ) -> Result<HandlerId, BusError> {
        let _topology = self.topology.lock().await;
        let id = subscription.id;
        if !self.subscriptions.insert_handler(model.type_id(), subscription) {
            return Err(BusError::AlreadyBound {
                message: model.name().to_string(),
            });
        }
        if let Err(e) = self.bind_transport(model).await {
            self.subscriptions.remove_handler(model.type_id(), id);
            return Err(e);
        }
        Ok(id)
    }

    pub(crate) async fn unsubscribe_single(
        &self,
        model: &MessageModel,
        id: HandlerId,
    ) -> Result<(), BusError> {
        let _topology = self.topology.lock().await;
        if !self.subscriptions.remove_handler(model.type_id(), id) {
            return Err(BusError::NotBound {
                message: model.name().to_string(),
            });
        }
        self.unbind_transport(model).await
    }

    async fn subscribe_event(
        &self,
        model: &MessageModel,
        subscription: Subscription,
    ) -> Result<HandlerId, BusError> {
        let _topology = self.topology.lock().await;
        let id = subscription.id;
        let Some(count) = self
            .subscriptions
            .add_event_handler(model.type_id(), subscription)
        else {
            return Err(BusError::AlreadyBound {
                message: model.name().to_string(),
            });
        };
        if count == 1 {
            if let Err(e) = self.bind_transport(model).await {
                self.subscriptions.remove_event_handler(model.type_id(), id);
                return Err(e);
            }
        }
        Ok(id)
    }

    async fn unsubscribe_event(&self, model: &MessageModel, id: HandlerId) -> Result<(), BusError> {
        let _topology = self.topology.lock().await;
        match self.subscriptions.remove_event_handler(model.type_id(), id) {
            None => Err(BusError::NotBound {
                message: model.name().to_string(),
            }),
            Some(0) => self.unbind_transport(model).await,
            Some(_) => Ok(()),
        }
    }

    /// Removes handlers registered by a failed or undone binding. Returns the first
    /// error while still attempting every removal.
    async fn release(&self, registered: &[(MessageModel, HandlerId)]) -> Result<(), BusError> {
        let mut first = None;
        for (model, id) in registered {
            if let Err(e) = self.unsubscribe_single(model, *id).await {
                warn!(message = %model.name(), error = %e, "handler release failed");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

/// Discards a pending request if the caller stops waiting before it is settled,
/// e.g. when the request future is dropped.
struct PendingGuard<'a> {
    transport: &'a dyn Transport,
    request: ServiceRequest,
    armed: bool,
}

impl PendingGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.transport.discard_request(&self.request) {
            debug!(correlation_id = %self.request.id, "pending request dropped by its caller");
        }
    }
}

fn expect_behavior(model: &MessageModel, expected: MessageBehavior) -> Result<(), BusError> {
    if model.behavior() == expected {
        Ok(())
    } else {
        Err(BusError::InvalidBehavior {
            message: model.name().to_string(),
            expected,
            actual: model.behavior(),
        })
    }
}

fn expect_response<R: Message>(
    registry: &ServiceRegistry,
    request: &MessageModel,
) -> Result<(), BusError> {
    if registry
        .response_model(request)
        .is_some_and(MessageModel::is::<R>)
    {
        Ok(())
    } else {
        Err(BusError::InvalidRequestResponsePair {
            request: request.name().to_string(),
            response: short_type_name(std::any::type_name::<R>()).to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

/// Handle to a running bus. Cloning is cheap and shares the same runtime.
pub struct Bus<S = JsonSerializationProvider> {
    inner: Arc<BusInner<S>>,
}

impl<S> Clone for Bus<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: SerializationProvider> Bus<S> {
    pub(crate) fn from_inner(inner: Arc<BusInner<S>>) -> Self {
        Self { inner }
    }

    #[must_use]
    pub fn registry(&self) -> &ServiceRegistry {
        &self.inner.registry
    }

    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn state(&self) -> BusState {
        self.inner.lifecycle.state()
    }

    /// Requests waiting for a reply.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.inner.transport.pending_requests()
    }

    /// Number of bound handlers across all message types.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.inner.subscriptions.len()
    }

    /// # Errors
    ///
    /// Returns `RegistryError::UnknownContract` if no contract has that name.
    pub fn service_contract(&self, name: &str) -> Result<&Arc<ServiceContract>, BusError> {
        Ok(self.inner.registry.service_contract(name)?)
    }

    #[must_use]
    pub fn service_contracts(&self) -> &[Arc<ServiceContract>] {
        self.inner.registry.service_contracts()
    }

    /// Contract that declares the interface `interface`.
    #[must_use]
    pub fn contract_implementing(&self, interface: &str) -> Option<&Arc<ServiceContract>> {
        self.inner.registry.service_implementing(interface)
    }

    /// Typed handle scoped to one contract.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::UnknownContract` if no contract has that name.
    pub fn client(&self, contract: &str) -> Result<ServiceClient<S>, BusError> {
        let contract = Arc::clone(self.service_contract(contract)?);
        Ok(ServiceClient::new(self.clone(), contract))
    }

    // -- publishing ---------------------------------------------------------

    /// Fire-and-forget publish. Only encoding and enqueueing can fail; handler
    /// failures downstream are never reported here.
    ///
    /// # Errors
    ///
    /// Returns `BusError::ShuttingDown` once shutdown has begun, a registry error
    /// for an unregistered type, or the serialization/transport error.
    pub async fn publish<M: Message>(&self, message: &M) -> Result<(), BusError> {
        let inner = &self.inner;
        inner.ensure_running()?;
        let model = inner.registry.message_model::<M>()?;
        let exchange = inner.contract_of(model)?.exchange_for(model);
        let payload = inner.serializer.serialize(message)?;
        inner
            .transport
            .publish(&exchange, model.name(), Bytes::from(payload))
            .await?;
        Ok(())
    }

    /// Sends a request and waits for its reply for the configured request timeout.
    ///
    /// # Errors
    ///
    /// See [`Bus::request_with_timeout`].
    pub async fn request<Q: Message, R: Message>(&self, request: &Q) -> Result<R, BusError> {
        self.request_with_timeout(request, self.inner.config.request_timeout)
            .await
    }

    /// Sends a request and waits up to `timeout` for its reply. Dropping the returned
    /// future discards the pending entry.
    ///
    /// # Errors
    ///
    /// - `BusError::InvalidBehavior` if `Q` is not a request;
    /// - `BusError::InvalidRequestResponsePair` if `Q` is not answered with `R`;
    /// - `BusError::RequestTimeout` if no reply arrived in time; the pending entry is
    ///   discarded and a late reply is dropped;
    /// - `BusError::RequestAbandoned` if the transport closed first;
    /// - serialization and transport errors.
    pub async fn request_with_timeout<Q: Message, R: Message>(
        &self,
        request: &Q,
        timeout: Duration,
    ) -> Result<R, BusError> {
        let inner = &self.inner;
        inner.ensure_running()?;
        let model = inner.registry.message_model::<Q>()?;
        expect_behavior(model, MessageBehavior::Request)?;
        expect_response::<R>(&inner.registry, model)?;
        let exchange = inner.contract_of(model)?.exchange_for(model);
        let payload = Bytes::from(inner.serializer.serialize(request)?);

        let mut pending = PendingGuard {
            transport: &*inner.transport,
            request: inner.transport.create_request(inner.ids.next_id())?,
            armed: true,
        };
        inner
            .transport
            .publish_request(&exchange, model.name(), payload, &pending.request)
            .await?;

        let outcome = match tokio::time::timeout(timeout, &mut pending.request.completion).await {
            Ok(outcome) => outcome,
            Err(_) => {
                if inner.transport.discard_request(&pending.request) {
                    pending.disarm();
                    debug!(message = %model.name(), correlation_id = %pending.request.id, "request timed out");
                    return Err(BusError::RequestTimeout {
                        message: model.name().to_string(),
                        timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    });
                }
                // The reply claimed the entry first; its sender either delivers or drops.
                (&mut pending.request.completion).await
            }
        };
        pending.disarm();
        let response = outcome.map_err(|_| BusError::RequestAbandoned {
            message: model.name().to_string(),
        })?;

        Ok(inner.serializer.deserialize(&response.data)?)
    }

    // -- subscriptions ------------------------------------------------------

    /// Binds the handler for requests of type `Q`.
    ///
    /// # Errors
    ///
    /// - `BusError::InvalidBehavior` if `Q` is not a request;
    /// - `BusError::InvalidRequestResponsePair` if the contract answers `Q` with
    ///   something other than `R`; no handler is registered;
    /// - `BusError::AlreadyBound` if `Q` already has a handler;
    /// - the transport error if the bind fails; the handler is removed again.
    pub async fn subscribe_request<Q: Message, R: Message>(
        &self,
        handler: Arc<dyn RequestHandler<Q, R>>,
    ) -> Result<HandlerId, BusError> {
        let inner = &self.inner;
        let model = inner.registry.message_model::<Q>()?;
        expect_behavior(model, MessageBehavior::Request)?;
        expect_response::<R>(&inner.registry, model)?;
        let subscription = Subscription::request(&inner.serializer, handler);
        inner.subscribe_single(model, subscription).await
    }

    /// Unbinds `handler` from `Q`.
    ///
    /// # Errors
    ///
    /// Returns `BusError::NotBound` if `handler` is not the bound handler of `Q`.
    pub async fn unsubscribe_request<Q: Message, R: Message>(
        &self,
        handler: &Arc<dyn RequestHandler<Q, R>>,
    ) -> Result<(), BusError> {
        let model = self.inner.registry.message_model::<Q>()?;
        self.inner
            .unsubscribe_single(model, HandlerId::of(handler))
            .await
    }

    /// Binds the handler for commands of type `C`.
    ///
    /// # Errors
    ///
    /// `BusError::InvalidBehavior` if `C` is not a command, `BusError::AlreadyBound`
    /// if it already has a handler, or the transport error.
    pub async fn subscribe_command<C: Message>(
        &self,
        handler: Arc<dyn MessageHandler<C>>,
    ) -> Result<HandlerId, BusError> {
        let inner = &self.inner;
        let model = inner.registry.message_model::<C>()?;
        expect_behavior(model, MessageBehavior::Command)?;
        let subscription = Subscription::message(&inner.serializer, handler);
        inner.subscribe_single(model, subscription).await
    }

    /// # Errors
    ///
    /// Returns `BusError::NotBound` if `handler` is not the bound handler of `C`.
    pub async fn unsubscribe_command<C: Message>(
        &self,
        handler: &Arc<dyn MessageHandler<C>>,
    ) -> Result<(), BusError> {
        let model = self.inner.registry.message_model::<C>()?;
        self.inner
            .unsubscribe_single(model, HandlerId::of(handler))
            .await
    }

    /// Adds an event handler. The first handler of `E` binds the event queue.
    ///
    /// # Errors
    ///
    /// `BusError::InvalidBehavior` if `E` is not an event, `BusError::AlreadyBound`
    /// if this very handler is already subscribed, or the transport error.
    pub async fn subscribe_event<E: Message>(
        &self,
        handler: Arc<dyn MessageHandler<E>>,
    ) -> Result<HandlerId, BusError> {
        let inner = &self.inner;
        let model = inner.registry.message_model::<E>()?;
        expect_behavior(model, MessageBehavior::Event)?;
        let subscription = Subscription::message(&inner.serializer, handler);
        inner.subscribe_event(model, subscription).await
    }

    /// Removes an event handler. The last handler of `E` unbinds it.
    ///
    /// # Errors
    ///
    /// Returns `BusError::NotBound` if `handler` is not subscribed to `E`.
    pub async fn unsubscribe_event<E: Message>(
        &self,
        handler: &Arc<dyn MessageHandler<E>>,
    ) -> Result<(), BusError> {
        let model = self.inner.registry.message_model::<E>()?;
        self.inner
            .unsubscribe_event(model, HandlerId::of(handler))
            .await
    }

    // -- bind ---------------------------------------------------------------

    /// Registers one handler per request and command declared by the interfaces of
    /// `contract`, taken from `implementation`.
    ///
    /// Every interface and handler is checked before anything is registered. If a
    /// registration still fails, the handlers registered so far are removed.
    ///
    /// # Errors
    ///
    /// - `BusError::UnbindableContract` if the contract declares no interfaces;
    /// - `BusError::MissingImplementation` if an interface is not provided;
    /// - `BusError::MissingHandler` if a declared request or command has no handler;
    /// - `BusError::InvalidRequestResponsePair` if a request handler answers with
    ///   the wrong type, `BusError::InvalidBehavior` if a command is given a request
    ///   handler or the other way round;
    /// - `BusError::AlreadyBound` or a transport error from registration.
    pub async fn bind(
        &self,
        contract: &str,
        mut implementation: ServiceImplementation<S>,
    ) -> Result<BindingId, BusError> {
        let inner = &self.inner;
        let contract = Arc::clone(inner.registry.service_contract(contract)?);
        if contract.interfaces().is_empty() {
            return Err(BusError::UnbindableContract {
                contract: contract.name().to_string(),
            });
        }

        let mut planned = Vec::new();
        for interface in contract.interfaces() {
            if !implementation.provides(interface.name()) {
                return Err(BusError::MissingImplementation {
                    contract: contract.name().to_string(),
                    interface: interface.name().to_string(),
                });
            }
            let missing = |message: &MessageModel| BusError::MissingHandler {
                interface: interface.name().to_string(),
                message: message.name().to_string(),
            };

            for entry in interface.requests() {
                let provided = implementation
                    .take_handler(entry.request.type_id())
                    .ok_or_else(|| missing(&entry.request))?;
                match provided.response {
                    Some(response) if response == entry.response.type_id() => {}
                    Some(_) => {
                        return Err(BusError::InvalidRequestResponsePair {
                            request: entry.request.name().to_string(),
                            response: entry.response.name().to_string(),
                        })
                    }
                    None => {
                        return Err(BusError::InvalidBehavior {
                            message: entry.request.name().to_string(),
                            expected: MessageBehavior::Command,
                            actual: MessageBehavior::Request,
                        })
                    }
                }
                planned.push((entry.request.clone(), provided));
            }
            for command in interface.commands() {
                let provided = implementation
                    .take_handler(command.type_id())
                    .ok_or_else(|| missing(command))?;
                if provided.response.is_some() {
                    return Err(BusError::InvalidBehavior {
                        message: command.name().to_string(),
                        expected: MessageBehavior::Request,
                        actual: MessageBehavior::Command,
                    });
                }
                planned.push((command.clone(), provided));
            }
        }
        if implementation.remaining_handlers() > 0 {
            debug!(
                contract = %contract.name(),
                unused = implementation.remaining_handlers(),
                "handlers for undeclared messages ignored"
            );
        }

        let mut registered = Vec::with_capacity(planned.len());
        for (model, provided) in planned {
            let subscription = (provided.make)(&inner.serializer);
            match inner.subscribe_single(&model, subscription).await {
                Ok(id) => registered.push((model, id)),
                Err(e) => {
                    if let Err(release) = inner.release(&registered).await {
                        warn!(contract = %contract.name(), error = %release, "rollback incomplete");
                    }
                    return Err(e);
                }
            }
        }

        let id = BindingId(inner.next_binding.fetch_add(1, Ordering::Relaxed) + 1);
        info!(contract = %contract.name(), binding = %id, handlers = registered.len(), "implementation bound");
        inner.bindings.insert(id, registered);
        Ok(id)
    }

    /// Removes every handler registered by `binding`.
    ///
    /// # Errors
    ///
    /// Returns `BusError::UnknownBinding` for an unknown or already removed binding,
    /// or the first error hit while removing its handlers.
    pub async fn unbind(&self, binding: BindingId) -> Result<(), BusError> {
        let (_, registered) = self
            .inner
            .bindings
            .remove(&binding)
            .ok_or(BusError::UnknownBinding { id: binding.0 })?;
        self.inner.release(&registered).await?;
        info!(binding = %binding, "implementation unbound");
        Ok(())
    }

    // -- lifecycle ----------------------------------------------------------

    /// Stops dispatching, waits up to the drain timeout for running handlers and
    /// closes the transport. Deliveries arriving meanwhile are rejected back to the
    /// broker. A second call is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the transport error from closing.
    pub async fn shutdown(&self) -> Result<(), BusError> {
        let inner = &self.inner;
        if !inner.lifecycle.begin_drain() {
            return Ok(());
        }
        if inner.lifecycle.wait_for_drain(inner.config.drain_timeout).await {
            info!("bus drained");
        } else {
            warn!(
                in_flight = inner.lifecycle.in_flight_count(),
                "drain timeout expired, closing with handlers still running"
            );
        }
        inner.transport.close().await?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<BusInner<S>> {
        &self.inner
    }

    #[cfg(test)]
    pub(crate) fn is_bound(&self, type_id: std::any::TypeId) -> bool {
        self.inner.subscriptions.handler(type_id).is_some()
            || !self.inner.subscriptions.event_handlers(type_id).is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::any::TypeId;
    use std::sync::atomic::AtomicUsize;

    use autobus_core::{AtomicCorrelationIdProvider, CorrelationId, ServiceInterfaceModel};
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::transport::recording::{Call, RecordingTransport};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        id: u32,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Pong {
        id: u32,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Other {
        id: u32,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Reset;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Pinged {
        id: u32,
    }

    fn pinger() -> ServiceContract {
        ServiceContract::builder("Pinger")
            .interface(
                ServiceInterfaceModel::builder("IPinger")
                    .request::<Ping, Pong>()
                    .command::<Reset>()
                    .build(),
            )
            .event::<Pinged>()
            .build()
            .unwrap()
    }

    fn others() -> ServiceContract {
        ServiceContract::builder("Others")
            .command::<Other>()
            .build()
            .unwrap()
    }

    async fn bus_with(transport: &Arc<RecordingTransport>) -> Bus {
        BusBuilder::new()
            .use_service(pinger())
            .use_service(others())
            .use_transport(Arc::clone(transport) as Arc<dyn Transport>)
            .use_correlation_id_provider(Arc::new(AtomicCorrelationIdProvider::new()))
            .build()
            .await
            .unwrap()
    }

    fn echo() -> Arc<dyn RequestHandler<Ping, Pong>> {
        Arc::new(|p: Ping| async move { anyhow::Ok(Pong { id: p.id }) })
    }

    fn json<T: Serialize>(value: &T) -> Bytes {
        Bytes::from(serde_json::to_vec(value).unwrap())
    }

    #[tokio::test]
    async fn build_declares_every_exchange() {
        let transport = RecordingTransport::new();
        let bus = bus_with(&transport).await;
        assert_eq!(bus.state(), BusState::Running);

        let declared: Vec<Call> = transport.calls();
        assert_eq!(
            declared,
            vec![
                Call::DeclareExchange("Pinger".to_string()),
                Call::DeclareExchange("Pinger.Events".to_string()),
                Call::DeclareExchange("Others".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn subscribe_binds_once_and_rejects_duplicates() {
        let transport = RecordingTransport::new();
        let bus = bus_with(&transport).await;
        let handler = echo();

        bus.subscribe_request(Arc::clone(&handler)).await.unwrap();
        assert!(matches!(
            bus.subscribe_request(echo()).await,
            Err(BusError::AlreadyBound { .. })
        ));
        assert_eq!(transport.binds(), vec!["Ping".to_string()]);

        bus.unsubscribe_request(&handler).await.unwrap();
        assert_eq!(transport.unbinds(), vec!["Ping".to_string()]);
        assert!(matches!(
            bus.unsubscribe_request(&handler).await,
            Err(BusError::NotBound { .. })
        ));
    }

    #[tokio::test]
    async fn invalid_pair_registers_nothing() {
        let transport = RecordingTransport::new();
        let bus = bus_with(&transport).await;

        let wrong: Arc<dyn RequestHandler<Ping, Other>> =
            Arc::new(|p: Ping| async move { anyhow::Ok(Other { id: p.id }) });
        assert!(matches!(
            bus.subscribe_request(wrong).await,
            Err(BusError::InvalidRequestResponsePair { ref request, ref response })
                if request == "Ping" && response == "Other"
        ));
        assert!(!bus.is_bound(TypeId::of::<Ping>()));
        assert!(transport.binds().is_empty());
    }

    #[tokio::test]
    async fn wrong_behavior_is_rejected() {
        let transport = RecordingTransport::new();
        let bus = bus_with(&transport).await;

        let as_event: Arc<dyn MessageHandler<Reset>> = Arc::new(|_: Reset| async { anyhow::Ok(()) });
        assert!(matches!(
            bus.subscribe_event(as_event).await,
            Err(BusError::InvalidBehavior {
                expected: MessageBehavior::Event,
                actual: MessageBehavior::Command,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn event_binding_follows_first_and_last_handler() {
        let transport = RecordingTransport::new();
        let bus = bus_with(&transport).await;
        let a: Arc<dyn MessageHandler<Pinged>> = Arc::new(|_: Pinged| async { anyhow::Ok(()) });
        let b: Arc<dyn MessageHandler<Pinged>> = Arc::new(|_: Pinged| async { anyhow::Ok(()) });

        bus.subscribe_event(Arc::clone(&a)).await.unwrap();
        bus.subscribe_event(Arc::clone(&b)).await.unwrap();
        assert!(matches!(
            bus.subscribe_event(Arc::clone(&a)).await,
            Err(BusError::AlreadyBound { .. })
        ));
        assert_eq!(transport.binds(), vec!["Pinged".to_string()]);

        bus.unsubscribe_event(&a).await.unwrap();
        assert!(transport.unbinds().is_empty());
        bus.unsubscribe_event(&b).await.unwrap();
        assert_eq!(transport.unbinds(), vec!["Pinged".to_string()]);
    }

    #[tokio::test]
    async fn failed_bind_leaves_type_unbound() {
        let transport = RecordingTransport::new();
        let bus = bus_with(&transport).await;
        transport.fail_bind_of("Ping");

        assert!(matches!(
            bus.subscribe_request(echo()).await,
            Err(BusError::Transport(_))
        ));
        assert!(!bus.is_bound(TypeId::of::<Ping>()));
    }

    #[tokio::test]
    async fn request_is_answered_by_the_reply() {
        let transport = RecordingTransport::new();
        let bus = bus_with(&transport).await;

        let caller = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.request::<Ping, Pong>(&Ping { id: 7 }).await })
        };
        while transport.pending_requests() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(transport.reply_to(CorrelationId(1), json(&Pong { id: 7 })));

        assert_eq!(caller.await.unwrap().unwrap(), Pong { id: 7 });
        assert!(transport.calls().contains(&Call::PublishRequest {
            exchange: "Pinger".to_string(),
            routing_key: "Ping".to_string(),
            id: CorrelationId(1),
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn request_times_out_and_discards_the_entry() {
        let transport = RecordingTransport::new();
        let bus = bus_with(&transport).await;

        let err = bus
            .request_with_timeout::<Ping, Pong>(&Ping { id: 1 }, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::RequestTimeout { timeout_ms: 50, .. }));
        assert_eq!(bus.pending_requests(), 0);
        assert!(!transport.reply_to(CorrelationId(1), json(&Pong { id: 1 })));
    }

    #[tokio::test(start_paused = true)]
    async fn request_times_out_within_its_window() {
        let transport = RecordingTransport::new();
        let bus = bus_with(&transport).await;

        let started = tokio::time::Instant::now();
        let result = bus
            .request_with_timeout::<Ping, Pong>(&Ping { id: 1 }, Duration::from_millis(50))
            .await;
        let elapsed = started.elapsed();
        assert!(matches!(result, Err(BusError::RequestTimeout { .. })));
        assert!(elapsed >= Duration::from_millis(50), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(100), "{elapsed:?}");
    }

    #[tokio::test]
    async fn reply_that_claims_the_entry_before_the_timer_is_returned() {
        let transport = RecordingTransport::new();
        let bus = bus_with(&transport).await;
        transport.reply_on_discard(json(&Pong { id: 1 }));

        let pong: Pong = bus
            .request_with_timeout(&Ping { id: 1 }, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(pong, Pong { id: 1 });
        assert_eq!(bus.pending_requests(), 0);
    }

    #[tokio::test]
    async fn cancelled_request_discards_its_entry() {
        let transport = RecordingTransport::new();
        let bus = bus_with(&transport).await;

        let outer = tokio::time::timeout(
            Duration::from_millis(20),
            bus.request_with_timeout::<Ping, Pong>(&Ping { id: 1 }, Duration::from_secs(30)),
        )
        .await;
        assert!(outer.is_err());
        assert_eq!(bus.pending_requests(), 0);
        assert!(!transport.reply_to(CorrelationId(1), json(&Pong { id: 1 })));
    }

    #[tokio::test]
    async fn aborted_caller_discards_its_entry() {
        let transport = RecordingTransport::new();
        let bus = bus_with(&transport).await;

        let caller = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.request::<Ping, Pong>(&Ping { id: 1 }).await })
        };
        while transport.pending_requests() == 0 {
            tokio::task::yield_now().await;
        }
        caller.abort();
        assert!(caller.await.unwrap_err().is_cancelled());
        assert_eq!(bus.pending_requests(), 0);
    }

    #[tokio::test]
    async fn request_for_wrong_response_type_is_rejected() {
        let transport = RecordingTransport::new();
        let bus = bus_with(&transport).await;
        assert!(matches!(
            bus.request::<Ping, Other>(&Ping { id: 1 }).await,
            Err(BusError::InvalidRequestResponsePair { .. })
        ));
        assert_eq!(bus.pending_requests(), 0);
    }

    #[tokio::test]
    async fn publish_routes_by_behavior() {
        let transport = RecordingTransport::new();
        let bus = bus_with(&transport).await;
        transport.clear_calls();

        bus.publish(&Pinged { id: 1 }).await.unwrap();
        bus.publish(&Reset).await.unwrap();
        assert_eq!(
            transport.calls(),
            vec![
                Call::Publish {
                    exchange: "Pinger.Events".to_string(),
                    routing_key: "Pinged".to_string(),
                },
                Call::Publish {
                    exchange: "Pinger".to_string(),
                    routing_key: "Reset".to_string(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn request_delivery_replies_then_acks() {
        let transport = RecordingTransport::new();
        let bus = bus_with(&transport).await;
        bus.subscribe_request(echo()).await.unwrap();

        let (tag, delivery) = transport.inbound("Ping", json(&Ping { id: 3 }));
        bus.inner().dispatch(delivery).await.unwrap();

        assert_eq!(transport.replies(), vec![(tag, json(&Pong { id: 3 }))]);
        assert_eq!(transport.acks(), vec![tag]);
        assert!(transport.rejects().is_empty());
    }

    #[tokio::test]
    async fn failing_handler_is_rejected_exactly_once() {
        let transport = RecordingTransport::new();
        let bus = bus_with(&transport).await;
        let failing: Arc<dyn RequestHandler<Ping, Pong>> =
            Arc::new(|_: Ping| async { Err::<Pong, _>(anyhow::anyhow!("database unavailable")) });
        bus.subscribe_request(failing).await.unwrap();

        let (tag, delivery) = transport.inbound("Ping", json(&Ping { id: 3 }));
        let err = bus.inner().dispatch(delivery).await.unwrap_err();

        assert!(matches!(err, BusError::HandlerFailed { ref reason, .. } if reason.contains("database")));
        assert_eq!(transport.rejects(), vec![tag]);
        assert!(transport.acks().is_empty());
        assert!(transport.replies().is_empty());
    }

    #[tokio::test]
    async fn panicking_handler_is_rejected() {
        let transport = RecordingTransport::new();
        let bus = bus_with(&transport).await;
        let panicking: Arc<dyn MessageHandler<Reset>> = Arc::new(|_: Reset| async {
            if true {
                panic!("handler bug");
            }
            anyhow::Ok(())
        });
        bus.subscribe_command(panicking).await.unwrap();

        let (tag, delivery) = transport.inbound("Reset", json(&Reset));
        assert!(bus.inner().dispatch(delivery).await.is_err());
        assert_eq!(transport.rejects(), vec![tag]);
    }

    #[tokio::test]
    async fn undecodable_payload_is_rejected() {
        let transport = RecordingTransport::new();
        let bus = bus_with(&transport).await;
        bus.subscribe_request(echo()).await.unwrap();

        let (tag, delivery) = transport.inbound("Ping", Bytes::from_static(b"{"));
        assert!(bus.inner().dispatch(delivery).await.is_err());
        assert_eq!(transport.rejects(), vec![tag]);
    }

    #[tokio::test]
    async fn unknown_and_unhandled_deliveries_are_rejected() {
        let transport = RecordingTransport::new();
        let bus = bus_with(&transport).await;

        let (unknown, delivery) = transport.inbound("Nope", Bytes::new());
        assert!(matches!(
            bus.inner().dispatch(delivery).await,
            Err(BusError::UnknownMessageName { .. })
        ));
        let (unhandled, delivery) = transport.inbound("Reset", json(&Reset));
        assert!(matches!(
            bus.inner().dispatch(delivery).await,
            Err(BusError::NoHandler { .. })
        ));
        assert_eq!(transport.rejects(), vec![unknown, unhandled]);
    }

    #[tokio::test]
    async fn event_fan_out_waits_for_every_handler() {
        let transport = RecordingTransport::new();
        let bus = bus_with(&transport).await;
        let calls = Arc::new(AtomicUsize::new(0));
        for delay in [30_u64, 10, 20] {
            let calls = Arc::clone(&calls);
            let handler: Arc<dyn MessageHandler<Pinged>> = Arc::new(move |_: Pinged| {
                let calls = Arc::clone(&calls);
                async move {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    calls.fetch_add(1, Ordering::SeqCst);
                    anyhow::Ok(())
                }
            });
            bus.subscribe_event(handler).await.unwrap();
        }

        let (_, delivery) = transport.inbound("Pinged", json(&Pinged { id: 1 }));
        bus.inner().dispatch(delivery).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Events are never settled by the runtime.
        assert!(transport.acks().is_empty());
        assert!(transport.rejects().is_empty());
    }

    #[tokio::test]
    async fn one_failing_event_handler_fails_the_dispatch() {
        let transport = RecordingTransport::new();
        let bus = bus_with(&transport).await;
        let calls = Arc::new(AtomicUsize::new(0));
        for fail in [false, true, false] {
            let calls = Arc::clone(&calls);
            let handler: Arc<dyn MessageHandler<Pinged>> = Arc::new(move |_: Pinged| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if fail {
                        anyhow::bail!("projection out of date");
                    }
                    anyhow::Ok(())
                }
            });
            bus.subscribe_event(handler).await.unwrap();
        }

        let (_, delivery) = transport.inbound("Pinged", json(&Pinged { id: 1 }));
        let err = bus.inner().dispatch(delivery).await.unwrap_err();
        assert!(matches!(
            err,
            BusError::EventDispatch { failed: 1, total: 3, .. }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn bind_checks_the_capability_descriptor() {
        let transport = RecordingTransport::new();
        let bus = bus_with(&transport).await;

        assert!(matches!(
            bus.bind("Others", ServiceImplementation::new()).await,
            Err(BusError::UnbindableContract { .. })
        ));
        assert!(matches!(
            bus.bind("Pinger", ServiceImplementation::new().on_request(echo())).await,
            Err(BusError::MissingImplementation { ref interface, .. }) if interface == "IPinger"
        ));
        assert!(matches!(
            bus.bind(
                "Pinger",
                ServiceImplementation::new().implements("IPinger").on_request(echo())
            )
            .await,
            Err(BusError::MissingHandler { ref message, .. }) if message == "Reset"
        ));
        assert!(transport.binds().is_empty());
    }

    #[tokio::test]
    async fn bind_and_unbind_register_every_handler() {
        let transport = RecordingTransport::new();
        let bus = bus_with(&transport).await;
        let implementation = ServiceImplementation::new()
            .implements("IPinger")
            .on_request(echo())
            .on_command::<Reset>(Arc::new(|_: Reset| async { anyhow::Ok(()) }));

        let binding = bus.bind("Pinger", implementation).await.unwrap();
        assert!(bus.is_bound(TypeId::of::<Ping>()));
        assert!(bus.is_bound(TypeId::of::<Reset>()));
        assert_eq!(transport.binds(), vec!["Ping".to_string(), "Reset".to_string()]);

        bus.unbind(binding).await.unwrap();
        assert!(!bus.is_bound(TypeId::of::<Ping>()));
        assert!(!bus.is_bound(TypeId::of::<Reset>()));
        assert_eq!(bus.handler_count(), 0);
        assert!(matches!(
            bus.unbind(binding).await,
            Err(BusError::UnknownBinding { .. })
        ));
    }

    #[tokio::test]
    async fn partial_bind_failure_rolls_back() {
        let transport = RecordingTransport::new();
        let bus = bus_with(&transport).await;
        transport.fail_bind_of("Reset");
        let implementation = ServiceImplementation::new()
            .implements("IPinger")
            .on_request(echo())
            .on_command::<Reset>(Arc::new(|_: Reset| async { anyhow::Ok(()) }));

        assert!(bus.bind("Pinger", implementation).await.is_err());
        assert!(!bus.is_bound(TypeId::of::<Ping>()));
        assert_eq!(transport.unbinds(), vec!["Ping".to_string()]);
    }

    #[tokio::test]
    async fn shutdown_rejects_late_deliveries_and_closes() {
        let transport = RecordingTransport::new();
        let bus = bus_with(&transport).await;
        bus.subscribe_request(echo()).await.unwrap();

        bus.shutdown().await.unwrap();
        assert!(transport.calls().contains(&Call::Close));
        assert_eq!(bus.state(), BusState::Stopped);
        assert!(matches!(
            bus.publish(&Reset).await,
            Err(BusError::ShuttingDown)
        ));

        let tag = transport.deliver("Ping", json(&Ping { id: 1 }));
        while transport.rejects().is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(transport.rejects(), vec![tag]);
        bus.shutdown().await.unwrap();
    }
}
