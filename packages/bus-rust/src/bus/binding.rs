//! Capability descriptors for binding an implementation to a contract.

use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use autobus_core::{JsonSerializationProvider, Message, SerializationProvider};

use super::handler::{MessageHandler, RequestHandler};
use super::subscriptions::Subscription;

/// Handle returned by `Bus::bind`, used to undo the binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingId(pub(crate) u64);

impl fmt::Display for BindingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "binding-{}", self.0)
    }
}

type MakeSubscription<S> = Box<dyn FnOnce(&Arc<S>) -> Subscription + Send>;

pub(crate) struct ProvidedHandler<S> {
    /// Response type for request handlers; `None` for commands.
    pub(crate) response: Option<TypeId>,
    pub(crate) make: MakeSubscription<S>,
}

/// Everything an implementation offers a contract: the interfaces it claims to
/// implement and one handler per request or command.
///
/// ```ignore
/// let implementation = ServiceImplementation::new()
///     .implements("IPinger")
///     .on_request::<Ping, Pong>(Arc::new(|p: Ping| async move { anyhow::Ok(Pong { id: p.id }) }));
/// let binding = bus.bind("Pinger", implementation).await?;
/// ```
pub struct ServiceImplementation<S = JsonSerializationProvider> {
    interfaces: HashSet<String>,
    handlers: HashMap<TypeId, ProvidedHandler<S>>,
    _serializer: PhantomData<fn() -> S>,
}

impl<S: SerializationProvider> ServiceImplementation<S> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            interfaces: HashSet::new(),
            handlers: HashMap::new(),
            _serializer: PhantomData,
        }
    }

    /// Declares that this implementation provides the interface `name`.
    #[must_use]
    pub fn implements(mut self, name: impl Into<String>) -> Self {
        self.interfaces.insert(name.into());
        self
    }

    /// Supplies the handler for requests of type `Q`. A later call for the same `Q`
    /// replaces the earlier one.
    #[must_use]
    pub fn on_request<Q: Message, R: Message>(mut self, handler: Arc<dyn RequestHandler<Q, R>>) -> Self {
        self.handlers.insert(
            TypeId::of::<Q>(),
            ProvidedHandler {
                response: Some(TypeId::of::<R>()),
                make: Box::new(move |serializer: &Arc<S>| Subscription::request(serializer, handler)),
            },
        );
        self
    }

    /// Supplies the handler for commands of type `C`.
    #[must_use]
    pub fn on_command<C: Message>(mut self, handler: Arc<dyn MessageHandler<C>>) -> Self {
        self.handlers.insert(
            TypeId::of::<C>(),
            ProvidedHandler {
                response: None,
                make: Box::new(move |serializer: &Arc<S>| Subscription::message(serializer, handler)),
            },
        );
        self
    }

    #[must_use]
    pub fn provides(&self, interface: &str) -> bool {
        self.interfaces.contains(interface)
    }

    pub(crate) fn take_handler(&mut self, type_id: TypeId) -> Option<ProvidedHandler<S>> {
        self.handlers.remove(&type_id)
    }

    pub(crate) fn remaining_handlers(&self) -> usize {
        self.handlers.len()
    }
}

impl<S: SerializationProvider> Default for ServiceImplementation<S> {
    fn default() -> Self {
        Self::new()
    }
}
