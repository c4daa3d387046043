//! Subscription tables: type-erased handlers keyed by message `TypeId`.

use std::any::TypeId;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use autobus_core::{Message, SerializationProvider};
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::handler::{HandlerId, MessageHandler, RequestHandler};

/// Outcome of one handler invocation: the encoded reply for requests, `None` otherwise.
pub(crate) type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<Option<Bytes>>> + Send>>;

/// Decodes a payload, runs the user handler and encodes its reply.
pub(crate) type Invoker = Arc<dyn Fn(Bytes) -> HandlerFuture + Send + Sync>;

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub(crate) struct Subscription {
    pub(crate) id: HandlerId,
    pub(crate) invoke: Invoker,
}

impl Subscription {
    pub(crate) fn request<S, Q, R>(serializer: &Arc<S>, handler: Arc<dyn RequestHandler<Q, R>>) -> Self
    where
        S: SerializationProvider,
        Q: Message,
        R: Message,
    {
        let id = HandlerId::of(&handler);
        let serializer = Arc::clone(serializer);
        let invoke: Invoker = Arc::new(move |body: Bytes| -> HandlerFuture {
            let serializer = Arc::clone(&serializer);
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let request: Q = serializer.deserialize(&body)?;
                let response = handler.handle(request).await?;
                anyhow::Ok(Some(Bytes::from(serializer.serialize(&response)?)))
            })
        });
        Self { id, invoke }
    }

    pub(crate) fn message<S, M>(serializer: &Arc<S>, handler: Arc<dyn MessageHandler<M>>) -> Self
    where
        S: SerializationProvider,
        M: Message,
    {
        let id = HandlerId::of(&handler);
        let serializer = Arc::clone(serializer);
        let invoke: Invoker = Arc::new(move |body: Bytes| -> HandlerFuture {
            let serializer = Arc::clone(&serializer);
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let message: M = serializer.deserialize(&body)?;
                handler.handle(message).await?;
                anyhow::Ok(None)
            })
        });
        Self { id, invoke }
    }
}

// ---------------------------------------------------------------------------
// SubscriptionTable
// ---------------------------------------------------------------------------

/// Request and command types map to a single handler; event types to an ordered
/// set of handlers, each present at most once.
#[derive(Default)]
pub(crate) struct SubscriptionTable {
    handlers: DashMap<TypeId, Subscription>,
    events: DashMap<TypeId, Vec<Subscription>>,
}

impl SubscriptionTable {
    /// Returns `false` if `type_id` already has a handler.
    pub(crate) fn insert_handler(&self, type_id: TypeId, subscription: Subscription) -> bool {
        match self.handlers.entry(type_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(subscription);
                true
            }
        }
    }

    /// Removes the handler of `type_id` if it is `id`.
    pub(crate) fn remove_handler(&self, type_id: TypeId, id: HandlerId) -> bool {
        self.handlers.remove_if(&type_id, |_, s| s.id == id).is_some()
    }

    pub(crate) fn handler(&self, type_id: TypeId) -> Option<Subscription> {
        self.handlers.get(&type_id).map(|s| s.value().clone())
    }

    /// Appends an event handler. Returns the number of handlers afterwards, or
    /// `None` if the handler was already present.
    pub(crate) fn add_event_handler(&self, type_id: TypeId, subscription: Subscription) -> Option<usize> {
        let mut handlers = self.events.entry(type_id).or_default();
        if handlers.iter().any(|s| s.id == subscription.id) {
            return None;
        }
        handlers.push(subscription);
        Some(handlers.len())
    }

    /// Removes an event handler. Returns the number of handlers left, or `None` if
    /// it was not subscribed. The entry is dropped with its last handler.
    pub(crate) fn remove_event_handler(&self, type_id: TypeId, id: HandlerId) -> Option<usize> {
        let remaining = {
            let mut handlers = self.events.get_mut(&type_id)?;
            let index = handlers.iter().position(|s| s.id == id)?;
            handlers.remove(index);
            handlers.len()
        };
        if remaining == 0 {
            self.events.remove_if(&type_id, |_, handlers| handlers.is_empty());
        }
        Some(remaining)
    }

    /// Snapshot of the handlers for an event type, in subscription order.
    pub(crate) fn event_handlers(&self, type_id: TypeId) -> Vec<Subscription> {
        self.events
            .get(&type_id)
            .map(|h| h.value().clone())
            .unwrap_or_default()
    }

    pub(crate) fn len(&self) -> usize {
        self.handlers.len() + self.events.iter().map(|e| e.value().len()).sum::<usize>()
    }
}
