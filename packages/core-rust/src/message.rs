//! Message model: the identity and behaviour of every type carried by the bus.
//!
//! A message type is identified in-process by its `TypeId` and on the wire by its
//! short type name (the last path segment of `std::any::type_name`). The short name
//! doubles as the routing key, which is why it must be unique across all contracts
//! registered with one bus.

use std::any::TypeId;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::de::DeserializeOwned;
use serde::Serialize;

// ---------------------------------------------------------------------------
// Message marker trait
// ---------------------------------------------------------------------------

/// Anything that can travel over the bus.
///
/// Blanket-implemented for every serde-compatible, thread-safe, owned type, so
/// contract authors never implement it by hand.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Message for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

// ---------------------------------------------------------------------------
// MessageBehavior
// ---------------------------------------------------------------------------

/// How a message is routed and acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageBehavior {
    /// Point-to-point message that expects exactly one `Response`.
    Request,
    /// Reply to a `Request`, routed back through the requester's reply queue.
    Response,
    /// Point-to-point message without a reply.
    Command,
    /// Fan-out notification delivered to every subscriber.
    Event,
}

impl MessageBehavior {
    /// Request and command deliveries must be explicitly acknowledged or rejected.
    #[must_use]
    pub fn requires_ack(self) -> bool {
        matches!(self, Self::Request | Self::Command)
    }
}

impl fmt::Display for MessageBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Command => "command",
            Self::Event => "event",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// MessageModel
// ---------------------------------------------------------------------------

/// Registered description of one message type.
///
/// Equality and hashing use the `TypeId` only; two models for the same Rust type
/// are the same message regardless of behaviour.
#[derive(Debug, Clone)]
pub struct MessageModel {
    type_id: TypeId,
    type_name: &'static str,
    name: String,
    behavior: MessageBehavior,
}

impl MessageModel {
    /// Describes `T` with the given behaviour.
    #[must_use]
    pub fn of<T: Message>(behavior: MessageBehavior) -> Self {
        let type_name = std::any::type_name::<T>();
        Self {
            type_id: TypeId::of::<T>(),
            type_name,
            name: short_type_name(type_name).to_string(),
            behavior,
        }
    }

    #[must_use]
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Fully-qualified Rust type name, used in diagnostics.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Short wire name; also the routing key.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn behavior(&self) -> MessageBehavior {
        self.behavior
    }

    /// Returns `true` if this model describes `T`.
    #[must_use]
    pub fn is<T: 'static>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }
}

impl PartialEq for MessageModel {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for MessageModel {}

impl Hash for MessageModel {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
    }
}

impl fmt::Display for MessageModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.behavior)
    }
}

/// Strips the module path and generic arguments from a type name.
///
/// `my_app::orders::PlaceOrder` becomes `PlaceOrder`;
/// `my_app::Envelope<my_app::Ping>` becomes `Envelope`.
#[must_use]
pub fn short_type_name(type_name: &str) -> &str {
    let base = type_name.split('<').next().unwrap_or(type_name);
    base.rsplit("::").next().unwrap_or(base)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
