//! Error types for the broker, the transport and the bus runtime.

use autobus_core::{CorrelationId, MessageBehavior, RegistryError, SerializationError};

/// Errors raised by broker primitives.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("exchange not found: {name}")]
    ExchangeNotFound { name: String },
    #[error("queue not found: {name}")]
    QueueNotFound { name: String },
    #[error("precondition failed: {reason}")]
    PreconditionFailed { reason: String },
    #[error("queue {name} is exclusive to another connection")]
    ResourceLocked { name: String },
    #[error("unknown delivery tag {tag}")]
    UnknownDeliveryTag { tag: u64 },
    #[error("unknown consumer tag {tag}")]
    UnknownConsumer { tag: String },
    #[error("channel is closed")]
    ChannelClosed,
    #[error("connection is closed")]
    ConnectionClosed,
    #[error("channel limit of {max} reached")]
    ChannelLimit { max: u16 },
    #[error("broker client error: {reason}")]
    Client { reason: String },
}

/// Errors raised by a `Transport`.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("request id {id} is already pending")]
    DuplicateRequestId { id: CorrelationId },
    #[error("sender token was not issued by this transport")]
    ForeignSenderToken,
    #[error("publisher channel is closed")]
    PublisherClosed,
    #[error("transport already started")]
    AlreadyStarted,
    #[error("transport not started")]
    NotStarted,
    #[error("transport is closed")]
    Closed,
}

/// Errors surfaced by the bus runtime.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Serialization(#[from] SerializationError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("no transport configured")]
    MissingTransport,
    #[error("request {message} timed out after {timeout_ms}ms")]
    RequestTimeout { message: String, timeout_ms: u64 },
    #[error("request {message} was abandoned before a reply arrived")]
    RequestAbandoned { message: String },
    #[error("{request} does not answer with {response}")]
    InvalidRequestResponsePair { request: String, response: String },
    #[error("{message} is a {actual}, expected a {expected}")]
    InvalidBehavior {
        message: String,
        expected: MessageBehavior,
        actual: MessageBehavior,
    },
    #[error("a handler for {message} is already bound")]
    AlreadyBound { message: String },
    #[error("no such handler is bound for {message}")]
    NotBound { message: String },
    #[error("service contract {contract} declares no interfaces")]
    UnbindableContract { contract: String },
    #[error("implementation does not provide interface {interface} of {contract}")]
    MissingImplementation { contract: String, interface: String },
    #[error("implementation of {interface} has no handler for {message}")]
    MissingHandler { interface: String, message: String },
    #[error("unknown binding {id}")]
    UnknownBinding { id: u64 },
    #[error("no message is registered under the wire name {name}")]
    UnknownMessageName { name: String },
    #[error("no handler is bound for {message}")]
    NoHandler { message: String },
    #[error("handler for {message} failed: {reason}")]
    HandlerFailed { message: String, reason: String },
    #[error("{message} does not belong to service contract {contract}")]
    ForeignMessage { message: String, contract: String },
    #[error("{failed} of {total} handlers for {message} failed: {first}")]
    EventDispatch {
        message: String,
        failed: usize,
        total: usize,
        first: String,
    },
    #[error("bus is shutting down")]
    ShuttingDown,
}
