//! Autobus core: message and contract model, service registry, correlation ids and
//! payload codecs.

pub mod contract;
pub mod correlation;
pub mod error;
pub mod hash;
pub mod message;
pub mod registry;
pub mod serialization;

pub use contract::{
    ExchangeKind, RequestEntry, ServiceContract, ServiceContractBuilder, ServiceExchangeModel,
    ServiceInterfaceBuilder, ServiceInterfaceModel,
};
pub use correlation::{AtomicCorrelationIdProvider, CorrelationId, CorrelationIdProvider};
pub use error::{ContractError, RegistryError, SerializationError};
pub use message::{Message, MessageBehavior, MessageModel};
pub use registry::ServiceRegistry;
pub use serialization::{
    JsonSerializationProvider, MessagePackSerializationProvider, SerializationProvider,
};
