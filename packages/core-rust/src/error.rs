//! Error types for contract construction, registry lookups and payload encoding.

/// Errors raised while building a `ServiceContract`.
#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    #[error("service contract name must not be empty")]
    MissingName,
    #[error("ambiguous use of {type_name} in service contract {contract}")]
    AmbiguousMessage {
        contract: String,
        type_name: &'static str,
    },
}

/// Errors raised while building or querying a `ServiceRegistry`.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("service contract {name} registered more than once")]
    DuplicateContractName { name: String },
    #[error("message name {name} used by both {first} and {second}")]
    DuplicateMessageName {
        name: String,
        first: &'static str,
        second: &'static str,
    },
    #[error("unknown service contract: {name}")]
    UnknownContract { name: String },
    #[error("message type {type_name} is not declared by any registered contract")]
    UnknownMessage { type_name: &'static str },
}

/// Errors raised by a `SerializationProvider`.
#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    #[error("failed to encode {type_name}: {reason}")]
    Encode {
        type_name: &'static str,
        reason: String,
    },
    #[error("failed to decode {type_name}: {reason}")]
    Decode {
        type_name: &'static str,
        reason: String,
    },
}
