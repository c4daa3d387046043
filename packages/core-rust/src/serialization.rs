//! Pluggable payload codecs.
//!
//! The bus is generic over its provider, so the trait keeps generic methods and is
//! not object-safe.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::SerializationError;

/// Turns messages into bytes and back.
pub trait SerializationProvider: Send + Sync + 'static {
    /// # Errors
    ///
    /// Returns `SerializationError::Encode` if `value` cannot be encoded.
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, SerializationError>;

    /// # Errors
    ///
    /// Returns `SerializationError::Decode` if `bytes` is not a valid `T`.
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializationError>;
}

/// JSON payloads via `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializationProvider;

impl SerializationProvider for JsonSerializationProvider {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, SerializationError> {
        serde_json::to_vec(value).map_err(|e| SerializationError::Encode {
            type_name: std::any::type_name::<T>(),
            reason: e.to_string(),
        })
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializationError> {
        serde_json::from_slice(bytes).map_err(|e| SerializationError::Decode {
            type_name: std::any::type_name::<T>(),
            reason: e.to_string(),
        })
    }
}

/// MessagePack payloads via `rmp-serde`, with struct fields encoded by name.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessagePackSerializationProvider;

impl SerializationProvider for MessagePackSerializationProvider {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, SerializationError> {
        rmp_serde::to_vec_named(value).map_err(|e| SerializationError::Encode {
            type_name: std::any::type_name::<T>(),
            reason: e.to_string(),
        })
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializationError> {
        rmp_serde::from_slice(bytes).map_err(|e| SerializationError::Decode {
            type_name: std::any::type_name::<T>(),
            reason: e.to_string(),
        })
    }
}
