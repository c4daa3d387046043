//! Static registry of service contracts and the messages they own.
//!
//! Built once at startup from the full list of contracts. Answers which contract
//! owns a message, what a request's response is, and which message a wire name
//! refers to. All lookups are read-only after construction.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::contract::ServiceContract;
use crate::error::RegistryError;
use crate::message::{Message, MessageModel};

/// Index entry: a message model plus the position of its owning contract.
#[derive(Debug)]
struct Entry {
    model: MessageModel,
    contract: usize,
}

/// Lookup tables over a fixed set of [`ServiceContract`]s.
///
/// Message wire names must be unique across all contracts, not just within one,
/// since the name is the routing key and the delivery dispatch key.
#[derive(Debug)]
pub struct ServiceRegistry {
    contracts: Vec<Arc<ServiceContract>>,
    by_type: HashMap<TypeId, Entry>,
    by_name: HashMap<String, TypeId>,
}

impl ServiceRegistry {
    /// Indexes `contracts` in order.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::DuplicateContractName` if two contracts share a name and
    /// `RegistryError::DuplicateMessageName` if two message types share a wire name.
    pub fn new(contracts: Vec<ServiceContract>) -> Result<Self, RegistryError> {
        let mut by_type: HashMap<TypeId, Entry> = HashMap::new();
        let mut by_name: HashMap<String, TypeId> = HashMap::new();

        for (index, contract) in contracts.iter().enumerate() {
            if contracts[..index].iter().any(|c| c.name() == contract.name()) {
                return Err(RegistryError::DuplicateContractName {
                    name: contract.name().to_string(),
                });
            }

            for model in contract.messages() {
                if let Some(existing) = by_name.get(model.name()) {
                    let first = by_type
                        .get(existing)
                        .map_or("<unknown>", |e| e.model.type_name());
                    return Err(RegistryError::DuplicateMessageName {
                        name: model.name().to_string(),
                        first,
                        second: model.type_name(),
                    });
                }
                by_name.insert(model.name().to_string(), model.type_id());
                by_type.insert(
                    model.type_id(),
                    Entry {
                        model: model.clone(),
                        contract: index,
                    },
                );
            }
        }

        debug!(
            contracts = contracts.len(),
            messages = by_type.len(),
            "service registry built"
        );

        Ok(Self {
            contracts: contracts.into_iter().map(Arc::new).collect(),
            by_type,
            by_name,
        })
    }

    /// Model registered for `T`.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::UnknownMessage` if no contract declares `T`.
    pub fn message_model<T: Message>(&self) -> Result<&MessageModel, RegistryError> {
        self.by_type
            .get(&TypeId::of::<T>())
            .map(|e| &e.model)
            .ok_or(RegistryError::UnknownMessage {
                type_name: std::any::type_name::<T>(),
            })
    }

    /// Model registered for a `TypeId`; `None` if the type is unknown.
    #[must_use]
    pub fn message_model_of(&self, type_id: TypeId) -> Option<&MessageModel> {
        self.by_type.get(&type_id).map(|e| &e.model)
    }

    /// Model registered under a wire name; `None` if the name is unknown.
    #[must_use]
    pub fn message_model_named(&self, name: &str) -> Option<&MessageModel> {
        self.by_name
            .get(name)
            .and_then(|id| self.message_model_of(*id))
    }

    /// Contract that declares `message`.
    #[must_use]
    pub fn owning_service(&self, message: &MessageModel) -> Option<&Arc<ServiceContract>> {
        self.by_type
            .get(&message.type_id())
            .map(|e| &self.contracts[e.contract])
    }

    /// Declared response for a request model.
    #[must_use]
    pub fn response_model(&self, request: &MessageModel) -> Option<&MessageModel> {
        self.owning_service(request)
            .and_then(|contract| contract.response_for(request))
    }

    /// Contract registered under `name`.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::UnknownContract` if no contract has that name.
    pub fn service_contract(&self, name: &str) -> Result<&Arc<ServiceContract>, RegistryError> {
        self.contracts
            .iter()
            .find(|c| c.name() == name)
            .ok_or_else(|| RegistryError::UnknownContract {
                name: name.to_string(),
            })
    }

    /// First contract that lists the capability interface `interface`.
    #[must_use]
    pub fn service_implementing(&self, interface: &str) -> Option<&Arc<ServiceContract>> {
        self.contracts
            .iter()
            .find(|c| c.interface(interface).is_some())
    }

    /// All contracts in registration order.
    #[must_use]
    pub fn service_contracts(&self) -> &[Arc<ServiceContract>] {
        &self.contracts
    }

    /// Every registered message model, in no particular order.
    pub fn message_models(&self) -> impl Iterator<Item = &MessageModel> {
        self.by_type.values().map(|e| &e.model)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
