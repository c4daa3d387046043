//! Service contracts: the declarative description of what a logical service owns.
//!
//! A contract is built once through [`ServiceContractBuilder`] and is immutable
//! afterwards. It names the request/response pairs, commands and events the service
//! is responsible for, plus the capability interfaces an implementation must
//! provide to be bound with `Bus::bind`.

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::error::ContractError;
use crate::message::{Message, MessageBehavior, MessageModel};

// ---------------------------------------------------------------------------
// Exchanges
// ---------------------------------------------------------------------------

/// Broker exchange flavour used by a contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Carries requests, commands and responses.
    Topic,
    /// Carries events.
    Fanout,
}

/// One exchange owned by a contract.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceExchangeModel {
    contract: String,
    kind: ExchangeKind,
}

impl ServiceExchangeModel {
    #[must_use]
    pub fn new(contract: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            contract: contract.into(),
            kind,
        }
    }

    /// Name of the owning contract.
    #[must_use]
    pub fn contract(&self) -> &str {
        &self.contract
    }

    #[must_use]
    pub fn kind(&self) -> ExchangeKind {
        self.kind
    }

    /// Exchange name on the broker: `"{contract}"` or `"{contract}.Events"`.
    #[must_use]
    pub fn name(&self) -> String {
        match self.kind {
            ExchangeKind::Topic => self.contract.clone(),
            ExchangeKind::Fanout => format!("{}.Events", self.contract),
        }
    }

    /// Shared queue that multiplexes this contract's requests and commands.
    #[must_use]
    pub fn request_queue_name(&self) -> String {
        format!("{}.Requests", self.contract)
    }
}

impl fmt::Display for ServiceExchangeModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

// ---------------------------------------------------------------------------
// ServiceInterfaceModel
// ---------------------------------------------------------------------------

/// A request/response pair declared by an interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEntry {
    pub request: MessageModel,
    pub response: MessageModel,
}

/// Capability interface: the requests and commands an implementation must handle.
///
/// Purely descriptive. The bus walks these entries when binding an implementation
/// to a contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInterfaceModel {
    name: String,
    requests: Vec<RequestEntry>,
    commands: Vec<MessageModel>,
}

impl ServiceInterfaceModel {
    #[must_use]
    pub fn builder(name: impl Into<String>) -> ServiceInterfaceBuilder {
        ServiceInterfaceBuilder {
            model: Self {
                name: name.into(),
                requests: Vec::new(),
                commands: Vec::new(),
            },
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn requests(&self) -> &[RequestEntry] {
        &self.requests
    }

    #[must_use]
    pub fn commands(&self) -> &[MessageModel] {
        &self.commands
    }
}

/// Builder for [`ServiceInterfaceModel`].
#[derive(Debug)]
pub struct ServiceInterfaceBuilder {
    model: ServiceInterfaceModel,
}

impl ServiceInterfaceBuilder {
    /// Declares a request handled by the interface and the response it produces.
    #[must_use]
    pub fn request<Q: Message, R: Message>(mut self) -> Self {
        self.model.requests.push(RequestEntry {
            request: MessageModel::of::<Q>(MessageBehavior::Request),
            response: MessageModel::of::<R>(MessageBehavior::Response),
        });
        self
    }

    /// Declares a command handled by the interface.
    #[must_use]
    pub fn command<C: Message>(mut self) -> Self {
        self.model
            .commands
            .push(MessageModel::of::<C>(MessageBehavior::Command));
        self
    }

    #[must_use]
    pub fn build(self) -> ServiceInterfaceModel {
        self.model
    }
}

// ---------------------------------------------------------------------------
// ServiceContract
// ---------------------------------------------------------------------------

/// Immutable description of one service.
#[derive(Debug, Clone)]
pub struct ServiceContract {
    name: String,
    interfaces: Vec<ServiceInterfaceModel>,
    requests: HashMap<MessageModel, MessageModel>,
    messages: Vec<MessageModel>,
}

impl ServiceContract {
    #[must_use]
    pub fn builder(name: impl Into<String>) -> ServiceContractBuilder {
        ServiceContractBuilder::new(name)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn interfaces(&self) -> &[ServiceInterfaceModel] {
        &self.interfaces
    }

    /// Request to response mapping.
    #[must_use]
    pub fn requests(&self) -> &HashMap<MessageModel, MessageModel> {
        &self.requests
    }

    /// Every message the contract owns, in declaration order.
    #[must_use]
    pub fn messages(&self) -> &[MessageModel] {
        &self.messages
    }

    /// Declared response for `request`, if it is one of this contract's requests.
    #[must_use]
    pub fn response_for(&self, request: &MessageModel) -> Option<&MessageModel> {
        self.requests.get(request)
    }

    /// Returns `true` if `message` belongs to this contract.
    #[must_use]
    pub fn declares(&self, message: &MessageModel) -> bool {
        self.messages.contains(message)
    }

    /// Returns `true` if any message has `Event` behaviour.
    #[must_use]
    pub fn has_events(&self) -> bool {
        self.messages
            .iter()
            .any(|m| m.behavior() == MessageBehavior::Event)
    }

    /// Looks up a capability interface by name.
    #[must_use]
    pub fn interface(&self, name: &str) -> Option<&ServiceInterfaceModel> {
        self.interfaces.iter().find(|i| i.name() == name)
    }

    #[must_use]
    pub fn topic_exchange(&self) -> ServiceExchangeModel {
        ServiceExchangeModel::new(&self.name, ExchangeKind::Topic)
    }

    /// Fanout exchange, present only when the contract declares events.
    #[must_use]
    pub fn event_exchange(&self) -> Option<ServiceExchangeModel> {
        self.has_events()
            .then(|| ServiceExchangeModel::new(&self.name, ExchangeKind::Fanout))
    }

    /// Every exchange the contract needs declared on the broker.
    #[must_use]
    pub fn exchanges(&self) -> Vec<ServiceExchangeModel> {
        let mut exchanges = vec![self.topic_exchange()];
        exchanges.extend(self.event_exchange());
        exchanges
    }

    /// Exchange that carries `message`.
    #[must_use]
    pub fn exchange_for(&self, message: &MessageModel) -> ServiceExchangeModel {
        match message.behavior() {
            MessageBehavior::Event => ServiceExchangeModel::new(&self.name, ExchangeKind::Fanout),
            MessageBehavior::Request | MessageBehavior::Response | MessageBehavior::Command => {
                self.topic_exchange()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ServiceContractBuilder
// ---------------------------------------------------------------------------

/// Declarative builder for [`ServiceContract`].
///
/// Every message type may be used once per contract. Interface entries are folded
/// into the contract's own requests and commands on `build()`.
#[derive(Debug)]
pub struct ServiceContractBuilder {
    name: String,
    interfaces: Vec<ServiceInterfaceModel>,
    declared: Vec<Declared>,
}

#[derive(Debug)]
enum Declared {
    Request(MessageModel, MessageModel),
    Command(MessageModel),
    Event(MessageModel),
}

impl ServiceContractBuilder {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            interfaces: Vec::new(),
            declared: Vec::new(),
        }
    }

    /// Adds a capability interface. Its requests and commands become part of the
    /// contract.
    #[must_use]
    pub fn interface(mut self, interface: ServiceInterfaceModel) -> Self {
        self.interfaces.push(interface);
        self
    }

    #[must_use]
    pub fn request<Q: Message, R: Message>(mut self) -> Self {
        self.declared.push(Declared::Request(
            MessageModel::of::<Q>(MessageBehavior::Request),
            MessageModel::of::<R>(MessageBehavior::Response),
        ));
        self
    }

    #[must_use]
    pub fn command<C: Message>(mut self) -> Self {
        self.declared
            .push(Declared::Command(MessageModel::of::<C>(MessageBehavior::Command)));
        self
    }

    #[must_use]
    pub fn event<E: Message>(mut self) -> Self {
        self.declared
            .push(Declared::Event(MessageModel::of::<E>(MessageBehavior::Event)));
        self
    }

    /// Validates and freezes the contract.
    ///
    /// # Errors
    ///
    /// Returns `ContractError::MissingName` for an empty name and
    /// `ContractError::AmbiguousMessage` if a type is used more than once.
    pub fn build(self) -> Result<ServiceContract, ContractError> {
        if self.name.trim().is_empty() {
            return Err(ContractError::MissingName);
        }

        let mut seen = HashSet::new();
        let mut requests = HashMap::new();
        let mut messages = Vec::new();

        let mut claim = |model: &MessageModel| -> Result<(), ContractError> {
            if seen.insert(model.type_id()) {
                Ok(())
            } else {
                Err(ContractError::AmbiguousMessage {
                    contract: self.name.clone(),
                    type_name: model.type_name(),
                })
            }
        };

        for declared in &self.declared {
            match declared {
                Declared::Request(request, response) => {
                    claim(request)?;
                    claim(response)?;
                    requests.insert(request.clone(), response.clone());
                    messages.push(request.clone());
                    messages.push(response.clone());
                }
                Declared::Command(model) | Declared::Event(model) => {
                    claim(model)?;
                    messages.push(model.clone());
                }
            }
        }

        for interface in &self.interfaces {
            for command in interface.commands() {
                claim(command)?;
                messages.push(command.clone());
            }
            for entry in interface.requests() {
                claim(&entry.request)?;
                claim(&entry.response)?;
                requests.insert(entry.request.clone(), entry.response.clone());
                messages.push(entry.request.clone());
                messages.push(entry.response.clone());
            }
        }

        Ok(ServiceContract {
            name: self.name,
            interfaces: self.interfaces,
            requests,
            messages,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
