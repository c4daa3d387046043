//! Contract-scoped client handle.

use std::sync::Arc;

use autobus_core::{Message, MessageBehavior, MessageModel, SerializationProvider, ServiceContract};

use crate::bus::Bus;
use crate::error::BusError;

/// Typed access to one contract's messages.
///
/// Every call first checks that the message belongs to this client's contract and
/// has the behaviour the call implies.
pub struct ServiceClient<S> {
    bus: Bus<S>,
    contract: Arc<ServiceContract>,
}

impl<S: SerializationProvider> ServiceClient<S> {
    pub(crate) fn new(bus: Bus<S>, contract: Arc<ServiceContract>) -> Self {
        Self { bus, contract }
    }

    #[must_use]
    pub fn contract(&self) -> &ServiceContract {
        &self.contract
    }

    fn member<M: Message>(&self, behavior: MessageBehavior) -> Result<&MessageModel, BusError> {
        let model = self.bus.registry().message_model::<M>()?;
        if !self.contract.declares(model) {
            return Err(BusError::ForeignMessage {
                message: model.name().to_string(),
                contract: self.contract.name().to_string(),
            });
        }
        if model.behavior() != behavior {
            return Err(BusError::InvalidBehavior {
                message: model.name().to_string(),
                expected: behavior,
                actual: model.behavior(),
            });
        }
        Ok(model)
    }

    /// Sends a request and awaits its reply.
    ///
    /// # Errors
    ///
    /// `BusError::ForeignMessage` if `Q` belongs to another contract, otherwise
    /// whatever `Bus::request` returns.
    pub async fn request<Q: Message, R: Message>(&self, request: &Q) -> Result<R, BusError> {
        self.member::<Q>(MessageBehavior::Request)?;
        self.bus.request(request).await
    }

    /// Sends a command.
    ///
    /// # Errors
    ///
    /// `BusError::ForeignMessage` or `BusError::InvalidBehavior` if `C` is not a
    /// command of this contract, otherwise whatever `Bus::publish` returns.
    pub async fn send<C: Message>(&self, command: &C) -> Result<(), BusError> {
        self.member::<C>(MessageBehavior::Command)?;
        self.bus.publish(command).await
    }

    /// Publishes an event.
    ///
    /// # Errors
    ///
    /// `BusError::ForeignMessage` or `BusError::InvalidBehavior` if `E` is not an
    /// event of this contract, otherwise whatever `Bus::publish` returns.
    pub async fn publish<E: Message>(&self, event: &E) -> Result<(), BusError> {
        self.member::<E>(MessageBehavior::Event)?;
        self.bus.publish(event).await
    }
}
