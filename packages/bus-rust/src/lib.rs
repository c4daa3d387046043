//! Autobus: a typed service bus over an AMQP-style broker.
//!
//! Services declare contracts (requests, commands and events grouped under
//! interfaces) with `autobus-core`. A [`Bus`] built from those contracts publishes,
//! sends requests and dispatches inbound deliveries to typed handlers through a
//! [`Transport`]. [`BrokerTransport`] implements the transport over any
//! [`broker::BrokerConnector`]; [`MemoryBroker`] is the in-process broker used by
//! tests and the demo binary.

pub mod broker;
pub mod bus;
pub mod client;
pub mod config;
pub mod error;
pub mod shutdown;
pub mod transport;

pub use autobus_core;

pub use broker::MemoryBroker;
pub use bus::{
    BindingId, Bus, BusBuilder, HandlerId, MessageHandler, RequestHandler, ServiceImplementation,
};
pub use client::ServiceClient;
pub use config::{BrokerConnectionConfig, BrokerTransportConfig, BusConfig};
pub use error::{BrokerError, BusError, TransportError};
pub use shutdown::{BusState, LifecycleController};
pub use transport::{BrokerTransport, DeliveryHandler, Transport};
