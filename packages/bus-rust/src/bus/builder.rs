//! Assembles a [`Bus`] from contracts, a transport and optional collaborators.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use autobus_core::{
    AtomicCorrelationIdProvider, CorrelationIdProvider, JsonSerializationProvider,
    SerializationProvider, ServiceContract, ServiceRegistry,
};
use dashmap::DashMap;
use tracing::info;

use super::dispatch::Dispatcher;
use super::subscriptions::SubscriptionTable;
use super::{Bus, BusInner};
use crate::config::BusConfig;
use crate::error::BusError;
use crate::shutdown::LifecycleController;
use crate::transport::Transport;

/// Builder for [`Bus`].
///
/// ```ignore
/// let bus = BusBuilder::new()
///     .use_service(pinger_contract)
///     .use_transport(Arc::new(transport))
///     .use_request_timeout(Duration::from_secs(2))
///     .build()
///     .await?;
/// ```
pub struct BusBuilder<S = JsonSerializationProvider> {
    contracts: Vec<ServiceContract>,
    config: BusConfig,
    serializer: S,
    ids: Option<Arc<dyn CorrelationIdProvider>>,
    transport: Option<Arc<dyn Transport>>,
}

impl BusBuilder<JsonSerializationProvider> {
    /// A builder with JSON payloads and the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            contracts: Vec::new(),
            config: BusConfig::default(),
            serializer: JsonSerializationProvider,
            ids: None,
            transport: None,
        }
    }
}

impl Default for BusBuilder<JsonSerializationProvider> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: SerializationProvider> BusBuilder<S> {
    /// Adds a contract. Names must be unique; duplicates fail at `build`.
    #[must_use]
    pub fn use_service(mut self, contract: ServiceContract) -> Self {
        self.contracts.push(contract);
        self
    }

    #[must_use]
    pub fn use_config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn use_request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn use_drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.drain_timeout = timeout;
        self
    }

    /// Replaces the payload codec.
    #[must_use]
    pub fn use_serializer<T: SerializationProvider>(self, serializer: T) -> BusBuilder<T> {
        BusBuilder {
            contracts: self.contracts,
            config: self.config,
            serializer,
            ids: self.ids,
            transport: self.transport,
        }
    }

    #[must_use]
    pub fn use_correlation_id_provider(mut self, ids: Arc<dyn CorrelationIdProvider>) -> Self {
        self.ids = Some(ids);
        self
    }

    #[must_use]
    pub fn use_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Builds the registry, declares every contract's exchanges and starts the
    /// transport with this bus as its delivery handler.
    ///
    /// # Errors
    ///
    /// - `BusError::MissingTransport` if no transport was supplied;
    /// - a registry error for duplicate contract or message names;
    /// - the transport error from declaring or starting.
    pub async fn build(self) -> Result<Bus<S>, BusError> {
        let transport = self.transport.ok_or(BusError::MissingTransport)?;
        let registry = ServiceRegistry::new(self.contracts)?;

        let inner = Arc::new(BusInner {
            config: self.config,
            registry,
            serializer: Arc::new(self.serializer),
            ids: self
                .ids
                .unwrap_or_else(|| Arc::new(AtomicCorrelationIdProvider::new())),
            transport,
            subscriptions: SubscriptionTable::default(),
            bindings: DashMap::new(),
            next_binding: AtomicU64::new(0),
            lifecycle: LifecycleController::new(),
            topology: tokio::sync::Mutex::new(()),
        });

        for contract in inner.registry.service_contracts() {
            for exchange in contract.exchanges() {
                inner.transport.declare_exchange(&exchange).await?;
            }
        }
        inner
            .transport
            .start(Arc::new(Dispatcher {
                inner: Arc::downgrade(&inner),
            }))
            .await?;
        inner.lifecycle.set_running();

        info!(
            contracts = inner.registry.service_contracts().len(),
            request_timeout_ms = u64::try_from(inner.config.request_timeout.as_millis()).unwrap_or(u64::MAX),
            "bus started"
        );
        Ok(Bus::from_inner(inner))
    }
}
