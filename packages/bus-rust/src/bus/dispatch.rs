//! Inbound delivery dispatch.
//!
//! The transport calls [`Dispatcher::on_delivery`] from its consumer loop. Every
//! delivery is moved onto its own tokio task at once so a slow handler never holds
//! up the loop. Requests and commands are settled exactly once: acknowledged after
//! the handler (and reply publish) succeeded, rejected with requeue otherwise.
//! Events are pre-acknowledged by the transport and never settled here.

use std::sync::Weak;

use autobus_core::{MessageBehavior, MessageModel, SerializationProvider};
use bytes::Bytes;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use super::subscriptions::Subscription;
use super::BusInner;
use crate::error::BusError;
use crate::transport::{DeliveryHandler, InboundDelivery};

/// The bus's `DeliveryHandler`. Holds the bus weakly so a dropped bus does not
/// stay alive through its own transport.
pub(crate) struct Dispatcher<S> {
    pub(crate) inner: Weak<BusInner<S>>,
}

impl<S: SerializationProvider> DeliveryHandler for Dispatcher<S> {
    fn on_delivery(&self, delivery: InboundDelivery) {
        let Some(inner) = self.inner.upgrade() else {
            debug!(message = %delivery.name, "bus dropped, delivery ignored");
            return;
        };
        // Counted before the state check so a concurrent shutdown waits for it.
        let guard = inner.lifecycle.in_flight_guard();

        tokio::spawn(async move {
            let _guard = guard;
            if !inner.lifecycle.is_running() {
                debug!(message = %delivery.name, "bus not running, delivery rejected");
                if let Err(e) = inner.transport.reject(&delivery.sender).await {
                    warn!(message = %delivery.name, error = %e, "reject failed");
                }
                return;
            }

            let name = delivery.name.clone();
            if let Err(e) = inner.dispatch(delivery).await {
                debug!(message = %name, error = %e, "dispatch failed");
            }
        });
    }
}

impl<S: SerializationProvider> BusInner<S> {
    /// Routes one delivery to its handlers and settles it.
    ///
    /// # Errors
    ///
    /// Reports why the delivery was not handled successfully. The delivery has
    /// already been settled (or left to the broker, for events) when this returns.
    pub(crate) async fn dispatch(&self, delivery: InboundDelivery) -> Result<(), BusError> {
        let Some(model) = self.registry.message_model_named(&delivery.name) else {
            warn!(message = %delivery.name, "delivery for unknown message rejected");
            self.transport.reject(&delivery.sender).await?;
            return Err(BusError::UnknownMessageName {
                name: delivery.name,
            });
        };

        match model.behavior() {
            MessageBehavior::Request | MessageBehavior::Command => {
                self.dispatch_single(model, delivery).await
            }
            MessageBehavior::Event => {
                let handlers = self.subscriptions.event_handlers(model.type_id());
                if handlers.is_empty() {
                    debug!(message = %model.name(), "no event subscribers, dropped");
                    return Ok(());
                }
                self.fan_out(model, handlers, delivery.body).await
            }
            MessageBehavior::Response => {
                warn!(message = %model.name(), "response outside the reply queue, dropped");
                self.transport.acknowledge(&delivery.sender).await?;
                Ok(())
            }
        }
    }

    async fn dispatch_single(
        &self,
        model: &MessageModel,
        delivery: InboundDelivery,
    ) -> Result<(), BusError> {
        let Some(subscription) = self.subscriptions.handler(model.type_id()) else {
            warn!(message = %model.name(), "no handler bound, delivery rejected");
            self.transport.reject(&delivery.sender).await?;
            return Err(BusError::NoHandler {
                message: model.name().to_string(),
            });
        };

        let reply = match invoke_isolated(&subscription, delivery.body).await {
            Ok(reply) => reply,
            Err(e) => {
                let reason = format!("{e:#}");
                error!(
                    message = %model.name(),
                    redelivered = delivery.redelivered,
                    error = %reason,
                    "handler failed, delivery rejected"
                );
                self.transport.reject(&delivery.sender).await?;
                return Err(BusError::HandlerFailed {
                    message: model.name().to_string(),
                    reason,
                });
            }
        };

        if let Some(reply) = reply {
            if let Err(e) = self.transport.publish_reply(&delivery.sender, reply).await {
                error!(message = %model.name(), error = %e, "reply publish failed, delivery rejected");
                self.transport.reject(&delivery.sender).await?;
                return Err(e.into());
            }
        }
        self.transport.acknowledge(&delivery.sender).await?;
        Ok(())
    }

    /// Runs every event handler concurrently and waits for all of them. Any failure
    /// fails the whole dispatch.
    pub(crate) async fn fan_out(
        &self,
        model: &MessageModel,
        handlers: Vec<Subscription>,
        body: Bytes,
    ) -> Result<(), BusError> {
        let total = handlers.len();
        let mut set = JoinSet::new();
        for subscription in handlers {
            set.spawn((subscription.invoke)(body.clone()));
        }

        let mut failed = 0;
        let mut first = None;
        while let Some(joined) = set.join_next().await {
            let reason = match joined {
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => format!("{e:#}"),
                Err(e) => e.to_string(),
            };
            failed += 1;
            first.get_or_insert(reason);
        }

        match first {
            None => Ok(()),
            Some(first) => {
                error!(message = %model.name(), failed, total, error = %first, "event handlers failed");
                Err(BusError::EventDispatch {
                    message: model.name().to_string(),
                    failed,
                    total,
                    first,
                })
            }
        }
    }
}

/// Runs a handler on its own task so a panic surfaces as an error.
async fn invoke_isolated(subscription: &Subscription, body: Bytes) -> anyhow::Result<Option<Bytes>> {
    match tokio::spawn((subscription.invoke)(body)).await {
        Ok(outcome) => outcome,
        Err(e) => Err(anyhow::anyhow!("handler task failed: {e}")),
    }
}
