//! User-facing handler traits.
//!
//! Handlers return `anyhow::Result`; any error (or panic) makes the runtime reject
//! the delivery back to the broker. Closures of the shape
//! `Fn(M) -> impl Future<Output = anyhow::Result<_>>` implement the traits directly.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use autobus_core::Message;

/// Answers requests of type `Q` with a `R`.
#[async_trait]
pub trait RequestHandler<Q: Message, R: Message>: Send + Sync + 'static {
    async fn handle(&self, request: Q) -> anyhow::Result<R>;
}

/// Handles commands or events of type `M`.
#[async_trait]
pub trait MessageHandler<M: Message>: Send + Sync + 'static {
    async fn handle(&self, message: M) -> anyhow::Result<()>;
}

#[async_trait]
impl<Q, R, F, Fut> RequestHandler<Q, R> for F
where
    Q: Message,
    R: Message,
    F: Fn(Q) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
{
    async fn handle(&self, request: Q) -> anyhow::Result<R> {
        self(request).await
    }
}

#[async_trait]
impl<M, F, Fut> MessageHandler<M> for F
where
    M: Message,
    F: Fn(M) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: M) -> anyhow::Result<()> {
        self(message).await
    }
}

/// Identity of a subscribed handler: the address of its `Arc` allocation.
///
/// Two `Arc`s compare equal only if they share the allocation, so subscribing a
/// clone of the same `Arc` twice is a duplicate while two separately allocated
/// handlers of the same type are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(usize);

impl HandlerId {
    #[must_use]
    pub fn of<T: ?Sized>(handler: &Arc<T>) -> Self {
        Self(Arc::as_ptr(handler).cast::<()>() as usize)
    }
}
