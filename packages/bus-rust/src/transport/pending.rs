//! Table of requests waiting for a reply.
//!
//! Three parties race to remove an entry: the reply consumer (`complete`), the
//! timed-out caller (`discard`) and transport shutdown (`clear`). `DashMap::remove`
//! makes exactly one of them win; the losers see `false`.

use autobus_core::CorrelationId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;

use super::{ServiceRequest, ServiceResponse};
use crate::error::TransportError;

#[derive(Debug, Default)]
pub struct PendingRequests {
    entries: DashMap<CorrelationId, oneshot::Sender<ServiceResponse>>,
}

impl PendingRequests {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `id` and returns the request whose completion resolves on reply.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::DuplicateRequestId` if `id` is already pending.
    pub fn insert(&self, id: CorrelationId) -> Result<ServiceRequest, TransportError> {
        match self.entries.entry(id) {
            Entry::Occupied(_) => Err(TransportError::DuplicateRequestId { id }),
            Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                slot.insert(tx);
                Ok(ServiceRequest { id, completion: rx })
            }
        }
    }

    /// Resolves the pending request `id`. Returns `false` if nothing was pending,
    /// which is the case for late replies.
    pub fn complete(&self, id: CorrelationId, response: ServiceResponse) -> bool {
        match self.entries.remove(&id) {
            // The caller may have stopped waiting; that still counts as resolved.
            Some((_, tx)) => {
                let _ = tx.send(response);
                true
            }
            None => false,
        }
    }

    /// Drops the pending request `id`. Returns `true` if it was still pending.
    pub fn discard(&self, id: CorrelationId) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Drops every pending request; their callers observe an abandoned completion.
    pub fn clear(&self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
