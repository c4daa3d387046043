//! Correlation ids that tie a reply to the request that caused it.

use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};

/// Identifier carried in a request's `correlation_id` property and echoed by the reply.
///
/// Travels on the wire as its decimal string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(pub u32);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CorrelationId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// Source of correlation ids for outgoing requests.
///
/// Ids must be distinct among requests that are pending at the same time.
pub trait CorrelationIdProvider: Send + Sync {
    fn next_id(&self) -> CorrelationId;
}

/// Lock-free counter. The first id handed out is 1; `u32::MAX` wraps to 0.
#[derive(Debug)]
pub struct AtomicCorrelationIdProvider {
    last: AtomicU32,
}

impl AtomicCorrelationIdProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Provider whose next id is `first`.
    #[must_use]
    pub fn starting_at(first: u32) -> Self {
        Self {
            last: AtomicU32::new(first.wrapping_sub(1)),
        }
    }
}

impl Default for AtomicCorrelationIdProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationIdProvider for AtomicCorrelationIdProvider {
    fn next_id(&self) -> CorrelationId {
        // fetch_add wraps on overflow.
        CorrelationId(self.last.fetch_add(1, Ordering::Relaxed).wrapping_add(1))
    }
}
