//! Event-level deduplication.
//!
//! Entries are delivered at least once and one event can ride several
//! entries, so "handle this event" is guarded by a per-event record:
//!
//! 1. [`IdempotencyStore::try_claim`] atomically creates a short *processing
//!    lease* if no record exists. An existing processed marker means the event
//!    was handled; an existing lease means another attempt is still running
//!    and the entry must stay pending until it settles.
//! 2. On handler success, [`IdempotencyStore::mark_processed`] turns the lease
//!    into a *processed marker* that lives for the dedup horizon.
//! 3. On handler failure, [`IdempotencyStore::release`] removes the lease so
//!    the retry of the same entry can claim it again.
//!
//! A crash between 1 and 2 leaves a lease that expires on its own.

use std::sync::Arc;
use std::time::Duration;

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_store;

pub use in_memory::InMemoryIdempotencyStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisIdempotencyStore;

use finstream_core::EventId;

/// Default dedup horizon (24h).
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The caller owns the event and should run its handler.
    Claimed,
    /// The event was handled; skip the handler and acknowledge.
    Processed,
    /// Another attempt holds a live lease; leave the entry pending.
    InFlight,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdempotencyError {
    #[error("idempotency store unavailable: {0}")]
    Unavailable(String),

    #[error("idempotency store error: {0}")]
    Storage(String),
}

/// Atomic "claim if absent, with TTL" store.
pub trait IdempotencyStore: Send + Sync {
    fn try_claim(&self, key: &str, lease: Duration) -> Result<ClaimOutcome, IdempotencyError>;

    fn mark_processed(&self, key: &str, ttl: Duration) -> Result<(), IdempotencyError>;

    /// Drop an unfinished lease. A processed marker is never removed.
    fn release(&self, key: &str) -> Result<(), IdempotencyError>;

    fn is_processed(&self, key: &str) -> Result<bool, IdempotencyError>;
}

impl<S> IdempotencyStore for Arc<S>
where
    S: IdempotencyStore + ?Sized,
{
    fn try_claim(&self, key: &str, lease: Duration) -> Result<ClaimOutcome, IdempotencyError> {
        (**self).try_claim(key, lease)
    }

    fn mark_processed(&self, key: &str, ttl: Duration) -> Result<(), IdempotencyError> {
        (**self).mark_processed(key, ttl)
    }

    fn release(&self, key: &str) -> Result<(), IdempotencyError> {
        (**self).release(key)
    }

    fn is_processed(&self, key: &str) -> Result<bool, IdempotencyError> {
        (**self).is_processed(key)
    }
}

/// Dedup key for an event, namespaced by stream and group so two groups on
/// the same stream each handle every event once.
pub fn dedup_key(stream: &str, group: &str, event_id: EventId) -> String {
    format!("{}:{}:processed:{}", stream, group, event_id)
}
