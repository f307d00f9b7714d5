//! Stream broker abstraction (consumer-group log protocol).
//!
//! The consumer only needs the handful of operations below. Their atomicity
//! is the broker's job: group reads hand each entry to exactly one member, and
//! [`StreamBroker::claim`] transfers ownership of a pending entry atomically,
//! so two processes never both believe they own it. The consumer adds no
//! locking of its own on top.
//!
//! Implementations:
//! - [`InMemoryStreamBroker`]: deterministic, clock-driven, for tests/dev
//! - `RedisStreamBroker` (feature `redis`): Redis Streams

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use finstream_core::EntryId;
use finstream_events::LogEntry;

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_streams;

pub use in_memory::InMemoryStreamBroker;
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamBroker;

/// Where a newly created group starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartPosition {
    /// Every entry already in the stream (`0`).
    #[default]
    Beginning,
    /// Only entries appended after group creation (`$`).
    NewOnly,
    /// Entries strictly after the given id.
    After(EntryId),
}

impl StartPosition {
    /// Broker argument form.
    pub fn as_arg(&self) -> String {
        match self {
            StartPosition::Beginning => "0".to_string(),
            StartPosition::NewOnly => "$".to_string(),
            StartPosition::After(id) => id.to_string(),
        }
    }
}

impl core::str::FromStr for StartPosition {
    type Err = finstream_core::CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "0" | "" | "beginning" => Ok(StartPosition::Beginning),
            "$" | "new" => Ok(StartPosition::NewOnly),
            other => other.parse().map(StartPosition::After),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupCreation {
    Created,
    AlreadyExists,
}

/// Broker-maintained record of a delivered but unacknowledged entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRecord {
    pub entry_id: EntryId,
    pub consumer: String,
    /// Time since the entry was last delivered to its current owner.
    pub idle: Duration,
    /// Number of deliveries so far (1 after the first read, +1 per claim).
    pub delivery_count: u64,
}

/// Result of an ownership-transfer attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// Ownership moved to the caller; the entry is returned with its payload.
    Claimed(LogEntry),
    /// The entry is still pending but its payload was trimmed from the stream.
    Gone,
    /// Not claimed: already acknowledged, or another consumer touched it
    /// within the minimum idle time.
    Lost,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker command error: {0}")]
    Command(String),

    #[error("unexpected broker reply: {0}")]
    Protocol(String),

    #[error("consumer group '{group}' does not exist on stream '{stream}'")]
    NoGroup { stream: String, group: String },
}

/// Consumer-group operations on an append-only log.
pub trait StreamBroker: Send + Sync {
    /// Create `group` on `stream`, creating the stream if needed.
    ///
    /// An existing group is reported as [`GroupCreation::AlreadyExists`], not
    /// as an error.
    fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: StartPosition,
    ) -> Result<GroupCreation, BrokerError>;

    /// Deliver up to `count` never-delivered entries to `consumer`, waiting up
    /// to `block` when none are available. Delivered entries become pending.
    fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>, BrokerError>;

    /// Up to `count` pending records of the whole group, oldest entry first.
    fn pending(&self, stream: &str, group: &str, count: usize)
    -> Result<Vec<PendingRecord>, BrokerError>;

    /// Atomically take ownership of a pending entry if it has been idle for at
    /// least `min_idle`. A successful claim resets idle time and increments
    /// the delivery count.
    fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        entry_id: EntryId,
    ) -> Result<Claim, BrokerError>;

    /// Acknowledge an entry. Returns `false` if it was not pending.
    fn ack(&self, stream: &str, group: &str, entry_id: EntryId) -> Result<bool, BrokerError>;

    /// Append an entry (producers, tests, operator replay).
    fn append(&self, stream: &str, fields: &BTreeMap<String, String>)
    -> Result<EntryId, BrokerError>;
}

impl<B> StreamBroker for Arc<B>
where
    B: StreamBroker + ?Sized,
{
    fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: StartPosition,
    ) -> Result<GroupCreation, BrokerError> {
        (**self).create_group(stream, group, start)
    }

    fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>, BrokerError> {
        (**self).read_group(stream, group, consumer, count, block)
    }

    fn pending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingRecord>, BrokerError> {
        (**self).pending(stream, group, count)
    }

    fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        entry_id: EntryId,
    ) -> Result<Claim, BrokerError> {
        (**self).claim(stream, group, consumer, min_idle, entry_id)
    }

    fn ack(&self, stream: &str, group: &str, entry_id: EntryId) -> Result<bool, BrokerError> {
        (**self).ack(stream, group, entry_id)
    }

    fn append(
        &self,
        stream: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<EntryId, BrokerError> {
        (**self).append(stream, fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_position_parses_broker_forms() {
        assert_eq!("0".parse::<StartPosition>().unwrap(), StartPosition::Beginning);
        assert_eq!("$".parse::<StartPosition>().unwrap(), StartPosition::NewOnly);
        assert_eq!(
            "1700000000000-3".parse::<StartPosition>().unwrap(),
            StartPosition::After(EntryId::new(1700000000000, 3))
        );
        assert!("later".parse::<StartPosition>().is_err());
        assert_eq!(StartPosition::NewOnly.as_arg(), "$");
    }
}
