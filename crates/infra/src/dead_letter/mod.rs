//! Dead-letter sink for entries that exhausted their retry budget.
//!
//! Writes are idempotent keyed by group and entry id: moving an entry is
//! "write record, then acknowledge", and a crash between the two re-drives the
//! same write without producing a second record. Groups sharing a stream keep
//! separate records for the same entry.
//!
//! There is no automatic replay. Operators inspect records with
//! [`DeadLetterSink::get`]/[`DeadLetterSink::list`], re-append
//! `original_payload` to the stream by hand, then [`DeadLetterSink::remove`].

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use finstream_core::{EntryId, EventId};
use finstream_events::LogEntry;

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_sink;

pub use in_memory::InMemoryDeadLetterSink;
#[cfg(feature = "redis")]
pub use redis_sink::RedisDeadLetterSink;

/// A dead-lettered entry, retaining everything needed to replay it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    pub entry_id: EntryId,
    pub stream: String,
    pub group: String,
    /// Raw `event` field, empty when the entry had none.
    pub original_payload: String,
    pub fields: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<EventId>,
    pub reason: String,
    pub delivery_count: u64,
    pub moved_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    /// Record for an entry as claimed from the broker. Event metadata is
    /// filled in separately when the payload still decodes.
    pub fn from_entry(
        entry: &LogEntry,
        stream: impl Into<String>,
        group: impl Into<String>,
        reason: impl Into<String>,
        delivery_count: u64,
        moved_at: DateTime<Utc>,
    ) -> Self {
        Self {
            entry_id: entry.id(),
            stream: stream.into(),
            group: group.into(),
            original_payload: entry.event_payload().unwrap_or_default().to_string(),
            fields: entry.fields().clone(),
            event_type: None,
            event_id: None,
            reason: reason.into(),
            delivery_count,
            moved_at,
        }
    }

    pub fn with_event(mut self, event_id: EventId, event_type: impl Into<String>) -> Self {
        self.event_id = Some(event_id);
        self.event_type = Some(event_type.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeadLetterError {
    #[error("dead-letter sink unavailable: {0}")]
    Unavailable(String),

    #[error("dead-letter sink error: {0}")]
    Storage(String),

    #[error("dead-letter record could not be (de)serialized: {0}")]
    Serialization(String),
}

pub trait DeadLetterSink: Send + Sync {
    /// Persist a record. Returns `true` if it was newly written, `false` if a
    /// record for the same group and entry id already existed (left unchanged).
    fn write(&self, record: &DeadLetterRecord) -> Result<bool, DeadLetterError>;

    fn get(&self, group: &str, entry_id: EntryId)
    -> Result<Option<DeadLetterRecord>, DeadLetterError>;

    /// Up to `limit` records, oldest entry first.
    fn list(&self, limit: usize) -> Result<Vec<DeadLetterRecord>, DeadLetterError>;

    /// Delete a record after manual replay. Returns whether it existed.
    fn remove(&self, group: &str, entry_id: EntryId) -> Result<bool, DeadLetterError>;
}

impl<S> DeadLetterSink for Arc<S>
where
    S: DeadLetterSink + ?Sized,
{
    fn write(&self, record: &DeadLetterRecord) -> Result<bool, DeadLetterError> {
        (**self).write(record)
    }

    fn get(
        &self,
        group: &str,
        entry_id: EntryId,
    ) -> Result<Option<DeadLetterRecord>, DeadLetterError> {
        (**self).get(group, entry_id)
    }

    fn list(&self, limit: usize) -> Result<Vec<DeadLetterRecord>, DeadLetterError> {
        (**self).list(limit)
    }

    fn remove(&self, group: &str, entry_id: EntryId) -> Result<bool, DeadLetterError> {
        (**self).remove(group, entry_id)
    }
}
