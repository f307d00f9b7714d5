use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use finstream_core::EntryId;

/// Name of the entry field holding the JSON-serialized [`crate::Event`].
pub const EVENT_FIELD: &str = "event";

/// One delivery unit as handed out by the broker.
///
/// Notes:
/// - `id` is broker-assigned and monotonically increasing within a stream.
/// - Entry identity is **not** event identity: a producer retry yields a new
///   entry carrying the same event.
/// - `fields` are kept raw so a dead-lettered entry can be replayed verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    id: EntryId,
    fields: BTreeMap<String, String>,
}

impl LogEntry {
    pub fn new(id: EntryId, fields: BTreeMap<String, String>) -> Self {
        Self { id, fields }
    }

    /// Entry whose only field is the serialized event.
    pub fn with_event_payload(id: EntryId, payload: impl Into<String>) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(EVENT_FIELD.to_string(), payload.into());
        Self { id, fields }
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Raw serialized event, if the entry carries one.
    pub fn event_payload(&self) -> Option<&str> {
        self.field(EVENT_FIELD)
    }

    pub fn into_fields(self) -> BTreeMap<String, String> {
        self.fields
    }
}
