use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use finstream_core::EventId;

/// Schema version stamped on events that do not carry one.
pub const DEFAULT_EVENT_VERSION: &str = "1.0.0";

fn default_version() -> String {
    DEFAULT_EVENT_VERSION.to_string()
}

/// A validated, signed business event.
///
/// Events are:
/// - **immutable** (treat them as facts; only the producer creates them)
/// - **identified** by a producer-assigned `id` that survives redelivery
/// - **signed** (HMAC over the canonical fields, see [`crate::EventCodec`])
///
/// Instances are obtained from [`crate::EventCodec::decode`] or
/// [`crate::EventCodec::seal`]; there is no way to build an unsigned one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    id: EventId,

    /// Stable event type identifier (e.g. "finbot.transaction.created").
    #[serde(rename = "type")]
    event_type: String,

    /// When the event occurred (producer time).
    timestamp: DateTime<Utc>,

    /// Emitting module (e.g. "finbot").
    source: String,

    data: Map<String, JsonValue>,

    /// Hex-encoded HMAC-SHA256 over the canonical fields.
    signature: String,

    #[serde(default = "default_version")]
    version: String,
}

impl Event {
    pub(crate) fn from_parts(draft: EventDraft, signature: String) -> Self {
        Self {
            id: draft.id,
            event_type: draft.event_type,
            timestamp: draft.timestamp,
            source: draft.source,
            data: draft.data,
            signature,
            version: draft.version,
        }
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn data(&self) -> &Map<String, JsonValue> {
        &self.data
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn version(&self) -> &str {
        &self.version
    }
}

/// Unsigned event content, as assembled by a producer before sealing.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    pub id: EventId,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub data: Map<String, JsonValue>,
    pub version: String,
}

impl EventDraft {
    /// New draft with a fresh id and the current time.
    ///
    /// Non-object `data` is wrapped as `{"value": data}`.
    pub fn new(event_type: impl Into<String>, source: impl Into<String>, data: JsonValue) -> Self {
        let data = match data {
            JsonValue::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };

        Self {
            id: EventId::new(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            source: source.into(),
            data,
            version: default_version(),
        }
    }

    pub fn with_id(mut self, id: EventId) -> Self {
        self.id = id;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}
