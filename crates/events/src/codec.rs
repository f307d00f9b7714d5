//! Wire codec for [`Event`]s carried in stream entries.
//!
//! Wire format: the entry field [`EVENT_FIELD`](crate::EVENT_FIELD) holds the
//! JSON event `{id, type, timestamp, source, data, version, signature}`.
//!
//! The signature is a hex HMAC-SHA256 over the compact JSON object
//! `{id, type, timestamp, source, data, version}` in exactly that field order.
//! Verification is done against the fields *as received* (not as re-serialized
//! by us), so producers in other languages verify byte-for-byte as long as they
//! keep `data`'s key order.

use hmac::{Hmac, Mac};
use serde_json::{Map, Value as JsonValue};
use sha2::Sha256;

use crate::entry::LogEntry;
use crate::event::{DEFAULT_EVENT_VERSION, Event, EventDraft};

type HmacSha256 = Hmac<Sha256>;

const SIGNED_FIELDS: [&str; 5] = ["id", "type", "timestamp", "source", "data"];

/// Why an entry could not be turned into an [`Event`].
///
/// Every variant is permanent: the same bytes will never decode later, so the
/// consumer acknowledges and drops such entries instead of retrying them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("entry has no '{}' field", crate::EVENT_FIELD)]
    MissingPayload,

    #[error("malformed event JSON: {0}")]
    Malformed(String),

    #[error("event is not signed")]
    Unsigned,

    #[error("event failed schema validation: {0}")]
    Schema(String),

    #[error("event signature does not match")]
    BadSignature,

    #[error("signing secret is empty")]
    InvalidKey,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("signing secret is empty")]
    InvalidKey,
}

/// HMAC-signing event codec shared by producers and consumers.
#[derive(Clone)]
pub struct EventCodec {
    secret: Vec<u8>,
}

impl core::fmt::Debug for EventCodec {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventCodec").field("secret", &"<redacted>").finish()
    }
}

impl EventCodec {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// `None` for an empty secret, which would make every signature forgeable.
    fn mac(&self) -> Option<HmacSha256> {
        if self.secret.is_empty() {
            return None;
        }
        HmacSha256::new_from_slice(&self.secret).ok()
    }

    /// Decode and verify the event carried by a log entry.
    pub fn decode(&self, entry: &LogEntry) -> Result<Event, DecodeError> {
        let raw = entry.event_payload().ok_or(DecodeError::MissingPayload)?;
        self.decode_str(raw)
    }

    /// Decode and verify a raw JSON event.
    pub fn decode_str(&self, raw: &str) -> Result<Event, DecodeError> {
        let value: JsonValue =
            serde_json::from_str(raw).map_err(|e| DecodeError::Malformed(e.to_string()))?;

        let object = match value {
            JsonValue::Object(object) => object,
            _ => return Err(DecodeError::Malformed("event is not a JSON object".to_string())),
        };

        let signature = match object.get("signature") {
            Some(JsonValue::String(s)) if !s.is_empty() => s.clone(),
            _ => return Err(DecodeError::Unsigned),
        };

        let event: Event = serde_json::from_value(JsonValue::Object(object.clone()))
            .map_err(|e| DecodeError::Schema(e.to_string()))?;

        if event.event_type().trim().is_empty() {
            return Err(DecodeError::Schema("type must not be empty".to_string()));
        }
        if event.source().trim().is_empty() {
            return Err(DecodeError::Schema("source must not be empty".to_string()));
        }

        let canonical = canonical_payload(&object)?;
        let expected = hex::decode(&signature).map_err(|_| DecodeError::BadSignature)?;

        let mut mac = self.mac().ok_or(DecodeError::InvalidKey)?;
        mac.update(canonical.as_bytes());
        mac.verify_slice(&expected)
            .map_err(|_| DecodeError::BadSignature)?;

        Ok(event)
    }

    /// Sign a draft, producing an immutable [`Event`].
    pub fn seal(&self, draft: EventDraft) -> Result<Event, EncodeError> {
        let unsigned = Event::from_parts(draft.clone(), String::new());
        let object = match serde_json::to_value(&unsigned) {
            Ok(JsonValue::Object(object)) => object,
            Ok(_) => return Err(EncodeError::Serialization("event did not serialize to an object".to_string())),
            Err(e) => return Err(EncodeError::Serialization(e.to_string())),
        };

        let canonical =
            canonical_payload(&object).map_err(|e| EncodeError::Serialization(e.to_string()))?;
        let signature = self.sign(&canonical)?;
        Ok(Event::from_parts(draft, signature))
    }

    /// Render an event in wire format.
    pub fn encode(&self, event: &Event) -> Result<String, EncodeError> {
        serde_json::to_string(event).map_err(|e| EncodeError::Serialization(e.to_string()))
    }

    fn sign(&self, canonical: &str) -> Result<String, EncodeError> {
        let mut mac = self.mac().ok_or(EncodeError::InvalidKey)?;
        mac.update(canonical.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

fn canonical_payload(object: &Map<String, JsonValue>) -> Result<String, DecodeError> {
    let mut canonical = Map::new();
    for field in SIGNED_FIELDS {
        let value = object.get(field).cloned().unwrap_or(JsonValue::Null);
        canonical.insert(field.to_string(), value);
    }
    let version = object
        .get("version")
        .cloned()
        .unwrap_or_else(|| JsonValue::String(DEFAULT_EVENT_VERSION.to_string()));
    canonical.insert("version".to_string(), version);

    serde_json::to_string(&JsonValue::Object(canonical))
        .map_err(|e| DecodeError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use finstream_core::{EntryId, EventId};
    use proptest::prelude::*;
    use serde_json::json;

    fn codec() -> EventCodec {
        EventCodec::new("test-secret-at-least-32-characters-long")
    }

    fn transaction_draft() -> EventDraft {
        EventDraft::new(
            "finbot.transaction.created",
            "finbot",
            json!({"transactionId": "tx-1", "amount": 125.5, "currency": "USD"}),
        )
    }

    #[test]
    fn sealed_event_decodes_from_entry() {
        let codec = codec();
        let event = codec.seal(transaction_draft()).unwrap();
        let entry = LogEntry::with_event_payload(EntryId::new(1, 0), codec.encode(&event).unwrap());

        let decoded = codec.decode(&entry).unwrap();
        assert_eq!(decoded, event);
        assert_eq!(decoded.version(), DEFAULT_EVENT_VERSION);
    }

    #[test]
    fn rejects_entry_without_event_field() {
        let entry = LogEntry::new(EntryId::new(1, 0), Default::default());
        assert_eq!(codec().decode(&entry), Err(DecodeError::MissingPayload));
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(
            codec().decode_str("{not json"),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            codec().decode_str("[1,2,3]"),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_unsigned_event() {
        let raw = json!({
            "id": EventId::new().to_string(),
            "type": "finbot.account.created",
            "timestamp": "2024-05-01T10:00:00Z",
            "source": "finbot",
            "data": {}
        });
        assert_eq!(codec().decode_str(&raw.to_string()), Err(DecodeError::Unsigned));
    }

    #[test]
    fn rejects_schema_violations() {
        let raw = json!({
            "id": "not-a-uuid",
            "type": "finbot.account.created",
            "timestamp": "2024-05-01T10:00:00Z",
            "source": "finbot",
            "data": {},
            "signature": "00"
        });
        assert!(matches!(
            codec().decode_str(&raw.to_string()),
            Err(DecodeError::Schema(_))
        ));
    }

    #[test]
    fn rejects_signature_from_other_secret() {
        let foreign = EventCodec::new("some-other-secret");
        let event = foreign.seal(transaction_draft()).unwrap();
        let raw = foreign.encode(&event).unwrap();

        assert_eq!(codec().decode_str(&raw), Err(DecodeError::BadSignature));
    }

    #[test]
    fn empty_secret_neither_signs_nor_verifies() {
        let unkeyed = EventCodec::new("");
        assert_eq!(unkeyed.seal(transaction_draft()), Err(EncodeError::InvalidKey));

        let raw = codec().encode(&codec().seal(transaction_draft()).unwrap()).unwrap();
        assert_eq!(unkeyed.decode_str(&raw), Err(DecodeError::InvalidKey));
    }

    #[test]
    fn rejects_non_hex_signature() {
        let codec = codec();
        let event = codec.seal(transaction_draft()).unwrap();
        let mut value = serde_json::to_value(&event).unwrap();
        value["signature"] = json!("zz-not-hex");

        assert_eq!(codec.decode_str(&value.to_string()), Err(DecodeError::BadSignature));
    }

    #[test]
    fn missing_version_verifies_against_default() {
        let codec = codec();
        let event = codec.seal(transaction_draft()).unwrap();
        let mut value = serde_json::to_value(&event).unwrap();
        value.as_object_mut().unwrap().remove("version");

        let decoded = codec.decode_str(&value.to_string()).unwrap();
        assert_eq!(decoded.version(), DEFAULT_EVENT_VERSION);
    }

    #[test]
    fn debug_output_hides_secret() {
        let rendered = format!("{:?}", codec());
        assert!(!rendered.contains("test-secret"));
    }

    proptest! {
        #[test]
        fn tampered_amount_is_rejected(amount in 0i64..1_000_000, delta in 1i64..1_000) {
            let codec = codec();
            let draft = EventDraft::new(
                "finbot.transaction.created",
                "finbot",
                json!({"transactionId": "tx-prop", "amount": amount}),
            );
            let event = codec.seal(draft).unwrap();
            let mut value = serde_json::to_value(&event).unwrap();
            value["data"]["amount"] = json!(amount + delta);

            prop_assert_eq!(codec.decode_str(&value.to_string()), Err(DecodeError::BadSignature));
        }
    }
}
