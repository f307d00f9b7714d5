//! Redis-backed dead-letter sink.
//!
//! Records are JSON values in a single hash keyed by group and entry id
//! (`HSETNX <dlq-key> <group>:<entry-id> <json>`), which makes writes
//! idempotent per group.

use std::sync::Arc;

use finstream_core::EntryId;

use super::{DeadLetterError, DeadLetterRecord, DeadLetterSink};

#[derive(Debug, Clone)]
pub struct RedisDeadLetterSink {
    client: Arc<redis::Client>,
    key: String,
}

impl RedisDeadLetterSink {
    /// * `key` - hash holding the records (e.g. "finbot.events.dlq")
    pub fn new(redis_url: impl AsRef<str>, key: impl Into<String>) -> Result<Self, DeadLetterError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| DeadLetterError::Unavailable(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            key: key.into(),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn connection(&self) -> Result<redis::Connection, DeadLetterError> {
        self.client
            .get_connection()
            .map_err(|e| DeadLetterError::Unavailable(e.to_string()))
    }
}

fn storage_error(command: &str, e: redis::RedisError) -> DeadLetterError {
    if e.is_connection_dropped() || e.is_io_error() || e.is_timeout() {
        return DeadLetterError::Unavailable(format!("{} failed: {}", command, e));
    }
    DeadLetterError::Storage(format!("{} failed: {}", command, e))
}

fn field(group: &str, entry_id: EntryId) -> String {
    format!("{}:{}", group, entry_id)
}

fn decode(raw: &str) -> Result<DeadLetterRecord, DeadLetterError> {
    serde_json::from_str(raw).map_err(|e| DeadLetterError::Serialization(e.to_string()))
}

impl DeadLetterSink for RedisDeadLetterSink {
    fn write(&self, record: &DeadLetterRecord) -> Result<bool, DeadLetterError> {
        let json = serde_json::to_string(record)
            .map_err(|e| DeadLetterError::Serialization(e.to_string()))?;
        let mut conn = self.connection()?;

        let created: i64 = redis::cmd("HSETNX")
            .arg(&self.key)
            .arg(field(&record.group, record.entry_id))
            .arg(json)
            .query(&mut conn)
            .map_err(|e| storage_error("HSETNX", e))?;
        Ok(created == 1)
    }

    fn get(
        &self,
        group: &str,
        entry_id: EntryId,
    ) -> Result<Option<DeadLetterRecord>, DeadLetterError> {
        let mut conn = self.connection()?;

        let raw: Option<String> = redis::cmd("HGET")
            .arg(&self.key)
            .arg(field(group, entry_id))
            .query(&mut conn)
            .map_err(|e| storage_error("HGET", e))?;
        raw.as_deref().map(decode).transpose()
    }

    fn list(&self, limit: usize) -> Result<Vec<DeadLetterRecord>, DeadLetterError> {
        let mut conn = self.connection()?;

        let raw: Vec<String> = redis::cmd("HVALS")
            .arg(&self.key)
            .query(&mut conn)
            .map_err(|e| storage_error("HVALS", e))?;

        let mut records = raw
            .iter()
            .map(|r| decode(r))
            .collect::<Result<Vec<_>, _>>()?;
        records.sort_by(|a, b| (a.entry_id, &a.group).cmp(&(b.entry_id, &b.group)));
        records.truncate(limit);
        Ok(records)
    }

    fn remove(&self, group: &str, entry_id: EntryId) -> Result<bool, DeadLetterError> {
        let mut conn = self.connection()?;

        let removed: i64 = redis::cmd("HDEL")
            .arg(&self.key)
            .arg(field(group, entry_id))
            .query(&mut conn)
            .map_err(|e| storage_error("HDEL", e))?;
        Ok(removed > 0)
    }
}
