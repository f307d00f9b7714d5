//! Redis Streams-backed broker (durable, at-least-once delivery).
//!
//! Command mapping:
//! - `create_group` → `XGROUP CREATE <stream> <group> <start> MKSTREAM`
//! - `read_group` → `XREADGROUP GROUP <group> <consumer> COUNT n [BLOCK ms] STREAMS <stream> >`
//! - `pending` → `XPENDING <stream> <group> - + <count>`
//! - `claim` → `XCLAIM <stream> <group> <consumer> <min-idle-ms> <id>`
//! - `ack` → `XACK`, `append` → `XADD <stream> * ...`
//!
//! Replies are parsed from raw [`redis::Value`]s so that trimmed entries
//! (nil payloads) can be told apart from malformed replies.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};

use finstream_core::EntryId;
use finstream_events::LogEntry;

use super::{BrokerError, Claim, GroupCreation, PendingRecord, StartPosition, StreamBroker};

#[derive(Debug, Clone)]
pub struct RedisStreamBroker {
    client: Arc<redis::Client>,
}

impl RedisStreamBroker {
    /// Create a broker for a Redis URL (e.g. "redis://localhost:6379").
    ///
    /// No connection is opened until the first command.
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
        })
    }

    fn connection(&self) -> Result<redis::Connection, BrokerError> {
        self.client
            .get_connection()
            .map_err(|e| BrokerError::Connection(e.to_string()))
    }

    /// Whether `entry_id` still exists in the stream.
    fn entry_exists(
        &self,
        conn: &mut redis::Connection,
        stream: &str,
        entry_id: EntryId,
    ) -> Result<bool, BrokerError> {
        let id = entry_id.to_string();
        let reply: redis::Value = redis::cmd("XRANGE")
            .arg(stream)
            .arg(&id)
            .arg(&id)
            .query(conn)
            .map_err(|e| command_error("XRANGE", stream, "", e))?;

        Ok(matches!(reply, redis::Value::Bulk(items) if !items.is_empty()))
    }
}

fn command_error(command: &str, stream: &str, group: &str, e: redis::RedisError) -> BrokerError {
    if e.code() == Some("NOGROUP") {
        return BrokerError::NoGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        };
    }
    if e.is_connection_dropped() || e.is_io_error() || e.is_timeout() {
        return BrokerError::Connection(format!("{} failed: {}", command, e));
    }
    BrokerError::Command(format!("{} failed: {}", command, e))
}

fn value_to_string(value: &redis::Value) -> Result<String, BrokerError> {
    match value {
        redis::Value::Data(data) => Ok(String::from_utf8_lossy(data).to_string()),
        redis::Value::Status(s) => Ok(s.clone()),
        other => Err(BrokerError::Protocol(format!("expected string, got {:?}", other))),
    }
}

fn value_to_u64(value: &redis::Value) -> Result<u64, BrokerError> {
    match value {
        redis::Value::Int(n) => Ok((*n).max(0) as u64),
        redis::Value::Data(data) => String::from_utf8_lossy(data)
            .parse::<u64>()
            .map_err(|e| BrokerError::Protocol(format!("expected integer: {}", e))),
        other => Err(BrokerError::Protocol(format!("expected integer, got {:?}", other))),
    }
}

fn parse_entry_id(value: &redis::Value) -> Result<EntryId, BrokerError> {
    value_to_string(value)?
        .parse()
        .map_err(|e| BrokerError::Protocol(format!("bad entry id: {}", e)))
}

/// Parse `[id, [field, value, ...]]`. A nil field list (entry trimmed while
/// pending) yields `Ok(None)`.
fn parse_stream_entry(entry: &redis::Value) -> Result<Option<LogEntry>, BrokerError> {
    let parts = match entry {
        redis::Value::Bulk(parts) if parts.len() >= 2 => parts,
        redis::Value::Nil => return Ok(None),
        other => return Err(BrokerError::Protocol(format!("invalid entry format: {:?}", other))),
    };

    let id = parse_entry_id(&parts[0])?;

    let raw_fields = match &parts[1] {
        redis::Value::Bulk(v) => v,
        redis::Value::Nil => return Ok(None),
        other => return Err(BrokerError::Protocol(format!("invalid fields format: {:?}", other))),
    };

    let mut fields = BTreeMap::new();
    for chunk in raw_fields.chunks(2) {
        if let [key, value] = chunk {
            fields.insert(value_to_string(key)?, value_to_string(value)?);
        }
    }

    Ok(Some(LogEntry::new(id, fields)))
}

/// Parse an `XREADGROUP` reply: `[[stream, [entry, ...]], ...]` or nil on
/// timeout.
fn parse_read_reply(reply: redis::Value, stream: &str) -> Result<Vec<LogEntry>, BrokerError> {
    let streams = match reply {
        redis::Value::Nil => return Ok(Vec::new()),
        redis::Value::Bulk(streams) => streams,
        other => return Err(BrokerError::Protocol(format!("invalid XREADGROUP reply: {:?}", other))),
    };

    let mut entries = Vec::new();
    for item in &streams {
        let redis::Value::Bulk(pair) = item else {
            return Err(BrokerError::Protocol("invalid stream block".to_string()));
        };
        if pair.len() < 2 || value_to_string(&pair[0])? != stream {
            continue;
        }
        if let redis::Value::Bulk(raw_entries) = &pair[1] {
            for raw in raw_entries {
                if let Some(entry) = parse_stream_entry(raw)? {
                    entries.push(entry);
                }
            }
        }
    }
    Ok(entries)
}

fn parse_pending_record(value: &redis::Value) -> Result<PendingRecord, BrokerError> {
    match value {
        redis::Value::Bulk(parts) if parts.len() >= 4 => Ok(PendingRecord {
            entry_id: parse_entry_id(&parts[0])?,
            consumer: value_to_string(&parts[1])?,
            idle: Duration::from_millis(value_to_u64(&parts[2])?),
            delivery_count: value_to_u64(&parts[3])?,
        }),
        other => Err(BrokerError::Protocol(format!("invalid XPENDING record: {:?}", other))),
    }
}

impl StreamBroker for RedisStreamBroker {
    #[instrument(skip(self), err)]
    fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: StartPosition,
    ) -> Result<GroupCreation, BrokerError> {
        let mut conn = self.connection()?;

        let result: redis::RedisResult<redis::Value> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg(start.as_arg())
            .arg("MKSTREAM")
            .query(&mut conn);

        match result {
            Ok(_) => Ok(GroupCreation::Created),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(GroupCreation::AlreadyExists),
            Err(e) => Err(command_error("XGROUP CREATE", stream, group, e)),
        }
    }

    fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>, BrokerError> {
        let mut conn = self.connection()?;

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count.max(1));
        // BLOCK 0 means "forever" to Redis; a zero wait is a plain poll.
        if !block.is_zero() {
            cmd.arg("BLOCK").arg(block.as_millis() as u64);
        }
        cmd.arg("STREAMS").arg(stream).arg(">");

        let reply: redis::Value = cmd
            .query(&mut conn)
            .map_err(|e| command_error("XREADGROUP", stream, group, e))?;

        let entries = parse_read_reply(reply, stream)?;
        if !entries.is_empty() {
            debug!(stream, group, consumer, count = entries.len(), "read batch");
        }
        Ok(entries)
    }

    fn pending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingRecord>, BrokerError> {
        let mut conn = self.connection()?;

        let reply: redis::Value = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg("-")
            .arg("+")
            .arg(count.max(1))
            .query(&mut conn)
            .map_err(|e| command_error("XPENDING", stream, group, e))?;

        match reply {
            redis::Value::Nil => Ok(Vec::new()),
            redis::Value::Bulk(records) => records.iter().map(parse_pending_record).collect(),
            other => Err(BrokerError::Protocol(format!("invalid XPENDING reply: {:?}", other))),
        }
    }

    #[instrument(skip(self, entry_id), fields(entry_id = %entry_id), err)]
    fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        entry_id: EntryId,
    ) -> Result<Claim, BrokerError> {
        let mut conn = self.connection()?;

        let reply: redis::Value = redis::cmd("XCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64)
            .arg(entry_id.to_string())
            .query(&mut conn)
            .map_err(|e| command_error("XCLAIM", stream, group, e))?;

        let claimed = match reply {
            redis::Value::Bulk(items) => items,
            redis::Value::Nil => Vec::new(),
            other => return Err(BrokerError::Protocol(format!("invalid XCLAIM reply: {:?}", other))),
        };

        match claimed.first() {
            Some(item) => match parse_stream_entry(item)? {
                Some(entry) => Ok(Claim::Claimed(entry)),
                None => Ok(Claim::Gone),
            },
            // Redis 7 drops trimmed entries from the PEL and returns nothing.
            None if !self.entry_exists(&mut conn, stream, entry_id)? => Ok(Claim::Gone),
            None => Ok(Claim::Lost),
        }
    }

    fn ack(&self, stream: &str, group: &str, entry_id: EntryId) -> Result<bool, BrokerError> {
        let mut conn = self.connection()?;

        let acked: u64 = redis::cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(entry_id.to_string())
            .query(&mut conn)
            .map_err(|e| command_error("XACK", stream, group, e))?;

        Ok(acked > 0)
    }

    fn append(
        &self,
        stream: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<EntryId, BrokerError> {
        let mut conn = self.connection()?;

        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("*");
        for (key, value) in fields {
            cmd.arg(key).arg(value);
        }

        let reply: redis::Value = cmd
            .query(&mut conn)
            .map_err(|e| command_error("XADD", stream, "", e))?;
        parse_entry_id(&reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(s: &str) -> redis::Value {
        redis::Value::Data(s.as_bytes().to_vec())
    }

    #[test]
    fn parses_read_reply_for_matching_stream() {
        let reply = redis::Value::Bulk(vec![redis::Value::Bulk(vec![
            data("finbot.events"),
            redis::Value::Bulk(vec![redis::Value::Bulk(vec![
                data("1700000000000-0"),
                redis::Value::Bulk(vec![data("event"), data("{}")]),
            ])]),
        ])]);

        let entries = parse_read_reply(reply, "finbot.events").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id(), EntryId::new(1700000000000, 0));
        assert_eq!(entries[0].event_payload(), Some("{}"));
    }

    #[test]
    fn read_timeout_is_an_empty_batch() {
        assert!(parse_read_reply(redis::Value::Nil, "s").unwrap().is_empty());
    }

    #[test]
    fn nil_fields_mean_trimmed_entry() {
        let entry = redis::Value::Bulk(vec![data("1-0"), redis::Value::Nil]);
        assert_eq!(parse_stream_entry(&entry).unwrap(), None);
    }

    #[test]
    fn parses_pending_record() {
        let record = redis::Value::Bulk(vec![
            data("5-1"),
            data("finbot-consumers-42"),
            redis::Value::Int(300_001),
            redis::Value::Int(2),
        ]);
        let parsed = parse_pending_record(&record).unwrap();
        assert_eq!(parsed.entry_id, EntryId::new(5, 1));
        assert_eq!(parsed.consumer, "finbot-consumers-42");
        assert_eq!(parsed.idle, Duration::from_millis(300_001));
        assert_eq!(parsed.delivery_count, 2);
    }

    #[test]
    fn malformed_reply_is_a_protocol_error() {
        let err = parse_read_reply(redis::Value::Int(1), "s").unwrap_err();
        assert!(matches!(err, BrokerError::Protocol(_)));
    }
}
