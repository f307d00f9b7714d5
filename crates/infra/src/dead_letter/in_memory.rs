use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use finstream_core::EntryId;

use super::{DeadLetterError, DeadLetterRecord, DeadLetterSink};

type RecordKey = (EntryId, String);

/// In-memory dead-letter sink for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterSink {
    records: RwLock<BTreeMap<RecordKey, DeadLetterRecord>>,
    offline: AtomicBool,
}

impl InMemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a sink outage.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<RecordKey, DeadLetterRecord>>, DeadLetterError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(DeadLetterError::Unavailable("sink offline".to_string()));
        }
        self.records
            .read()
            .map_err(|_| DeadLetterError::Storage("lock poisoned".to_string()))
    }

    fn write_lock(
        &self,
    ) -> Result<RwLockWriteGuard<'_, BTreeMap<RecordKey, DeadLetterRecord>>, DeadLetterError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(DeadLetterError::Unavailable("sink offline".to_string()));
        }
        self.records
            .write()
            .map_err(|_| DeadLetterError::Storage("lock poisoned".to_string()))
    }
}

impl DeadLetterSink for InMemoryDeadLetterSink {
    fn write(&self, record: &DeadLetterRecord) -> Result<bool, DeadLetterError> {
        let mut records = self.write_lock()?;
        let key = (record.entry_id, record.group.clone());
        if records.contains_key(&key) {
            return Ok(false);
        }
        records.insert(key, record.clone());
        Ok(true)
    }

    fn get(
        &self,
        group: &str,
        entry_id: EntryId,
    ) -> Result<Option<DeadLetterRecord>, DeadLetterError> {
        Ok(self.read()?.get(&(entry_id, group.to_string())).cloned())
    }

    fn list(&self, limit: usize) -> Result<Vec<DeadLetterRecord>, DeadLetterError> {
        Ok(self.read()?.values().take(limit).cloned().collect())
    }

    fn remove(&self, group: &str, entry_id: EntryId) -> Result<bool, DeadLetterError> {
        Ok(self.write_lock()?.remove(&(entry_id, group.to_string())).is_some())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use finstream_events::LogEntry;

    use super::*;

    fn record(seq: u64, reason: &str) -> DeadLetterRecord {
        record_for("g", seq, reason)
    }

    fn record_for(group: &str, seq: u64, reason: &str) -> DeadLetterRecord {
        let entry = LogEntry::with_event_payload(EntryId::new(10, seq), "{}");
        DeadLetterRecord::from_entry(&entry, "s", group, reason, 3, Utc::now())
    }

    #[test]
    fn write_is_idempotent_per_entry() {
        let sink = InMemoryDeadLetterSink::new();
        assert!(sink.write(&record(1, "first")).unwrap());
        assert!(!sink.write(&record(1, "second")).unwrap());

        let stored = sink.get("g", EntryId::new(10, 1)).unwrap().unwrap();
        assert_eq!(stored.reason, "first");
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn list_is_ordered_and_limited() {
        let sink = InMemoryDeadLetterSink::new();
        for seq in [3, 1, 2] {
            sink.write(&record(seq, "r")).unwrap();
        }
        let ids: Vec<_> = sink.list(2).unwrap().into_iter().map(|r| r.entry_id).collect();
        assert_eq!(ids, vec![EntryId::new(10, 1), EntryId::new(10, 2)]);
    }

    #[test]
    fn remove_reports_existence() {
        let sink = InMemoryDeadLetterSink::new();
        sink.write(&record(1, "r")).unwrap();
        assert!(!sink.remove("other", EntryId::new(10, 1)).unwrap());
        assert!(sink.remove("g", EntryId::new(10, 1)).unwrap());
        assert!(!sink.remove("g", EntryId::new(10, 1)).unwrap());
        assert!(sink.is_empty());
    }

    #[test]
    fn groups_keep_separate_records_for_one_entry() {
        let sink = InMemoryDeadLetterSink::new();
        assert!(sink.write(&record_for("ledger", 1, "ledger failed")).unwrap());
        assert!(sink.write(&record_for("alerts", 1, "alerts failed")).unwrap());

        assert_eq!(sink.len(), 2);
        assert_eq!(
            sink.get("alerts", EntryId::new(10, 1)).unwrap().unwrap().reason,
            "alerts failed"
        );
    }
}
