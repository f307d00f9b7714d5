use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use finstream_core::{Clock, EntryId, SystemClock};
use finstream_events::LogEntry;

use super::{BrokerError, Claim, GroupCreation, PendingRecord, StartPosition, StreamBroker};

#[derive(Debug, Clone)]
struct PendingState {
    consumer: String,
    delivered_at: u64,
    delivery_count: u64,
}

#[derive(Debug, Default)]
struct GroupState {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, PendingState>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: BTreeMap<EntryId, BTreeMap<String, String>>,
    last_id: EntryId,
    groups: HashMap<String, GroupState>,
}

#[derive(Debug, Default)]
struct BrokerState {
    streams: HashMap<String, StreamState>,
    offline: bool,
}

/// In-memory consumer-group log.
///
/// - Entry ids come from the injected [`Clock`], so ids and idle times are
///   deterministic under a `ManualClock`
/// - Blocking reads wait on real time (a condition variable woken by appends)
/// - `set_offline(true)` makes every call fail, to exercise error paths
#[derive(Debug)]
pub struct InMemoryStreamBroker {
    state: Mutex<BrokerState>,
    appended: Condvar,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryStreamBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStreamBroker {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            appended: Condvar::new(),
            clock,
        }
    }

    /// Simulate a broker outage.
    pub fn set_offline(&self, offline: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.offline = offline;
        }
    }

    /// Number of entries currently stored in `stream`.
    pub fn len(&self, stream: &str) -> usize {
        self.state
            .lock()
            .map(|s| s.streams.get(stream).map_or(0, |st| st.entries.len()))
            .unwrap_or(0)
    }

    pub fn is_empty(&self, stream: &str) -> bool {
        self.len(stream) == 0
    }

    /// Ids pending in `group`, oldest first.
    pub fn pending_ids(&self, stream: &str, group: &str) -> Vec<EntryId> {
        self.state
            .lock()
            .map(|s| {
                s.streams
                    .get(stream)
                    .and_then(|st| st.groups.get(group))
                    .map(|g| g.pending.keys().copied().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    /// Remove an entry's payload, as stream trimming would. Pending state is
    /// left untouched.
    pub fn delete(&self, stream: &str, entry_id: EntryId) -> bool {
        self.state
            .lock()
            .map(|mut s| {
                s.streams
                    .get_mut(stream)
                    .is_some_and(|st| st.entries.remove(&entry_id).is_some())
            })
            .unwrap_or(false)
    }

    fn lock(&self) -> Result<MutexGuard<'_, BrokerState>, BrokerError> {
        let state = self
            .state
            .lock()
            .map_err(|_| BrokerError::Command("broker state lock poisoned".to_string()))?;
        if state.offline {
            return Err(BrokerError::Connection("broker offline".to_string()));
        }
        Ok(state)
    }
}

fn no_group(stream: &str, group: &str) -> BrokerError {
    BrokerError::NoGroup {
        stream: stream.to_string(),
        group: group.to_string(),
    }
}

/// Deliver up to `count` undelivered entries. Returns an empty vec when none
/// are available.
fn deliver(
    state: &mut BrokerState,
    stream: &str,
    group: &str,
    consumer: &str,
    count: usize,
    now: u64,
) -> Result<Vec<LogEntry>, BrokerError> {
    let st = state
        .streams
        .get_mut(stream)
        .ok_or_else(|| no_group(stream, group))?;
    let g = st.groups.get_mut(group).ok_or_else(|| no_group(stream, group))?;

    let batch: Vec<LogEntry> = st
        .entries
        .range(g.last_delivered.successor()..)
        .take(count)
        .map(|(id, fields)| LogEntry::new(*id, fields.clone()))
        .collect();

    for entry in &batch {
        g.last_delivered = entry.id();
        g.pending.insert(
            entry.id(),
            PendingState {
                consumer: consumer.to_string(),
                delivered_at: now,
                delivery_count: 1,
            },
        );
    }

    Ok(batch)
}

impl StreamBroker for InMemoryStreamBroker {
    fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: StartPosition,
    ) -> Result<GroupCreation, BrokerError> {
        let mut state = self.lock()?;
        let st = state.streams.entry(stream.to_string()).or_default();

        if st.groups.contains_key(group) {
            return Ok(GroupCreation::AlreadyExists);
        }

        let last_delivered = match start {
            StartPosition::Beginning => EntryId::ZERO,
            StartPosition::NewOnly => st.last_id,
            StartPosition::After(id) => id,
        };
        st.groups.insert(
            group.to_string(),
            GroupState {
                last_delivered,
                pending: BTreeMap::new(),
            },
        );
        Ok(GroupCreation::Created)
    }

    fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>, BrokerError> {
        let deadline = Instant::now() + block;
        let mut state = self.lock()?;

        loop {
            let now = self.clock.now_millis();
            let batch = deliver(&mut state, stream, group, consumer, count, now)?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(batch);
            }

            let (guard, _) = self
                .appended
                .wait_timeout(state, remaining)
                .map_err(|_| BrokerError::Command("broker state lock poisoned".to_string()))?;
            state = guard;
            if state.offline {
                return Err(BrokerError::Connection("broker offline".to_string()));
            }
        }
    }

    fn pending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingRecord>, BrokerError> {
        let state = self.lock()?;
        let g = state
            .streams
            .get(stream)
            .and_then(|st| st.groups.get(group))
            .ok_or_else(|| no_group(stream, group))?;

        let now = self.clock.now_millis();
        Ok(g.pending
            .iter()
            .take(count)
            .map(|(id, p)| PendingRecord {
                entry_id: *id,
                consumer: p.consumer.clone(),
                idle: Duration::from_millis(now.saturating_sub(p.delivered_at)),
                delivery_count: p.delivery_count,
            })
            .collect())
    }

    fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        entry_id: EntryId,
    ) -> Result<Claim, BrokerError> {
        let mut state = self.lock()?;
        let now = self.clock.now_millis();
        let st = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| no_group(stream, group))?;
        let g = st.groups.get_mut(group).ok_or_else(|| no_group(stream, group))?;

        let Some(p) = g.pending.get_mut(&entry_id) else {
            return Ok(Claim::Lost);
        };
        let idle = Duration::from_millis(now.saturating_sub(p.delivered_at));
        if idle < min_idle {
            return Ok(Claim::Lost);
        }

        let Some(fields) = st.entries.get(&entry_id) else {
            return Ok(Claim::Gone);
        };

        p.consumer = consumer.to_string();
        p.delivered_at = now;
        p.delivery_count += 1;

        Ok(Claim::Claimed(LogEntry::new(entry_id, fields.clone())))
    }

    fn ack(&self, stream: &str, group: &str, entry_id: EntryId) -> Result<bool, BrokerError> {
        let mut state = self.lock()?;
        let g = state
            .streams
            .get_mut(stream)
            .and_then(|st| st.groups.get_mut(group))
            .ok_or_else(|| no_group(stream, group))?;
        Ok(g.pending.remove(&entry_id).is_some())
    }

    fn append(
        &self,
        stream: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<EntryId, BrokerError> {
        let mut state = self.lock()?;
        let now = self.clock.now_millis();
        let st = state.streams.entry(stream.to_string()).or_default();

        let id = if now > st.last_id.millis() {
            EntryId::new(now, 0)
        } else {
            st.last_id.successor()
        };
        st.last_id = id;
        st.entries.insert(id, fields.clone());

        drop(state);
        self.appended.notify_all();
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use finstream_core::ManualClock;

    use super::*;

    const STREAM: &str = "finbot.events";
    const GROUP: &str = "finbot-consumers";

    fn fields(v: &str) -> BTreeMap<String, String> {
        BTreeMap::from([("event".to_string(), v.to_string())])
    }

    fn broker() -> (Arc<ManualClock>, InMemoryStreamBroker) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        ));
        let broker = InMemoryStreamBroker::with_clock(clock.clone());
        (clock, broker)
    }

    #[test]
    fn create_group_is_idempotent_and_creates_stream() {
        let (_, broker) = broker();
        assert_eq!(
            broker.create_group(STREAM, GROUP, StartPosition::Beginning).unwrap(),
            GroupCreation::Created
        );
        assert_eq!(
            broker.create_group(STREAM, GROUP, StartPosition::Beginning).unwrap(),
            GroupCreation::AlreadyExists
        );
        assert!(broker.is_empty(STREAM));
    }

    #[test]
    fn ids_increase_within_the_same_millisecond() {
        let (_, broker) = broker();
        let a = broker.append(STREAM, &fields("a")).unwrap();
        let b = broker.append(STREAM, &fields("b")).unwrap();
        assert_eq!(a.millis(), b.millis());
        assert!(b > a);
    }

    #[test]
    fn each_entry_is_delivered_once_per_group() {
        let (_, broker) = broker();
        broker.create_group(STREAM, GROUP, StartPosition::Beginning).unwrap();
        for v in ["a", "b", "c"] {
            broker.append(STREAM, &fields(v)).unwrap();
        }

        let first = broker.read_group(STREAM, GROUP, "c1", 2, Duration::ZERO).unwrap();
        let second = broker.read_group(STREAM, GROUP, "c2", 10, Duration::ZERO).unwrap();
        let third = broker.read_group(STREAM, GROUP, "c1", 10, Duration::ZERO).unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 1);
        assert!(third.is_empty());
        assert_eq!(broker.pending_ids(STREAM, GROUP).len(), 3);
    }

    #[test]
    fn new_only_group_skips_existing_entries() {
        let (_, broker) = broker();
        broker.append(STREAM, &fields("old")).unwrap();
        broker.create_group(STREAM, GROUP, StartPosition::NewOnly).unwrap();
        broker.append(STREAM, &fields("new")).unwrap();

        let batch = broker.read_group(STREAM, GROUP, "c1", 10, Duration::ZERO).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].event_payload(), Some("new"));
    }

    #[test]
    fn read_without_group_fails() {
        let (_, broker) = broker();
        let err = broker
            .read_group(STREAM, GROUP, "c1", 10, Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, BrokerError::NoGroup { .. }));
    }

    #[test]
    fn claim_respects_min_idle_and_bumps_delivery_count() {
        let (clock, broker) = broker();
        broker.create_group(STREAM, GROUP, StartPosition::Beginning).unwrap();
        let id = broker.append(STREAM, &fields("a")).unwrap();
        broker.read_group(STREAM, GROUP, "c1", 10, Duration::ZERO).unwrap();

        let min_idle = Duration::from_secs(60);
        assert_eq!(broker.claim(STREAM, GROUP, "c2", min_idle, id).unwrap(), Claim::Lost);

        clock.advance(Duration::from_secs(61));
        let pending = broker.pending(STREAM, GROUP, 10).unwrap();
        assert_eq!(pending[0].idle, Duration::from_secs(61));
        assert_eq!(pending[0].delivery_count, 1);

        assert!(matches!(
            broker.claim(STREAM, GROUP, "c2", min_idle, id).unwrap(),
            Claim::Claimed(_)
        ));
        // A second claimant immediately after loses.
        assert_eq!(broker.claim(STREAM, GROUP, "c3", min_idle, id).unwrap(), Claim::Lost);

        let pending = broker.pending(STREAM, GROUP, 10).unwrap();
        assert_eq!(pending[0].consumer, "c2");
        assert_eq!(pending[0].delivery_count, 2);
        assert_eq!(pending[0].idle, Duration::ZERO);
    }

    #[test]
    fn claim_of_trimmed_entry_reports_gone() {
        let (clock, broker) = broker();
        broker.create_group(STREAM, GROUP, StartPosition::Beginning).unwrap();
        let id = broker.append(STREAM, &fields("a")).unwrap();
        broker.read_group(STREAM, GROUP, "c1", 10, Duration::ZERO).unwrap();
        broker.delete(STREAM, id);
        clock.advance(Duration::from_secs(5));

        assert_eq!(
            broker.claim(STREAM, GROUP, "c2", Duration::ZERO, id).unwrap(),
            Claim::Gone
        );
    }

    #[test]
    fn ack_removes_pending_once() {
        let (_, broker) = broker();
        broker.create_group(STREAM, GROUP, StartPosition::Beginning).unwrap();
        let id = broker.append(STREAM, &fields("a")).unwrap();
        broker.read_group(STREAM, GROUP, "c1", 10, Duration::ZERO).unwrap();

        assert!(broker.ack(STREAM, GROUP, id).unwrap());
        assert!(!broker.ack(STREAM, GROUP, id).unwrap());
        assert!(broker.pending_ids(STREAM, GROUP).is_empty());
    }

    #[test]
    fn blocking_read_wakes_on_append() {
        let (_, broker) = broker();
        let broker = Arc::new(broker);
        broker.create_group(STREAM, GROUP, StartPosition::Beginning).unwrap();

        let producer = broker.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.append(STREAM, &fields("late")).unwrap();
        });

        let batch = broker
            .read_group(STREAM, GROUP, "c1", 10, Duration::from_secs(5))
            .unwrap();
        handle.join().unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn offline_broker_fails_every_call() {
        let (_, broker) = broker();
        broker.set_offline(true);
        assert!(matches!(
            broker.append(STREAM, &fields("a")),
            Err(BrokerError::Connection(_))
        ));
        broker.set_offline(false);
        assert!(broker.append(STREAM, &fields("a")).is_ok());
    }
}
