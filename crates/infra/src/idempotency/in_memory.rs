use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use finstream_core::{Clock, SystemClock};

use super::{ClaimOutcome, IdempotencyError, IdempotencyStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordState {
    Processing,
    Processed,
}

#[derive(Debug, Clone, Copy)]
struct Record {
    state: RecordState,
    expires_at: u64,
}

/// In-memory idempotency store for tests/dev.
///
/// Expiry is evaluated lazily against the injected [`Clock`].
#[derive(Debug)]
pub struct InMemoryIdempotencyStore {
    records: Mutex<HashMap<String, Record>>,
    offline: AtomicBool,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryIdempotencyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            offline: AtomicBool::new(false),
            clock,
        }
    }

    /// Simulate a store outage.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of live (unexpired) records.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.records
            .lock()
            .map(|r| r.values().filter(|rec| rec.expires_at > now).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Record>>, IdempotencyError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(IdempotencyError::Unavailable("store offline".to_string()));
        }
        self.records
            .lock()
            .map_err(|_| IdempotencyError::Storage("lock poisoned".to_string()))
    }

    fn live(&self, records: &HashMap<String, Record>, key: &str) -> Option<Record> {
        let now = self.clock.now_millis();
        records.get(key).copied().filter(|rec| rec.expires_at > now)
    }

    fn expiry(&self, ttl: Duration) -> u64 {
        self.clock.now_millis().saturating_add(ttl.as_millis() as u64)
    }
}

impl IdempotencyStore for InMemoryIdempotencyStore {
    fn try_claim(&self, key: &str, lease: Duration) -> Result<ClaimOutcome, IdempotencyError> {
        let mut records = self.lock()?;
        match self.live(&records, key).map(|rec| rec.state) {
            Some(RecordState::Processed) => return Ok(ClaimOutcome::Processed),
            Some(RecordState::Processing) => return Ok(ClaimOutcome::InFlight),
            None => {}
        }

        records.insert(
            key.to_string(),
            Record {
                state: RecordState::Processing,
                expires_at: self.expiry(lease),
            },
        );
        Ok(ClaimOutcome::Claimed)
    }

    fn mark_processed(&self, key: &str, ttl: Duration) -> Result<(), IdempotencyError> {
        let mut records = self.lock()?;
        records.insert(
            key.to_string(),
            Record {
                state: RecordState::Processed,
                expires_at: self.expiry(ttl),
            },
        );
        Ok(())
    }

    fn release(&self, key: &str) -> Result<(), IdempotencyError> {
        let mut records = self.lock()?;
        if records
            .get(key)
            .is_some_and(|rec| rec.state == RecordState::Processing)
        {
            records.remove(key);
        }
        Ok(())
    }

    fn is_processed(&self, key: &str) -> Result<bool, IdempotencyError> {
        let records = self.lock()?;
        Ok(self
            .live(&records, key)
            .is_some_and(|rec| rec.state == RecordState::Processed))
    }
}

#[cfg(test)]
mod tests {
    use finstream_core::ManualClock;

    use super::*;

    const LEASE: Duration = Duration::from_secs(300);
    const TTL: Duration = Duration::from_secs(86_400);

    fn store() -> (Arc<ManualClock>, InMemoryIdempotencyStore) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = InMemoryIdempotencyStore::with_clock(clock.clone());
        (clock, store)
    }

    #[test]
    fn first_claim_wins() {
        let (_, store) = store();
        assert_eq!(store.try_claim("k", LEASE).unwrap(), ClaimOutcome::Claimed);
        assert_eq!(store.try_claim("k", LEASE).unwrap(), ClaimOutcome::InFlight);
        assert!(!store.is_processed("k").unwrap());
    }

    #[test]
    fn released_lease_can_be_claimed_again() {
        let (_, store) = store();
        store.try_claim("k", LEASE).unwrap();
        store.release("k").unwrap();
        assert_eq!(store.try_claim("k", LEASE).unwrap(), ClaimOutcome::Claimed);
    }

    #[test]
    fn processed_marker_survives_release_and_lease_expiry() {
        let (clock, store) = store();
        store.try_claim("k", LEASE).unwrap();
        store.mark_processed("k", TTL).unwrap();
        store.release("k").unwrap();

        clock.advance(LEASE * 2);
        assert!(store.is_processed("k").unwrap());
        assert_eq!(store.try_claim("k", LEASE).unwrap(), ClaimOutcome::Processed);
    }

    #[test]
    fn records_expire_after_horizon() {
        let (clock, store) = store();
        store.mark_processed("k", TTL).unwrap();
        clock.advance(TTL + Duration::from_millis(1));

        assert!(!store.is_processed("k").unwrap());
        assert!(store.is_empty());
        assert_eq!(store.try_claim("k", LEASE).unwrap(), ClaimOutcome::Claimed);
    }

    #[test]
    fn abandoned_lease_expires() {
        let (clock, store) = store();
        store.try_claim("k", LEASE).unwrap();
        clock.advance(LEASE);
        assert_eq!(store.try_claim("k", LEASE).unwrap(), ClaimOutcome::Claimed);
    }

    #[test]
    fn offline_store_reports_unavailable() {
        let (_, store) = store();
        store.set_offline(true);
        assert!(matches!(
            store.try_claim("k", LEASE),
            Err(IdempotencyError::Unavailable(_))
        ));
    }
}
