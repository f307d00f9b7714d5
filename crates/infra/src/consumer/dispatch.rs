//! Fetch & dispatch: decode, deduplicate, handle, acknowledge.

use tracing::{debug, error, info, instrument, warn};

use finstream_core::EntryId;
use finstream_events::{Event, LogEntry};
use finstream_observability::Counter;

use crate::idempotency::{ClaimOutcome, dedup_key};

use super::{BatchReport, ConsumerError, EntryOutcome, StreamConsumer};

impl StreamConsumer {
    /// Fetch up to `batch_size` new entries (blocking up to `block`) and
    /// process them in delivery order.
    ///
    /// Only a failed fetch is an error; per-entry failures are reported in
    /// the [`BatchReport`] and leave the entry pending.
    pub fn poll_once(&self) -> Result<BatchReport, ConsumerError> {
        let s = &self.settings;
        let entries = self
            .broker
            .read_group(&s.stream, &s.group, &self.consumer_name, s.batch_size, s.block)
            .inspect_err(|e| {
                self.count(Counter::ConsumeErrors);
                error!(
                    stream = %s.stream,
                    group = %s.group,
                    consumer = %self.consumer_name,
                    error = %e,
                    "failed to read from stream"
                );
            })?;

        let mut report = BatchReport::default();
        for entry in entries {
            self.count(Counter::Received);
            let entry_id = entry.id();
            let outcome = self.process_entry(&entry, 1);
            report.outcomes.push((entry_id, outcome));
        }

        if report.fetched() > 0 {
            debug!(
                consumer = %self.consumer_name,
                fetched = report.fetched(),
                "processed batch"
            );
        }
        Ok(report)
    }

    /// Run one delivery of an entry through decode → dedup → handler → ack.
    ///
    /// `delivery` is the broker's delivery count for this attempt.
    #[instrument(
        skip(self, entry),
        fields(entry_id = %entry.id(), consumer = %self.consumer_name),
        level = "debug"
    )]
    pub(crate) fn process_entry(&self, entry: &LogEntry, delivery: u64) -> EntryOutcome {
        let event = match self.codec.decode(entry) {
            Ok(event) => event,
            Err(e) => {
                // Permanent: retrying the same bytes cannot succeed.
                self.count(Counter::ConsumeErrors);
                warn!(entry_id = %entry.id(), error = %e, "dropping undecodable entry");
                self.ack(entry.id());
                self.forget_failure(entry.id());
                return EntryOutcome::Dropped {
                    reason: e.to_string(),
                };
            }
        };

        match self.handle_event(entry.id(), &event, delivery) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.count(Counter::ConsumeErrors);
                error!(
                    entry_id = %entry.id(),
                    event_id = %event.id(),
                    error = %e,
                    "entry left pending after store failure"
                );
                EntryOutcome::Errored {
                    reason: e.to_string(),
                }
            }
        }
    }

    fn handle_event(
        &self,
        entry_id: EntryId,
        event: &Event,
        delivery: u64,
    ) -> Result<EntryOutcome, ConsumerError> {
        let s = &self.settings;
        let key = dedup_key(&s.stream, &s.group, event.id());

        match self.idempotency.try_claim(&key, s.processing_lease)? {
            ClaimOutcome::Claimed => {}
            ClaimOutcome::Processed => {
                info!(
                    entry_id = %entry_id,
                    event_id = %event.id(),
                    event_type = %event.event_type(),
                    "event already processed; acknowledging duplicate"
                );
                self.ack(entry_id);
                self.forget_failure(entry_id);
                return Ok(EntryOutcome::Duplicate);
            }
            ClaimOutcome::InFlight => {
                // Acking here would lose the event if the lease holder died.
                info!(
                    entry_id = %entry_id,
                    event_id = %event.id(),
                    delivery,
                    "event held by another attempt; leaving entry pending"
                );
                return Ok(EntryOutcome::InFlight);
            }
        }

        match self.registry.dispatch(event) {
            Ok(dispatched) => {
                if let Err(e) = self.idempotency.mark_processed(&key, s.dedup_ttl) {
                    // The lease still guards the event until it expires.
                    self.count(Counter::ConsumeErrors);
                    warn!(event_id = %event.id(), error = %e, "failed to record processed event");
                }
                self.ack(entry_id);
                self.count(Counter::Processed);
                self.forget_failure(entry_id);
                debug!(
                    entry_id = %entry_id,
                    event_id = %event.id(),
                    event_type = %event.event_type(),
                    delivery,
                    "event processed"
                );

                if dispatched.notify {
                    if let Err(e) = self.notifier.notify(event) {
                        warn!(event_id = %event.id(), error = %e, "real-time notification failed");
                    }
                }
                Ok(EntryOutcome::Processed)
            }
            Err(handler_err) => {
                self.count(Counter::Failed);
                let reason = handler_err.to_string();
                self.remember_failure(entry_id, &reason);
                warn!(
                    entry_id = %entry_id,
                    event_id = %event.id(),
                    event_type = %event.event_type(),
                    delivery,
                    max_retries = s.max_retries,
                    error = %reason,
                    "event handler failed; entry left pending"
                );

                if let Err(e) = self.idempotency.release(&key) {
                    // Next attempt waits for the lease to expire.
                    self.count(Counter::ConsumeErrors);
                    warn!(event_id = %event.id(), error = %e, "failed to release processing lease");
                }
                Ok(EntryOutcome::Failed { reason })
            }
        }
    }

    /// Acknowledge, logging failures. An unacknowledged entry is reclaimed
    /// later and short-circuits on its dedup record.
    pub(crate) fn ack(&self, entry_id: EntryId) {
        let s = &self.settings;
        if let Err(e) = self.broker.ack(&s.stream, &s.group, entry_id) {
            self.count(Counter::ConsumeErrors);
            error!(entry_id = %entry_id, error = %e, "failed to acknowledge entry");
        }
    }
}
