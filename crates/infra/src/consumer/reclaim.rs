//! Retry & reclaim: stalled pending entries are taken over and re-run, and
//! entries out of deliveries are moved to the dead-letter sink.

use tracing::{error, info, warn};

use finstream_observability::Counter;

use crate::broker::{Claim, PendingRecord};
use crate::dead_letter::DeadLetterRecord;

use super::{ConsumerError, EntryOutcome, ReclaimReport, StreamConsumer};

impl StreamConsumer {
    /// Scan the group's pending entries once.
    ///
    /// For each record idle longer than `retry_delay`:
    /// - reclaimed fewer than `max_retries` times: claim it and run it again
    /// - otherwise: claim it, write a dead-letter record, acknowledge
    ///
    /// The first delivery is not a retry, so an entry runs at most
    /// `max_retries + 1` times.
    ///
    /// Records another consumer claims first are skipped.
    pub fn reclaim_once(&self) -> Result<ReclaimReport, ConsumerError> {
        let s = &self.settings;
        let pending = self
            .broker
            .pending(&s.stream, &s.group, s.reclaim_batch_size)
            .inspect_err(|e| {
                self.count(Counter::ConsumeErrors);
                error!(stream = %s.stream, group = %s.group, error = %e, "failed to list pending entries");
            })?;

        let mut report = ReclaimReport {
            scanned: pending.len(),
            ..Default::default()
        };

        for record in pending {
            if record.idle <= s.retry_delay {
                report.not_due += 1;
                continue;
            }

            let retries = record.delivery_count.saturating_sub(1);
            let outcome = if retries >= s.max_retries {
                self.dead_letter(&record)
            } else {
                self.retry(&record)
            };

            let outcome = outcome.unwrap_or_else(|e| {
                self.count(Counter::ConsumeErrors);
                error!(entry_id = %record.entry_id, error = %e, "reclaim step failed; entry left pending");
                EntryOutcome::Errored {
                    reason: e.to_string(),
                }
            });
            report.outcomes.push((record.entry_id, outcome));
        }

        Ok(report)
    }

    fn retry(&self, record: &PendingRecord) -> Result<EntryOutcome, ConsumerError> {
        let s = &self.settings;
        match self.broker.claim(
            &s.stream,
            &s.group,
            &self.consumer_name,
            s.retry_delay,
            record.entry_id,
        )? {
            Claim::Claimed(entry) => {
                self.count(Counter::Received);
                info!(
                    entry_id = %record.entry_id,
                    previous_owner = %record.consumer,
                    delivery = record.delivery_count + 1,
                    "reclaimed stalled entry"
                );
                Ok(self.process_entry(&entry, record.delivery_count + 1))
            }
            Claim::Gone => Ok(self.drop_trimmed(record)),
            Claim::Lost => Ok(EntryOutcome::Skipped),
        }
    }

    fn dead_letter(&self, record: &PendingRecord) -> Result<EntryOutcome, ConsumerError> {
        let s = &self.settings;
        let entry = match self.broker.claim(
            &s.stream,
            &s.group,
            &self.consumer_name,
            s.retry_delay,
            record.entry_id,
        )? {
            Claim::Claimed(entry) => entry,
            Claim::Gone => return Ok(self.drop_trimmed(record)),
            Claim::Lost => return Ok(EntryOutcome::Skipped),
        };

        let reason = match self.last_failure(record.entry_id) {
            Some(last) => format!(
                "exceeded {} retries; last error: {}",
                s.max_retries, last
            ),
            None => format!("exceeded {} retries", s.max_retries),
        };

        let mut dlq_record = DeadLetterRecord::from_entry(
            &entry,
            &s.stream,
            &s.group,
            reason,
            record.delivery_count,
            self.clock.now(),
        );
        if let Ok(event) = self.codec.decode(&entry) {
            dlq_record = dlq_record.with_event(event.id(), event.event_type());
        }

        let newly_written = self.dead_letters.write(&dlq_record)?;
        if newly_written {
            self.count(Counter::Dlq);
        }
        self.ack(record.entry_id);
        self.forget_failure(record.entry_id);

        warn!(
            entry_id = %record.entry_id,
            event_id = ?dlq_record.event_id,
            event_type = ?dlq_record.event_type,
            deliveries = record.delivery_count,
            reason = %dlq_record.reason,
            newly_written,
            "entry moved to dead-letter sink"
        );
        Ok(EntryOutcome::DeadLettered { newly_written })
    }

    fn drop_trimmed(&self, record: &PendingRecord) -> EntryOutcome {
        warn!(entry_id = %record.entry_id, "pending entry no longer in stream; acknowledging");
        self.ack(record.entry_id);
        self.forget_failure(record.entry_id);
        EntryOutcome::Gone
    }
}
