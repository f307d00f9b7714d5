use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Per-entry outcome counters exposed to the metrics collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    /// An entry was taken off the stream (new or reclaimed).
    Received,
    /// A handler completed successfully.
    Processed,
    /// A handler failed, panicked, or no handler existed.
    Failed,
    /// An entry was newly written to the dead-letter sink.
    Dlq,
    /// Undecodable entries and broker/store call failures.
    ConsumeErrors,
}

impl Counter {
    pub const ALL: [Counter; 5] = [
        Counter::Received,
        Counter::Processed,
        Counter::Failed,
        Counter::Dlq,
        Counter::ConsumeErrors,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Counter::Received => "received",
            Counter::Processed => "processed",
            Counter::Failed => "failed",
            Counter::Dlq => "dlq",
            Counter::ConsumeErrors => "consumeErrors",
        }
    }

    /// Exporter-facing metric name.
    pub fn metric_name(&self) -> &'static str {
        match self {
            Counter::Received => "finstream_received_total",
            Counter::Processed => "finstream_processed_total",
            Counter::Failed => "finstream_failed_total",
            Counter::Dlq => "finstream_dlq_total",
            Counter::ConsumeErrors => "finstream_consume_errors_total",
        }
    }

    fn index(&self) -> usize {
        match self {
            Counter::Received => 0,
            Counter::Processed => 1,
            Counter::Failed => 2,
            Counter::Dlq => 3,
            Counter::ConsumeErrors => 4,
        }
    }
}

/// Counter-increment interface of the metrics collaborator.
pub trait ConsumerMetrics: Send + Sync {
    fn increment(&self, counter: Counter);
}

impl<M> ConsumerMetrics for std::sync::Arc<M>
where
    M: ConsumerMetrics + ?Sized,
{
    fn increment(&self, counter: Counter) {
        (**self).increment(counter)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl ConsumerMetrics for NoopMetrics {
    fn increment(&self, _counter: Counter) {}
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterSnapshot {
    pub received: u64,
    pub processed: u64,
    pub failed: u64,
    pub dlq: u64,
    pub consume_errors: u64,
}

/// In-process counters for tests and status endpoints.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counts: [AtomicU64; 5],
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counts[counter.index()].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            received: self.get(Counter::Received),
            processed: self.get(Counter::Processed),
            failed: self.get(Counter::Failed),
            dlq: self.get(Counter::Dlq),
            consume_errors: self.get(Counter::ConsumeErrors),
        }
    }
}

impl ConsumerMetrics for InMemoryMetrics {
    fn increment(&self, counter: Counter) {
        self.counts[counter.index()].fetch_add(1, Ordering::Relaxed);
    }
}

/// Forwards increments to the process-wide `metrics` recorder, labelled with
/// the stream and consumer group.
#[derive(Debug, Clone)]
pub struct RecorderMetrics {
    stream: String,
    group: String,
}

impl RecorderMetrics {
    pub fn new(stream: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            group: group.into(),
        }
    }
}

impl ConsumerMetrics for RecorderMetrics {
    fn increment(&self, counter: Counter) {
        metrics::counter!(
            counter.metric_name(),
            "stream" => self.stream.clone(),
            "group" => self.group.clone()
        )
        .increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_counts_per_counter() {
        let metrics = InMemoryMetrics::new();
        metrics.increment(Counter::Received);
        metrics.increment(Counter::Received);
        metrics.increment(Counter::Dlq);

        assert_eq!(
            metrics.snapshot(),
            CounterSnapshot {
                received: 2,
                dlq: 1,
                ..Default::default()
            }
        );
    }

    #[test]
    fn counter_names_are_distinct() {
        let mut names: Vec<_> = Counter::ALL.iter().map(Counter::name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), Counter::ALL.len());
    }

    #[test]
    fn recorder_without_installed_recorder_is_a_noop() {
        RecorderMetrics::new("finbot.events", "finbot-consumers").increment(Counter::Processed);
    }
}
