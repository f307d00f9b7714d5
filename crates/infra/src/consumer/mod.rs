//! Consumer-group event consumer.
//!
//! [`StreamConsumer`] owns one iteration's worth of work:
//! - [`StreamConsumer::ensure_group`] (group manager)
//! - [`StreamConsumer::poll_once`] (fetch & dispatch)
//! - [`StreamConsumer::reclaim_once`] (retry, reclaim, dead-lettering)
//!
//! [`ConsumerController`] runs those on background threads with a shared
//! stop signal. Everything is synchronous; callers inside an async runtime
//! should drive the controller from `spawn_blocking`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use finstream_core::{Clock, EntryId, SystemClock};
use finstream_events::{EventCodec, HandlerRegistry, NoopNotifier, RealtimeNotifier};
use finstream_observability::{ConsumerMetrics, Counter, NoopMetrics};

use crate::broker::{BrokerError, StartPosition, StreamBroker};
use crate::dead_letter::{DeadLetterError, DeadLetterSink};
use crate::idempotency::{DEFAULT_DEDUP_TTL, IdempotencyError, IdempotencyStore};

mod dispatch;
mod group;
mod lifecycle;
mod reclaim;
mod restart;

pub use group::consumer_name;
pub use lifecycle::{ConsumerController, LifecycleState};
pub use restart::RestartPolicy;

/// Most failure reasons remembered for dead-letter records.
const MAX_TRACKED_FAILURES: usize = 10_000;

/// Tunables of a consumer. Defaults match the production deployment.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerSettings {
    pub stream: String,
    pub group: String,
    /// Appended to the derived consumer name (`<group>-<pid>-<suffix>`).
    pub consumer_suffix: Option<String>,
    /// Start position used when the group is created.
    pub start: StartPosition,
    /// Entries requested per fetch.
    pub batch_size: usize,
    /// Longest wait for new entries per fetch.
    pub block: Duration,
    /// Reclaims a failing entry gets before it is dead-lettered.
    pub max_retries: u64,
    /// Minimum idle time before a pending entry is retried.
    pub retry_delay: Duration,
    /// Lifetime of the per-event processing lease.
    pub processing_lease: Duration,
    pub reclaim_interval: Duration,
    /// Pending records inspected per reclaim scan.
    pub reclaim_batch_size: usize,
    /// Dedup horizon for processed events.
    pub dedup_ttl: Duration,
    /// Pause after a failed fetch before trying again.
    pub error_pause: Duration,
    pub restart: RestartPolicy,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            stream: "finbot.events".to_string(),
            group: "finbot-consumers".to_string(),
            consumer_suffix: None,
            start: StartPosition::Beginning,
            batch_size: 10,
            block: Duration::from_millis(1000),
            max_retries: 3,
            retry_delay: Duration::from_secs(5 * 60),
            processing_lease: Duration::from_secs(5 * 60),
            reclaim_interval: Duration::from_secs(5),
            reclaim_batch_size: 100,
            dedup_ttl: DEFAULT_DEDUP_TTL,
            error_pause: Duration::from_millis(1000),
            restart: RestartPolicy::default(),
        }
    }
}

impl ConsumerSettings {
    pub fn new(stream: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            group: group.into(),
            ..Default::default()
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self.reclaim_batch_size = self.batch_size.saturating_mul(10);
        self
    }

    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u64) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    /// Also resets the processing lease, which follows the retry delay.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self.processing_lease = retry_delay;
        self
    }

    pub fn with_reclaim_interval(mut self, interval: Duration) -> Self {
        self.reclaim_interval = interval;
        self
    }

    pub fn with_dedup_ttl(mut self, ttl: Duration) -> Self {
        self.dedup_ttl = ttl;
        self
    }

    pub fn with_error_pause(mut self, pause: Duration) -> Self {
        self.error_pause = pause;
        self
    }

    pub fn with_start(mut self, start: StartPosition) -> Self {
        self.start = start;
        self
    }

    pub fn with_consumer_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.consumer_suffix = Some(suffix.into());
        self
    }

    pub fn with_restart_policy(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Idempotency(#[from] IdempotencyError),

    #[error(transparent)]
    DeadLetter(#[from] DeadLetterError),

    #[error("consumer misconfigured: {0}")]
    Misconfigured(String),

    #[error("consumer is stopping")]
    Stopping,

    #[error("failed to spawn consumer thread: {0}")]
    Spawn(String),
}

/// What happened to a single entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome {
    /// Handler succeeded; entry acknowledged.
    Processed,
    /// Event already handled; acknowledged without a handler.
    Duplicate,
    /// Another attempt at the same event holds its lease; entry left pending.
    InFlight,
    /// Entry could not be decoded; acknowledged and dropped.
    Dropped { reason: String },
    /// Handler failed; entry left pending for retry.
    Failed { reason: String },
    /// Entry moved to the dead-letter sink and acknowledged.
    DeadLettered { newly_written: bool },
    /// Payload trimmed from the stream; acknowledged.
    Gone,
    /// Another consumer owns the entry now.
    Skipped,
    /// Store/broker failure mid-entry; entry left pending.
    Errored { reason: String },
}

/// Result of one fetch iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub outcomes: Vec<(EntryId, EntryOutcome)>,
}

impl BatchReport {
    pub fn fetched(&self) -> usize {
        self.outcomes.len()
    }

    pub fn count(&self, pred: impl Fn(&EntryOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, o)| pred(o)).count()
    }
}

/// Result of one reclaim scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    /// Pending records inspected.
    pub scanned: usize,
    /// Records still within the retry delay.
    pub not_due: usize,
    pub outcomes: Vec<(EntryId, EntryOutcome)>,
}

impl ReclaimReport {
    pub fn count(&self, pred: impl Fn(&EntryOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, o)| pred(o)).count()
    }

    pub fn dead_lettered(&self) -> usize {
        self.count(|o| matches!(o, EntryOutcome::DeadLettered { .. }))
    }
}

/// Consumer for one stream/group pair.
pub struct StreamConsumer {
    settings: ConsumerSettings,
    consumer_name: String,
    broker: Arc<dyn StreamBroker>,
    idempotency: Arc<dyn IdempotencyStore>,
    dead_letters: Arc<dyn DeadLetterSink>,
    registry: Arc<HandlerRegistry>,
    codec: EventCodec,
    notifier: Arc<dyn RealtimeNotifier>,
    metrics: Arc<dyn ConsumerMetrics>,
    clock: Arc<dyn Clock>,
    failures: Mutex<HashMap<EntryId, String>>,
}

impl core::fmt::Debug for StreamConsumer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StreamConsumer")
            .field("consumer_name", &self.consumer_name)
            .field("settings", &self.settings)
            .field("registry", &self.registry)
            .finish()
    }
}

impl StreamConsumer {
    pub fn builder(settings: ConsumerSettings) -> StreamConsumerBuilder {
        StreamConsumerBuilder::new(settings)
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    fn count(&self, counter: Counter) {
        self.metrics.increment(counter);
    }

    fn remember_failure(&self, entry_id: EntryId, reason: &str) {
        if let Ok(mut failures) = self.failures.lock() {
            if failures.len() >= MAX_TRACKED_FAILURES {
                debug!(tracked = failures.len(), "dropping tracked failure reasons");
                failures.clear();
            }
            failures.insert(entry_id, reason.to_string());
        }
    }

    fn forget_failure(&self, entry_id: EntryId) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.remove(&entry_id);
        }
    }

    fn last_failure(&self, entry_id: EntryId) -> Option<String> {
        self.failures
            .lock()
            .ok()
            .and_then(|failures| failures.get(&entry_id).cloned())
    }
}

/// Assembles a [`StreamConsumer`].
///
/// Broker, idempotency store, dead-letter sink, codec and registry are
/// required; notifier, metrics and clock default to no-ops/system time.
pub struct StreamConsumerBuilder {
    settings: ConsumerSettings,
    consumer_name: Option<String>,
    broker: Option<Arc<dyn StreamBroker>>,
    idempotency: Option<Arc<dyn IdempotencyStore>>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    registry: Option<Arc<HandlerRegistry>>,
    codec: Option<EventCodec>,
    notifier: Arc<dyn RealtimeNotifier>,
    metrics: Arc<dyn ConsumerMetrics>,
    clock: Arc<dyn Clock>,
}

impl StreamConsumerBuilder {
    pub fn new(settings: ConsumerSettings) -> Self {
        Self {
            settings,
            consumer_name: None,
            broker: None,
            idempotency: None,
            dead_letters: None,
            registry: None,
            codec: None,
            notifier: Arc::new(NoopNotifier),
            metrics: Arc::new(NoopMetrics),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn broker(mut self, broker: Arc<dyn StreamBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn idempotency(mut self, store: Arc<dyn IdempotencyStore>) -> Self {
        self.idempotency = Some(store);
        self
    }

    pub fn dead_letters(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    pub fn registry(mut self, registry: Arc<HandlerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn codec(mut self, codec: EventCodec) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn RealtimeNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn ConsumerMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Override the derived consumer name (tests, multiple consumers in one
    /// process).
    pub fn consumer_name(mut self, name: impl Into<String>) -> Self {
        self.consumer_name = Some(name.into());
        self
    }

    pub fn build(self) -> Result<StreamConsumer, ConsumerError> {
        fn required<T>(value: Option<T>, what: &str) -> Result<T, ConsumerError> {
            value.ok_or_else(|| ConsumerError::Misconfigured(format!("{} is required", what)))
        }

        if self.settings.stream.trim().is_empty() || self.settings.group.trim().is_empty() {
            return Err(ConsumerError::Misconfigured(
                "stream and group must not be empty".to_string(),
            ));
        }

        let name = self.consumer_name.unwrap_or_else(|| {
            consumer_name(
                &self.settings.group,
                std::process::id(),
                self.settings.consumer_suffix.as_deref(),
            )
        });

        Ok(StreamConsumer {
            consumer_name: name,
            broker: required(self.broker, "broker")?,
            idempotency: required(self.idempotency, "idempotency store")?,
            dead_letters: required(self.dead_letters, "dead-letter sink")?,
            registry: required(self.registry, "handler registry")?,
            codec: required(self.codec, "event codec")?,
            notifier: self.notifier,
            metrics: self.metrics,
            clock: self.clock,
            settings: self.settings,
            failures: Mutex::new(HashMap::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryStreamBroker;
    use crate::dead_letter::InMemoryDeadLetterSink;
    use crate::idempotency::InMemoryIdempotencyStore;

    #[test]
    fn builder_requires_collaborators() {
        let err = StreamConsumer::builder(ConsumerSettings::default())
            .broker(Arc::new(InMemoryStreamBroker::new()))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConsumerError::Misconfigured(_)));
    }

    #[test]
    fn builder_derives_consumer_name_from_group_and_pid() {
        let consumer = StreamConsumer::builder(ConsumerSettings::default().with_consumer_suffix("a"))
            .broker(Arc::new(InMemoryStreamBroker::new()))
            .idempotency(Arc::new(InMemoryIdempotencyStore::new()))
            .dead_letters(Arc::new(InMemoryDeadLetterSink::new()))
            .registry(Arc::new(HandlerRegistry::new()))
            .codec(EventCodec::new("k"))
            .build()
            .unwrap();

        assert_eq!(
            consumer.consumer_name(),
            format!("finbot-consumers-{}-a", std::process::id())
        );
    }

    #[test]
    fn retry_delay_setter_moves_the_lease_too() {
        let settings = ConsumerSettings::default().with_retry_delay(Duration::from_secs(2));
        assert_eq!(settings.processing_lease, Duration::from_secs(2));
    }

    #[test]
    fn tracked_failures_are_bounded() {
        let consumer = StreamConsumer::builder(ConsumerSettings::default())
            .broker(Arc::new(InMemoryStreamBroker::new()))
            .idempotency(Arc::new(InMemoryIdempotencyStore::new()))
            .dead_letters(Arc::new(InMemoryDeadLetterSink::new()))
            .registry(Arc::new(HandlerRegistry::new()))
            .codec(EventCodec::new("k"))
            .build()
            .unwrap();

        for seq in 0..(MAX_TRACKED_FAILURES as u64 + 1) {
            consumer.remember_failure(EntryId::new(1, seq), "boom");
        }
        assert_eq!(consumer.failures.lock().unwrap().len(), 1);
        assert_eq!(
            consumer.last_failure(EntryId::new(1, MAX_TRACKED_FAILURES as u64)).as_deref(),
            Some("boom")
        );
    }
}
