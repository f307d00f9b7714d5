//! Infrastructure layer: the stream broker, idempotency and dead-letter
//! storage, configuration, and the consumer that ties them together.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod dead_letter;
pub mod idempotency;


pub use broker::{
    BrokerError, Claim, GroupCreation, InMemoryStreamBroker, PendingRecord, StartPosition,
    StreamBroker,
};
pub use config::{ConfigError, ConsumerConfig};
pub use consumer::{
    BatchReport, ConsumerController, ConsumerError, ConsumerSettings, EntryOutcome,
    LifecycleState, ReclaimReport, RestartPolicy, StreamConsumer, StreamConsumerBuilder,
};
pub use dead_letter::{DeadLetterError, DeadLetterRecord, DeadLetterSink, InMemoryDeadLetterSink};
pub use idempotency::{
    ClaimOutcome, IdempotencyError, IdempotencyStore, InMemoryIdempotencyStore, dedup_key,
};

#[cfg(feature = "redis")]
pub use broker::RedisStreamBroker;
#[cfg(feature = "redis")]
pub use dead_letter::RedisDeadLetterSink;
#[cfg(feature = "redis")]
pub use idempotency::RedisIdempotencyStore;
