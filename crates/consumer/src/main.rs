use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use finstream_events::{ChannelNotifier, EventCodec};
use finstream_infra::{
    ConsumerConfig, ConsumerController, RedisDeadLetterSink, RedisIdempotencyStore,
    RedisStreamBroker, StreamConsumer,
};
use finstream_observability::RecorderMetrics;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    finstream_observability::init();

    let config = ConsumerConfig::from_env().context("invalid consumer configuration")?;
    let secret = config.require_secret()?.to_string();
    let settings = config.settings.clone();

    let broker = RedisStreamBroker::new(&config.redis_url).context("failed to open stream broker")?;
    let idempotency =
        RedisIdempotencyStore::new(&config.redis_url).context("failed to open idempotency store")?;
    let dead_letters = RedisDeadLetterSink::new(&config.redis_url, &config.dlq_key)
        .context("failed to open dead-letter sink")?;

    let notifier = Arc::new(ChannelNotifier::new());
    let realtime = notifier.subscribe();
    tokio::task::spawn_blocking(move || {
        // Stand-in for the fan-out gateway: ends when the notifier is dropped.
        while let Ok(event) = realtime.recv() {
            tracing::debug!(
                event_id = %event.id(),
                event_type = %event.event_type(),
                "real-time notification"
            );
        }
    });

    let consumer = StreamConsumer::builder(settings.clone())
        .broker(Arc::new(broker))
        .idempotency(Arc::new(idempotency))
        .dead_letters(Arc::new(dead_letters))
        .registry(Arc::new(finstream_consumer::handlers::registry()))
        .codec(EventCodec::new(secret))
        .notifier(notifier)
        .metrics(Arc::new(RecorderMetrics::new(&settings.stream, &settings.group)))
        .build()?;

    tracing::info!(
        stream = %settings.stream,
        group = %settings.group,
        dlq_key = %config.dlq_key,
        consumer = %consumer.consumer_name(),
        "starting event bus consumer"
    );

    let controller = Arc::new(ConsumerController::new(Arc::new(consumer)));
    {
        let controller = Arc::clone(&controller);
        tokio::task::spawn_blocking(move || controller.start()).await??;
    }

    let mut health = tokio::time::interval(Duration::from_secs(1));
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            tracing::info!("shutdown requested");
        }
        _ = async {
            loop {
                health.tick().await;
                if !controller.is_running() {
                    break;
                }
            }
        } => {
            tracing::error!("consumer loops stopped on their own; exiting");
        }
    }

    tokio::task::spawn_blocking(move || controller.stop()).await?;
    Ok(())
}
