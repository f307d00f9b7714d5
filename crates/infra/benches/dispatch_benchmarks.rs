use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use finstream_core::EntryId;
use finstream_events::{EventCodec, EventDraft, HandlerRegistry, LogEntry};
use finstream_infra::{
    ConsumerSettings, InMemoryDeadLetterSink, InMemoryIdempotencyStore, InMemoryStreamBroker,
    StreamBroker, StreamConsumer,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const SECRET: &str = "bench-secret";
const STREAM: &str = "finbot.events";
const GROUP: &str = "bench";

fn sealed_payload(codec: &EventCodec, n: usize) -> String {
    let event = codec
        .seal(EventDraft::new(
            "finbot.transaction.created",
            "finbot",
            json!({"userId": format!("u-{}", n), "amount": 12.5, "currency": "USD"}),
        ))
        .unwrap();
    codec.encode(&event).unwrap()
}

/// Consumer over fresh in-memory parts with `count` entries queued.
fn setup_consumer(count: usize, batch_size: usize) -> (Arc<InMemoryStreamBroker>, StreamConsumer) {
    let codec = EventCodec::new(SECRET);
    let broker = Arc::new(InMemoryStreamBroker::new());
    let mut registry = HandlerRegistry::new();
    registry.register("finbot.*", |event| {
        black_box(event.data().len());
        Ok(())
    });

    let settings = ConsumerSettings::new(STREAM, GROUP)
        .with_batch_size(batch_size)
        .with_block(Duration::ZERO);
    let consumer = StreamConsumer::builder(settings)
        .consumer_name("bench-1")
        .broker(broker.clone())
        .idempotency(Arc::new(InMemoryIdempotencyStore::new()))
        .dead_letters(Arc::new(InMemoryDeadLetterSink::new()))
        .registry(Arc::new(registry))
        .codec(codec.clone())
        .build()
        .unwrap();
    consumer.ensure_group().unwrap();

    for n in 0..count {
        let entry = LogEntry::with_event_payload(EntryId::ZERO, sealed_payload(&codec, n));
        broker.append(STREAM, entry.fields()).unwrap();
    }
    (broker, consumer)
}

fn bench_decode_and_verify(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_and_verify");
    group.throughput(Throughput::Elements(1));

    let codec = EventCodec::new(SECRET);
    let payload = sealed_payload(&codec, 0);

    group.bench_function("valid_signature", |b| {
        b.iter(|| black_box(codec.decode_str(black_box(&payload)).unwrap()))
    });

    let forged = sealed_payload(&EventCodec::new("other-secret"), 0);
    group.bench_function("rejected_signature", |b| {
        b.iter(|| black_box(codec.decode_str(black_box(&forged)).is_err()))
    });

    group.finish();
}

fn bench_batch_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_dispatch");

    for batch in [10usize, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), batch, |b, &batch| {
            b.iter_batched(
                || setup_consumer(batch, batch),
                |(_broker, consumer)| {
                    let report = consumer.poll_once().unwrap();
                    assert_eq!(report.fetched(), batch);
                },
                BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

fn bench_duplicate_short_circuit(c: &mut Criterion) {
    let mut group = c.benchmark_group("duplicate_short_circuit");
    group.throughput(Throughput::Elements(100));

    group.bench_function("same_event_100_times", |b| {
        b.iter_batched(
            || {
                let (broker, consumer) = setup_consumer(0, 100);
                let payload = sealed_payload(&EventCodec::new(SECRET), 0);
                for _ in 0..100 {
                    let entry = LogEntry::with_event_payload(EntryId::ZERO, payload.clone());
                    broker.append(STREAM, entry.fields()).unwrap();
                }
                (broker, consumer)
            },
            |(_broker, consumer)| black_box(consumer.poll_once().unwrap()),
            BatchSize::LargeInput,
        );
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_decode_and_verify,
    bench_batch_dispatch,
    bench_duplicate_short_circuit
);
criterion_main!(benches);
