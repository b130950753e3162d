//! Performance benchmarks for subscriptions and the wire codec.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;
use topicstream::{
    wire, AckStatus, Connection, ConnectionConfig, Envelope, Frame, MemoryBroker, StreamId,
    SubscriptionOptions,
};

fn connect(broker: &MemoryBroker) -> Connection {
    let config = ConnectionConfig::default();
    let transport = broker.connect(config.max_frame_bytes).unwrap();
    Connection::with_transport(Arc::new(transport), config).unwrap()
}

/// Benchmark pull receive + ack round trips with varying payload sizes
fn bench_pull_receive_ack(c: &mut Criterion) {
    let mut group = c.benchmark_group("pull_receive_ack");

    for payload_size in [64, 1024, 16 * 1024] {
        group.throughput(Throughput::Bytes(payload_size as u64));
        group.bench_with_input(
            BenchmarkId::new("payload_bytes", payload_size),
            &payload_size,
            |b, &size| {
                let broker = MemoryBroker::new();
                let conn = connect(&broker);
                let sub = conn
                    .subscribe(SubscriptionOptions::new("messages", "bench"))
                    .unwrap();
                let payload = vec![0u8; size];
                let mut seq = 0u64;

                b.iter(|| {
                    seq += 1;
                    broker.publish(Envelope::new(
                        "messages",
                        "bench",
                        seq.to_string(),
                        payload.clone(),
                    ));
                    let msg = sub.receive().unwrap();
                    msg.acknowledge(AckStatus::Success).unwrap();
                    black_box(msg);
                });

                sub.close().unwrap();
            },
        );
    }

    group.finish();
}

/// Benchmark push delivery throughput
fn bench_push_delivery(c: &mut Criterion) {
    let mut group = c.benchmark_group("push_delivery");
    group.measurement_time(Duration::from_secs(5));

    group.bench_function("handler_ack", |b| {
        let broker = MemoryBroker::new();
        let conn = connect(&broker);
        let (tx, rx) = crossbeam_channel::unbounded();
        let push = conn
            .subscribe_with_handler(
                SubscriptionOptions::new("messages", "bench"),
                move |_: &Envelope| {
                    let _ = tx.send(());
                    AckStatus::Success
                },
            )
            .unwrap();
        let mut seq = 0u64;

        b.iter(|| {
            seq += 1;
            broker.publish(Envelope::new("messages", "bench", seq.to_string(), b"x".to_vec()));
            rx.recv().unwrap();
        });

        push.stop().unwrap();
    });

    group.finish();
}

/// Benchmark frame encoding with checksums
fn bench_frame_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_codec");

    let frame = Frame::Deliver {
        stream: StreamId(1),
        envelope: Envelope::new("messages", "bench", "e1", vec![7u8; 1024])
            .with_metadata("traceparent", "00-abc-def-01"),
    };

    group.bench_function("write_read", |b| {
        let mut buf = Vec::with_capacity(2048);
        b.iter(|| {
            buf.clear();
            wire::write_frame(&mut buf, &frame, usize::MAX).unwrap();
            let decoded = wire::read_frame(&mut buf.as_slice(), usize::MAX).unwrap();
            black_box(decoded);
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_pull_receive_ack,
    bench_push_delivery,
    bench_frame_codec
);
criterion_main!(benches);
