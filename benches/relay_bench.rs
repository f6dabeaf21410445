//! Performance benchmarks for relay hot paths

use axum::extract::ws::Utf8Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fanout_relay::connection::{ConnectionRegistry, RegistryConfig};
use fanout_relay::relay::Dispatcher;

fn registry_benchmark(c: &mut Criterion) {
    let registry = ConnectionRegistry::new(RegistryConfig {
        max_connections: 0,
        outbound_queue: 16,
    });
    let mut receivers = Vec::new();
    for _ in 0..1000 {
        let (conn, rx) = registry.open("127.0.0.1:40000".parse().unwrap());
        conn.set_open();
        registry.register(conn);
        receivers.push(rx);
    }

    let mut group = c.benchmark_group("registry");

    group.bench_function("snapshot_1000", |b| {
        b.iter(|| black_box(registry.snapshot()))
    });

    group.bench_function("register_unregister", |b| {
        b.iter(|| {
            let (conn, rx) = registry.open("127.0.0.1:40001".parse().unwrap());
            registry.register(conn.clone());
            registry.unregister(conn.id);
            black_box(rx);
        })
    });

    group.finish();
}

fn dispatch_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");
    let message = Utf8Bytes::from_static("{\"type\":\"tick\",\"payload\":42}");

    for peers in [10usize, 100, 1000] {
        let registry = ConnectionRegistry::new(RegistryConfig {
            max_connections: 0,
            outbound_queue: 1 << 20,
        });
        let dispatcher = Dispatcher::new(registry.clone());
        let mut receivers = Vec::new();
        for _ in 0..peers {
            let (conn, rx) = registry.open("127.0.0.1:40000".parse().unwrap());
            conn.set_open();
            registry.register(conn);
            receivers.push(rx);
        }
        let sender = registry.snapshot()[0].id;

        group.throughput(Throughput::Elements(peers as u64 - 1));
        group.bench_with_input(BenchmarkId::from_parameter(peers), &peers, |b, _| {
            b.iter(|| {
                let report = dispatcher.dispatch(black_box(&message), sender);
                // Keep queues from filling so every iteration measures delivery
                for rx in receivers.iter_mut() {
                    while rx.try_recv().is_ok() {}
                }
                black_box(report)
            })
        });
    }

    group.finish();
}

fn metrics_benchmark(c: &mut Criterion) {
    use fanout_relay::metrics::METRICS;

    let mut group = c.benchmark_group("metrics");
    group.throughput(Throughput::Elements(1));

    group.bench_function("message_relayed", |b| {
        b.iter(|| {
            METRICS.message_relayed(black_box(100), black_box(64));
        })
    });

    group.bench_function("snapshot", |b| {
        b.iter(|| {
            let snapshot = METRICS.snapshot();
            black_box(snapshot);
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    registry_benchmark,
    dispatch_benchmark,
    metrics_benchmark,
);
criterion_main!(benches);
