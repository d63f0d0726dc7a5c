use std::sync::Arc;

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use mockwire::recording::MessageType;
use mockwire::session::{ChannelTransport, ConnectionInfo, ConnectionManager, TransportEvent};
use tokio::sync::mpsc::UnboundedReceiver;

fn populated(size: usize) -> (ConnectionManager, Vec<UnboundedReceiver<TransportEvent>>) {
    let manager = ConnectionManager::default();
    let mut receivers = Vec::with_capacity(size);

    for i in 0..size {
        let (transport, rx) = ChannelTransport::new();
        let conn = manager.open(ConnectionInfo::new("/ws"), Arc::new(transport));
        conn.join_group(&format!("group-{}", i % 10)).unwrap();
        conn.join_group("everyone").unwrap();
        receivers.push(rx);
    }

    (manager, receivers)
}

fn bench_manager_reads(c: &mut Criterion) {
    let mut group = c.benchmark_group("manager_reads");

    for size in [100, 1_000, 10_000] {
        let (manager, _receivers) = populated(size);

        group.bench_with_input(BenchmarkId::new("list_by_group", size), &size, |b, _| {
            b.iter(|| manager.list_by_group(black_box("group-3")));
        });
        group.bench_with_input(BenchmarkId::new("stats", size), &size, |b, _| {
            b.iter(|| manager.stats());
        });
    }

    group.finish();
}

fn bench_group_broadcast(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("group_broadcast");

    for size in [100, 1_000] {
        let (manager, mut receivers) = populated(size);
        let payload = Bytes::from_static(b"{\"type\":\"tick\",\"seq\":1}");

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                let sent = rt.block_on(manager.broadcast_to_group_raw(
                    "everyone",
                    MessageType::Text,
                    payload.clone(),
                ));
                for rx in &mut receivers {
                    while rx.try_recv().is_ok() {}
                }
                black_box(sent)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_manager_reads, bench_group_broadcast);
criterion_main!(benches);
