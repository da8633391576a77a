//! Benchmarks for store round trips

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use store_client::TcpStore;
use store_core::StoreOptions;

fn start_store_for_bench(rt: &tokio::runtime::Runtime) -> (Arc<TcpStore>, u16) {
    rt.block_on(async {
        let port = portpicker::pick_unused_port().expect("No ports free");
        let store = TcpStore::new("127.0.0.1", StoreOptions::server(port))
            .await
            .unwrap();
        (Arc::new(store), port)
    })
}

fn bench_set_get(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let (store, _port) = start_store_for_bench(&rt);

    let mut group = c.benchmark_group("set_get");
    group.throughput(Throughput::Elements(1));

    for size in [16usize, 1024, 64 * 1024] {
        let value = vec![7u8; size];
        group.bench_with_input(BenchmarkId::new("set_then_get", size), &value, |b, value| {
            b.to_async(&rt).iter(|| {
                let store = store.clone();
                let value = value.clone();
                async move {
                    store.set("bench", value).await.unwrap();
                    store.get("bench").await.unwrap();
                }
            });
        });
    }

    group.finish();
}

fn bench_add(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let (store, port) = start_store_for_bench(&rt);

    let mut group = c.benchmark_group("add");
    group.throughput(Throughput::Elements(1));

    group.bench_function("single_client", |b| {
        b.to_async(&rt).iter(|| {
            let store = store.clone();
            async move {
                store.add("counter", 1).await.unwrap();
            }
        });
    });

    let clients: Vec<Arc<TcpStore>> = rt.block_on(async {
        let mut clients = Vec::new();
        for _ in 0..4 {
            let store = TcpStore::new("127.0.0.1", StoreOptions::client(port))
                .await
                .unwrap();
            clients.push(Arc::new(store));
        }
        clients
    });

    group.throughput(Throughput::Elements(clients.len() as u64));
    group.bench_function("concurrent_clients", |b| {
        b.to_async(&rt).iter(|| {
            let clients = clients.clone();
            async move {
                let handles: Vec<_> = clients
                    .into_iter()
                    .map(|store| tokio::spawn(async move { store.add("shared", 1).await }))
                    .collect();
                for handle in handles {
                    handle.await.unwrap().unwrap();
                }
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_set_get, bench_add);
criterion_main!(benches);
