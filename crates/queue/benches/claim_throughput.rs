//! Claim throughput benchmark
//!
//! Benchmarks the critical path: begin → claim → mark → commit
//! against the in-memory store, for a single connection and for a full pool.

use std::sync::Arc;
use std::time::{Duration, Instant};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;

use pgq_queue::persistence::{InMemoryQueueStore, QueueStore};
use pgq_queue::worker::{PoolConfig, WorkerPool};

/// Benchmark single-connection claim/commit cycles (baseline)
fn bench_cycle_single(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("claim_throughput/single");

    for batch_size in [1, 100, 1000] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(
            BenchmarkId::new("batch", batch_size),
            &batch_size,
            |b, &batch_size| {
                b.to_async(&rt).iter_custom(|iters| async move {
                    let store = InMemoryQueueStore::new();
                    store.enqueue_many(iters as usize * batch_size);
                    let mut conn = store.acquire().await.unwrap();

                    let start = Instant::now();
                    for _ in 0..iters {
                        let mut tx = conn.begin().await.unwrap();
                        let batch = tx.claim_batch(batch_size).await.unwrap();
                        let ids: Vec<i64> = batch.iter().map(|item| item.id).collect();
                        tx.mark_processed(&ids).await.unwrap();
                        tx.commit().await.unwrap();
                    }
                    start.elapsed()
                });
            },
        );
    }

    group.finish();
}

/// Benchmark a full pool draining a fixed backlog (contention)
fn bench_pool_drain(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("claim_throughput/pool");
    group.sample_size(20);

    let backlog = 10_000usize;
    group.throughput(Throughput::Elements(backlog as u64));

    for workers in [1, 4, 10] {
        group.bench_with_input(
            BenchmarkId::new("workers", workers),
            &workers,
            |b, &workers| {
                b.to_async(&rt).iter(|| async move {
                    let store = InMemoryQueueStore::new();
                    store.enqueue_many(backlog);

                    let config = PoolConfig::new(workers, 1000)
                        .with_grace_period(Duration::ZERO)
                        .with_error_backoff(Duration::ZERO);
                    let pool = WorkerPool::new(Arc::new(store), config);

                    pool.run().await.unwrap();
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_cycle_single, bench_pool_drain);

criterion_main!(benches);
