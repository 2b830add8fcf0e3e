//! Worker pool throughput benchmark
//!
//! Benchmarks the critical path: submit → dispatch → execute → outcome,
//! across worker counts.

use std::time::Instant;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use tokio::runtime::Runtime;

use bulwark_core::{CancelContext, CoreConfig, JobError, TaskCore};

/// Jobs that finish immediately: measures dispatch overhead
fn bench_dispatch(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("worker_pool/dispatch");
    group.throughput(Throughput::Elements(1));

    for worker_count in [1, 4, 16, 64] {
        group.bench_with_input(
            BenchmarkId::new("workers", worker_count),
            &worker_count,
            |b, &worker_count| {
                b.to_async(&rt).iter_custom(|iters| async move {
                    let core = TaskCore::new(
                        CoreConfig::new()
                            .with_worker_count(worker_count)
                            .with_queue_capacity(iters.max(1) as usize)
                            .with_rate_limit(f64::MAX / 2.0, 1.0),
                    )
                    .unwrap();
                    core.register_handler(|job, _ctx| async move { Ok::<_, JobError>(job.payload) });
                    core.start().unwrap();

                    let ctx = CancelContext::new();
                    let start = Instant::now();
                    let tickets: Vec<_> = (0..iters)
                        .map(|i| core.submit(json!(i), &ctx).unwrap())
                        .collect();
                    for ticket in tickets {
                        ticket.wait().await.unwrap();
                    }
                    let elapsed = start.elapsed();

                    core.shutdown(&ctx).await.unwrap();
                    elapsed
                });
            },
        );
    }

    group.finish();
}

/// Jobs that yield once per step, like handlers doing I/O
fn bench_cooperative_jobs(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("worker_pool/cooperative");
    group.throughput(Throughput::Elements(1));

    for worker_count in [4, 16] {
        group.bench_with_input(
            BenchmarkId::new("workers", worker_count),
            &worker_count,
            |b, &worker_count| {
                b.to_async(&rt).iter_custom(|iters| async move {
                    let core = TaskCore::new(
                        CoreConfig::new()
                            .with_worker_count(worker_count)
                            .with_queue_capacity(iters.max(1) as usize)
                            .with_rate_limit(f64::MAX / 2.0, 1.0),
                    )
                    .unwrap();
                    core.register_handler(|_job, _ctx| async move {
                        for _ in 0..8 {
                            tokio::task::yield_now().await;
                        }
                        Ok::<_, JobError>(json!(null))
                    });
                    core.start().unwrap();

                    let ctx = CancelContext::new();
                    let start = Instant::now();
                    let tickets: Vec<_> = (0..iters)
                        .map(|_| core.submit(json!({}), &ctx).unwrap())
                        .collect();
                    for ticket in tickets {
                        ticket.wait().await.unwrap();
                    }
                    let elapsed = start.elapsed();

                    core.shutdown(&ctx).await.unwrap();
                    elapsed
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_dispatch, bench_cooperative_jobs);

criterion_main!(benches);
