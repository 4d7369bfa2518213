//! Benchmarks for range partitioning and inline dispatch.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use rangepool::partition::{partitions, slice_args};
use rangepool::{JobSpec, Pool, PoolConfig, builtin};
use serde_json::{Value, json};
use std::sync::Arc;

fn bench_partitions(c: &mut Criterion) {
    let mut group = c.benchmark_group("partitions");

    for parts in [4, 64, 1024].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(parts), parts, |b, &parts| {
            b.iter(|| black_box(partitions(black_box(1_000_003), parts)));
        });
    }

    group.finish();
}

fn bench_slice_args(c: &mut Criterion) {
    let mut group = c.benchmark_group("slice_args");

    for len in [1_000, 100_000].iter() {
        let args = vec![
            Value::Array((0..*len).map(|i| json!(i)).collect()),
            json!({"mode": "fast"}),
        ];
        group.bench_with_input(BenchmarkId::from_parameter(len), &args, |b, args| {
            b.iter(|| {
                for index in 0..8 {
                    black_box(slice_args(args, &[0], index, 8));
                }
            });
        });
    }

    group.finish();
}

fn bench_local_dispatch(c: &mut Criterion) {
    let pool = Pool::new(PoolConfig::with_workers(1), Arc::new(builtin::registry()))
        .expect("Failed to start local pool");

    c.bench_function("local_sum_squares_10k", |b| {
        b.iter(|| {
            let results = pool
                .run(JobSpec::new("sum_squares", black_box(10_000)))
                .expect("job failed");
            black_box(results)
        });
    });
}

criterion_group!(benches, bench_partitions, bench_slice_args, bench_local_dispatch);
criterion_main!(benches);
