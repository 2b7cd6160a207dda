//! Scheduling-overhead micro-benchmarks: an (almost) empty loop body makes the
//! runtime's own dispatch cost the thing being measured.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

fn bench_parallel_for(c: &mut Criterion) {
    parfor::init_parallel(parfor::num_threads());

    let mut group = c.benchmark_group("parallel_for");
    for size in [1usize << 10, 1 << 14, 1 << 18] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("noop", size), &size, |b, &size| {
            b.iter(|| {
                parfor::parallel_for(0, size, |i| {
                    black_box(i);
                });
            });
        });
    }
    group.finish();
}

fn bench_reduce(c: &mut Criterion) {
    use std::sync::atomic::{AtomicU64, Ordering};

    parfor::init_parallel(parfor::num_threads());

    let size = 1usize << 16;
    c.bench_function("reduce_sum", |b| {
        b.iter(|| {
            let sum = AtomicU64::new(0);
            parfor::parallel_for(0, size, |i| {
                sum.fetch_add(i as u64, Ordering::Relaxed);
            });
            black_box(sum.into_inner())
        });
    });
}

criterion_group!(benches, bench_parallel_for, bench_reduce);
criterion_main!(benches);
