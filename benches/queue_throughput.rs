//! Benchmarks comparing queue modes

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use dispatchkit::prelude::*;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

fn drain(queue: &TaskQueue, n: usize) -> u64 {
    let sum = Arc::new(AtomicU64::new(0));
    let group = CompletionGroup::new();

    for i in 0..n {
        let sum = sum.clone();
        queue.submit_in_group(
            move || {
                sum.fetch_add(black_box(i as u64), Ordering::Relaxed);
            },
            &group,
        );
    }

    group.wait();
    sum.load(Ordering::Relaxed)
}

fn bench_submit(c: &mut Criterion) {
    let rt = Runtime::new(Config::default()).expect("Failed to start runtime");
    let serial = rt.serial_queue();
    let concurrent = rt.concurrent_queue();

    let mut group = c.benchmark_group("submit");

    for size in [100, 1_000, 10_000].iter() {
        group.bench_with_input(BenchmarkId::new("serial", size), size, |b, &size| {
            b.iter(|| drain(&serial, size))
        });

        group.bench_with_input(BenchmarkId::new("concurrent", size), size, |b, &size| {
            b.iter(|| drain(&concurrent, size))
        });
    }

    group.finish();
}

fn bench_iter(c: &mut Criterion) {
    let rt = Runtime::new(Config::default()).expect("Failed to start runtime");
    let queue = rt.concurrent_queue();

    let mut group = c.benchmark_group("submit_and_wait_iter");

    for size in [100, 10_000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let sum = AtomicU64::new(0);
            b.iter(|| {
                queue.submit_and_wait_iter(size, |i| {
                    sum.fetch_add(black_box(i as u64), Ordering::Relaxed);
                })
            })
        });
    }

    group.finish();
}

fn bench_barrier(c: &mut Criterion) {
    let rt = Runtime::new(Config::default()).expect("Failed to start runtime");
    let queue = rt.concurrent_queue();

    c.bench_function("barrier_round_trip", |b| {
        b.iter(|| {
            for _ in 0..64 {
                queue.submit(|| {
                    black_box(0u64);
                });
            }
            queue.submit_barrier_and_wait(|| {});
        })
    });
}

criterion_group!(benches, bench_submit, bench_iter, bench_barrier);
criterion_main!(benches);
