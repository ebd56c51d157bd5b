//! Benchmark for the deferred cell and its combinators.
//!
//! Measures subscription and delivery overhead, derived chains and zips.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use deferral::{Deferred, SubscribeMode, zip, zip_all};
use std::hint::black_box;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

// =============================================================================
// Single Instance
// =============================================================================

fn benchmark_ready_subscribe(criterion: &mut Criterion) {
    criterion.bench_function("ready_subscribe", |bencher| {
        bencher.iter(|| {
            let deferred = Deferred::ready(black_box(42_u64));
            deferred.subscribe(SubscribeMode::WEAK, |value| {
                black_box(value);
            });
        });
    });
}

fn benchmark_repeatable_delivery(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("repeatable_delivery");

    for deliveries in [10, 100, 1000] {
        group.bench_with_input(
            BenchmarkId::new("deliveries", deliveries),
            &deliveries,
            |bencher, &deliveries| {
                bencher.iter(|| {
                    let total = Arc::new(AtomicU64::new(0));
                    let sink = Arc::clone(&total);
                    let deferred = Deferred::manual();
                    deferred.subscribe(SubscribeMode::REPEATABLE_WEAK, move |value: u64| {
                        sink.fetch_add(value, Ordering::Relaxed);
                    });
                    for value in 0..deliveries {
                        deferred.complete(value);
                    }
                    black_box(total.load(Ordering::Relaxed))
                });
            },
        );
    }

    group.finish();
}

fn benchmark_contended_delivery(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("contended_delivery");
    group.sample_size(20);

    for threads in [2, 4, 8] {
        group.bench_with_input(BenchmarkId::new("threads", threads), &threads, |bencher, &threads| {
            bencher.iter(|| {
                let deferred = Deferred::manual();
                deferred.subscribe(SubscribeMode::REPEATABLE_WEAK, |value: u64| {
                    black_box(value);
                });
                let handles: Vec<_> = (0..threads)
                    .map(|_| {
                        let completer = deferred.completer();
                        thread::spawn(move || {
                            for value in 0..100 {
                                completer.complete(value);
                            }
                        })
                    })
                    .collect();
                for handle in handles {
                    handle.join().unwrap();
                }
            });
        });
    }

    group.finish();
}

// =============================================================================
// Combinators
// =============================================================================

fn benchmark_map_chain(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("map_chain");

    for chain_length in [1, 5, 20] {
        group.bench_with_input(
            BenchmarkId::new("chain_length", chain_length),
            &chain_length,
            |bencher, &length| {
                bencher.iter(|| {
                    let source = Deferred::<u64>::manual();
                    let mut chained = source.clone();
                    for _ in 0..length {
                        chained = chained.map(|value| value.wrapping_mul(3));
                    }
                    chained.subscribe(SubscribeMode::WEAK, |value| {
                        black_box(value);
                    });
                    source.complete(1);
                });
            },
        );
    }

    group.finish();
}

fn benchmark_zip(criterion: &mut Criterion) {
    criterion.bench_function("zip_pair", |bencher| {
        bencher.iter(|| {
            let left = Deferred::<u32>::manual();
            let right = Deferred::<u32>::manual();
            zip(&left, &right).subscribe(SubscribeMode::RETAINED, |pair| {
                black_box(pair);
            });
            right.complete(2);
            left.complete(1);
        });
    });

    let mut group = criterion.benchmark_group("zip_all");
    for width in [4, 64, 512] {
        group.bench_with_input(BenchmarkId::new("width", width), &width, |bencher, &width| {
            bencher.iter(|| {
                let inputs: Vec<Deferred<usize>> = (0..width).map(|_| Deferred::manual()).collect();
                zip_all(inputs.clone()).subscribe(SubscribeMode::RETAINED, |row| {
                    black_box(row.len());
                });
                for (index, input) in inputs.iter().enumerate().rev() {
                    input.complete(index);
                }
            });
        });
    }
    group.finish();
}

fn benchmark_and_then(criterion: &mut Criterion) {
    criterion.bench_function("and_then_ready", |bencher| {
        bencher.iter(|| {
            let sequenced = Deferred::ready(black_box(7_u32)).and_then(|id| Deferred::ready(id + 1));
            sequenced.subscribe(SubscribeMode::WEAK, |pair| {
                black_box(pair);
            });
        });
    });
}

criterion_group!(
    benches,
    benchmark_ready_subscribe,
    benchmark_repeatable_delivery,
    benchmark_contended_delivery,
    benchmark_map_chain,
    benchmark_zip,
    benchmark_and_then
);

criterion_main!(benches);
