//! Throughput benchmarks for both map variants.
//!
//! Mirrors the benchmark structure used elsewhere in this codebase:
//! per-size `BenchmarkId` groups for single-threaded operations, plus a
//! dedicated multi-threaded mixed-operation benchmark.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use logitree_map::{AvlMap, BstMap};
use std::sync::Arc;
use std::thread;

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");

    for size in [100, 1_000, 10_000].iter() {
        group.bench_with_input(BenchmarkId::new("bst", size), size, |b, &size| {
            b.iter(|| {
                let map: BstMap<i32> = BstMap::new();
                for i in 0..size {
                    map.insert(i, i).unwrap();
                }
            });
        });

        group.bench_with_input(BenchmarkId::new("avl", size), size, |b, &size| {
            b.iter(|| {
                let map: AvlMap<i32> = AvlMap::new();
                for i in 0..size {
                    map.insert(i, i).unwrap();
                }
            });
        });
    }

    group.finish();
}

fn bench_lookup_existing(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup_existing");

    for size in [100, 1_000, 10_000].iter() {
        let bst: BstMap<i32> = BstMap::new();
        let avl: AvlMap<i32> = AvlMap::new();
        for i in 0..*size {
            bst.insert(i, i).unwrap();
            avl.insert(i, i).unwrap();
        }

        group.bench_with_input(BenchmarkId::new("bst", size), size, |b, &size| {
            let key = size / 2;
            b.iter(|| black_box(bst.lookup(key).unwrap()));
        });

        group.bench_with_input(BenchmarkId::new("avl", size), size, |b, &size| {
            let key = size / 2;
            b.iter(|| black_box(avl.lookup(key).unwrap()));
        });
    }

    group.finish();
}

fn bench_mixed_concurrent(c: &mut Criterion) {
    c.bench_function("avl_mixed_8_threads", |b| {
        b.iter(|| {
            let map: Arc<AvlMap<i32>> = Arc::new(AvlMap::new());
            let mut handles = Vec::new();
            for t in 0..8 {
                let map = Arc::clone(&map);
                handles.push(thread::spawn(move || {
                    for i in 0..200 {
                        let key = ((t * 200 + i) % 1_000) + 1;
                        if i % 2 == 0 {
                            let _ = map.insert(key, key);
                        } else {
                            let _ = map.lookup(key);
                        }
                    }
                }));
            }
            for h in handles {
                h.join().unwrap();
            }
        });
    });
}

criterion_group!(
    benches,
    bench_insert,
    bench_lookup_existing,
    bench_mixed_concurrent
);
criterion_main!(benches);
