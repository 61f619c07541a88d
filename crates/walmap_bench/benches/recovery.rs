//! Cold-path benchmarks: log replay on open and compaction.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use walmap_bench::{bench_map, session};
use walmap_core::{PersistMap, Store};

/// Benchmark replaying a log of N records into a pre-registered map.
fn bench_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("replay");
    group.sample_size(20);

    for records in [1_000usize, 10_000, 50_000] {
        group.throughput(Throughput::Elements(records as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(records),
            &records,
            |b, &records| {
                let (bench, map) = bench_map(records);
                map.store().close().unwrap();
                let path = bench.path.clone();

                b.iter(|| {
                    let store = Store::new();
                    let map: PersistMap<walmap_bench::Session> =
                        PersistMap::new(&store, "sessions").unwrap();
                    store.open(&path).unwrap();
                    black_box(map.len());
                    store.close().unwrap();
                });
            },
        );
    }

    group.finish();
}

/// Benchmark shrinking a log where most records are superseded.
fn bench_shrink(c: &mut Criterion) {
    let mut group = c.benchmark_group("shrink");
    group.sample_size(10);

    for live_keys in [100usize, 1_000] {
        group.throughput(Throughput::Elements(live_keys as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(live_keys),
            &live_keys,
            |b, &live_keys| {
                b.iter_batched(
                    || {
                        let (bench, map) = bench_map(0);
                        // Ten generations per key: 90% of records are garbage.
                        for generation in 0..10usize {
                            for i in 0..live_keys {
                                map.set(&format!("key-{i}"), session(generation));
                            }
                        }
                        (bench, map)
                    },
                    |(bench, map)| {
                        bench.store.shrink().unwrap();
                        black_box(map.len());
                        // Returned so the directory teardown is not timed.
                        (bench, map)
                    },
                    criterion::BatchSize::PerIteration,
                );
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_replay, bench_shrink);
criterion_main!(benches);
