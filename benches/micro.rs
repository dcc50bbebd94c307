//! Micro-benchmarks for RemusDB core operations.
//!
//! Uses Criterion for statistically rigorous measurement with regression
//! detection and HTML reports.
//!
//! # Running
//!
//! ```bash
//! cargo bench --bench micro              # run all micro-benchmarks
//! cargo bench --bench micro -- put       # filter by name
//! ```
//!
//! Reports are generated in `target/criterion/report/index.html`.

use criterion::{BatchSize, Criterion, Throughput, black_box, criterion_group, criterion_main};

use remusdb::engine::{Engine, EngineConfig};
use tempfile::TempDir;

/// Default value payload (128 bytes).
const VALUE_128B: &[u8; 128] = &[0xAB; 128];

fn make_key(i: u64) -> Vec<u8> {
    format!("key-{i:012}").into_bytes()
}

/// Open a database whose memtable comfortably holds the working set, so
/// measurements exclude background compaction.
fn open_memtable_only(dir: &std::path::Path) -> Engine {
    Engine::open(
        dir,
        EngineConfig {
            mt_size_mb: 256,
            wal_size_mb: 512,
            nr_workers: 1,
            ..EngineConfig::default()
        },
    )
    .expect("open")
}

fn bench_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("put");
    group.throughput(Throughput::Elements(1));

    group.bench_function("put_128b", |b| {
        let dir = TempDir::new().unwrap();
        let engine = open_memtable_only(dir.path());
        let mut h = engine.handle().unwrap();
        let mut i = 0u64;
        b.iter(|| {
            assert!(h.put(&make_key(i), VALUE_128B));
            i += 1;
        });
        drop(h);
        engine.close().unwrap();
    });

    group.bench_function("overwrite_128b", |b| {
        let dir = TempDir::new().unwrap();
        let engine = open_memtable_only(dir.path());
        let mut h = engine.handle().unwrap();
        let mut i = 0u64;
        b.iter(|| {
            assert!(h.put(&make_key(i % 1024), VALUE_128B));
            i += 1;
        });
        drop(h);
        engine.close().unwrap();
    });

    group.finish();
}

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("get");
    group.throughput(Throughput::Elements(1));

    group.bench_function("get_memtable_hit", |b| {
        let dir = TempDir::new().unwrap();
        let engine = open_memtable_only(dir.path());
        let mut h = engine.handle().unwrap();
        for i in 0..100_000u64 {
            h.put(&make_key(i), VALUE_128B);
        }
        let mut i = 0u64;
        b.iter(|| {
            let v = h.get(black_box(&make_key(i % 100_000)));
            assert!(v.is_some());
            i += 1;
        });
        drop(h);
        engine.close().unwrap();
    });

    group.bench_function("get_table_hit", |b| {
        let dir = TempDir::new().unwrap();
        let engine = open_memtable_only(dir.path());
        let mut h = engine.handle().unwrap();
        for i in 0..100_000u64 {
            h.put(&make_key(i), VALUE_128B);
        }
        engine.compact().expect("compact");
        let mut i = 0u64;
        b.iter(|| {
            let v = h.get(black_box(&make_key(i % 100_000)));
            assert!(v.is_some());
            i += 1;
        });
        drop(h);
        engine.close().unwrap();
    });

    group.bench_function("get_miss", |b| {
        let dir = TempDir::new().unwrap();
        let engine = open_memtable_only(dir.path());
        let mut h = engine.handle().unwrap();
        for i in 0..100_000u64 {
            h.put(&make_key(i), VALUE_128B);
        }
        engine.compact().expect("compact");
        b.iter(|| {
            assert!(h.get(black_box(b"absent-key")).is_none());
        });
        drop(h);
        engine.close().unwrap();
    });

    group.finish();
}

fn bench_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("scan");
    group.throughput(Throughput::Elements(10_000));

    group.bench_function("scan_10k_from_tables", |b| {
        let dir = TempDir::new().unwrap();
        let engine = open_memtable_only(dir.path());
        let mut h = engine.handle().unwrap();
        for i in 0..100_000u64 {
            h.put(&make_key(i), VALUE_128B);
        }
        engine.compact().expect("compact");
        b.iter_batched(
            || (),
            |_| {
                let mut it = h.iter();
                it.seek(&make_key(40_000));
                assert_eq!(it.take(10_000).count(), 10_000);
            },
            BatchSize::SmallInput,
        );
        drop(h);
        engine.close().unwrap();
    });

    group.finish();
}

criterion_group!(benches, bench_put, bench_get, bench_scan);
criterion_main!(benches);
