//! Benchmarks for append and replay throughput.

use std::hint::black_box;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use tempfile::TempDir;
use weir_core::{DurabilityPolicy, Wal, WalConfig};

fn open_wal(dir: &std::path::Path, policy: DurabilityPolicy) -> Wal {
    Wal::open(
        WalConfig::new(dir)
            .with_segment_capacity(64 * 1024 * 1024)
            .with_durability(policy),
    )
    .unwrap()
}

/// Append latency without a sync in the hot path (durability deferred).
fn bench_append(c: &mut Criterion) {
    let temp_dir = TempDir::new().unwrap();
    let wal = open_wal(
        temp_dir.path(),
        DurabilityPolicy::Periodic {
            interval: Duration::from_secs(1),
        },
    );

    c.bench_function("wal_append", |b| {
        b.iter(|| wal.append(black_box(b"test_payload_with_some_data")).unwrap());
    });

    let mut group = c.benchmark_group("wal_append_sizes");
    for size in [16, 64, 256, 1024, 4096] {
        group.bench_function(format!("{size}B"), |b| {
            let payload = vec![0u8; size];
            b.iter(|| wal.append(black_box(&payload)).unwrap());
        });
    }
    group.finish();
}

/// Cost of forcing durability after a burst of appends.
fn bench_flush(c: &mut Criterion) {
    c.bench_function("wal_flush_after_burst", |b| {
        b.iter_batched(
            || {
                let temp_dir = TempDir::new().unwrap();
                let wal = open_wal(
                    temp_dir.path(),
                    DurabilityPolicy::Periodic {
                        interval: Duration::from_secs(60),
                    },
                );
                for i in 0..100u32 {
                    wal.append(format!("record_{i}").as_bytes()).unwrap();
                }
                (wal, temp_dir)
            },
            |(wal, _temp_dir)| {
                wal.flush().unwrap();
                black_box(());
            },
            BatchSize::SmallInput,
        );
    });
}

/// Sequential replay throughput over a populated log.
fn bench_replay(c: &mut Criterion) {
    let temp_dir = TempDir::new().unwrap();
    let wal = open_wal(
        temp_dir.path(),
        DurabilityPolicy::Periodic {
            interval: Duration::from_secs(60),
        },
    );
    for _ in 0..10_000u32 {
        wal.append(&[0xABu8; 128]).unwrap();
    }
    wal.flush().unwrap();

    c.bench_function("wal_replay_10k", |b| {
        b.iter(|| {
            let mut count = 0u64;
            for record in wal.replay(0) {
                black_box(record.unwrap());
                count += 1;
            }
            assert_eq!(count, 10_000);
        });
    });
}

criterion_group!(benches, bench_append, bench_flush, bench_replay);
criterion_main!(benches);
