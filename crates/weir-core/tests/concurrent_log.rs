//! Concurrency properties: gap-free offsets, per-producer ordering, and
//! live tailing under parallel appenders.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use weir_core::{DurabilityPolicy, Wal, WalConfig, WalResult};

fn open(dir: &std::path::Path, capacity: u64, policy: DurabilityPolicy) -> Arc<Wal> {
    Arc::new(
        Wal::open(
            WalConfig::new(dir)
                .with_segment_capacity(capacity)
                .with_durability(policy),
        )
        .unwrap(),
    )
}

// ── Scenario 1: offsets are exactly {0..n} across threads and rollovers ──

#[test]
fn test_concurrent_appends_across_rollovers() {
    let temp_dir = tempfile::tempdir().unwrap();
    // Small segments so the run rolls over many times mid-contention.
    let wal = open(temp_dir.path(), 512, DurabilityPolicy::EveryWrite);

    let threads = 8u64;
    let per_thread = 100u64;
    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let wal = Arc::clone(&wal);
            thread::spawn(move || {
                let mut assigned = Vec::with_capacity(per_thread as usize);
                for i in 0..per_thread {
                    let payload = format!("{t}:{i}");
                    assigned.push((wal.append(payload.as_bytes()).unwrap(), t, i));
                }
                assigned
            })
        })
        .collect();

    let assigned: Vec<(u64, u64, u64)> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();

    let n = threads * per_thread;
    let mut offsets: Vec<u64> = assigned.iter().map(|(o, _, _)| *o).collect();
    offsets.sort_unstable();
    offsets.dedup();
    assert_eq!(offsets.len() as u64, n, "no duplicates");
    assert_eq!(offsets.first(), Some(&0));
    assert_eq!(offsets.last(), Some(&(n - 1)), "no gaps");

    // Each producer's own appends must carry increasing offsets.
    let mut last_per_thread: HashMap<u64, (u64, u64)> = HashMap::new();
    for &(offset, t, i) in &assigned {
        if let Some(&(prev_offset, prev_i)) = last_per_thread.get(&t) {
            if i > prev_i {
                assert!(offset > prev_offset, "thread {t} offsets must be ordered");
            }
        }
        let entry = last_per_thread.entry(t).or_insert((offset, i));
        if i >= entry.1 {
            *entry = (offset, i);
        }
    }

    // Replay returns every payload, in offset order, intact.
    let records: Vec<_> = wal.replay(0).collect::<WalResult<_>>().unwrap();
    assert_eq!(records.len() as u64, n);
    let by_offset: HashMap<u64, (u64, u64)> =
        assigned.iter().map(|&(o, t, i)| (o, (t, i))).collect();
    for (expected, record) in records.iter().enumerate() {
        assert_eq!(record.offset, expected as u64);
        let (t, i) = by_offset[&record.offset];
        assert_eq!(record.payload.as_ref(), format!("{t}:{i}").as_bytes());
    }
}

// ── Scenario 2: a tailing reader keeps up with live writers ──

#[test]
fn test_tail_follows_concurrent_writers() {
    let temp_dir = tempfile::tempdir().unwrap();
    let wal = open(temp_dir.path(), 1024, DurabilityPolicy::EveryWrite);

    let total = 200u64;
    let reader = {
        let wal = Arc::clone(&wal);
        thread::spawn(move || {
            let mut seen = Vec::with_capacity(total as usize);
            for record in wal.tail(0) {
                let record = record.unwrap();
                seen.push(record.offset);
                if seen.len() as u64 == total {
                    break;
                }
            }
            seen
        })
    };

    let writers: Vec<_> = (0..4u64)
        .map(|t| {
            let wal = Arc::clone(&wal);
            thread::spawn(move || {
                for i in 0..total / 4 {
                    wal.append(format!("{t}:{i}").as_bytes()).unwrap();
                }
            })
        })
        .collect();
    for w in writers {
        w.join().unwrap();
    }

    let seen = reader.join().unwrap();
    let expected: Vec<u64> = (0..total).collect();
    assert_eq!(seen, expected, "tail must yield every offset in order");
}

// ── Scenario 3: the durable watermark never regresses under batching ──

#[test]
fn test_watermark_is_monotonic_under_batched_policy() {
    let temp_dir = tempfile::tempdir().unwrap();
    let wal = open(
        temp_dir.path(),
        1024,
        DurabilityPolicy::Batched {
            appends: 8,
            interval: std::time::Duration::from_millis(2),
        },
    );

    let watcher = {
        let wal = Arc::clone(&wal);
        thread::spawn(move || {
            let mut prev = 0;
            for _ in 0..500 {
                let now = wal.durable_next();
                assert!(now >= prev, "watermark regressed: {now} < {prev}");
                prev = now;
                std::thread::yield_now();
            }
        })
    };

    let writers: Vec<_> = (0..4u64)
        .map(|t| {
            let wal = Arc::clone(&wal);
            thread::spawn(move || {
                for i in 0..50 {
                    wal.append(format!("{t}:{i}").as_bytes()).unwrap();
                }
            })
        })
        .collect();
    for w in writers {
        w.join().unwrap();
    }
    watcher.join().unwrap();

    assert_eq!(wal.durable_next(), 200);
}

// ── Scenario 4: replay taken mid-write sees a consistent prefix ──

#[test]
fn test_replay_snapshot_is_a_prefix() {
    let temp_dir = tempfile::tempdir().unwrap();
    let wal = open(temp_dir.path(), 1024, DurabilityPolicy::EveryWrite);

    let writer = {
        let wal = Arc::clone(&wal);
        thread::spawn(move || {
            for i in 0..100u64 {
                wal.append(format!("w{i}").as_bytes()).unwrap();
            }
        })
    };

    // Take replays while the writer runs; each must be a clean prefix.
    for _ in 0..10 {
        let records: Vec<_> = wal.replay(0).collect::<WalResult<_>>().unwrap();
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.offset, i as u64);
        }
    }
    writer.join().unwrap();
}
