//! Benchmarks for snapshot fingerprinting and the snapshot log
//!
//! Run with: cargo bench --bench fingerprint
//!
//! Snapshots are whole-world state, so fingerprinting cost scales with the size
//! of the simulation. Sizes cover a small puzzle game up to a large RTS map.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use lockstep_resync::{Fingerprint, SimulationSnapshot, SnapshotLog, Tick};
use std::hint::black_box;

const SIZES: [usize; 4] = [64, 4 * 1024, 256 * 1024, 4 * 1024 * 1024];

/// Pseudo-random but reproducible world bytes
fn world_bytes(len: usize) -> Vec<u8> {
    let mut x: u32 = 0x9e37_79b9;
    (0..len)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            x as u8
        })
        .collect()
}

fn bench_fingerprint(c: &mut Criterion) {
    let mut group = c.benchmark_group("fingerprint");
    for size in SIZES {
        let bytes = world_bytes(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &bytes, |b, bytes| {
            b.iter(|| Fingerprint::of_bytes(black_box(bytes)));
        });
    }
    group.finish();
}

fn bench_snapshot_log(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot_log_store");
    for size in [64, 256 * 1024] {
        let bytes = world_bytes(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &bytes, |b, bytes| {
            let mut log = SnapshotLog::new(16);
            let mut tick = 0u32;
            b.iter(|| {
                tick = tick.wrapping_add(1);
                let snapshot = SimulationSnapshot::new(Tick::new(tick), bytes.clone());
                black_box(log.store(Tick::new(tick), snapshot))
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_fingerprint, bench_snapshot_log);
criterion_main!(benches);
