//! Benchmarks for deferring and releasing messages during a recovery
//!
//! Run with: cargo bench --bench message_gate

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use lockstep_resync::{DeferredMessage, MessageGate, MessageKind, PeerId, Tick};
use std::hint::black_box;

fn message(i: u32) -> DeferredMessage {
    DeferredMessage {
        kind: MessageKind::Game(i % 16),
        raw: vec![0u8; 32],
        sender: PeerId::new(i % 8),
        receiver: PeerId::new(0),
        arrival_tick: Tick::new(i),
    }
}

fn bench_defer_and_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("gate_defer_release");
    for count in [16u32, 256, 4096] {
        group.throughput(Throughput::Elements(u64::from(count)));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            let mut gate = MessageGate::new();
            b.iter(|| {
                gate.lock();
                for i in 0..count {
                    gate.enqueue_if_locked(message(i));
                }
                black_box(gate.unlock())
            });
        });
    }
    group.finish();
}

fn bench_restore_front(c: &mut Criterion) {
    c.bench_function("gate_restore_front_256", |b| {
        let mut gate = MessageGate::new();
        b.iter(|| {
            gate.lock();
            for i in 0..256 {
                gate.enqueue_if_locked(message(i));
            }
            let mut released = gate.unlock();
            let rest = released.split_off(1);
            gate.lock();
            gate.restore_front(rest);
            black_box(gate.unlock())
        });
    });
}

criterion_group!(benches, bench_defer_and_release, bench_restore_front);
criterion_main!(benches);
