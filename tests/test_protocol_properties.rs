//! Property-based tests for the sync protocol building blocks.
//!
//! # Properties Tested
//!
//! - Fingerprints are deterministic and sensitive to any single-byte change
//! - The snapshot log never exceeds its capacity and always keeps the newest ticks
//! - The message gate releases exactly what it deferred, in arrival order
//! - Any burst of concurrent resync requests produces exactly one recovery
//! - A single corrupted peer is always repaired

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

mod common;

use common::{Cluster, AUTHORITY};
use lockstep_resync::{
    DeferredMessage, Fingerprint, MessageGate, MessageKind, PeerId, SimulationSnapshot,
    SnapshotLog, SyncEvent, Tick,
};
use proptest::prelude::*;

// ============================================================================
// Fingerprints
// ============================================================================

proptest! {
    #[test]
    fn fingerprint_is_deterministic(bytes in prop::collection::vec(any::<u8>(), 1..512)) {
        let a = Fingerprint::of_bytes(&bytes).unwrap();
        let b = Fingerprint::of(&SimulationSnapshot::new(Tick::ZERO, bytes.clone())).unwrap();
        prop_assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_detects_single_byte_change(
        bytes in prop::collection::vec(any::<u8>(), 1..512),
        index in any::<prop::sample::Index>(),
        flip in 1u8..=255,
    ) {
        let mut changed = bytes.clone();
        let i = index.index(changed.len());
        changed[i] ^= flip;
        prop_assert_ne!(
            Fingerprint::of_bytes(&bytes).unwrap(),
            Fingerprint::of_bytes(&changed).unwrap()
        );
    }
}

// ============================================================================
// Snapshot log
// ============================================================================

proptest! {
    #[test]
    fn snapshot_log_keeps_newest_within_capacity(
        capacity in 1usize..16,
        ticks in 1u32..64,
    ) {
        let mut log = SnapshotLog::new(capacity);
        for t in 0..ticks {
            log.store(Tick::new(t), SimulationSnapshot::new(Tick::new(t), vec![t as u8 + 1]));
            prop_assert!(log.len() <= capacity);
        }
        prop_assert_eq!(log.latest_tick(), Some(Tick::new(ticks - 1)));
        let kept = capacity.min(ticks as usize) as u32;
        for t in (ticks - kept)..ticks {
            prop_assert!(log.retrieve(Tick::new(t)).is_some());
        }
        if ticks > kept {
            prop_assert!(log.retrieve(Tick::new(ticks - kept - 1)).is_none());
        }
    }
}

// ============================================================================
// Message gate
// ============================================================================

fn deferred(id: u32, sender: u32) -> DeferredMessage {
    DeferredMessage {
        kind: MessageKind::Game(id),
        raw: id.to_le_bytes().to_vec(),
        sender: PeerId::new(sender),
        receiver: PeerId::new(0),
        arrival_tick: Tick::new(id),
    }
}

proptest! {
    #[test]
    fn gate_releases_everything_in_order(
        batches in prop::collection::vec(prop::collection::vec((0u32..1000, 1u32..5), 0..20), 1..5),
    ) {
        let mut gate = MessageGate::new();
        for batch in batches {
            prop_assert!(!gate.is_locked());
            for &(id, sender) in &batch {
                // unlocked: nothing is held back
                prop_assert!(!gate.enqueue_if_locked(deferred(id, sender)));
            }
            gate.lock();
            for &(id, sender) in &batch {
                prop_assert!(gate.enqueue_if_locked(deferred(id, sender)));
            }
            prop_assert_eq!(gate.delayed_count(), batch.len());
            let released: Vec<(u32, u32)> = gate
                .unlock()
                .into_iter()
                .map(|m| match m.kind {
                    MessageKind::Game(id) => (id, m.sender.as_u32()),
                    other => panic!("unexpected kind {other}"),
                })
                .collect();
            prop_assert_eq!(released, batch);
            prop_assert_eq!(gate.delayed_count(), 0);
        }
    }

    #[test]
    fn gate_restore_front_preserves_order(
        ids in prop::collection::vec(0u32..1000, 1..30),
        split in any::<prop::sample::Index>(),
    ) {
        let mut gate = MessageGate::new();
        gate.lock();
        for &id in &ids {
            gate.enqueue_if_locked(deferred(id, 1));
        }
        let mut released = gate.unlock();
        let rest = released.split_off(split.index(released.len()));

        // delivery re-locked the gate and a new message arrived before the rest went back
        gate.lock();
        gate.enqueue_if_locked(deferred(5000, 2));
        gate.restore_front(rest.clone());

        let order: Vec<u32> = gate.unlock().iter().map(|m| match m.kind {
            MessageKind::Game(id) => id,
            other => panic!("unexpected kind {other}"),
        }).collect();
        let mut expected: Vec<u32> = rest.iter().map(|m| match m.kind {
            MessageKind::Game(id) => id,
            other => panic!("unexpected kind {other}"),
        }).collect();
        expected.push(5000);
        prop_assert_eq!(order, expected);
    }
}

// ============================================================================
// Sessions
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn concurrent_requests_yield_one_recovery(
        size in 2u32..6,
        warmup in 0u32..9,
        requesters in prop::collection::vec(1u32..6, 1..8),
    ) {
        let mut cluster = Cluster::new(size);
        cluster.advance_by(warmup);
        for id in requesters {
            if id <= size {
                cluster.node_mut(id).trigger_resync().unwrap();
            }
        }
        cluster.pump();

        prop_assert!(cluster.failures.is_empty());
        prop_assert!(cluster.all_idle());
        prop_assert!(cluster.converged());
        let events = cluster.drain_events();
        let sessions = events[&AUTHORITY]
            .iter()
            .filter(|e| matches!(e, SyncEvent::Resynchronizing { .. }))
            .count();
        prop_assert!(sessions <= 1);
        prop_assert_eq!(
            cluster.network.borrow().count_sent(AUTHORITY, MessageKind::SyncData),
            if sessions == 1 { (size - 1) as usize } else { 0 }
        );
    }

    #[test]
    fn corrupted_peer_is_always_repaired(
        size in 2u32..6,
        victim in 2u32..6,
        at in 1u32..25,
        delta in 1u64..u64::MAX,
    ) {
        prop_assume!(victim <= size);
        let mut cluster = Cluster::new(size);
        cluster.advance_by(at);
        cluster.node_mut(victim).simulation_mut().corrupt(delta);
        cluster.advance_by(30);

        prop_assert!(cluster.failures.is_empty());
        prop_assert!(cluster.all_idle());
        prop_assert!(cluster.converged());
        prop_assert_eq!(cluster.evidence.len(), 1);
        prop_assert_eq!(cluster.evidence.reports()[0].peer, PeerId::new(victim));
    }
}
