//! End-to-end recovery scenarios over the in-memory cluster.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

mod common;

use common::{Cluster, AUTHORITY};
use lockstep_resync::telemetry::ViolationSeverity;
use lockstep_resync::{
    assert_no_violations, MessageKind, PeerId, ResyncFailure, ResyncPhase, SyncError, SyncEvent,
    SyncMessage, SynchronizerConfig, Tick,
};

fn count<F: Fn(&SyncEvent) -> bool>(events: &[SyncEvent], pred: F) -> usize {
    events.iter().filter(|e| pred(e)).count()
}

// ============================================================================
// Healthy session
// ============================================================================

#[test]
fn no_divergence_passes_every_check() {
    let mut cluster = Cluster::new(3);
    cluster.advance_by(100);

    let events = cluster.drain_events();
    let authority = &events[&AUTHORITY];
    assert_eq!(authority.len(), 10);
    assert!(authority
        .iter()
        .all(|e| matches!(e, SyncEvent::SyncCheckPassed { .. })));
    assert!(events[&PeerId::new(2)].is_empty());
    assert!(events[&PeerId::new(3)].is_empty());
    assert!(cluster.converged());
    assert!(cluster.failures.is_empty());
    assert!(cluster.evidence.is_empty());
    for id in 1..=3 {
        assert_no_violations!(cluster.observer(id));
    }
}

#[test]
fn checks_honor_interval_and_offset() {
    let mut cluster = Cluster::with_config(
        2,
        SynchronizerConfig {
            check_interval: 7,
            check_offset: 3,
            ..SynchronizerConfig::default()
        },
    );
    cluster.advance_by(30);
    let ticks: Vec<Tick> = cluster
        .network
        .borrow()
        .sync_messages(AUTHORITY, PeerId::new(2))
        .into_iter()
        .filter_map(|m| match m {
            SyncMessage::SyncCheckBroadcast { tick, .. } => Some(tick),
            _ => None,
        })
        .collect();
    assert_eq!(ticks, vec![Tick::new(3), Tick::new(10), Tick::new(17), Tick::new(24)]);
}

// ============================================================================
// Divergence and recovery
// ============================================================================

#[test]
fn single_peer_divergence_is_repaired() {
    let mut cluster = Cluster::new(3);
    cluster.advance_by(5);
    cluster.node_mut(3).simulation_mut().corrupt(1);
    assert!(!cluster.converged());
    cluster.advance_by(5);

    assert!(cluster.failures.is_empty(), "{:?}", cluster.failures);
    assert!(cluster.converged());
    assert!(cluster.all_idle());

    let events = cluster.drain_events();
    let authority = &events[&AUTHORITY];
    assert!(authority.contains(&SyncEvent::DivergenceDetected {
        sync_id: lockstep_resync::SyncId::new(1),
        tick: Tick::new(10),
        peers: vec![PeerId::new(3)],
    }));
    assert_eq!(count(authority, |e| matches!(e, SyncEvent::Resynchronizing { .. })), 1);
    assert_eq!(count(authority, |e| *e == SyncEvent::GameUnlocked), 1);

    let diverged = &events[&PeerId::new(3)];
    assert!(matches!(diverged[0], SyncEvent::LocalDivergence { .. }));
    assert!(diverged.contains(&SyncEvent::GameUnlocked));
    assert!(events[&PeerId::new(2)].contains(&SyncEvent::GameUnlocked));

    let reports = cluster.evidence.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].peer, PeerId::new(3));
    assert!(reports[0].first_difference.is_some());

    // the session keeps running after the repair
    cluster.advance_by(20);
    assert!(cluster.converged());
    let after = cluster.drain_events();
    assert_eq!(
        count(&after[&AUTHORITY], |e| matches!(e, SyncEvent::SyncCheckPassed { .. })),
        2
    );
}

#[test]
fn concurrent_requests_share_one_recovery() {
    let mut cluster = Cluster::new(3);
    cluster.advance_by(4);
    cluster.node_mut(2).trigger_resync().unwrap();
    cluster.node_mut(3).trigger_resync().unwrap();
    cluster.pump();

    assert!(cluster.failures.is_empty(), "{:?}", cluster.failures);
    assert!(cluster.all_idle());
    assert!(cluster.converged());

    let network = cluster.network.borrow();
    // one full state per remote peer, one relay per remote peer
    assert_eq!(network.count_sent(AUTHORITY, MessageKind::SyncData), 2);
    assert_eq!(network.count_sent(AUTHORITY, MessageKind::RequestSync), 2);
    drop(network);

    let events = cluster.drain_events();
    for (peer, events) in &events {
        assert_eq!(
            count(events, |e| matches!(e, SyncEvent::Resynchronizing { .. })),
            1,
            "peer {peer} resynchronized more than once"
        );
        assert_eq!(count(events, |e| *e == SyncEvent::GameUnlocked), 1);
    }
    assert!(events[&AUTHORITY].contains(&SyncEvent::Resynchronizing {
        initiator: PeerId::new(2)
    }));
}

#[test]
fn messages_arriving_during_recovery_are_replayed_in_order() {
    let mut cluster = Cluster::new(3);
    cluster.advance_by(3);
    cluster.node_mut(2).trigger_resync().unwrap();
    cluster.send_game(3, 7);
    cluster.send_game(1, 9);
    cluster.pump();

    assert!(cluster.failures.is_empty(), "{:?}", cluster.failures);
    assert!(cluster.all_idle());
    assert!(cluster.converged());
    for node in cluster.nodes.values() {
        assert_eq!(node.simulation().gs.applied, vec![7, 9]);
    }
    // peers loaded the authority's state exactly once
    assert_eq!(cluster.node(2).simulation().loads, 1);
    assert_eq!(cluster.node(3).simulation().loads, 1);
    assert_eq!(cluster.node(1).simulation().loads, 0);
}

#[test]
fn failed_load_keeps_peer_locked() {
    let mut cluster = Cluster::new(3);
    cluster.advance_by(5);
    {
        let world = cluster.node_mut(3).simulation_mut();
        world.corrupt(42);
        world.fail_next_load = true;
    }
    cluster.advance_by(5);

    let (peer, err) = cluster
        .failures
        .iter()
        .find(|(peer, _)| *peer == PeerId::new(3))
        .cloned()
        .unwrap();
    assert_eq!(peer, PeerId::new(3));
    assert!(matches!(
        err,
        SyncError::ResyncFailed {
            reason: ResyncFailure::LoadFailed { .. }
        }
    ));
    let failed = cluster.node(3);
    assert!(failed.is_locked());
    assert_eq!(failed.resync_phase(), ResyncPhase::Failed);
    assert!(cluster.observer(3).has_severity(ViolationSeverity::Critical));

    // the failed peer answers the confirmation check with a disagreement
    assert!(cluster.failures.iter().any(|(peer, err)| *peer == AUTHORITY
        && matches!(
            err,
            SyncError::ResyncFailed {
                reason: ResyncFailure::StillDiverged { .. }
            }
        )));

    // ordinary traffic keeps piling up behind the locked gate
    cluster.send_game(2, 5);
    cluster.pump();
    assert_eq!(cluster.node(3).delayed_count(), 1);
    assert!(cluster.node(3).simulation().gs.applied.is_empty());
}

// ============================================================================
// Round bookkeeping
// ============================================================================

#[test]
fn rounds_do_not_overlap() {
    let mut cluster = Cluster::new(2);
    let authority = cluster.node_mut(1);
    for _ in 0..30 {
        let tick = authority.simulation_mut().advance();
        authority.on_advance_tick(tick).unwrap();
    }
    assert_eq!(
        authority.current_round().unwrap().sync_id(),
        lockstep_resync::SyncId::new(1)
    );
    assert_eq!(
        cluster
            .network
            .borrow()
            .count_sent(AUTHORITY, MessageKind::SyncCheckBroadcast),
        1
    );
}

#[test]
fn ack_timeout_without_resync_retires_round() {
    let mut cluster = Cluster::with_config(
        2,
        SynchronizerConfig {
            ack_timeout_ticks: 5,
            resync_on_ack_timeout: false,
            ..SynchronizerConfig::default()
        },
    );
    let authority = cluster.node_mut(1);
    for _ in 0..20 {
        let tick = authority.simulation_mut().advance();
        authority.on_advance_tick(tick).unwrap();
    }
    let events: Vec<SyncEvent> = authority.events().collect();
    assert_eq!(
        events[0],
        SyncEvent::AckTimeout {
            sync_id: lockstep_resync::SyncId::new(1),
            tick: Tick::new(10),
            missing: vec![PeerId::new(2)],
        }
    );
    assert_eq!(authority.resync_phase(), ResyncPhase::NotSyncing);
    // the next cadence tick opened a fresh round
    assert_eq!(
        authority.current_round().unwrap().sync_id(),
        lockstep_resync::SyncId::new(2)
    );
}

#[test]
fn lagging_peer_answers_once_it_reaches_the_tick() {
    let mut cluster = Cluster::new(2);
    {
        let authority = cluster.node_mut(1);
        for _ in 0..10 {
            let tick = authority.simulation_mut().advance();
            authority.on_advance_tick(tick).unwrap();
        }
    }
    cluster.pump();
    assert_eq!(cluster.node(2).checker().pending_count(), 1);

    let peer = cluster.node_mut(2);
    for _ in 0..10 {
        let tick = peer.simulation_mut().advance();
        peer.on_advance_tick(tick).unwrap();
    }
    cluster.pump();
    let events = cluster.drain_events();
    assert_eq!(
        events[&AUTHORITY],
        vec![SyncEvent::SyncCheckPassed {
            sync_id: lockstep_resync::SyncId::new(1),
            tick: Tick::new(10)
        }]
    );
}

#[test]
fn leaving_peer_does_not_block_recovery() {
    let mut cluster = Cluster::new(3);
    cluster.advance_by(2);
    // peer 3 drops off the wire and never answers
    cluster.network.borrow_mut().members.remove(&PeerId::new(3));
    cluster.nodes.remove(&PeerId::new(3));
    cluster.node_mut(1).trigger_resync().unwrap();
    cluster.pump();
    assert_eq!(cluster.node(1).resync_phase(), ResyncPhase::ConfirmingRecovery);

    cluster.node_mut(1).remove_peer(PeerId::new(3)).unwrap();
    cluster.pump();
    assert!(cluster.all_idle());
    assert!(cluster.converged());
}
