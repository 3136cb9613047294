//! When to check, and what to compare.
//!
//! The checker runs on every peer. It captures a snapshot on each cadence tick,
//! keeps it in the [`SnapshotLog`], and on non-authority peers compares the
//! authority's fingerprints against it. Fingerprints that arrive before the
//! local simulation reached their tick are buffered and retried.

use std::collections::VecDeque;

use crate::error::ProtocolViolationKind;
use crate::{Fingerprint, Role, Simulation, SimulationSnapshot, SnapshotLog, SyncError, SyncId, Tick};

/// Per-peer checker state.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CheckerState {
    /// Nothing outstanding.
    Idle,
    /// (Authority) A round is open and waiting for acknowledgements.
    AwaitingAcks {
        /// The open round.
        sync_id: SyncId,
    },
    /// (Peer) A snapshot was captured and the authority's fingerprint for it has
    /// not arrived yet.
    AwaitingFingerprint {
        /// Tick of the captured snapshot.
        tick: Tick,
    },
}

/// A fingerprint received from the authority, waiting for the local tick to catch up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCheck {
    /// Round id.
    pub sync_id: SyncId,
    /// Tick of the authority's snapshot.
    pub tick: Tick,
    /// The authority's fingerprint.
    pub fingerprint: Fingerprint,
    /// Set for a post-recovery confirmation check.
    pub complete: bool,
    /// Local tick when the fingerprint arrived.
    pub received_at: Tick,
}

/// Result of comparing the authority's fingerprint with local state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Comparison {
    /// Fingerprints match.
    Agreed,
    /// Fingerprints differ, or the local snapshot for the tick is unusable.
    Diverged {
        /// The local fingerprint, if a usable snapshot existed.
        local: Option<Fingerprint>,
        /// The local snapshot, to be sent as evidence.
        evidence: Option<SimulationSnapshot>,
    },
    /// The local simulation has not reached the tick yet. Buffered for retry.
    Deferred(SyncError),
    /// The tick is behind the local simulation but nothing was captured for it,
    /// or a buffered check never saw its tick. Holds a
    /// [`SyncError::TickMismatch`]. Nothing was compared.
    TickMismatch(SyncError),
}

/// A buffered check that was resolved on a later tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCheck {
    /// The check that was buffered.
    pub check: PendingCheck,
    /// How it resolved. Never [`Comparison::Deferred`].
    pub comparison: Comparison,
    /// Set if the check resolved by running out of time.
    pub timed_out: bool,
}

/// Decides when to check and produces comparison results.
#[derive(Debug, Clone)]
pub struct SyncChecker {
    role: Role,
    interval: u32,
    offset: u32,
    tick_mismatch_timeout: u32,
    log: SnapshotLog,
    state: CheckerState,
    next_sync_id: SyncId,
    pending: VecDeque<PendingCheck>,
}

impl SyncChecker {
    /// Creates a checker that captures when `tick % interval == offset`.
    #[must_use]
    pub fn new(
        role: Role,
        interval: u32,
        offset: u32,
        log_capacity: usize,
        tick_mismatch_timeout: u32,
    ) -> Self {
        Self {
            role,
            interval,
            offset,
            tick_mismatch_timeout,
            log: SnapshotLog::new(log_capacity),
            state: CheckerState::Idle,
            next_sync_id: SyncId::new(1),
            pending: VecDeque::new(),
        }
    }

    /// Returns `true` if a cadence check falls on `tick`.
    #[must_use]
    pub const fn is_due(&self, tick: Tick) -> bool {
        tick.is_check_tick(self.interval, self.offset)
    }

    /// Captures the simulation, stores the snapshot under `tick` and fingerprints it.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidSnapshot`] if the simulation produced an empty
    /// snapshot. Nothing is stored in that case.
    pub fn capture<S: Simulation + ?Sized>(
        &mut self,
        sim: &mut S,
        tick: Tick,
    ) -> Result<(SimulationSnapshot, Fingerprint), SyncError> {
        let snapshot = sim.capture_snapshot();
        let fingerprint = SnapshotLog::fingerprint_of(&snapshot)?;
        self.log.store(tick, snapshot.clone());
        if !self.role.is_authority() {
            self.state = CheckerState::AwaitingFingerprint { tick };
        }
        tracing::debug!(%tick, %fingerprint, len = snapshot.len(), "captured snapshot");
        Ok((snapshot, fingerprint))
    }

    /// Issues the id for a new round and starts waiting for acknowledgements.
    ///
    /// # Errors
    ///
    /// Only the authority may originate rounds.
    pub fn begin_round(&mut self) -> Result<SyncId, SyncError> {
        if !self.role.is_authority() {
            return Err(ProtocolViolationKind::CheckFromNonAuthority.into());
        }
        let sync_id = self.next_sync_id;
        self.next_sync_id = sync_id.next();
        self.state = CheckerState::AwaitingAcks { sync_id };
        Ok(sync_id)
    }

    /// (Authority) The open round is settled.
    pub fn retire_round(&mut self) {
        if matches!(self.state, CheckerState::AwaitingAcks { .. }) {
            self.state = CheckerState::Idle;
        }
    }

    /// Compares the authority's fingerprint for `check.tick` with local state.
    ///
    /// If the local simulation at `local_tick` has not reached the tick yet the
    /// check is buffered and [`Comparison::Deferred`] returned.
    pub fn compare(&mut self, check: PendingCheck, local_tick: Tick) -> Comparison {
        if self.log.retrieve(check.tick).is_none() && check.tick > local_tick {
            let mismatch = SyncError::TickMismatch {
                expected: check.tick,
                actual: local_tick,
            };
            tracing::debug!(
                sync_id = %check.sync_id,
                tick = %check.tick,
                %local_tick,
                "fingerprint ahead of local simulation, buffering"
            );
            self.pending.push_back(check);
            return Comparison::Deferred(mismatch);
        }
        self.resolve(&check, local_tick)
    }

    /// Re-evaluates buffered checks at `local_tick`.
    ///
    /// Checks whose tick has been reached resolve normally; checks buffered for
    /// longer than the tick-mismatch timeout resolve as [`Comparison::TickMismatch`].
    pub fn retry_pending(&mut self, local_tick: Tick) -> Vec<ResolvedCheck> {
        let mut resolved = Vec::new();
        let mut still_pending = VecDeque::with_capacity(self.pending.len());
        while let Some(check) = self.pending.pop_front() {
            if self.log.retrieve(check.tick).is_some() || check.tick <= local_tick {
                let comparison = self.resolve(&check, local_tick);
                resolved.push(ResolvedCheck {
                    check,
                    comparison,
                    timed_out: false,
                });
            } else if local_tick.ticks_since(check.received_at) > self.tick_mismatch_timeout {
                let comparison = Comparison::TickMismatch(SyncError::TickMismatch {
                    expected: check.tick,
                    actual: local_tick,
                });
                resolved.push(ResolvedCheck {
                    check,
                    comparison,
                    timed_out: true,
                });
            } else {
                still_pending.push_back(check);
            }
        }
        self.pending = still_pending;
        resolved
    }

    fn resolve(&mut self, check: &PendingCheck, local_tick: Tick) -> Comparison {
        if self.state == (CheckerState::AwaitingFingerprint { tick: check.tick }) {
            self.state = CheckerState::Idle;
        }
        let Some(snapshot) = self.log.retrieve(check.tick) else {
            // offset disagreement, eviction or a reset: the tick was passed uncaptured
            let actual = self.log.latest_tick().unwrap_or(local_tick);
            tracing::debug!(tick = %check.tick, %actual, "no local snapshot for tick");
            return Comparison::TickMismatch(SyncError::TickMismatch {
                expected: check.tick,
                actual,
            });
        };
        match SnapshotLog::fingerprint_of(snapshot) {
            Ok(local) if local == check.fingerprint => Comparison::Agreed,
            Ok(local) => Comparison::Diverged {
                local: Some(local),
                evidence: Some(snapshot.clone()),
            },
            Err(_) => Comparison::Diverged {
                local: None,
                evidence: None,
            },
        }
    }

    /// Drops buffered checks, stored snapshots and any open round.
    ///
    /// Called when a recovery starts: everything captured before it belongs to a
    /// timeline that is about to be replaced.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.log.clear();
        self.state = CheckerState::Idle;
    }

    /// The current state.
    #[must_use]
    pub const fn state(&self) -> CheckerState {
        self.state
    }

    /// The snapshot log.
    #[must_use]
    pub const fn log(&self) -> &SnapshotLog {
        &self.log
    }

    /// Fingerprints waiting for the local tick to catch up.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// The id the next round will get.
    #[must_use]
    pub const fn next_sync_id(&self) -> SyncId {
        self.next_sync_id
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::{LoadError, PeerId};

    struct Counter {
        tick: Tick,
        value: u64,
    }

    impl Simulation for Counter {
        fn capture_snapshot(&mut self) -> SimulationSnapshot {
            SimulationSnapshot::new(self.tick, self.value.to_le_bytes().to_vec())
        }
        fn load_full_state(&mut self, _snapshot: &SimulationSnapshot) -> Result<(), LoadError> {
            Ok(())
        }
        fn current_advance_tick(&self) -> Tick {
            self.tick
        }
        fn dispatch(&mut self, _message_id: u32, _raw: &[u8], _sender: PeerId) {}
    }

    struct Empty;

    impl Simulation for Empty {
        fn capture_snapshot(&mut self) -> SimulationSnapshot {
            SimulationSnapshot::new(Tick::ZERO, Vec::new())
        }
        fn load_full_state(&mut self, _snapshot: &SimulationSnapshot) -> Result<(), LoadError> {
            Ok(())
        }
        fn current_advance_tick(&self) -> Tick {
            Tick::ZERO
        }
        fn dispatch(&mut self, _message_id: u32, _raw: &[u8], _sender: PeerId) {}
    }

    fn fingerprint_for(value: u64) -> Fingerprint {
        Fingerprint::of_bytes(&value.to_le_bytes()).unwrap()
    }

    fn check(tick: u32, value: u64, received_at: u32) -> PendingCheck {
        PendingCheck {
            sync_id: SyncId::new(1),
            tick: Tick::new(tick),
            fingerprint: fingerprint_for(value),
            complete: false,
            received_at: Tick::new(received_at),
        }
    }

    fn peer_checker() -> SyncChecker {
        SyncChecker::new(Role::Peer, 10, 0, 8, 20)
    }

    // ========================================================================
    // Cadence and capture
    // ========================================================================

    #[test]
    fn due_on_interval_with_offset() {
        let checker = SyncChecker::new(Role::Authority, 10, 5, 8, 20);
        assert!(checker.is_due(Tick::new(5)));
        assert!(checker.is_due(Tick::new(105)));
        assert!(!checker.is_due(Tick::new(100)));
    }

    #[test]
    fn capture_stores_and_fingerprints() {
        let mut checker = peer_checker();
        let mut sim = Counter {
            tick: Tick::new(10),
            value: 42,
        };
        let (snapshot, fp) = checker.capture(&mut sim, Tick::new(10)).unwrap();
        assert_eq!(fp, fingerprint_for(42));
        assert_eq!(checker.log().retrieve(Tick::new(10)), Some(&snapshot));
        assert_eq!(
            checker.state(),
            CheckerState::AwaitingFingerprint { tick: Tick::new(10) }
        );
    }

    #[test]
    fn empty_capture_is_invalid_and_not_stored() {
        let mut checker = peer_checker();
        let err = checker.capture(&mut Empty, Tick::new(10)).unwrap_err();
        assert!(matches!(err, SyncError::InvalidSnapshot { .. }));
        assert!(checker.log().is_empty());
    }

    #[test]
    fn only_authority_begins_rounds() {
        let mut peer = peer_checker();
        assert!(peer.begin_round().is_err());

        let mut authority = SyncChecker::new(Role::Authority, 10, 0, 8, 20);
        let first = authority.begin_round().unwrap();
        assert_eq!(authority.state(), CheckerState::AwaitingAcks { sync_id: first });
        authority.retire_round();
        assert_eq!(authority.state(), CheckerState::Idle);
        assert_eq!(authority.begin_round().unwrap(), first.next());
    }

    // ========================================================================
    // Comparison
    // ========================================================================

    #[test]
    fn matching_fingerprint_agrees() {
        let mut checker = peer_checker();
        let mut sim = Counter {
            tick: Tick::new(10),
            value: 7,
        };
        checker.capture(&mut sim, Tick::new(10)).unwrap();
        assert_eq!(checker.compare(check(10, 7, 10), Tick::new(10)), Comparison::Agreed);
        assert_eq!(checker.state(), CheckerState::Idle);
    }

    #[test]
    fn different_fingerprint_diverges_with_evidence() {
        let mut checker = peer_checker();
        let mut sim = Counter {
            tick: Tick::new(10),
            value: 7,
        };
        checker.capture(&mut sim, Tick::new(10)).unwrap();
        match checker.compare(check(10, 8, 10), Tick::new(10)) {
            Comparison::Diverged { local, evidence } => {
                assert_eq!(local, Some(fingerprint_for(7)));
                assert_eq!(evidence.unwrap().bytes(), &7u64.to_le_bytes());
            },
            other => panic!("expected divergence, got {:?}", other),
        }
    }

    #[test]
    fn future_tick_is_buffered_then_resolved() {
        let mut checker = peer_checker();
        let result = checker.compare(check(20, 3, 18), Tick::new(18));
        assert!(matches!(
            result,
            Comparison::Deferred(SyncError::TickMismatch { .. })
        ));
        assert_eq!(checker.pending_count(), 1);

        assert!(checker.retry_pending(Tick::new(19)).is_empty());

        let mut sim = Counter {
            tick: Tick::new(20),
            value: 3,
        };
        checker.capture(&mut sim, Tick::new(20)).unwrap();
        let resolved = checker.retry_pending(Tick::new(20));
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].comparison, Comparison::Agreed);
        assert!(!resolved[0].timed_out);
        assert_eq!(checker.pending_count(), 0);
    }

    #[test]
    fn buffered_check_times_out_as_tick_mismatch() {
        let mut checker = SyncChecker::new(Role::Peer, 10, 0, 8, 5);
        checker.compare(check(1_000, 3, 10), Tick::new(10));
        assert!(checker.retry_pending(Tick::new(15)).is_empty());
        let resolved = checker.retry_pending(Tick::new(16));
        assert_eq!(resolved.len(), 1);
        assert!(resolved[0].timed_out);
        assert_eq!(
            resolved[0].comparison,
            Comparison::TickMismatch(SyncError::TickMismatch {
                expected: Tick::new(1_000),
                actual: Tick::new(16),
            })
        );
    }

    #[test]
    fn past_tick_without_snapshot_is_tick_mismatch() {
        let mut checker = peer_checker();
        let result = checker.compare(check(10, 3, 30), Tick::new(30));
        assert_eq!(
            result,
            Comparison::TickMismatch(SyncError::TickMismatch {
                expected: Tick::new(10),
                actual: Tick::new(30),
            })
        );
        assert_eq!(checker.pending_count(), 0);
    }

    #[test]
    fn snapshot_on_other_tick_is_tick_mismatch() {
        // captured on tick 13 (offset 3) while the authority checked tick 10
        let mut checker = SyncChecker::new(Role::Peer, 10, 3, 8, 20);
        let mut sim = Counter {
            tick: Tick::new(13),
            value: 3,
        };
        checker.capture(&mut sim, Tick::new(13)).unwrap();
        assert_eq!(
            checker.compare(check(10, 3, 13), Tick::new(13)),
            Comparison::TickMismatch(SyncError::TickMismatch {
                expected: Tick::new(10),
                actual: Tick::new(13),
            })
        );
    }

    #[test]
    fn reset_clears_everything() {
        let mut checker = peer_checker();
        let mut sim = Counter {
            tick: Tick::new(10),
            value: 1,
        };
        checker.capture(&mut sim, Tick::new(10)).unwrap();
        checker.compare(check(50, 1, 10), Tick::new(10));
        checker.reset();
        assert_eq!(checker.pending_count(), 0);
        assert!(checker.log().is_empty());
        assert_eq!(checker.state(), CheckerState::Idle);
    }
}
