//! The recovery state machine.
//!
//! [`Resyncer`] owns the [`MessageGate`] and the single [`ResyncState`] value
//! that says where the local peer is in a recovery. It performs no I/O: the
//! coordinator asks it for transitions and does the sending, capturing and
//! loading itself.
//!
//! ```text
//! NotSyncing ──trigger──▶ AwaitingLock ──RequestSync──▶ Locked
//!      ▲                                                   │ SyncData
//!      │ UnlockGame                                        ▼
//! ConfirmingRecovery ◀──────── load ok ─────────── ApplyingSnapshot
//!                                                          │ load failed
//!                                                          ▼
//!                                                        Failed
//! ```

use std::time::Duration;

use smallvec::SmallVec;
use web_time::Instant;

use crate::error::ProtocolViolationKind;
use crate::{DeferredMessage, MessageGate, PeerId, ResyncFailure, SimulationSnapshot, SyncId};

/// One in-progress recovery.
#[derive(Debug, Clone)]
pub struct ResyncSession {
    initiator: PeerId,
    started_at: Instant,
    snapshot: Option<SimulationSnapshot>,
    pending_confirmation: SmallVec<[PeerId; 8]>,
    confirm_sync_id: Option<SyncId>,
}

impl ResyncSession {
    fn new(initiator: PeerId) -> Self {
        Self {
            initiator,
            started_at: Instant::now(),
            snapshot: None,
            pending_confirmation: SmallVec::new(),
            confirm_sync_id: None,
        }
    }

    /// The peer whose request started the recovery.
    #[must_use]
    pub const fn initiator(&self) -> PeerId {
        self.initiator
    }

    /// (Authority) The full state that was distributed.
    #[must_use]
    pub const fn snapshot(&self) -> Option<&SimulationSnapshot> {
        self.snapshot.as_ref()
    }

    /// Peers whose confirmation is still outstanding.
    #[must_use]
    pub fn pending_confirmation(&self) -> &[PeerId] {
        &self.pending_confirmation
    }

    /// (Authority) The round confirming the recovery, once opened.
    #[must_use]
    pub const fn confirm_sync_id(&self) -> Option<SyncId> {
        self.confirm_sync_id
    }

    /// Time since the recovery started locally.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Where the local peer is in a recovery.
#[derive(Debug, Clone, Default)]
pub enum ResyncState {
    /// No recovery in progress.
    #[default]
    NotSyncing,
    /// The local peer requested a recovery and has not locked yet.
    AwaitingLock(ResyncSession),
    /// The gate is locked; waiting for (or, at the authority, producing) the full state.
    Locked(ResyncSession),
    /// The full state is being loaded.
    ApplyingSnapshot(ResyncSession),
    /// The full state is in place; waiting for the confirmation check to pass.
    ConfirmingRecovery(ResyncSession),
    /// Recovery failed. The gate stays locked for the rest of the session.
    Failed(ResyncFailure),
}

impl ResyncState {
    /// The phase without its payload.
    #[must_use]
    pub const fn phase(&self) -> ResyncPhase {
        match self {
            ResyncState::NotSyncing => ResyncPhase::NotSyncing,
            ResyncState::AwaitingLock(_) => ResyncPhase::AwaitingLock,
            ResyncState::Locked(_) => ResyncPhase::Locked,
            ResyncState::ApplyingSnapshot(_) => ResyncPhase::ApplyingSnapshot,
            ResyncState::ConfirmingRecovery(_) => ResyncPhase::ConfirmingRecovery,
            ResyncState::Failed(_) => ResyncPhase::Failed,
        }
    }

    /// The active session, if any.
    #[must_use]
    pub const fn session(&self) -> Option<&ResyncSession> {
        match self {
            ResyncState::AwaitingLock(s)
            | ResyncState::Locked(s)
            | ResyncState::ApplyingSnapshot(s)
            | ResyncState::ConfirmingRecovery(s) => Some(s),
            ResyncState::NotSyncing | ResyncState::Failed(_) => None,
        }
    }

    fn session_mut(&mut self) -> Option<&mut ResyncSession> {
        match self {
            ResyncState::AwaitingLock(s)
            | ResyncState::Locked(s)
            | ResyncState::ApplyingSnapshot(s)
            | ResyncState::ConfirmingRecovery(s) => Some(s),
            ResyncState::NotSyncing | ResyncState::Failed(_) => None,
        }
    }
}

/// Payload-free view of [`ResyncState`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ResyncPhase {
    /// See [`ResyncState::NotSyncing`].
    NotSyncing,
    /// See [`ResyncState::AwaitingLock`].
    AwaitingLock,
    /// See [`ResyncState::Locked`].
    Locked,
    /// See [`ResyncState::ApplyingSnapshot`].
    ApplyingSnapshot,
    /// See [`ResyncState::ConfirmingRecovery`].
    ConfirmingRecovery,
    /// See [`ResyncState::Failed`].
    Failed,
}

impl ResyncPhase {
    /// Returns `true` unless no recovery was ever started or the last one completed.
    #[must_use]
    pub const fn is_active(self) -> bool {
        !matches!(self, ResyncPhase::NotSyncing)
    }
}

/// How a `RequestSync` was taken.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    /// A remote request started a new recovery.
    Started,
    /// The local peer's own request arrived and completed the lock.
    Joined,
    /// A recovery was already past locking; the request was folded into it.
    Coalesced,
}

/// Drives the recovery state machine and owns the message gate.
#[derive(Debug, Default)]
pub struct Resyncer {
    state: ResyncState,
    gate: MessageGate,
}

impl Resyncer {
    /// Creates a resyncer with no recovery in progress and an unlocked gate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a locally requested recovery.
    ///
    /// Returns `false` without changing anything if a recovery is already active
    /// (including a failed one); the request is coalesced into it.
    pub fn begin(&mut self, initiator: PeerId) -> bool {
        if self.is_active() {
            return false;
        }
        self.state = ResyncState::AwaitingLock(ResyncSession::new(initiator));
        true
    }

    /// Handles a `RequestSync`, locking the gate if the request starts or
    /// completes a lock.
    pub fn lock(&mut self, initiator: PeerId) -> LockOutcome {
        let (next, outcome) = match std::mem::take(&mut self.state) {
            ResyncState::NotSyncing => (
                ResyncState::Locked(ResyncSession::new(initiator)),
                LockOutcome::Started,
            ),
            ResyncState::AwaitingLock(session) => {
                (ResyncState::Locked(session), LockOutcome::Joined)
            },
            other => (other, LockOutcome::Coalesced),
        };
        self.state = next;
        if outcome != LockOutcome::Coalesced {
            self.gate.lock();
        }
        outcome
    }

    /// (Authority) Remembers the distributed full state.
    pub fn record_snapshot(&mut self, snapshot: SimulationSnapshot) {
        if let Some(session) = self.state.session_mut() {
            session.snapshot = Some(snapshot);
        }
    }

    /// Accepts full state from `sender` for loading.
    ///
    /// # Errors
    ///
    /// The state must come from `authority` and a recovery must be waiting for
    /// it. Otherwise the message is a protocol violation and must be discarded.
    pub fn start_apply(
        &mut self,
        sender: PeerId,
        authority: PeerId,
    ) -> Result<(), ProtocolViolationKind> {
        if sender != authority {
            return Err(ProtocolViolationKind::SyncDataFromNonAuthority { sender });
        }
        match std::mem::take(&mut self.state) {
            ResyncState::AwaitingLock(session) | ResyncState::Locked(session) => {
                self.state = ResyncState::ApplyingSnapshot(session);
                Ok(())
            },
            other => {
                self.state = other;
                Err(ProtocolViolationKind::SyncDataWithoutSession { sender })
            },
        }
    }

    /// The full state is in place; wait for the listed peers to confirm.
    pub fn confirming(&mut self, confirm_sync_id: Option<SyncId>, pending: &[PeerId]) {
        self.state = match std::mem::take(&mut self.state) {
            ResyncState::Locked(mut session)
            | ResyncState::ApplyingSnapshot(mut session)
            | ResyncState::ConfirmingRecovery(mut session) => {
                session.confirm_sync_id = confirm_sync_id.or(session.confirm_sync_id);
                session.pending_confirmation = pending.iter().copied().collect();
                ResyncState::ConfirmingRecovery(session)
            },
            other => {
                tracing::warn!(phase = ?other.phase(), "confirmation requested outside of a recovery");
                other
            },
        };
    }

    /// `peer` confirmed the recovery.
    pub fn confirmed(&mut self, peer: PeerId) {
        if let Some(session) = self.state.session_mut() {
            session.pending_confirmation.retain(|p| *p != peer);
        }
    }

    /// `peer` left the session and can no longer confirm anything.
    pub fn remove_peer(&mut self, peer: PeerId) {
        self.confirmed(peer);
    }

    /// Completes the recovery. Returns how long it took, or `None` if no recovery
    /// was waiting for confirmation.
    pub fn finish(&mut self) -> Option<Duration> {
        match std::mem::take(&mut self.state) {
            ResyncState::ConfirmingRecovery(session) => Some(session.elapsed()),
            other => {
                self.state = other;
                None
            },
        }
    }

    /// Marks the recovery as failed. The gate is left as it is.
    pub fn fail(&mut self, reason: ResyncFailure) {
        self.state = ResyncState::Failed(reason);
    }

    /// If an unfinished recovery has run for `timeout` or longer, returns the peers it is
    /// still waiting for.
    #[must_use]
    pub fn overdue(&self, timeout: Duration) -> Option<Vec<PeerId>> {
        let session = self.state.session()?;
        (session.elapsed() >= timeout).then(|| session.pending_confirmation.to_vec())
    }

    /// Unlocks the gate and returns the deferred messages, oldest first.
    pub fn unlock_gate(&mut self) -> Vec<DeferredMessage> {
        self.gate.unlock()
    }

    /// Returns `true` while a recovery (or its failure) holds the session.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.state.phase().is_active()
    }

    /// The current state.
    #[must_use]
    pub const fn state(&self) -> &ResyncState {
        &self.state
    }

    /// The current phase.
    #[must_use]
    pub const fn phase(&self) -> ResyncPhase {
        self.state.phase()
    }

    /// The message gate.
    #[must_use]
    pub const fn gate(&self) -> &MessageGate {
        &self.gate
    }

    /// The message gate, mutably.
    pub fn gate_mut(&mut self) -> &mut MessageGate {
        &mut self.gate
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
    use crate::Tick;

    const AUTHORITY: PeerId = PeerId::new(1);
    const PEER: PeerId = PeerId::new(2);

    // ========================================================================
    // Session lifecycle
    // ========================================================================

    #[test]
    fn local_trigger_then_own_request_joins() {
        let mut r = Resyncer::new();
        assert!(r.begin(AUTHORITY));
        assert_eq!(r.phase(), ResyncPhase::AwaitingLock);
        assert!(!r.gate().is_locked());
        assert_eq!(r.lock(AUTHORITY), LockOutcome::Joined);
        assert_eq!(r.phase(), ResyncPhase::Locked);
        assert!(r.gate().is_locked());
    }

    #[test]
    fn remote_request_starts_session() {
        let mut r = Resyncer::new();
        assert_eq!(r.lock(AUTHORITY), LockOutcome::Started);
        assert_eq!(r.state().session().unwrap().initiator(), AUTHORITY);
        assert!(r.gate().is_locked());
    }

    #[test]
    fn second_trigger_is_coalesced() {
        let mut r = Resyncer::new();
        assert!(r.begin(PEER));
        assert!(!r.begin(AUTHORITY));
        r.lock(PEER);
        assert!(!r.begin(AUTHORITY));
        assert_eq!(r.state().session().unwrap().initiator(), PEER);
    }

    #[test]
    fn request_after_lock_is_coalesced_without_relocking() {
        let mut r = Resyncer::new();
        r.lock(AUTHORITY);
        r.start_apply(AUTHORITY, AUTHORITY).unwrap();
        r.confirming(None, &[AUTHORITY]);
        r.unlock_gate();
        assert_eq!(r.lock(PEER), LockOutcome::Coalesced);
        assert!(!r.gate().is_locked());
        assert_eq!(r.phase(), ResyncPhase::ConfirmingRecovery);
    }

    #[test]
    fn full_cycle_returns_to_not_syncing() {
        let mut r = Resyncer::new();
        r.lock(AUTHORITY);
        r.start_apply(AUTHORITY, AUTHORITY).unwrap();
        assert_eq!(r.phase(), ResyncPhase::ApplyingSnapshot);
        r.confirming(Some(SyncId::new(4)), &[AUTHORITY]);
        assert_eq!(
            r.state().session().unwrap().confirm_sync_id(),
            Some(SyncId::new(4))
        );
        r.unlock_gate();
        assert!(r.finish().is_some());
        assert_eq!(r.phase(), ResyncPhase::NotSyncing);
        assert!(r.begin(PEER));
    }

    // ========================================================================
    // Protocol errors
    // ========================================================================

    #[test]
    fn sync_data_without_session_is_rejected() {
        let mut r = Resyncer::new();
        assert_eq!(
            r.start_apply(AUTHORITY, AUTHORITY),
            Err(ProtocolViolationKind::SyncDataWithoutSession { sender: AUTHORITY })
        );
        assert_eq!(r.phase(), ResyncPhase::NotSyncing);
    }

    #[test]
    fn sync_data_from_non_authority_is_rejected() {
        let mut r = Resyncer::new();
        r.lock(AUTHORITY);
        assert_eq!(
            r.start_apply(PEER, AUTHORITY),
            Err(ProtocolViolationKind::SyncDataFromNonAuthority { sender: PEER })
        );
        assert_eq!(r.phase(), ResyncPhase::Locked);
    }

    #[test]
    fn finish_outside_confirmation_is_none() {
        let mut r = Resyncer::new();
        assert!(r.finish().is_none());
        r.lock(AUTHORITY);
        assert!(r.finish().is_none());
        assert_eq!(r.phase(), ResyncPhase::Locked);
    }

    #[test]
    fn failure_keeps_gate_locked_and_blocks_new_sessions() {
        let mut r = Resyncer::new();
        r.lock(AUTHORITY);
        r.start_apply(AUTHORITY, AUTHORITY).unwrap();
        r.fail(ResyncFailure::LoadFailed {
            tick: Tick::new(3),
            message: "bad".into(),
        });
        assert_eq!(r.phase(), ResyncPhase::Failed);
        assert!(r.gate().is_locked());
        assert!(!r.begin(PEER));
        assert!(r.overdue(Duration::ZERO).is_none());
    }

    #[test]
    fn confirmation_tracking() {
        let mut r = Resyncer::new();
        r.begin(AUTHORITY);
        r.lock(AUTHORITY);
        r.record_snapshot(SimulationSnapshot::new(Tick::new(9), vec![1]));
        r.confirming(Some(SyncId::new(1)), &[PeerId::new(2), PeerId::new(3)]);
        r.confirmed(PeerId::new(2));
        r.remove_peer(PeerId::new(3));
        let session = r.state().session().unwrap();
        assert!(session.pending_confirmation().is_empty());
        assert_eq!(session.snapshot().unwrap().tick(), Tick::new(9));
    }

    #[test]
    fn overdue_reports_pending_peers() {
        let mut r = Resyncer::new();
        r.lock(AUTHORITY);
        r.confirming(None, &[AUTHORITY]);
        assert_eq!(r.overdue(Duration::ZERO), Some(vec![AUTHORITY]));
        assert!(r.overdue(Duration::from_secs(3_600)).is_none());
    }
}
