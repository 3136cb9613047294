//! The single entry point the host drives.
//!
//! [`SyncCoordinator`] owns the checker, the resyncer (and through it the
//! message gate) and the outstanding sync check round. The host feeds it
//! advance ticks and inbound messages; it answers through the [`Transport`]
//! and reports progress as [`SyncEvent`]s.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use crate::error::ProtocolViolationKind;
use crate::network::codec::decode_message;
use crate::resyncer::{LockOutcome, Resyncer};
use crate::sessions::config::SynchronizerConfig;
use crate::sessions::event_drain::EventDrain;
use crate::sync_checker::{Comparison, PendingCheck};
use crate::telemetry::{SyncViolation, ViolationKind, ViolationObserver, ViolationSeverity};
use crate::{
    sync_violation, DeferredMessage, DivergenceReport, EvidenceSink, Fingerprint, MessageKind,
    PeerId, ResyncFailure, ResyncPhase, ResyncState, Role, RoundOutcome, Simulation,
    SimulationSnapshot, SnapshotLog, SyncChecker, SyncCheckRound, SyncError, SyncEvent, SyncId,
    SyncMessage, Tick, Transport,
};

/// Orchestrates sync checks and recoveries for one peer.
///
/// Built with [`SynchronizerBuilder`](crate::SynchronizerBuilder). All methods run
/// synchronously on the caller's thread. Only [`SyncError::ResyncFailed`] is ever
/// returned from the entry points; every other problem is reported to the
/// violation observer and absorbed.
pub struct SyncCoordinator<S: Simulation, T: Transport> {
    local: PeerId,
    role: Role,
    authority: PeerId,
    members: BTreeSet<PeerId>,
    config: SynchronizerConfig,
    simulation: S,
    transport: T,
    checker: SyncChecker,
    resyncer: Resyncer,
    current_round: Option<SyncCheckRound>,
    last_tick: Tick,
    events: VecDeque<SyncEvent>,
    observer: Arc<dyn ViolationObserver>,
    evidence: Box<dyn EvidenceSink>,
}

/// Everything the builder hands over.
pub(crate) struct CoordinatorParts<S, T> {
    pub local: PeerId,
    pub role: Role,
    pub authority: PeerId,
    pub members: BTreeSet<PeerId>,
    pub config: SynchronizerConfig,
    pub simulation: S,
    pub transport: T,
    pub observer: Arc<dyn ViolationObserver>,
    pub evidence: Box<dyn EvidenceSink>,
}

impl<S: Simulation, T: Transport> SyncCoordinator<S, T> {
    pub(crate) fn from_parts(parts: CoordinatorParts<S, T>) -> Self {
        let checker = SyncChecker::new(
            parts.role,
            parts.config.check_interval,
            parts.config.check_offset,
            parts.config.snapshot_log_capacity,
            parts.config.tick_mismatch_timeout_ticks,
        );
        let last_tick = parts.simulation.current_advance_tick();
        Self {
            local: parts.local,
            role: parts.role,
            authority: parts.authority,
            members: parts.members,
            events: VecDeque::with_capacity(parts.config.max_event_queue_size.min(64)),
            config: parts.config,
            simulation: parts.simulation,
            transport: parts.transport,
            checker,
            resyncer: Resyncer::new(),
            current_round: None,
            last_tick,
            observer: parts.observer,
            evidence: parts.evidence,
        }
    }

    // #############
    // # TICKS     #
    // #############

    /// Called by the host after the simulation advanced to `tick`.
    ///
    /// Runs the cadence check, retries fingerprints that arrived early and
    /// enforces the ack timeout. The host must not advance ticks while a
    /// recovery is in progress; ticks fed anyway are ignored and reported.
    pub fn on_advance_tick(&mut self, tick: Tick) -> Result<(), SyncError> {
        match self.resyncer.phase() {
            ResyncPhase::NotSyncing => {},
            ResyncPhase::Failed => return Ok(()),
            phase => {
                self.report(
                    sync_violation!(
                        ViolationSeverity::Warning,
                        ViolationKind::Configuration,
                        "advance tick fed during recovery ({:?}); ignored",
                        phase
                    )
                    .with_tick(tick),
                );
                return Ok(());
            },
        }
        self.last_tick = tick;

        if self.checker.is_due(tick) {
            match self.checker.capture(&mut self.simulation, tick) {
                Ok((_, fingerprint)) if self.role.is_authority() => {
                    self.start_round(tick, fingerprint)?;
                },
                Ok(_) => {},
                Err(err) => self.absorb(err, None)?,
            }
        }

        if self.role.is_authority() {
            self.check_ack_timeout(tick)
        } else {
            for resolved in self.checker.retry_pending(tick) {
                if resolved.timed_out {
                    tracing::warn!(
                        sync_id = %resolved.check.sync_id,
                        tick = %resolved.check.tick,
                        "local simulation never reached the checked tick"
                    );
                }
                self.answer(&resolved.check, resolved.comparison);
            }
            Ok(())
        }
    }

    fn start_round(&mut self, tick: Tick, fingerprint: Fingerprint) -> Result<(), SyncError> {
        if let Some(round) = &self.current_round {
            tracing::debug!(
                outstanding = %round.sync_id(),
                %tick,
                "previous sync check not retired; skipping cadence check"
            );
            return Ok(());
        }
        let sync_id = match self.checker.begin_round() {
            Ok(sync_id) => sync_id,
            Err(err) => return self.absorb(err, None),
        };
        let mut round = SyncCheckRound::new(
            sync_id,
            tick,
            fingerprint,
            false,
            self.members.iter().copied(),
            tick,
        );
        if let Err(err) = round.record(self.local, true, None) {
            return self.absorb(err, None);
        }
        tracing::debug!(%sync_id, %tick, %fingerprint, "broadcasting sync check");
        self.transport.broadcast(&SyncMessage::SyncCheckBroadcast {
            sync_id,
            tick,
            fingerprint,
            complete: false,
        });
        self.current_round = Some(round);
        self.settle_round()
    }

    fn check_ack_timeout(&mut self, now: Tick) -> Result<(), SyncError> {
        let timeout = self.config.ack_timeout_ticks;
        let Some(round) = self.current_round.as_mut() else {
            return Ok(());
        };
        if round.is_complete_check() || round.age(now) <= timeout {
            return Ok(());
        }
        let missing = round.expire();
        let answered_no = round
            .disagreeing()
            .iter()
            .any(|peer| !missing.contains(peer));
        let (sync_id, tick) = (round.sync_id(), round.tick());

        self.report(
            sync_violation!(
                ViolationSeverity::Warning,
                ViolationKind::Timeout,
                "peers {:?} did not answer sync check {} within {} ticks",
                missing,
                sync_id,
                timeout
            )
            .with_tick(tick),
        );
        self.push_event(SyncEvent::AckTimeout {
            sync_id,
            tick,
            missing,
        });

        if self.config.resync_on_ack_timeout || answered_no {
            self.settle_round()
        } else {
            self.current_round = None;
            self.checker.retire_round();
            Ok(())
        }
    }

    // #############
    // # MESSAGES  #
    // #############

    /// Returns `true` if a message of `kind` may be processed right now.
    ///
    /// While the gate is locked only the exempt sync kinds pass; everything else
    /// is deferred by [`SyncCoordinator::on_message`].
    #[must_use]
    pub fn accept_message(&self, kind: MessageKind) -> bool {
        !self.resyncer.gate().is_locked() || kind.is_exempt_while_locked()
    }

    /// Entry point for every inbound message, sync or not.
    ///
    /// Ordinary messages are dispatched to the simulation, or deferred while the
    /// gate is locked. Sync messages are decoded and handled.
    pub fn on_message(
        &mut self,
        kind: MessageKind,
        raw: &[u8],
        sender: PeerId,
    ) -> Result<(), SyncError> {
        if !self.accept_message(kind) {
            self.defer(kind, raw.to_vec(), sender);
            return Ok(());
        }
        self.process(kind, raw, sender)
    }

    fn process(&mut self, kind: MessageKind, raw: &[u8], sender: PeerId) -> Result<(), SyncError> {
        if let MessageKind::Game(message_id) = kind {
            self.simulation.dispatch(message_id, raw, sender);
            return Ok(());
        }
        match decode_message(kind, raw) {
            Ok(message) => self.handle_message(message, sender),
            Err(SyncError::Codec { source }) => {
                self.report(
                    SyncViolation::from_error(
                        &ProtocolViolationKind::MalformedPayload { kind, sender }.into(),
                        concat!(file!(), ":", line!()),
                    )
                    .with_peer(sender)
                    .with_context("codec", source.to_string()),
                );
                Ok(())
            },
            Err(err) => self.absorb(err, Some(sender)),
        }
    }

    fn defer(&mut self, kind: MessageKind, raw: Vec<u8>, sender: PeerId) {
        let message = DeferredMessage {
            kind,
            raw,
            sender,
            receiver: self.local,
            arrival_tick: self.simulation.current_advance_tick(),
        };
        self.resyncer.gate_mut().enqueue_if_locked(message);
        let delayed = self.resyncer.gate().delayed_count();
        let threshold = self.config.gate_warning_threshold;
        if threshold > 0 && delayed % threshold == 0 {
            self.report(sync_violation!(
                ViolationSeverity::Warning,
                ViolationKind::MessageGate,
                "{} messages deferred while resynchronizing",
                delayed
            ));
        }
    }

    /// Handles an already decoded sync message.
    ///
    /// Does not consult the gate: callers that decode at the transport boundary
    /// must check [`SyncCoordinator::accept_message`] first.
    pub fn handle_message(&mut self, message: SyncMessage, sender: PeerId) -> Result<(), SyncError> {
        match message {
            SyncMessage::SyncCheckBroadcast {
                sync_id,
                tick,
                fingerprint,
                complete,
            } => {
                self.on_sync_check_broadcast(sync_id, tick, fingerprint, complete, sender);
                Ok(())
            },
            SyncMessage::SyncCheckAck {
                sync_id,
                agreed,
                evidence,
            } => self.on_sync_check_ack(sync_id, agreed, evidence, sender),
            SyncMessage::RequestSync => self.on_resync_request(sender),
            SyncMessage::SyncData { tick, payload } => self.on_resync_data(tick, payload, sender),
            SyncMessage::UnlockGame => self.on_resync_unlock(sender),
        }
    }

    // #############
    // # CHECKS    #
    // #############

    /// (Peer) Compares the authority's fingerprint against local state and sends
    /// the acknowledgement.
    ///
    /// Returns the acknowledgement that was sent, or `None` if the check was
    /// buffered (tick not reached yet) or discarded.
    pub fn on_sync_check_broadcast(
        &mut self,
        sync_id: SyncId,
        tick: Tick,
        fingerprint: Fingerprint,
        complete: bool,
        sender: PeerId,
    ) -> Option<SyncMessage> {
        if self.role.is_authority() {
            let err: SyncError = ProtocolViolationKind::BroadcastAtAuthority { sender }.into();
            self.report_error(&err, Some(sender));
            return None;
        }
        if sender != self.authority {
            let err: SyncError = ProtocolViolationKind::BroadcastFromNonAuthority { sender }.into();
            self.report_error(&err, Some(sender));
            return None;
        }
        let check = PendingCheck {
            sync_id,
            tick,
            fingerprint,
            complete,
            received_at: self.simulation.current_advance_tick(),
        };
        match self.resyncer.phase() {
            ResyncPhase::Failed => {
                return self.answer(
                    &check,
                    Comparison::Diverged {
                        local: None,
                        evidence: None,
                    },
                );
            },
            phase if phase.is_active() && !complete => {
                tracing::debug!(%sync_id, "ignoring cadence check during recovery");
                return None;
            },
            _ => {},
        }
        let local_tick = check.received_at;
        match self.checker.compare(check.clone(), local_tick) {
            Comparison::Deferred(err) => {
                self.report(
                    SyncViolation::from_error(&err, concat!(file!(), ":", line!()))
                        .with_tick(tick)
                        .with_peer(sender),
                );
                None
            },
            comparison => self.answer(&check, comparison),
        }
    }

    fn answer(&mut self, check: &PendingCheck, comparison: Comparison) -> Option<SyncMessage> {
        let (agreed, evidence) = match comparison {
            Comparison::Agreed => (true, None),
            Comparison::Diverged { local, evidence } => {
                tracing::warn!(
                    sync_id = %check.sync_id,
                    tick = %check.tick,
                    authority = %check.fingerprint,
                    local = ?local,
                    "local state diverged from the authority"
                );
                self.push_event(SyncEvent::LocalDivergence {
                    sync_id: check.sync_id,
                    tick: check.tick,
                    local,
                    authority: check.fingerprint,
                });
                let evidence = if self.config.send_evidence {
                    evidence.map(|snapshot| snapshot.bytes().to_vec())
                } else {
                    None
                };
                (false, evidence)
            },
            Comparison::TickMismatch(err) => {
                self.report_error(&err, Some(self.authority));
                (false, None)
            },
            Comparison::Deferred(_) => return None,
        };
        let ack = SyncMessage::SyncCheckAck {
            sync_id: check.sync_id,
            agreed,
            evidence,
        };
        self.transport.send_to(self.authority, &ack);
        Some(ack)
    }

    /// (Authority) Records an acknowledgement and settles the round once every
    /// peer answered.
    pub fn on_sync_check_ack(
        &mut self,
        sync_id: SyncId,
        agreed: bool,
        evidence: Option<Vec<u8>>,
        sender: PeerId,
    ) -> Result<(), SyncError> {
        if !self.role.is_authority() {
            return self.absorb(
                ProtocolViolationKind::AckAtNonAuthority { sender }.into(),
                Some(sender),
            );
        }
        let Some(round) = self
            .current_round
            .as_mut()
            .filter(|round| round.sync_id() == sync_id)
        else {
            return self.absorb(SyncError::StaleAck { sync_id, sender }, Some(sender));
        };
        if let Err(err) = round.record(sender, agreed, evidence.clone()) {
            return self.absorb(err, Some(sender));
        }
        let (tick, fingerprint, complete) =
            (round.tick(), round.fingerprint(), round.is_complete_check());

        if agreed {
            tracing::debug!(%sync_id, peer = %sender, "peer agreed");
            if complete {
                self.resyncer.confirmed(sender);
            }
        } else {
            self.record_evidence(sync_id, tick, fingerprint, sender, evidence.as_deref());
        }
        self.settle_round()
    }

    fn record_evidence(
        &mut self,
        sync_id: SyncId,
        tick: Tick,
        fingerprint: Fingerprint,
        peer: PeerId,
        evidence: Option<&[u8]>,
    ) {
        let Some(authority) = self.checker.log().retrieve(tick) else {
            tracing::debug!(%tick, %peer, "authority snapshot evicted; no divergence report");
            return;
        };
        let report = DivergenceReport::compare(sync_id, peer, authority, fingerprint, evidence);
        self.evidence.record(&report, authority.bytes(), evidence);
    }

    fn settle_round(&mut self) -> Result<(), SyncError> {
        let Some(round) = self.current_round.as_ref() else {
            return Ok(());
        };
        let (sync_id, tick, complete) = (round.sync_id(), round.tick(), round.is_complete_check());
        match round.outcome() {
            RoundOutcome::Pending => Ok(()),
            RoundOutcome::Agreed => {
                self.current_round = None;
                self.checker.retire_round();
                if complete {
                    self.finish_recovery()
                } else {
                    tracing::debug!(%sync_id, %tick, "sync check passed");
                    self.push_event(SyncEvent::SyncCheckPassed { sync_id, tick });
                    Ok(())
                }
            },
            RoundOutcome::Diverged(peers) => {
                self.current_round = None;
                self.checker.retire_round();
                tracing::warn!(%sync_id, %tick, ?peers, "sync check found diverged peers");
                self.push_event(SyncEvent::DivergenceDetected {
                    sync_id,
                    tick,
                    peers: peers.clone(),
                });
                if complete {
                    self.fail(ResyncFailure::StillDiverged { sync_id, peers })
                } else {
                    self.trigger_resync()
                }
            },
        }
    }

    // #############
    // # RECOVERY  #
    // #############

    /// Starts a recovery, or does nothing if one is already in progress.
    ///
    /// Broadcasts `RequestSync` and handles the local copy in-line, which locks
    /// the gate. The host must stop advancing ticks until [`SyncEvent::GameUnlocked`].
    pub fn trigger_resync(&mut self) -> Result<(), SyncError> {
        if !self.resyncer.begin(self.local) {
            tracing::debug!(phase = ?self.resyncer.phase(), "resync already in progress; coalesced");
            return Ok(());
        }
        tracing::info!(peer = %self.local, "requesting resync");
        self.transport.broadcast(&SyncMessage::RequestSync);
        self.on_resync_request(self.local)
    }

    /// Handles a `RequestSync` from `sender` (possibly the local peer).
    ///
    /// Locks the gate and, at the authority, captures and distributes the full state.
    pub fn on_resync_request(&mut self, sender: PeerId) -> Result<(), SyncError> {
        let outcome = self.resyncer.lock(sender);
        if outcome == LockOutcome::Coalesced {
            tracing::debug!(%sender, "resync request folded into the running recovery");
            return Ok(());
        }
        self.current_round = None;
        self.checker.reset();
        tracing::info!(initiator = %sender, "resynchronizing");
        self.push_event(SyncEvent::Resynchronizing { initiator: sender });

        if !self.role.is_authority() {
            return Ok(());
        }
        if outcome == LockOutcome::Started {
            // relay, so every peer has a request from the authority ahead of its state
            self.transport.broadcast(&SyncMessage::RequestSync);
        }
        self.send_full_state()
    }

    fn send_full_state(&mut self) -> Result<(), SyncError> {
        let tick = self.simulation.current_advance_tick();
        let (snapshot, fingerprint) = match self.checker.capture(&mut self.simulation, tick) {
            Ok(captured) => captured,
            Err(err) => {
                self.report_error(&err, None);
                return self.fail(ResyncFailure::CaptureFailed { tick });
            },
        };
        self.resyncer.record_snapshot(snapshot.clone());
        tracing::info!(%tick, len = snapshot.len(), "distributing full state");
        self.transport.broadcast(&SyncMessage::SyncData {
            tick,
            payload: snapshot.bytes().to_vec(),
        });

        let apply_own = self.config.apply_own_sync_data;
        if apply_own {
            if let Err(kind) = self.resyncer.start_apply(self.local, self.authority) {
                return self.absorb(kind.into(), None);
            }
            if let Err(err) = self.simulation.load_full_state(&snapshot) {
                return self.fail(ResyncFailure::LoadFailed {
                    tick,
                    message: err.to_string(),
                });
            }
        }

        let sync_id = match self.checker.begin_round() {
            Ok(sync_id) => sync_id,
            Err(err) => return self.absorb(err, None),
        };
        let mut round = SyncCheckRound::new(
            sync_id,
            tick,
            fingerprint,
            true,
            self.members.iter().copied(),
            self.last_tick,
        );
        let remote: Vec<PeerId> = self
            .members
            .iter()
            .copied()
            .filter(|peer| *peer != self.local)
            .collect();
        self.resyncer.confirming(Some(sync_id), &remote);
        self.transport.broadcast(&SyncMessage::SyncCheckBroadcast {
            sync_id,
            tick,
            fingerprint,
            complete: true,
        });

        let self_agreed = if apply_own {
            let reloaded = self.simulation.capture_snapshot();
            SnapshotLog::fingerprint_of(&reloaded).is_ok_and(|fp| fp == fingerprint)
        } else {
            true
        };
        if let Err(err) = round.record(self.local, self_agreed, None) {
            return self.absorb(err, None);
        }
        self.current_round = Some(round);

        self.release_gate()?;
        self.settle_round()
    }

    /// (Peer) Loads the authority's full state and releases the deferred messages.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ResyncFailed`] if the simulation rejects the state. The
    /// gate then stays locked: resuming dispatch on an unknown state is unsafe.
    pub fn on_resync_data(
        &mut self,
        tick: Tick,
        payload: Vec<u8>,
        sender: PeerId,
    ) -> Result<(), SyncError> {
        if let Err(kind) = self.resyncer.start_apply(sender, self.authority) {
            return self.absorb(kind.into(), Some(sender));
        }
        let snapshot = SimulationSnapshot::new(tick, payload);
        if let Err(err) = self.simulation.load_full_state(&snapshot) {
            return self.fail(ResyncFailure::LoadFailed {
                tick,
                message: err.to_string(),
            });
        }
        tracing::info!(%tick, len = snapshot.len(), "loaded authority state");

        // confirmation capture happens before any deferred message touches the state
        if let Err(err) = self.checker.capture(&mut self.simulation, tick) {
            self.report_error(&err, None);
        }
        self.resyncer.confirming(None, &[self.authority]);
        self.release_gate()
    }

    /// Completes the recovery once the authority confirms every peer agreed.
    pub fn on_resync_unlock(&mut self, sender: PeerId) -> Result<(), SyncError> {
        if sender != self.authority {
            return self.absorb(
                ProtocolViolationKind::UnlockFromNonAuthority { sender }.into(),
                Some(sender),
            );
        }
        let Some(elapsed) = self.resyncer.finish() else {
            return self.absorb(
                ProtocolViolationKind::UnlockWithoutSession { sender }.into(),
                Some(sender),
            );
        };
        tracing::info!(elapsed_ms = elapsed.as_millis(), "resync completed");
        self.push_event(SyncEvent::ResyncCompleted {
            elapsed_ms: elapsed.as_millis(),
        });
        self.push_event(SyncEvent::GameUnlocked);
        Ok(())
    }

    fn finish_recovery(&mut self) -> Result<(), SyncError> {
        self.transport.broadcast(&SyncMessage::UnlockGame);
        self.on_resync_unlock(self.local)
    }

    /// Redelivers deferred messages one at a time. Stops and re-queues the rest
    /// if a delivery locks the gate again.
    fn release_gate(&mut self) -> Result<(), SyncError> {
        let mut drained: VecDeque<DeferredMessage> = self.resyncer.unlock_gate().into();
        while let Some(message) = drained.pop_front() {
            let result = self.process(message.kind, &message.raw, message.sender);
            if result.is_err() || self.resyncer.gate().is_locked() {
                self.resyncer.gate_mut().restore_front(Vec::from(drained));
                return result;
            }
        }
        Ok(())
    }

    fn fail(&mut self, reason: ResyncFailure) -> Result<(), SyncError> {
        tracing::error!(%reason, "resync failed");
        self.resyncer.fail(reason.clone());
        self.current_round = None;
        self.push_event(SyncEvent::ResyncFailed {
            reason: reason.clone(),
        });
        let err = SyncError::ResyncFailed { reason };
        self.report_error(&err, None);
        Err(err)
    }

    /// Checks the wall-clock recovery timeout. Call regularly while a recovery runs.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ResyncFailed`] once a recovery exceeds
    /// [`SynchronizerConfig::confirmation_timeout`].
    pub fn poll(&mut self) -> Result<(), SyncError> {
        let Some(mut pending) = self.resyncer.overdue(self.config.confirmation_timeout) else {
            return Ok(());
        };
        if let Some(round) = self.current_round.as_ref().filter(|r| r.is_complete_check()) {
            pending = round.pending();
        }
        if pending.is_empty() && !self.role.is_authority() {
            pending.push(self.authority);
        }
        self.report(sync_violation!(
            ViolationSeverity::Error,
            ViolationKind::Timeout,
            "recovery not confirmed within {:?}",
            self.config.confirmation_timeout
        ));
        self.fail(ResyncFailure::ConfirmationTimedOut { pending })
    }

    // #############
    // # MEMBERS   #
    // #############

    /// Adds a peer to the session. It takes part from the next round on.
    pub fn add_peer(&mut self, peer: PeerId) {
        if self.members.insert(peer) {
            tracing::info!(%peer, "peer joined");
        }
    }

    /// Removes a peer. Rounds and recoveries stop waiting for it.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ResyncFailed`] if the removal settles a confirmation
    /// round that still disagrees.
    pub fn remove_peer(&mut self, peer: PeerId) -> Result<(), SyncError> {
        if peer == self.local || !self.members.remove(&peer) {
            return Ok(());
        }
        tracing::info!(%peer, "peer left");
        if peer == self.authority {
            self.report(
                sync_violation!(
                    ViolationSeverity::Error,
                    ViolationKind::Configuration,
                    "the authority left the session"
                )
                .with_peer(peer),
            );
        }
        self.resyncer.remove_peer(peer);
        if let Some(round) = self.current_round.as_mut() {
            if round.remove_peer(peer) {
                return self.settle_round();
            }
        }
        Ok(())
    }

    // #############
    // # EVENTS    #
    // #############

    /// Drains the queued events.
    pub fn events(&mut self) -> EventDrain<'_> {
        EventDrain::from_drain(self.events.drain(..))
    }

    fn push_event(&mut self, event: SyncEvent) {
        self.events.push_back(event);
        while self.events.len() > self.config.max_event_queue_size {
            self.events.pop_front();
        }
    }

    fn report(&self, violation: SyncViolation) {
        self.observer.on_violation(&violation);
    }

    fn report_error(&self, err: &SyncError, peer: Option<PeerId>) {
        let mut violation = SyncViolation::from_error(err, concat!(file!(), ":", line!()))
            .with_tick(self.last_tick);
        if let Some(peer) = peer {
            violation = violation.with_peer(peer);
        }
        self.report(violation);
    }

    /// Reports a non-fatal error and swallows it; passes a fatal one through.
    fn absorb(&self, err: SyncError, peer: Option<PeerId>) -> Result<(), SyncError> {
        self.report_error(&err, peer);
        if err.is_fatal() {
            Err(err)
        } else {
            Ok(())
        }
    }

    // #############
    // # ACCESSORS #
    // #############

    /// The local peer.
    #[must_use]
    pub const fn local_peer(&self) -> PeerId {
        self.local
    }

    /// The local role.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// The session authority.
    #[must_use]
    pub const fn authority(&self) -> PeerId {
        self.authority
    }

    /// Every member of the session, including the local peer.
    pub fn members(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.members.iter().copied()
    }

    /// The configuration in use.
    #[must_use]
    pub const fn config(&self) -> &SynchronizerConfig {
        &self.config
    }

    /// The simulation.
    #[must_use]
    pub const fn simulation(&self) -> &S {
        &self.simulation
    }

    /// The simulation, mutably. Do not load state through this while a recovery runs.
    pub fn simulation_mut(&mut self) -> &mut S {
        &mut self.simulation
    }

    /// The transport.
    #[must_use]
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// The transport, mutably.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// The recovery phase.
    #[must_use]
    pub const fn resync_phase(&self) -> ResyncPhase {
        self.resyncer.phase()
    }

    /// The full recovery state.
    #[must_use]
    pub const fn resync_state(&self) -> &ResyncState {
        self.resyncer.state()
    }

    /// Returns `true` while ordinary messages are deferred.
    #[must_use]
    pub const fn is_locked(&self) -> bool {
        self.resyncer.gate().is_locked()
    }

    /// Number of deferred messages.
    #[must_use]
    pub fn delayed_count(&self) -> usize {
        self.resyncer.gate().delayed_count()
    }

    /// The outstanding round (authority only).
    #[must_use]
    pub const fn current_round(&self) -> Option<&SyncCheckRound> {
        self.current_round.as_ref()
    }

    /// The sync checker.
    #[must_use]
    pub const fn checker(&self) -> &SyncChecker {
        &self.checker
    }
}

impl<S: Simulation, T: Transport> std::fmt::Debug for SyncCoordinator<S, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("local", &self.local)
            .field("role", &self.role)
            .field("authority", &self.authority)
            .field("members", &self.members)
            .field("phase", &self.resyncer.phase())
            .field(
                "current_round",
                &self.current_round.as_ref().map(SyncCheckRound::sync_id),
            )
            .field("delayed", &self.resyncer.gate().delayed_count())
            .field("queued_events", &self.events.len())
            .finish_non_exhaustive()
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
    use crate::network::codec::encode_message;
    use crate::telemetry::CollectingObserver;
    use crate::{CollectingEvidenceSink, LoadError, SynchronizerBuilder};

    const AUTHORITY: PeerId = PeerId::new(1);
    const PEER: PeerId = PeerId::new(2);
    const OTHER: PeerId = PeerId::new(3);

    #[derive(Debug, Default)]
    struct Sim {
        tick: Tick,
        state: Vec<u8>,
        dispatched: Vec<u32>,
        reject_loads: bool,
    }

    impl Sim {
        fn new(state: &[u8]) -> Self {
            Self {
                state: state.to_vec(),
                ..Self::default()
            }
        }
    }

    impl Simulation for Sim {
        fn capture_snapshot(&mut self) -> SimulationSnapshot {
            SimulationSnapshot::new(self.tick, self.state.clone())
        }
        fn load_full_state(&mut self, snapshot: &SimulationSnapshot) -> Result<(), LoadError> {
            if self.reject_loads {
                return Err(LoadError::new("rejected"));
            }
            self.state = snapshot.bytes().to_vec();
            self.tick = snapshot.tick();
            Ok(())
        }
        fn current_advance_tick(&self) -> Tick {
            self.tick
        }
        fn dispatch(&mut self, message_id: u32, _raw: &[u8], _sender: PeerId) {
            self.dispatched.push(message_id);
        }
    }

    #[derive(Debug, Default)]
    struct Outbox {
        sent: Vec<(Option<PeerId>, SyncMessage)>,
    }

    impl Outbox {
        fn broadcasts(&self) -> Vec<&SyncMessage> {
            self.sent
                .iter()
                .filter(|(to, _)| to.is_none())
                .map(|(_, m)| m)
                .collect()
        }
    }

    impl Transport for Outbox {
        fn send_to(&mut self, peer: PeerId, msg: &SyncMessage) {
            self.sent.push((Some(peer), msg.clone()));
        }
        fn broadcast(&mut self, msg: &SyncMessage) {
            self.sent.push((None, msg.clone()));
        }
    }

    fn authority_with(
        peers: &[PeerId],
        observer: Arc<CollectingObserver>,
    ) -> SyncCoordinator<Sim, Outbox> {
        let mut builder = SynchronizerBuilder::new(AUTHORITY, Role::Authority)
            .with_violation_observer(observer);
        for peer in peers {
            builder = builder.add_peer(*peer);
        }
        builder.start(Sim::new(b"world"), Outbox::default()).unwrap()
    }

    fn peer(observer: Arc<CollectingObserver>) -> SyncCoordinator<Sim, Outbox> {
        SynchronizerBuilder::new(PEER, Role::Peer)
            .with_authority(AUTHORITY)
            .with_violation_observer(observer)
            .start(Sim::new(b"world"), Outbox::default())
            .unwrap()
    }

    fn fp(bytes: &[u8]) -> Fingerprint {
        Fingerprint::of_bytes(bytes).unwrap()
    }

    // ========================================================================
    // Cadence
    // ========================================================================

    #[test]
    fn solo_authority_passes_immediately() {
        let observer = Arc::new(CollectingObserver::new());
        let mut c = authority_with(&[], observer.clone());
        c.on_advance_tick(Tick::ZERO).unwrap();
        let events: Vec<_> = c.events().collect();
        assert_eq!(
            events,
            vec![SyncEvent::SyncCheckPassed {
                sync_id: SyncId::new(1),
                tick: Tick::ZERO
            }]
        );
        assert!(c.current_round().is_none());
        assert!(observer.is_empty());
    }

    #[test]
    fn off_cadence_ticks_do_nothing() {
        let observer = Arc::new(CollectingObserver::new());
        let mut c = authority_with(&[PEER], observer);
        for t in 1..10 {
            c.simulation_mut().tick = Tick::new(t);
            c.on_advance_tick(Tick::new(t)).unwrap();
        }
        assert!(c.transport().sent.is_empty());
    }

    #[test]
    fn empty_authority_capture_skips_round() {
        let observer = Arc::new(CollectingObserver::new());
        let mut c = SynchronizerBuilder::new(AUTHORITY, Role::Authority)
            .add_peer(PEER)
            .with_violation_observer(observer.clone())
            .start(Sim::new(b""), Outbox::default())
            .unwrap();
        c.on_advance_tick(Tick::ZERO).unwrap();

        assert!(c.transport().sent.is_empty());
        assert!(c.current_round().is_none());
        assert_eq!(c.events().count(), 0);
        assert!(observer.has_violation(ViolationKind::InvalidSnapshot));
        assert!(observer.has_severity(ViolationSeverity::Warning));

        // a later capture with content opens the first round
        c.simulation_mut().state = b"world".to_vec();
        for t in 1..=10 {
            c.simulation_mut().tick = Tick::new(t);
            c.on_advance_tick(Tick::new(t)).unwrap();
        }
        assert_eq!(c.current_round().unwrap().sync_id(), SyncId::new(1));
        assert_eq!(c.transport().broadcasts().len(), 1);
    }

    #[test]
    fn stale_ack_is_info_violation() {
        let observer = Arc::new(CollectingObserver::new());
        let mut c = authority_with(&[PEER], observer.clone());
        c.on_sync_check_ack(SyncId::new(99), true, None, PEER).unwrap();
        assert!(observer.has_violation(ViolationKind::StaleAck));
        assert!(observer.has_severity(ViolationSeverity::Info));
    }

    #[test]
    fn ack_timeout_triggers_resync() {
        let observer = Arc::new(CollectingObserver::new());
        let mut c = authority_with(&[PEER], observer.clone());
        c.on_advance_tick(Tick::ZERO).unwrap();
        let limit = c.config().ack_timeout_ticks;
        for t in 1..=limit + 1 {
            c.simulation_mut().tick = Tick::new(t);
            c.on_advance_tick(Tick::new(t)).unwrap();
        }
        let events: Vec<_> = c.events().collect();
        assert!(events.iter().any(|e| matches!(
            e,
            SyncEvent::AckTimeout { missing, .. } if missing == &vec![PEER]
        )));
        assert!(events
            .iter()
            .any(|e| matches!(e, SyncEvent::Resynchronizing { .. })));
        assert!(observer.has_violation(ViolationKind::Timeout));
        assert_eq!(c.resync_phase(), ResyncPhase::ConfirmingRecovery);
    }

    // ========================================================================
    // Peer side
    // ========================================================================

    #[test]
    fn peer_acks_agreement() {
        let observer = Arc::new(CollectingObserver::new());
        let mut c = peer(observer);
        c.on_advance_tick(Tick::ZERO).unwrap();
        let ack = c
            .on_sync_check_broadcast(SyncId::new(1), Tick::ZERO, fp(b"world"), false, AUTHORITY)
            .unwrap();
        assert_eq!(
            ack,
            SyncMessage::SyncCheckAck {
                sync_id: SyncId::new(1),
                agreed: true,
                evidence: None
            }
        );
        assert_eq!(c.transport().sent, vec![(Some(AUTHORITY), ack)]);
    }

    #[test]
    fn peer_sends_evidence_on_disagreement() {
        let observer = Arc::new(CollectingObserver::new());
        let mut c = peer(observer);
        c.on_advance_tick(Tick::ZERO).unwrap();
        let ack = c
            .on_sync_check_broadcast(SyncId::new(1), Tick::ZERO, fp(b"other"), false, AUTHORITY)
            .unwrap();
        assert_eq!(
            ack,
            SyncMessage::SyncCheckAck {
                sync_id: SyncId::new(1),
                agreed: false,
                evidence: Some(b"world".to_vec())
            }
        );
        assert!(matches!(
            c.events().next(),
            Some(SyncEvent::LocalDivergence { .. })
        ));
    }

    #[test]
    fn broadcast_from_non_authority_is_discarded() {
        let observer = Arc::new(CollectingObserver::new());
        let mut c = peer(observer.clone());
        c.on_advance_tick(Tick::ZERO).unwrap();
        assert!(c
            .on_sync_check_broadcast(SyncId::new(1), Tick::ZERO, fp(b"world"), false, OTHER)
            .is_none());
        assert!(c.transport().sent.is_empty());
        assert!(observer.has_violation(ViolationKind::ProtocolViolation));
    }

    #[test]
    fn early_fingerprint_waits_for_tick() {
        let observer = Arc::new(CollectingObserver::new());
        let mut c = peer(observer.clone());
        c.simulation_mut().tick = Tick::new(8);
        c.on_advance_tick(Tick::new(8)).unwrap();
        assert!(c
            .on_sync_check_broadcast(SyncId::new(1), Tick::new(10), fp(b"world"), false, AUTHORITY)
            .is_none());
        assert!(observer.has_violation(ViolationKind::TickMismatch));

        for t in 9..=10 {
            c.simulation_mut().tick = Tick::new(t);
            c.on_advance_tick(Tick::new(t)).unwrap();
        }
        assert_eq!(
            c.transport().sent,
            vec![(
                Some(AUTHORITY),
                SyncMessage::SyncCheckAck {
                    sync_id: SyncId::new(1),
                    agreed: true,
                    evidence: None
                }
            )]
        );
    }

    #[test]
    fn check_for_uncaptured_past_tick_is_tick_mismatch() {
        let observer = Arc::new(CollectingObserver::new());
        let mut c = SynchronizerBuilder::new(PEER, Role::Peer)
            .with_authority(AUTHORITY)
            .with_config(SynchronizerConfig {
                check_offset: 3,
                ..SynchronizerConfig::default()
            })
            .with_violation_observer(observer.clone())
            .start(Sim::new(b"world"), Outbox::default())
            .unwrap();
        for t in 0..=13 {
            c.simulation_mut().tick = Tick::new(t);
            c.on_advance_tick(Tick::new(t)).unwrap();
        }

        // the authority checks tick 10; this peer captured 3 and 13
        let ack = c
            .on_sync_check_broadcast(SyncId::new(1), Tick::new(10), fp(b"world"), false, AUTHORITY)
            .unwrap();
        assert_eq!(
            ack,
            SyncMessage::SyncCheckAck {
                sync_id: SyncId::new(1),
                agreed: false,
                evidence: None
            }
        );
        assert_eq!(c.events().count(), 0);
        assert!(observer.has_violation(ViolationKind::TickMismatch));
        assert!(observer.has_severity(ViolationSeverity::Warning));
        assert_eq!(c.checker().pending_count(), 0);
    }

    #[test]
    fn sync_data_without_session_is_discarded() {
        let observer = Arc::new(CollectingObserver::new());
        let mut c = peer(observer.clone());
        c.on_resync_data(Tick::new(5), b"evil".to_vec(), AUTHORITY)
            .unwrap();
        assert_eq!(c.simulation().state, b"world".to_vec());
        assert!(observer.has_violation(ViolationKind::ProtocolViolation));
    }

    #[test]
    fn failed_load_keeps_gate_locked() {
        let observer = Arc::new(CollectingObserver::new());
        let mut c = peer(observer.clone());
        c.simulation_mut().reject_loads = true;
        c.on_resync_request(AUTHORITY).unwrap();
        let err = c
            .on_resync_data(Tick::new(5), b"state".to_vec(), AUTHORITY)
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(c.is_locked());
        assert_eq!(c.resync_phase(), ResyncPhase::Failed);
        assert!(observer.has_severity(ViolationSeverity::Critical));
    }

    // ========================================================================
    // Gate
    // ========================================================================

    #[test]
    fn game_messages_are_deferred_and_replayed_in_order() {
        let observer = Arc::new(CollectingObserver::new());
        let mut c = peer(observer);
        c.on_resync_request(AUTHORITY).unwrap();
        assert!(!c.accept_message(MessageKind::Game(1)));
        assert!(!c.accept_message(MessageKind::RequestSync));
        assert!(c.accept_message(MessageKind::SyncData));
        for id in [3, 1, 2] {
            c.on_message(MessageKind::Game(id), &[], OTHER).unwrap();
        }
        assert_eq!(c.delayed_count(), 3);
        assert!(c.simulation().dispatched.is_empty());

        let data = encode_message(&SyncMessage::SyncData {
            tick: Tick::new(20),
            payload: b"fixed".to_vec(),
        })
        .unwrap();
        c.on_message(MessageKind::SyncData, &data, AUTHORITY)
            .unwrap();
        assert!(!c.is_locked());
        assert_eq!(c.simulation().dispatched, vec![3, 1, 2]);
        assert_eq!(c.simulation().state, b"fixed".to_vec());
        assert_eq!(c.resync_phase(), ResyncPhase::ConfirmingRecovery);
    }

    #[test]
    fn gate_growth_warns_at_threshold() {
        let observer = Arc::new(CollectingObserver::new());
        let mut c = SynchronizerBuilder::new(PEER, Role::Peer)
            .with_authority(AUTHORITY)
            .with_config(SynchronizerConfig {
                gate_warning_threshold: 2,
                ..SynchronizerConfig::default()
            })
            .with_violation_observer(observer.clone())
            .start(Sim::new(b"w"), Outbox::default())
            .unwrap();
        c.on_resync_request(AUTHORITY).unwrap();
        for id in 0..5 {
            c.on_message(MessageKind::Game(id), &[], OTHER).unwrap();
        }
        assert_eq!(observer.violations_of_kind(ViolationKind::MessageGate).len(), 2);
    }

    #[test]
    fn malformed_sync_payload_is_absorbed() {
        let observer = Arc::new(CollectingObserver::new());
        let mut c = peer(observer.clone());
        c.on_message(MessageKind::SyncCheckAck, &[0xff], AUTHORITY)
            .unwrap();
        let violations = observer.violations_of_kind(ViolationKind::ProtocolViolation);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].context.contains_key("codec"));
    }

    // ========================================================================
    // Recovery (authority)
    // ========================================================================

    #[test]
    fn disagreement_triggers_single_resync() {
        let observer = Arc::new(CollectingObserver::new());
        let sink = CollectingEvidenceSink::new();
        let mut c = SynchronizerBuilder::new(AUTHORITY, Role::Authority)
            .add_peer(PEER)
            .add_peer(OTHER)
            .with_violation_observer(observer)
            .with_evidence_sink(sink.clone())
            .start(Sim::new(b"world"), Outbox::default())
            .unwrap();
        c.on_advance_tick(Tick::ZERO).unwrap();
        c.on_sync_check_ack(SyncId::new(1), false, Some(b"wOrld".to_vec()), PEER)
            .unwrap();
        assert!(c.current_round().is_some());
        c.on_sync_check_ack(SyncId::new(1), false, None, OTHER)
            .unwrap();
        // a second trigger while the first recovery runs is coalesced
        c.trigger_resync().unwrap();

        let requests = c
            .transport()
            .broadcasts()
            .into_iter()
            .filter(|m| **m == SyncMessage::RequestSync)
            .count();
        assert_eq!(requests, 1);
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.reports()[0].first_difference, Some(1));
        assert_eq!(c.resync_phase(), ResyncPhase::ConfirmingRecovery);
        assert!(c
            .transport()
            .broadcasts()
            .iter()
            .any(|m| matches!(m, SyncMessage::SyncData { .. })));
    }

    #[test]
    fn confirmation_round_unlocks_game() {
        let observer = Arc::new(CollectingObserver::new());
        let mut c = authority_with(&[PEER], observer);
        c.trigger_resync().unwrap();
        let confirm = c.resync_state().session().unwrap().confirm_sync_id().unwrap();
        c.on_sync_check_ack(confirm, true, None, PEER).unwrap();
        assert_eq!(c.resync_phase(), ResyncPhase::NotSyncing);
        assert_eq!(
            c.transport().broadcasts().last(),
            Some(&&SyncMessage::UnlockGame)
        );
        let events: Vec<_> = c.events().collect();
        assert!(events.contains(&SyncEvent::GameUnlocked));
    }

    #[test]
    fn confirmation_disagreement_is_fatal() {
        let observer = Arc::new(CollectingObserver::new());
        let mut c = authority_with(&[PEER], observer);
        c.trigger_resync().unwrap();
        let confirm = c.resync_state().session().unwrap().confirm_sync_id().unwrap();
        let err = c.on_sync_check_ack(confirm, false, None, PEER).unwrap_err();
        assert!(matches!(
            err,
            SyncError::ResyncFailed {
                reason: ResyncFailure::StillDiverged { .. }
            }
        ));
        assert_eq!(c.resync_phase(), ResyncPhase::Failed);
    }

    #[test]
    fn removing_silent_peer_settles_confirmation() {
        let observer = Arc::new(CollectingObserver::new());
        let mut c = authority_with(&[PEER, OTHER], observer);
        c.trigger_resync().unwrap();
        let confirm = c.resync_state().session().unwrap().confirm_sync_id().unwrap();
        c.on_sync_check_ack(confirm, true, None, PEER).unwrap();
        c.remove_peer(OTHER).unwrap();
        assert_eq!(c.resync_phase(), ResyncPhase::NotSyncing);
    }

    #[test]
    fn poll_times_out_confirmation() {
        let observer = Arc::new(CollectingObserver::new());
        let mut c = SynchronizerBuilder::new(AUTHORITY, Role::Authority)
            .add_peer(PEER)
            .with_config(SynchronizerConfig {
                confirmation_timeout: web_time::Duration::from_millis(1),
                ..SynchronizerConfig::default()
            })
            .with_violation_observer(observer)
            .start(Sim::new(b"world"), Outbox::default())
            .unwrap();
        c.trigger_resync().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let err = c.poll().unwrap_err();
        assert_eq!(
            err,
            SyncError::ResyncFailed {
                reason: ResyncFailure::ConfirmationTimedOut {
                    pending: vec![PEER]
                }
            }
        );
    }

    #[test]
    fn ticks_during_recovery_are_ignored() {
        let observer = Arc::new(CollectingObserver::new());
        let mut c = authority_with(&[PEER], observer.clone());
        c.trigger_resync().unwrap();
        let sent = c.transport().sent.len();
        c.on_advance_tick(Tick::new(10)).unwrap();
        assert_eq!(c.transport().sent.len(), sent);
        assert!(observer.has_violation(ViolationKind::Configuration));
    }

    #[test]
    fn event_queue_is_bounded() {
        let observer = Arc::new(CollectingObserver::new());
        let mut c = SynchronizerBuilder::new(AUTHORITY, Role::Authority)
            .with_config(SynchronizerConfig {
                check_interval: 2,
                max_event_queue_size: 4,
                ..SynchronizerConfig::default()
            })
            .with_violation_observer(observer)
            .start(Sim::new(b"world"), Outbox::default())
            .unwrap();
        for t in 0..20 {
            c.simulation_mut().tick = Tick::new(t);
            c.on_advance_tick(Tick::new(t)).unwrap();
        }
        let events: Vec<_> = c.events().collect();
        assert_eq!(events.len(), 4);
        assert_eq!(
            events[3],
            SyncEvent::SyncCheckPassed {
                sync_id: SyncId::new(10),
                tick: Tick::new(18)
            }
        );
    }
}
