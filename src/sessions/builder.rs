//! Builder for [`SyncCoordinator`](crate::SyncCoordinator).

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::sessions::coordinator::CoordinatorParts;
use crate::telemetry::{TracingObserver, ViolationObserver};
use crate::{
    EvidenceSink, InvalidConfigKind, PeerId, Role, Simulation, SyncCoordinator, SyncError,
    SynchronizerConfig, TracingEvidenceSink, Transport,
};

/// The [`SynchronizerBuilder`] assembles a [`SyncCoordinator`].
///
/// Name the local peer and its role, list the remote peers, optionally tune the
/// configuration and plug in observers, then call [`SynchronizerBuilder::start`].
///
/// # Examples
///
/// ```
/// use lockstep_resync::{PeerId, Role, SynchronizerBuilder, SynchronizerConfig};
///
/// let builder = SynchronizerBuilder::new(PeerId::new(2), Role::Peer)
///     .with_authority(PeerId::new(1))
///     .add_peer(PeerId::new(3))
///     .with_config(SynchronizerConfig::lan());
/// ```
#[must_use = "SynchronizerBuilder must be consumed by calling start()"]
pub struct SynchronizerBuilder {
    local: PeerId,
    role: Role,
    authority: Option<PeerId>,
    peers: BTreeSet<PeerId>,
    config: SynchronizerConfig,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
    evidence_sink: Option<Box<dyn EvidenceSink>>,
}

impl std::fmt::Debug for SynchronizerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynchronizerBuilder")
            .field("local", &self.local)
            .field("role", &self.role)
            .field("authority", &self.authority)
            .field("peers", &self.peers)
            .field("config", &self.config)
            .field("violation_observer", &self.violation_observer.is_some())
            .field("evidence_sink", &self.evidence_sink.is_some())
            .finish()
    }
}

impl SynchronizerBuilder {
    /// Starts a builder for `local` with the given role.
    ///
    /// An authority is its own authority; peers must name theirs with
    /// [`SynchronizerBuilder::with_authority`].
    pub fn new(local: PeerId, role: Role) -> Self {
        Self {
            local,
            role,
            authority: None,
            peers: BTreeSet::new(),
            config: SynchronizerConfig::default(),
            violation_observer: None,
            evidence_sink: None,
        }
    }

    /// Names the session authority.
    pub fn with_authority(mut self, authority: PeerId) -> Self {
        self.authority = Some(authority);
        self
    }

    /// Adds a remote peer. Adding the same peer twice has no effect.
    pub fn add_peer(mut self, peer: PeerId) -> Self {
        self.peers.insert(peer);
        self
    }

    /// Replaces the configuration. Validated in [`SynchronizerBuilder::start`].
    pub fn with_config(mut self, config: SynchronizerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets a custom violation observer.
    ///
    /// Every absorbed error and every warning condition (deferral growth,
    /// timeouts, ignored messages) is reported to it. Defaults to a
    /// [`TracingObserver`].
    ///
    /// # Example
    ///
    /// ```
    /// use std::sync::Arc;
    /// use lockstep_resync::{PeerId, Role, SynchronizerBuilder};
    /// use lockstep_resync::telemetry::CollectingObserver;
    ///
    /// let observer = Arc::new(CollectingObserver::new());
    /// let builder = SynchronizerBuilder::new(PeerId::new(1), Role::Authority)
    ///     .with_violation_observer(observer.clone());
    /// // after running the session: assert!(observer.is_empty());
    /// ```
    pub fn with_violation_observer(mut self, observer: Arc<dyn ViolationObserver>) -> Self {
        self.violation_observer = Some(observer);
        self
    }

    /// Sets where the authority sends divergence evidence. Defaults to a
    /// [`TracingEvidenceSink`].
    pub fn with_evidence_sink(mut self, sink: impl EvidenceSink + 'static) -> Self {
        self.evidence_sink = Some(Box::new(sink));
        self
    }

    /// Validates everything and builds the coordinator.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidConfig`] if the configuration is out of range,
    /// the local peer is listed as a remote peer, a non-authority has no
    /// authority, or an authority names a different peer as authority.
    pub fn start<S, T>(self, simulation: S, transport: T) -> Result<SyncCoordinator<S, T>, SyncError>
    where
        S: Simulation,
        T: Transport,
    {
        self.config.validate()?;
        if self.peers.contains(&self.local) {
            return Err(InvalidConfigKind::LocalPeerListed { peer: self.local }.into());
        }
        let authority = match (self.role, self.authority) {
            (Role::Authority, None) => self.local,
            (Role::Authority, Some(authority)) if authority == self.local => authority,
            (Role::Authority, Some(authority)) => {
                return Err(InvalidConfigKind::ConflictingAuthority {
                    local: self.local,
                    authority,
                }
                .into());
            },
            (Role::Peer, Some(authority)) if authority != self.local => authority,
            (Role::Peer, Some(_)) => {
                return Err(InvalidConfigKind::ConflictingAuthority {
                    local: self.local,
                    authority: self.local,
                }
                .into());
            },
            (Role::Peer, None) => return Err(InvalidConfigKind::MissingAuthority.into()),
        };

        let mut members = self.peers;
        members.insert(self.local);
        members.insert(authority);
        tracing::info!(
            local = %self.local,
            role = ?self.role,
            %authority,
            members = members.len(),
            "starting synchronizer"
        );

        Ok(SyncCoordinator::from_parts(CoordinatorParts {
            local: self.local,
            role: self.role,
            authority,
            members,
            config: self.config,
            simulation,
            transport,
            observer: self
                .violation_observer
                .unwrap_or_else(|| Arc::new(TracingObserver::new())),
            evidence: self
                .evidence_sink
                .unwrap_or_else(|| Box::new(TracingEvidenceSink)),
        }))
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
    use crate::{LoadError, SimulationSnapshot, SyncMessage, Tick};

    struct NullSim;

    impl Simulation for NullSim {
        fn capture_snapshot(&mut self) -> SimulationSnapshot {
            SimulationSnapshot::new(Tick::ZERO, vec![0])
        }
        fn load_full_state(&mut self, _snapshot: &SimulationSnapshot) -> Result<(), LoadError> {
            Ok(())
        }
        fn current_advance_tick(&self) -> Tick {
            Tick::ZERO
        }
        fn dispatch(&mut self, _message_id: u32, _raw: &[u8], _sender: PeerId) {}
    }

    struct NullTransport;

    impl Transport for NullTransport {
        fn send_to(&mut self, _peer: PeerId, _msg: &SyncMessage) {}
        fn broadcast(&mut self, _msg: &SyncMessage) {}
    }

    fn start(builder: SynchronizerBuilder) -> Result<SyncCoordinator<NullSim, NullTransport>, SyncError> {
        builder.start(NullSim, NullTransport)
    }

    #[test]
    fn authority_defaults_to_itself() {
        let c = start(SynchronizerBuilder::new(PeerId::new(1), Role::Authority).add_peer(PeerId::new(2)))
            .unwrap();
        assert_eq!(c.authority(), PeerId::new(1));
        assert_eq!(c.members().collect::<Vec<_>>(), vec![PeerId::new(1), PeerId::new(2)]);
    }

    #[test]
    fn peer_includes_authority_in_members() {
        let c = start(SynchronizerBuilder::new(PeerId::new(2), Role::Peer).with_authority(PeerId::new(1)))
            .unwrap();
        assert_eq!(c.members().collect::<Vec<_>>(), vec![PeerId::new(1), PeerId::new(2)]);
    }

    #[test]
    fn peer_without_authority_is_rejected() {
        let err = start(SynchronizerBuilder::new(PeerId::new(2), Role::Peer)).unwrap_err();
        assert_eq!(err, SyncError::from(InvalidConfigKind::MissingAuthority));
    }

    #[test]
    fn local_peer_listed_is_rejected() {
        let err = start(SynchronizerBuilder::new(PeerId::new(1), Role::Authority).add_peer(PeerId::new(1)))
            .unwrap_err();
        assert_eq!(
            err,
            SyncError::from(InvalidConfigKind::LocalPeerListed {
                peer: PeerId::new(1)
            })
        );
    }

    #[test]
    fn conflicting_authority_is_rejected() {
        let err = start(
            SynchronizerBuilder::new(PeerId::new(1), Role::Authority).with_authority(PeerId::new(2)),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            SyncError::InvalidConfig {
                kind: InvalidConfigKind::ConflictingAuthority { .. }
            }
        ));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = SynchronizerConfig {
            check_interval: 5,
            check_offset: 5,
            ..SynchronizerConfig::default()
        };
        let err = start(SynchronizerBuilder::new(PeerId::new(1), Role::Authority).with_config(config))
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidConfig { .. }));
    }
}
