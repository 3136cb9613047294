//! # Lockstep Resync
//!
//! Desync detection and live resynchronization for deterministic lockstep
//! simulations.
//!
//! Every peer of a lockstep session runs the same simulation from the same
//! message stream. When a bug, uninitialized memory or floating point drift makes
//! one peer's state diverge, the session is silently broken. This crate
//! detects that and repairs it without restarting the game:
//!
//! 1. On a fixed tick cadence every peer captures a snapshot of its simulation.
//!    The authority broadcasts a 128-bit fingerprint of its snapshot.
//! 2. Every peer compares the fingerprint against its own snapshot for the same
//!    tick and acknowledges agreement (or sends its snapshot as evidence).
//! 3. If any peer disagrees, the authority freezes ordinary message delivery on
//!    all peers, captures its full state and distributes it. Diverged peers load
//!    it, replay the messages deferred in the meantime in their original order,
//!    and a final complete check confirms the recovery.
//!
//! The simulation and the transport stay outside the crate. They are plugged in
//! through the [`Simulation`] and [`Transport`] traits and driven through
//! [`SyncCoordinator`].
//!
//! ```
//! use lockstep_resync::{
//!     LoadError, PeerId, Role, SimulationSnapshot, Simulation, SyncMessage,
//!     SynchronizerBuilder, Tick, Transport,
//! };
//!
//! struct World { tick: Tick, gold: u32 }
//!
//! impl Simulation for World {
//!     fn capture_snapshot(&mut self) -> SimulationSnapshot {
//!         SimulationSnapshot::new(self.tick, self.gold.to_le_bytes().to_vec())
//!     }
//!     fn load_full_state(&mut self, snapshot: &SimulationSnapshot) -> Result<(), LoadError> {
//!         let bytes: [u8; 4] = snapshot.bytes().try_into().map_err(|_| LoadError::new("bad size"))?;
//!         self.gold = u32::from_le_bytes(bytes);
//!         self.tick = snapshot.tick();
//!         Ok(())
//!     }
//!     fn current_advance_tick(&self) -> Tick { self.tick }
//!     fn dispatch(&mut self, _message_id: u32, _raw: &[u8], _sender: PeerId) {}
//! }
//!
//! struct Outbox(Vec<SyncMessage>);
//!
//! impl Transport for Outbox {
//!     fn send_to(&mut self, _peer: PeerId, msg: &SyncMessage) { self.0.push(msg.clone()); }
//!     fn broadcast(&mut self, msg: &SyncMessage) { self.0.push(msg.clone()); }
//! }
//!
//! let mut coordinator = SynchronizerBuilder::new(PeerId::new(1), Role::Authority)
//!     .with_authority(PeerId::new(1))
//!     .add_peer(PeerId::new(2))
//!     .start(World { tick: Tick::ZERO, gold: 0 }, Outbox(Vec::new()))
//!     .expect("valid configuration");
//!
//! // Tick 0 is a check tick: the authority broadcasts its fingerprint.
//! coordinator.on_advance_tick(Tick::ZERO).expect("not fatal");
//! assert!(matches!(coordinator.transport().0[0], SyncMessage::SyncCheckBroadcast { .. }));
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub use error::{
    InvalidConfigKind, InvalidSnapshotReason, LoadError, ProtocolViolationKind, ResyncFailure,
    SyncError,
};
pub use evidence::{CollectingEvidenceSink, DivergenceReport, EvidenceSink, TracingEvidenceSink};
pub use fingerprint::Fingerprint;
pub use message_gate::{DeferredMessage, MessageGate};
pub use network::messages::{MessageKind, SyncMessage};
pub use resyncer::{ResyncPhase, ResyncSession, ResyncState};
pub use round::{AckEntry, RoundOutcome, SyncCheckRound};
pub use sessions::builder::SynchronizerBuilder;
pub use sessions::config::SynchronizerConfig;
pub use sessions::coordinator::SyncCoordinator;
pub use sessions::event_drain::EventDrain;
pub use snapshot::SimulationSnapshot;
pub use snapshot_log::{LogHandle, SnapshotLog};
pub use sync_checker::{CheckerState, SyncChecker};

pub mod error;
pub mod evidence;
pub mod fingerprint;
pub mod hash;
pub mod message_gate;
pub mod resyncer;
pub mod round;
pub mod snapshot;
pub mod snapshot_log;
pub mod sync_checker;
pub mod telemetry;
pub mod sessions {
    //! Session assembly: configuration, the builder and the coordinator.
    pub mod builder;
    pub mod config;
    pub mod coordinator;
    pub mod event_drain;
}
pub mod network {
    //! Wire model of the sync protocol.

    /// Binary codec for sync protocol messages.
    ///
    /// Provides centralized encoding and decoding of [`SyncMessage`](crate::SyncMessage)
    /// values using bincode.
    pub mod codec;
    pub mod messages;
}

// #############
// #   TYPES   #
// #############

/// A discrete simulation step.
///
/// All peers process the same sequence of ticks in the same order; sync checks
/// are only meaningful between snapshots captured at the same tick.
///
/// # Examples
///
/// ```
/// use lockstep_resync::Tick;
///
/// let tick = Tick::new(20);
/// assert!(tick.is_check_tick(10, 0));
/// assert!(!tick.next().is_check_tick(10, 0));
/// assert_eq!(tick.next().as_u32(), 21);
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Tick(u32);

impl Tick {
    /// The first tick of a session.
    pub const ZERO: Tick = Tick(0);

    /// Creates a new `Tick` from a raw counter value.
    #[inline]
    #[must_use]
    pub const fn new(tick: u32) -> Self {
        Tick(tick)
    }

    /// Returns the underlying counter value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the tick after this one.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Tick(self.0.wrapping_add(1))
    }

    /// Returns how many ticks passed since `earlier`, or 0 if `earlier` is in the future.
    #[inline]
    #[must_use]
    pub const fn ticks_since(self, earlier: Tick) -> u32 {
        self.0.saturating_sub(earlier.0)
    }

    /// Returns `true` if a cadence check falls on this tick.
    ///
    /// A zero interval never matches.
    #[inline]
    #[must_use]
    pub const fn is_check_tick(self, interval: u32, offset: u32) -> bool {
        interval != 0 && self.0 % interval == offset
    }
}

impl std::fmt::Display for Tick {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Tick {
    #[inline]
    fn from(value: u32) -> Self {
        Tick(value)
    }
}

/// Identifier of one sync check round. Issued only by the authority.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct SyncId(u32);

impl SyncId {
    /// Creates a new `SyncId`.
    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        SyncId(id)
    }

    /// Returns the raw id.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the id following this one.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        SyncId(self.0.wrapping_add(1))
    }
}

impl std::fmt::Display for SyncId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Transport-level identifier of a client in the session.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct PeerId(u32);

impl PeerId {
    /// Creates a new `PeerId`.
    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        PeerId(id)
    }

    /// Returns the raw id.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether the local peer is the session authority.
///
/// Exactly one peer of a session is the authority. It alone originates sync check
/// rounds and provides the full state during recovery.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Role {
    /// The peer that originates sync checks and owns the reference state.
    Authority,
    /// Any other peer.
    Peer,
}

impl Role {
    /// Returns `true` for [`Role::Authority`].
    #[inline]
    #[must_use]
    pub const fn is_authority(self) -> bool {
        matches!(self, Role::Authority)
    }
}

/// Notifications produced by the [`SyncCoordinator`]. Handling them is up to the host.
///
/// [`SyncEvent::Resynchronizing`] and [`SyncEvent::GameUnlocked`] carry a contract:
/// the host must stop feeding advance ticks after the former and may resume after
/// the latter.
///
/// # Forward Compatibility
///
/// This enum is marked `#[non_exhaustive]`. Always include a wildcard arm when matching.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SyncEvent {
    /// A sync check round finished and every peer agreed.
    SyncCheckPassed {
        /// The round.
        sync_id: SyncId,
        /// Tick at which the compared snapshots were captured.
        tick: Tick,
    },
    /// (Authority) At least one peer reported a different state.
    DivergenceDetected {
        /// The round.
        sync_id: SyncId,
        /// Tick at which the compared snapshots were captured.
        tick: Tick,
        /// Peers that disagreed.
        peers: Vec<PeerId>,
    },
    /// (Peer) The local state does not match the authority's.
    LocalDivergence {
        /// The round.
        sync_id: SyncId,
        /// Tick at which the compared snapshots were captured.
        tick: Tick,
        /// Local fingerprint, if a local snapshot existed for the tick.
        local: Option<Fingerprint>,
        /// The authority's fingerprint.
        authority: Fingerprint,
    },
    /// (Authority) Some peers never answered a sync check.
    AckTimeout {
        /// The round.
        sync_id: SyncId,
        /// Tick of the round.
        tick: Tick,
        /// Peers that did not answer in time.
        missing: Vec<PeerId>,
    },
    /// Recovery started. The host must pause its advance-tick driver.
    Resynchronizing {
        /// The peer that requested the recovery.
        initiator: PeerId,
    },
    /// The post-recovery check passed on every peer.
    ResyncCompleted {
        /// Milliseconds since the recovery started locally.
        elapsed_ms: u128,
    },
    /// The authority released the session. The host may resume advancing ticks.
    GameUnlocked,
    /// Recovery failed. The session can no longer guarantee consistency.
    ResyncFailed {
        /// Why recovery failed.
        reason: ResyncFailure,
    },
}

// #############
// #  TRAITS   #
// #############

/// The simulation engine, as seen by the sync subsystem.
///
/// `capture_snapshot` and `load_full_state` are only invoked while the host
/// guarantees the simulation is not advancing.
pub trait Simulation {
    /// Serializes the complete deterministic state at the current tick.
    fn capture_snapshot(&mut self) -> SimulationSnapshot;

    /// Replaces the complete state with `snapshot`.
    fn load_full_state(&mut self, snapshot: &SimulationSnapshot) -> Result<(), LoadError>;

    /// The tick the simulation is currently at.
    fn current_advance_tick(&self) -> Tick;

    /// Entry point for ordinary (non-sync) messages.
    fn dispatch(&mut self, message_id: u32, raw: &[u8], sender: PeerId);
}

/// The message transport, as seen by the sync subsystem.
///
/// Delivery must preserve per-sender order. Binary framing is the transport's
/// concern; [`network::codec`] provides a ready-made bincode framing.
pub trait Transport {
    /// Sends `msg` to a single peer.
    fn send_to(&mut self, peer: PeerId, msg: &SyncMessage);

    /// Sends `msg` to every peer of the session except the local one.
    fn broadcast(&mut self, msg: &SyncMessage);
}

// ###################
// # UNIT TESTS      #
// ###################

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn tick_cadence_honors_offset() {
        assert!(Tick::new(15).is_check_tick(10, 5));
        assert!(!Tick::new(10).is_check_tick(10, 5));
        assert!(Tick::new(0).is_check_tick(10, 0));
    }

    #[test]
    fn tick_zero_interval_never_checks() {
        for t in 0..50 {
            assert!(!Tick::new(t).is_check_tick(0, 0));
        }
    }

    #[test]
    fn tick_ticks_since_saturates() {
        assert_eq!(Tick::new(10).ticks_since(Tick::new(4)), 6);
        assert_eq!(Tick::new(4).ticks_since(Tick::new(10)), 0);
    }

    #[test]
    fn tick_next_wraps() {
        assert_eq!(Tick::new(u32::MAX).next(), Tick::ZERO);
    }

    #[test]
    fn sync_id_display_and_next() {
        let id = SyncId::new(7);
        assert_eq!(id.to_string(), "#7");
        assert_eq!(id.next().as_u32(), 8);
    }

    #[test]
    fn role_is_authority() {
        assert!(Role::Authority.is_authority());
        assert!(!Role::Peer.is_authority());
    }

    #[test]
    fn sync_event_equality() {
        let a = SyncEvent::SyncCheckPassed {
            sync_id: SyncId::new(1),
            tick: Tick::new(10),
        };
        assert_eq!(a.clone(), a);
        assert_ne!(a, SyncEvent::GameUnlocked);
    }
}
