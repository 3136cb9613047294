//! Error types returned and reported by the sync subsystem.

use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::network::codec::CodecError;
use crate::{MessageKind, PeerId, SyncId, Tick};

/// All errors the sync subsystem can produce.
///
/// Only [`SyncError::ResyncFailed`] ever escapes [`SyncCoordinator`]'s message and
/// tick entry points; every other kind is logged through the violation observer
/// and absorbed.
///
/// [`SyncCoordinator`]: crate::SyncCoordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// A snapshot could not be fingerprinted.
    InvalidSnapshot {
        /// Why the snapshot was rejected.
        reason: InvalidSnapshotReason,
    },
    /// A comparison was requested against snapshots from different ticks.
    TickMismatch {
        /// Tick of the authority's fingerprint.
        expected: Tick,
        /// The local tick, or the tick of the local snapshot found instead.
        actual: Tick,
    },
    /// An acknowledgement arrived for a round that is retired or never existed.
    StaleAck {
        /// The round the ack refers to.
        sync_id: SyncId,
        /// Who sent it.
        sender: PeerId,
    },
    /// A peer broke the protocol. The offending message was discarded.
    ProtocolViolation {
        /// What exactly went wrong.
        kind: ProtocolViolationKind,
    },
    /// Recovery failed. Fatal to the session.
    ResyncFailed {
        /// Why recovery failed.
        reason: ResyncFailure,
    },
    /// A configuration value is out of range.
    InvalidConfig {
        /// The offending setting.
        kind: InvalidConfigKind,
    },
    /// Encoding or decoding a wire message failed.
    Codec {
        /// The underlying codec error.
        source: CodecError,
    },
}

impl SyncError {
    /// Returns `true` if the error ends the session.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, SyncError::ResyncFailed { .. })
    }
}

impl Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::InvalidSnapshot { reason } => write!(f, "Invalid snapshot: {}", reason),
            SyncError::TickMismatch { expected, actual } => write!(
                f,
                "Tick mismatch: authority fingerprint is for tick {} but local state is at tick {}",
                expected, actual
            ),
            SyncError::StaleAck { sync_id, sender } => write!(
                f,
                "Stale ack for sync check {} from peer {}",
                sync_id, sender
            ),
            SyncError::ProtocolViolation { kind } => write!(f, "Protocol violation: {}", kind),
            SyncError::ResyncFailed { reason } => write!(f, "Resync failed: {}", reason),
            SyncError::InvalidConfig { kind } => write!(f, "Invalid configuration: {}", kind),
            SyncError::Codec { source } => write!(f, "Codec error: {}", source),
        }
    }
}

impl Error for SyncError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SyncError::Codec { source } => Some(source),
            _ => None,
        }
    }
}

impl From<CodecError> for SyncError {
    fn from(source: CodecError) -> Self {
        SyncError::Codec { source }
    }
}

impl From<ProtocolViolationKind> for SyncError {
    fn from(kind: ProtocolViolationKind) -> Self {
        SyncError::ProtocolViolation { kind }
    }
}

impl From<InvalidConfigKind> for SyncError {
    fn from(kind: InvalidConfigKind) -> Self {
        SyncError::InvalidConfig { kind }
    }
}

impl From<ResyncFailure> for SyncError {
    fn from(reason: ResyncFailure) -> Self {
        SyncError::ResyncFailed { reason }
    }
}

/// Why a snapshot could not be fingerprinted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvalidSnapshotReason {
    /// The snapshot contains no bytes.
    Empty,
}

impl Display for InvalidSnapshotReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidSnapshotReason::Empty => write!(f, "snapshot is empty"),
        }
    }
}

/// The specific protocol rule a peer broke.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolationKind {
    /// Full state arrived while no recovery was in progress.
    SyncDataWithoutSession {
        /// Who sent it.
        sender: PeerId,
    },
    /// Full state arrived from a peer that is not the authority.
    SyncDataFromNonAuthority {
        /// Who sent it.
        sender: PeerId,
    },
    /// A sync check fingerprint arrived from a peer that is not the authority.
    BroadcastFromNonAuthority {
        /// Who sent it.
        sender: PeerId,
    },
    /// The authority received a sync check fingerprint.
    BroadcastAtAuthority {
        /// Who sent it.
        sender: PeerId,
    },
    /// A non-authority peer received an acknowledgement.
    AckAtNonAuthority {
        /// Who sent it.
        sender: PeerId,
    },
    /// An acknowledgement came from a peer the round was not waiting for.
    UnexpectedAck {
        /// The round.
        sync_id: SyncId,
        /// Who sent it.
        sender: PeerId,
    },
    /// An unlock arrived while no recovery was in its confirmation phase.
    UnlockWithoutSession {
        /// Who sent it.
        sender: PeerId,
    },
    /// An unlock arrived from a peer that is not the authority.
    UnlockFromNonAuthority {
        /// Who sent it.
        sender: PeerId,
    },
    /// The decoded payload does not match the declared message kind.
    KindMismatch {
        /// Kind announced by the transport.
        declared: MessageKind,
        /// Kind of the decoded payload.
        decoded: MessageKind,
    },
    /// A sync payload could not be decoded.
    MalformedPayload {
        /// Declared message kind.
        kind: MessageKind,
        /// Who sent it.
        sender: PeerId,
    },
    /// A non-authority peer tried to originate a sync check round.
    CheckFromNonAuthority,
}

impl Display for ProtocolViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolViolationKind::SyncDataWithoutSession { sender } => write!(
                f,
                "sync data from peer {} while no resync is in progress",
                sender
            ),
            ProtocolViolationKind::SyncDataFromNonAuthority { sender } => {
                write!(f, "sync data from non-authority peer {}", sender)
            }
            ProtocolViolationKind::BroadcastFromNonAuthority { sender } => write!(
                f,
                "sync check fingerprint from non-authority peer {}",
                sender
            ),
            ProtocolViolationKind::BroadcastAtAuthority { sender } => write!(
                f,
                "authority received a sync check fingerprint from peer {}",
                sender
            ),
            ProtocolViolationKind::AckAtNonAuthority { sender } => {
                write!(f, "non-authority received a sync check ack from peer {}", sender)
            }
            ProtocolViolationKind::UnexpectedAck { sync_id, sender } => write!(
                f,
                "sync check {} was not waiting for an ack from peer {}",
                sync_id, sender
            ),
            ProtocolViolationKind::UnlockWithoutSession { sender } => write!(
                f,
                "unlock from peer {} while no resync is awaiting confirmation",
                sender
            ),
            ProtocolViolationKind::UnlockFromNonAuthority { sender } => {
                write!(f, "unlock from non-authority peer {}", sender)
            }
            ProtocolViolationKind::KindMismatch { declared, decoded } => write!(
                f,
                "message declared as {} decoded as {}",
                declared, decoded
            ),
            ProtocolViolationKind::MalformedPayload { kind, sender } => {
                write!(f, "malformed {} payload from peer {}", kind, sender)
            }
            ProtocolViolationKind::CheckFromNonAuthority => {
                write!(f, "only the authority may originate sync checks")
            }
        }
    }
}

/// Why a recovery failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResyncFailure {
    /// The simulation rejected the authority's state.
    LoadFailed {
        /// Tick of the rejected snapshot.
        tick: Tick,
        /// The simulation's error message.
        message: String,
    },
    /// The authority could not capture a usable full state.
    CaptureFailed {
        /// Tick at which the capture was attempted.
        tick: Tick,
    },
    /// The confirmation check after loading still found diverged peers.
    StillDiverged {
        /// The confirmation round.
        sync_id: SyncId,
        /// Peers that still disagree.
        peers: Vec<PeerId>,
    },
    /// Not every peer confirmed the recovery in time.
    ConfirmationTimedOut {
        /// Peers that never confirmed.
        pending: Vec<PeerId>,
    },
}

impl Display for ResyncFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResyncFailure::LoadFailed { tick, message } => write!(
                f,
                "loading the authority state for tick {} failed: {}",
                tick, message
            ),
            ResyncFailure::CaptureFailed { tick } => {
                write!(f, "could not capture a full state at tick {}", tick)
            }
            ResyncFailure::StillDiverged { sync_id, peers } => write!(
                f,
                "peers {:?} are still out of sync after recovery (check {})",
                peers, sync_id
            ),
            ResyncFailure::ConfirmationTimedOut { pending } => {
                write!(f, "peers {:?} never confirmed the recovery", pending)
            }
        }
    }
}

/// A configuration constraint that was not met.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidConfigKind {
    /// A numeric setting is outside its allowed range.
    ConfigValueOutOfRange {
        /// Name of the setting.
        field: &'static str,
        /// Minimum allowed value.
        min: u64,
        /// Maximum allowed value.
        max: u64,
        /// The value provided.
        actual: u64,
    },
    /// The check offset must be smaller than the check interval.
    OffsetNotBelowInterval {
        /// The configured offset.
        offset: u32,
        /// The configured interval.
        interval: u32,
    },
    /// The local peer cannot be its own remote peer.
    LocalPeerListed {
        /// The local peer id.
        peer: PeerId,
    },
    /// A non-authority peer was built without knowing the authority.
    MissingAuthority,
    /// The local peer has the authority role but another peer was named authority.
    ConflictingAuthority {
        /// The local peer id.
        local: PeerId,
        /// The peer named as authority.
        authority: PeerId,
    },
}

impl Display for InvalidConfigKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidConfigKind::ConfigValueOutOfRange {
                field,
                min,
                max,
                actual,
            } => write!(
                f,
                "{} must be between {} and {}, got {}",
                field, min, max, actual
            ),
            InvalidConfigKind::OffsetNotBelowInterval { offset, interval } => write!(
                f,
                "check_offset ({}) must be smaller than check_interval ({})",
                offset, interval
            ),
            InvalidConfigKind::LocalPeerListed { peer } => {
                write!(f, "local peer {} listed as a remote peer", peer)
            }
            InvalidConfigKind::MissingAuthority => {
                write!(f, "a non-authority peer needs the authority's id")
            }
            InvalidConfigKind::ConflictingAuthority { local, authority } => write!(
                f,
                "local peer {} has the authority role but peer {} was named authority",
                local, authority
            ),
        }
    }
}

/// Returned by [`Simulation::load_full_state`](crate::Simulation::load_full_state).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadError {
    message: String,
}

impl LoadError {
    /// Creates a new load error with a human-readable message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl Error for LoadError {}

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
    fn only_resync_failed_is_fatal() {
        let fatal = SyncError::ResyncFailed {
            reason: ResyncFailure::CaptureFailed { tick: Tick::new(3) },
        };
        assert!(fatal.is_fatal());

        let stale = SyncError::StaleAck {
            sync_id: SyncId::new(1),
            sender: PeerId::new(2),
        };
        assert!(!stale.is_fatal());
        assert!(!SyncError::from(ProtocolViolationKind::CheckFromNonAuthority).is_fatal());
    }

    #[test]
    fn tick_mismatch_display_names_both_ticks() {
        let err = SyncError::TickMismatch {
            expected: Tick::new(100),
            actual: Tick::new(97),
        };
        let msg = err.to_string();
        assert!(msg.contains("100"));
        assert!(msg.contains("97"));
    }

    #[test]
    fn load_failure_display_contains_message() {
        let err = SyncError::from(ResyncFailure::LoadFailed {
            tick: Tick::new(12),
            message: "truncated".to_string(),
        });
        assert!(err.to_string().contains("truncated"));
        assert!(err.to_string().contains("12"));
    }

    #[test]
    fn config_error_display() {
        let err = SyncError::from(InvalidConfigKind::ConfigValueOutOfRange {
            field: "check_interval",
            min: 1,
            max: 100_000,
            actual: 0,
        });
        let msg = err.to_string();
        assert!(msg.contains("check_interval"));
        assert!(msg.contains("got 0"));
    }

    #[test]
    fn codec_error_is_source() {
        let err = SyncError::from(CodecError::decode(
            "unexpected end",
            crate::network::codec::CodecOperation::DecodeMessage,
        ));
        assert!(err.source().is_some());
    }

    #[test]
    fn load_error_message_round_trips() {
        let err = LoadError::new("bad header");
        assert_eq!(err.message(), "bad header");
        assert_eq!(err.to_string(), "bad header");
    }
}
