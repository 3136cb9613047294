//! Messages of the sync protocol.

use serde::{Deserialize, Serialize};

use crate::{Fingerprint, SyncId, Tick};

/// Message type as announced by the transport, before decoding.
///
/// The five sync kinds are handled by the coordinator; everything else is an
/// ordinary simulation message identified by its application-defined id.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// [`SyncMessage::SyncCheckBroadcast`].
    SyncCheckBroadcast,
    /// [`SyncMessage::SyncCheckAck`].
    SyncCheckAck,
    /// [`SyncMessage::RequestSync`].
    RequestSync,
    /// [`SyncMessage::SyncData`].
    SyncData,
    /// [`SyncMessage::UnlockGame`].
    UnlockGame,
    /// An ordinary simulation message.
    Game(u32),
}

impl MessageKind {
    /// Returns `true` for the five sync protocol kinds.
    #[inline]
    #[must_use]
    pub const fn is_sync(self) -> bool {
        !matches!(self, MessageKind::Game(_))
    }

    /// Returns `true` for kinds that bypass the message gate while it is locked.
    ///
    /// `RequestSync` is deliberately not exempt: a request arriving during a
    /// recovery is deferred and redelivered afterwards.
    #[inline]
    #[must_use]
    pub const fn is_exempt_while_locked(self) -> bool {
        matches!(
            self,
            MessageKind::SyncCheckBroadcast
                | MessageKind::SyncCheckAck
                | MessageKind::SyncData
                | MessageKind::UnlockGame
        )
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::SyncCheckBroadcast => write!(f, "SyncCheckBroadcast"),
            MessageKind::SyncCheckAck => write!(f, "SyncCheckAck"),
            MessageKind::RequestSync => write!(f, "RequestSync"),
            MessageKind::SyncData => write!(f, "SyncData"),
            MessageKind::UnlockGame => write!(f, "UnlockGame"),
            MessageKind::Game(id) => write!(f, "Game({})", id),
        }
    }
}

/// A decoded sync protocol message.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Authority → all. The authority's fingerprint for `tick`.
    SyncCheckBroadcast {
        /// Round id.
        sync_id: SyncId,
        /// Tick the fingerprinted snapshot was captured at.
        tick: Tick,
        /// The authority's fingerprint.
        fingerprint: Fingerprint,
        /// Set for the confirmation check that follows a recovery.
        complete: bool,
    },
    /// Peer → authority. Whether the peer's state matched.
    SyncCheckAck {
        /// Round id.
        sync_id: SyncId,
        /// `true` if the fingerprints matched.
        agreed: bool,
        /// The peer's snapshot bytes, attached to a disagreement when enabled.
        evidence: Option<Vec<u8>>,
    },
    /// Any → all. Starts a recovery.
    RequestSync,
    /// Authority → all. The authority's full state.
    SyncData {
        /// Tick the state was captured at.
        tick: Tick,
        /// Serialized simulation state.
        payload: Vec<u8>,
    },
    /// Authority → all. Every peer confirmed the recovery.
    UnlockGame,
}

impl SyncMessage {
    /// The kind a transport should announce this message as.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self {
            SyncMessage::SyncCheckBroadcast { .. } => MessageKind::SyncCheckBroadcast,
            SyncMessage::SyncCheckAck { .. } => MessageKind::SyncCheckAck,
            SyncMessage::RequestSync => MessageKind::RequestSync,
            SyncMessage::SyncData { .. } => MessageKind::SyncData,
            SyncMessage::UnlockGame => MessageKind::UnlockGame,
        }
    }
}

impl std::fmt::Debug for SyncMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncMessage::SyncCheckBroadcast {
                sync_id,
                tick,
                fingerprint,
                complete,
            } => f
                .debug_struct("SyncCheckBroadcast")
                .field("sync_id", sync_id)
                .field("tick", tick)
                .field("fingerprint", fingerprint)
                .field("complete", complete)
                .finish(),
            SyncMessage::SyncCheckAck {
                sync_id,
                agreed,
                evidence,
            } => f
                .debug_struct("SyncCheckAck")
                .field("sync_id", sync_id)
                .field("agreed", agreed)
                .field("evidence", &evidence.as_deref().map(BytesDebug))
                .finish(),
            SyncMessage::RequestSync => f.write_str("RequestSync"),
            SyncMessage::SyncData { tick, payload } => f
                .debug_struct("SyncData")
                .field("tick", tick)
                .field("payload", &BytesDebug(payload))
                .finish(),
            SyncMessage::UnlockGame => f.write_str("UnlockGame"),
        }
    }
}

/// Prints a length and a short hex prefix instead of the whole blob.
struct BytesDebug<'a>(&'a [u8]);

impl std::fmt::Debug for BytesDebug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const PREVIEW: usize = 16;
        write!(f, "{} bytes 0x", self.0.len())?;
        for byte in self.0.iter().take(PREVIEW) {
            write!(f, "{:02x}", byte)?;
        }
        if self.0.len() > PREVIEW {
            f.write_str("..")?;
        }
        Ok(())
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

    #[test]
    fn kinds_match_variants() {
        assert_eq!(SyncMessage::RequestSync.kind(), MessageKind::RequestSync);
        assert_eq!(SyncMessage::UnlockGame.kind(), MessageKind::UnlockGame);
        let data = SyncMessage::SyncData {
            tick: Tick::new(1),
            payload: vec![1],
        };
        assert_eq!(data.kind(), MessageKind::SyncData);
    }

    #[test]
    fn request_sync_is_not_exempt() {
        assert!(!MessageKind::RequestSync.is_exempt_while_locked());
        assert!(!MessageKind::Game(7).is_exempt_while_locked());
        assert!(MessageKind::SyncData.is_exempt_while_locked());
        assert!(MessageKind::SyncCheckAck.is_exempt_while_locked());
        assert!(MessageKind::SyncCheckBroadcast.is_exempt_while_locked());
        assert!(MessageKind::UnlockGame.is_exempt_while_locked());
    }

    #[test]
    fn game_kind_is_not_sync() {
        assert!(!MessageKind::Game(0).is_sync());
        assert!(MessageKind::RequestSync.is_sync());
        assert_eq!(MessageKind::Game(12).to_string(), "Game(12)");
    }

    #[test]
    fn debug_truncates_payloads() {
        let data = SyncMessage::SyncData {
            tick: Tick::new(9),
            payload: vec![0xab; 100],
        };
        let text = format!("{:?}", data);
        assert!(text.contains("100 bytes 0xabab"));
        assert!(text.contains(".."));
        assert!(text.len() < 150);
    }
}
