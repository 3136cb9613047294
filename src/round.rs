//! Bookkeeping for one outstanding sync check.

use std::collections::BTreeMap;

use smallvec::SmallVec;

use crate::error::ProtocolViolationKind;
use crate::{Fingerprint, PeerId, SyncError, SyncId, Tick};

/// One peer's answer to a sync check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckEntry {
    /// Whether the peer's fingerprint matched.
    pub agreed: bool,
    /// The peer's snapshot, if it sent one along with a disagreement.
    pub evidence: Option<Vec<u8>>,
    /// Set when the entry was filled in because the peer never answered.
    pub timed_out: bool,
}

/// Result of a round once every expected peer answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    /// Some peers have not answered yet.
    Pending,
    /// Every peer agreed.
    Agreed,
    /// The listed peers disagreed or timed out.
    Diverged(Vec<PeerId>),
}

/// An outstanding consistency check, owned by the authority's coordinator.
///
/// The expected set is fixed when the round opens, except that peers leaving
/// the session are removed from it.
#[derive(Debug, Clone)]
pub struct SyncCheckRound {
    sync_id: SyncId,
    tick: Tick,
    fingerprint: Fingerprint,
    complete: bool,
    opened_at: Tick,
    expected: SmallVec<[PeerId; 8]>,
    acks: BTreeMap<PeerId, AckEntry>,
}

impl SyncCheckRound {
    /// Opens a round for the authority's `fingerprint` of the snapshot at `tick`.
    ///
    /// `opened_at` is the local advance tick, used for the ack timeout.
    #[must_use]
    pub fn new(
        sync_id: SyncId,
        tick: Tick,
        fingerprint: Fingerprint,
        complete: bool,
        expected: impl IntoIterator<Item = PeerId>,
        opened_at: Tick,
    ) -> Self {
        let mut expected: SmallVec<[PeerId; 8]> = expected.into_iter().collect();
        expected.sort_unstable();
        expected.dedup();
        Self {
            sync_id,
            tick,
            fingerprint,
            complete,
            opened_at,
            expected,
            acks: BTreeMap::new(),
        }
    }

    /// Records `peer`'s answer.
    ///
    /// # Errors
    ///
    /// Returns a [`SyncError::ProtocolViolation`] if the round is not waiting for
    /// `peer`, either because it is not a member or because it already answered.
    pub fn record(
        &mut self,
        peer: PeerId,
        agreed: bool,
        evidence: Option<Vec<u8>>,
    ) -> Result<(), SyncError> {
        if !self.expected.contains(&peer) || self.acks.contains_key(&peer) {
            return Err(ProtocolViolationKind::UnexpectedAck {
                sync_id: self.sync_id,
                sender: peer,
            }
            .into());
        }
        self.acks.insert(
            peer,
            AckEntry {
                agreed,
                evidence,
                timed_out: false,
            },
        );
        Ok(())
    }

    /// Records every peer that has not answered as timed out and not agreed.
    ///
    /// Returns the peers that were marked.
    pub fn expire(&mut self) -> Vec<PeerId> {
        let missing = self.pending();
        for &peer in &missing {
            self.acks.insert(
                peer,
                AckEntry {
                    agreed: false,
                    evidence: None,
                    timed_out: true,
                },
            );
        }
        missing
    }

    /// Stops waiting for `peer`. Returns `true` if it was a member.
    pub fn remove_peer(&mut self, peer: PeerId) -> bool {
        let before = self.expected.len();
        self.expected.retain(|p| *p != peer);
        self.acks.remove(&peer);
        before != self.expected.len()
    }

    /// Peers that have not answered yet.
    #[must_use]
    pub fn pending(&self) -> Vec<PeerId> {
        self.expected
            .iter()
            .copied()
            .filter(|peer| !self.acks.contains_key(peer))
            .collect()
    }

    /// Peers that answered with a disagreement or timed out.
    #[must_use]
    pub fn disagreeing(&self) -> Vec<PeerId> {
        self.acks
            .iter()
            .filter(|(_, entry)| !entry.agreed)
            .map(|(peer, _)| *peer)
            .collect()
    }

    /// Returns `true` once every expected peer has an entry.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.expected.iter().all(|peer| self.acks.contains_key(peer))
    }

    /// The round's outcome so far.
    #[must_use]
    pub fn outcome(&self) -> RoundOutcome {
        if !self.is_complete() {
            return RoundOutcome::Pending;
        }
        let diverged = self.disagreeing();
        if diverged.is_empty() {
            RoundOutcome::Agreed
        } else {
            RoundOutcome::Diverged(diverged)
        }
    }

    /// The recorded answer of `peer`.
    #[must_use]
    pub fn ack(&self, peer: PeerId) -> Option<&AckEntry> {
        self.acks.get(&peer)
    }

    /// Local ticks elapsed since the round opened.
    #[must_use]
    pub const fn age(&self, now: Tick) -> u32 {
        now.ticks_since(self.opened_at)
    }

    /// The round id.
    #[must_use]
    pub const fn sync_id(&self) -> SyncId {
        self.sync_id
    }

    /// Tick of the fingerprinted snapshot.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// The authority's fingerprint.
    #[must_use]
    pub const fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Returns `true` for the confirmation check after a recovery.
    #[must_use]
    pub const fn is_complete_check(&self) -> bool {
        self.complete
    }

    /// The peers the round waits for.
    #[must_use]
    pub fn expected(&self) -> &[PeerId] {
        &self.expected
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

    fn round(peers: &[u32]) -> SyncCheckRound {
        SyncCheckRound::new(
            SyncId::new(1),
            Tick::new(100),
            Fingerprint::of_bytes(b"state").unwrap(),
            false,
            peers.iter().copied().map(PeerId::new),
            Tick::new(100),
        )
    }

    #[test]
    fn all_agree() {
        let mut r = round(&[1, 2, 3]);
        for p in 1..=3 {
            assert_eq!(r.outcome(), RoundOutcome::Pending);
            r.record(PeerId::new(p), true, None).unwrap();
        }
        assert!(r.is_complete());
        assert_eq!(r.outcome(), RoundOutcome::Agreed);
    }

    #[test]
    fn one_disagrees() {
        let mut r = round(&[1, 2, 3]);
        r.record(PeerId::new(1), true, None).unwrap();
        r.record(PeerId::new(2), false, Some(vec![7])).unwrap();
        r.record(PeerId::new(3), true, None).unwrap();
        assert_eq!(r.outcome(), RoundOutcome::Diverged(vec![PeerId::new(2)]));
        assert_eq!(r.ack(PeerId::new(2)).unwrap().evidence, Some(vec![7]));
    }

    #[test]
    fn duplicate_and_foreign_acks_are_rejected() {
        let mut r = round(&[1, 2]);
        r.record(PeerId::new(1), true, None).unwrap();
        assert!(r.record(PeerId::new(1), false, None).is_err());
        assert!(r.record(PeerId::new(7), true, None).is_err());
        assert!(r.ack(PeerId::new(1)).unwrap().agreed);
    }

    #[test]
    fn expire_marks_missing_as_disagreeing() {
        let mut r = round(&[1, 2, 3]);
        r.record(PeerId::new(1), true, None).unwrap();
        let missing = r.expire();
        assert_eq!(missing, vec![PeerId::new(2), PeerId::new(3)]);
        assert!(r.ack(PeerId::new(3)).unwrap().timed_out);
        assert_eq!(
            r.outcome(),
            RoundOutcome::Diverged(vec![PeerId::new(2), PeerId::new(3)])
        );
    }

    #[test]
    fn removing_last_pending_peer_completes_round() {
        let mut r = round(&[1, 2]);
        r.record(PeerId::new(1), true, None).unwrap();
        assert!(r.remove_peer(PeerId::new(2)));
        assert!(!r.remove_peer(PeerId::new(2)));
        assert_eq!(r.outcome(), RoundOutcome::Agreed);
    }

    #[test]
    fn duplicate_members_are_collapsed() {
        let r = round(&[2, 1, 2]);
        assert_eq!(r.expected(), &[PeerId::new(1), PeerId::new(2)]);
        assert_eq!(r.age(Tick::new(130)), 30);
    }
}
