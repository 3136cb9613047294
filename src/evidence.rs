//! Divergence evidence.
//!
//! When a peer disagrees with the authority it may attach its own snapshot to
//! the acknowledgement. The authority turns that into a [`DivergenceReport`] and
//! hands report and both blobs to an [`EvidenceSink`]. Interpreting the blobs is
//! up to the host; the crate only locates the first differing byte.

use std::fmt;

use parking_lot::Mutex;

use crate::{Fingerprint, PeerId, SimulationSnapshot, SyncId, Tick};

/// Summary of one disagreeing acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DivergenceReport {
    /// The round the disagreement was reported in.
    pub sync_id: SyncId,
    /// Tick of the compared snapshots.
    pub tick: Tick,
    /// The disagreeing peer.
    pub peer: PeerId,
    /// The authority's fingerprint.
    pub authority_fingerprint: Fingerprint,
    /// The peer's fingerprint, if it had a usable snapshot.
    pub peer_fingerprint: Option<Fingerprint>,
    /// Length of the authority's snapshot.
    pub authority_len: usize,
    /// Length of the peer's snapshot, if it sent one.
    pub peer_len: Option<usize>,
    /// Offset of the first byte that differs, if both snapshots are known.
    pub first_difference: Option<usize>,
}

impl DivergenceReport {
    /// Compares the authority's snapshot against the evidence a peer sent.
    #[must_use]
    pub fn compare(
        sync_id: SyncId,
        peer: PeerId,
        authority: &SimulationSnapshot,
        authority_fingerprint: Fingerprint,
        evidence: Option<&[u8]>,
    ) -> Self {
        let peer_fingerprint = evidence.and_then(|bytes| Fingerprint::of_bytes(bytes).ok());
        Self {
            sync_id,
            tick: authority.tick(),
            peer,
            authority_fingerprint,
            peer_fingerprint,
            authority_len: authority.len(),
            peer_len: evidence.map(<[u8]>::len),
            first_difference: evidence.and_then(|bytes| first_difference(authority.bytes(), bytes)),
        }
    }
}

impl fmt::Display for DivergenceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "peer {} diverged at tick {} (check {}): authority {} ({} bytes)",
            self.peer, self.tick, self.sync_id, self.authority_fingerprint, self.authority_len
        )?;
        match (self.peer_fingerprint, self.peer_len) {
            (Some(fp), Some(len)) => write!(f, ", peer {} ({} bytes)", fp, len)?,
            (None, Some(len)) => write!(f, ", peer sent {} bytes", len)?,
            _ => write!(f, ", no evidence")?,
        }
        if let Some(offset) = self.first_difference {
            write!(f, ", first difference at byte {}", offset)?;
        }
        Ok(())
    }
}

/// Returns the offset of the first differing byte, or `None` if `a == b`.
///
/// A length difference counts as a difference at the end of the shorter input.
#[must_use]
pub fn first_difference(a: &[u8], b: &[u8]) -> Option<usize> {
    a.iter()
        .zip(b)
        .position(|(x, y)| x != y)
        .or_else(|| (a.len() != b.len()).then(|| a.len().min(b.len())))
}

/// Receives divergence evidence from the authority.
pub trait EvidenceSink {
    /// Called once per disagreeing acknowledgement.
    ///
    /// `authority` is the authority's snapshot for the round's tick, `evidence` the
    /// bytes the peer attached (if any).
    fn record(&mut self, report: &DivergenceReport, authority: &[u8], evidence: Option<&[u8]>);
}

/// Logs a one-line summary of every report at `warn` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEvidenceSink;

impl EvidenceSink for TracingEvidenceSink {
    fn record(&mut self, report: &DivergenceReport, _authority: &[u8], _evidence: Option<&[u8]>) {
        tracing::warn!(
            peer = %report.peer,
            tick = %report.tick,
            sync_id = %report.sync_id,
            first_difference = ?report.first_difference,
            "{}",
            report
        );
    }
}

/// One entry recorded by a [`CollectingEvidenceSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedEvidence {
    /// The report.
    pub report: DivergenceReport,
    /// The authority's snapshot bytes.
    pub authority: Vec<u8>,
    /// The bytes the peer sent.
    pub evidence: Option<Vec<u8>>,
}

/// Keeps every report in memory. Intended for tests and tooling.
///
/// The store is shared behind a mutex, so a clone of the sink handed to the
/// coordinator can still be inspected through the original.
#[derive(Debug, Default, Clone)]
pub struct CollectingEvidenceSink {
    entries: std::sync::Arc<Mutex<Vec<CollectedEvidence>>>,
}

impl CollectingEvidenceSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of everything recorded so far.
    #[must_use]
    pub fn entries(&self) -> Vec<CollectedEvidence> {
        self.entries.lock().clone()
    }

    /// The recorded reports.
    #[must_use]
    pub fn reports(&self) -> Vec<DivergenceReport> {
        self.entries
            .lock()
            .iter()
            .map(|entry| entry.report.clone())
            .collect()
    }

    /// Number of recorded reports.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl EvidenceSink for CollectingEvidenceSink {
    fn record(&mut self, report: &DivergenceReport, authority: &[u8], evidence: Option<&[u8]>) {
        self.entries.lock().push(CollectedEvidence {
            report: report.clone(),
            authority: authority.to_vec(),
            evidence: evidence.map(<[u8]>::to_vec),
        });
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

    fn authority() -> SimulationSnapshot {
        SimulationSnapshot::new(Tick::new(100), vec![1, 2, 3, 4, 5])
    }

    #[test]
    fn first_difference_cases() {
        assert_eq!(first_difference(b"abc", b"abc"), None);
        assert_eq!(first_difference(b"abc", b"abd"), Some(2));
        assert_eq!(first_difference(b"abc", b"abcd"), Some(3));
        assert_eq!(first_difference(b"", b"x"), Some(0));
    }

    #[test]
    fn compare_with_evidence() {
        let snap = authority();
        let fp = Fingerprint::of(&snap).unwrap();
        let report = DivergenceReport::compare(
            SyncId::new(3),
            PeerId::new(2),
            &snap,
            fp,
            Some(&[1, 2, 9, 4, 5]),
        );
        assert_eq!(report.tick, Tick::new(100));
        assert_eq!(report.first_difference, Some(2));
        assert_eq!(report.peer_len, Some(5));
        assert_ne!(report.peer_fingerprint, Some(fp));
        assert!(report.to_string().contains("first difference at byte 2"));
    }

    #[test]
    fn compare_without_evidence() {
        let snap = authority();
        let fp = Fingerprint::of(&snap).unwrap();
        let report = DivergenceReport::compare(SyncId::new(3), PeerId::new(2), &snap, fp, None);
        assert_eq!(report.peer_fingerprint, None);
        assert_eq!(report.first_difference, None);
        assert!(report.to_string().contains("no evidence"));
    }

    #[test]
    fn collecting_sink_shares_store_between_clones() {
        let sink = CollectingEvidenceSink::new();
        let mut handed_out = sink.clone();
        let snap = authority();
        let fp = Fingerprint::of(&snap).unwrap();
        let report = DivergenceReport::compare(SyncId::new(1), PeerId::new(4), &snap, fp, None);
        handed_out.record(&report, snap.bytes(), None);
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.reports()[0], report);
        assert_eq!(sink.entries()[0].authority, snap.bytes().to_vec());
    }

    #[test]
    fn tracing_sink_accepts_reports() {
        let snap = authority();
        let fp = Fingerprint::of(&snap).unwrap();
        let report =
            DivergenceReport::compare(SyncId::new(1), PeerId::new(4), &snap, fp, Some(b"zz"));
        TracingEvidenceSink.record(&report, snap.bytes(), Some(b"zz"));
    }
}
