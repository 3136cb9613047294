//! Bounded store of recently captured snapshots.
//!
//! The log is the source of truth for sync check comparisons and for the
//! evidence attached to a disagreeing acknowledgement.

use std::collections::VecDeque;

use crate::{Fingerprint, SimulationSnapshot, SyncError, Tick};

/// Opaque handle to an entry stored in a [`SnapshotLog`].
///
/// Handles are issued in increasing order and are never reused, so a handle to an
/// evicted entry simply stops resolving.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogHandle(u64);

impl LogHandle {
    /// The sequence number of the entry.
    #[inline]
    #[must_use]
    pub const fn sequence(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone)]
struct LogEntry {
    handle: LogHandle,
    tick: Tick,
    snapshot: SimulationSnapshot,
}

/// Append-only, count-bounded snapshot store with oldest-first eviction.
///
/// # Examples
///
/// ```
/// use lockstep_resync::{SimulationSnapshot, SnapshotLog, Tick};
///
/// let mut log = SnapshotLog::new(2);
/// for t in [10, 20, 30] {
///     log.store(Tick::new(t), SimulationSnapshot::new(Tick::new(t), vec![t as u8]));
/// }
/// assert!(log.retrieve(Tick::new(10)).is_none()); // evicted
/// assert_eq!(log.retrieve(Tick::new(30)).map(|s| s.bytes()), Some(&[30u8][..]));
/// ```
#[derive(Debug, Clone)]
pub struct SnapshotLog {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    next_sequence: u64,
}

impl SnapshotLog {
    /// Creates an empty log holding at most `capacity` snapshots (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            next_sequence: 0,
        }
    }

    /// Stores `snapshot` under `tick`, evicting the oldest entry if the log is full.
    ///
    /// Storing a second snapshot for a tick replaces the first.
    pub fn store(&mut self, tick: Tick, snapshot: SimulationSnapshot) -> LogHandle {
        if snapshot.tick() != tick {
            tracing::debug!(
                %tick,
                snapshot_tick = %snapshot.tick(),
                "storing snapshot under a different tick than it was captured at"
            );
        }
        self.entries.retain(|entry| entry.tick != tick);
        while self.entries.len() >= self.capacity {
            if let Some(evicted) = self.entries.pop_front() {
                tracing::trace!(tick = %evicted.tick, "evicted snapshot from log");
            }
        }

        let handle = LogHandle(self.next_sequence);
        self.next_sequence = self.next_sequence.wrapping_add(1);
        self.entries.push_back(LogEntry {
            handle,
            tick,
            snapshot,
        });
        handle
    }

    /// Fingerprints a snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidSnapshot`] for an empty snapshot.
    pub fn fingerprint_of(snapshot: &SimulationSnapshot) -> Result<Fingerprint, SyncError> {
        Fingerprint::of(snapshot)
    }

    /// Returns the snapshot stored for `tick`, if it was captured and not yet evicted.
    #[must_use]
    pub fn retrieve(&self, tick: Tick) -> Option<&SimulationSnapshot> {
        self.entries
            .iter()
            .rev()
            .find(|entry| entry.tick == tick)
            .map(|entry| &entry.snapshot)
    }

    /// Resolves a handle returned by [`SnapshotLog::store`].
    #[must_use]
    pub fn get(&self, handle: LogHandle) -> Option<&SimulationSnapshot> {
        self.entries
            .iter()
            .find(|entry| entry.handle == handle)
            .map(|entry| &entry.snapshot)
    }

    /// The most recently stored tick.
    #[must_use]
    pub fn latest_tick(&self) -> Option<Tick> {
        self.entries.back().map(|entry| entry.tick)
    }

    /// Drops every entry. Handles issued before stay unique.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Maximum number of entries.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of stored snapshots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
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

    fn snap(tick: u32, byte: u8) -> SimulationSnapshot {
        SimulationSnapshot::new(Tick::new(tick), vec![byte; 8])
    }

    // ========================================================================
    // Storage and eviction
    // ========================================================================

    #[test]
    fn evicts_oldest_first() {
        let mut log = SnapshotLog::new(3);
        for t in 0..5 {
            log.store(Tick::new(t), snap(t, t as u8));
        }
        assert_eq!(log.len(), 3);
        assert!(log.retrieve(Tick::new(0)).is_none());
        assert!(log.retrieve(Tick::new(1)).is_none());
        for t in 2..5 {
            assert_eq!(log.retrieve(Tick::new(t)).unwrap().bytes()[0], t as u8);
        }
    }

    #[test]
    fn zero_capacity_is_clamped_to_one() {
        let mut log = SnapshotLog::new(0);
        assert_eq!(log.capacity(), 1);
        log.store(Tick::new(1), snap(1, 1));
        log.store(Tick::new(2), snap(2, 2));
        assert_eq!(log.len(), 1);
        assert_eq!(log.latest_tick(), Some(Tick::new(2)));
    }

    #[test]
    fn restoring_a_tick_replaces_it() {
        let mut log = SnapshotLog::new(4);
        let first = log.store(Tick::new(10), snap(10, 1));
        let second = log.store(Tick::new(10), snap(10, 2));
        assert_eq!(log.len(), 1);
        assert!(second > first);
        assert!(log.get(first).is_none());
        assert_eq!(log.get(second).unwrap().bytes()[0], 2);
    }

    #[test]
    fn handles_stop_resolving_after_eviction() {
        let mut log = SnapshotLog::new(1);
        let handle = log.store(Tick::new(1), snap(1, 1));
        assert!(log.get(handle).is_some());
        log.store(Tick::new(2), snap(2, 2));
        assert!(log.get(handle).is_none());
    }

    #[test]
    fn never_captured_tick_is_none() {
        let log = SnapshotLog::new(4);
        assert!(log.retrieve(Tick::new(7)).is_none());
        assert!(log.is_empty());
        assert_eq!(log.latest_tick(), None);
    }

    #[test]
    fn clear_keeps_handles_unique() {
        let mut log = SnapshotLog::new(4);
        let before = log.store(Tick::new(1), snap(1, 1));
        log.clear();
        assert!(log.is_empty());
        let after = log.store(Tick::new(1), snap(1, 1));
        assert_ne!(before, after);
    }

    // ========================================================================
    // Fingerprinting
    // ========================================================================

    #[test]
    fn fingerprint_of_matches_fingerprint() {
        let s = snap(3, 9);
        assert_eq!(
            SnapshotLog::fingerprint_of(&s).unwrap(),
            Fingerprint::of(&s).unwrap()
        );
        let empty = SimulationSnapshot::new(Tick::new(3), Vec::new());
        assert!(SnapshotLog::fingerprint_of(&empty).is_err());
    }
}
