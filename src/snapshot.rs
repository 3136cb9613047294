//! Captured simulation state.

use std::sync::Arc;

use crate::Tick;

/// The complete deterministic state of a simulation at one tick, as opaque bytes.
///
/// The bytes are reference counted: storing a snapshot in the [`SnapshotLog`],
/// attaching it to a divergence report and sending it as full state all share one
/// allocation.
///
/// [`SnapshotLog`]: crate::SnapshotLog
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SimulationSnapshot {
    tick: Tick,
    bytes: Arc<[u8]>,
}

impl SimulationSnapshot {
    /// Creates a snapshot of the state at `tick`.
    #[must_use]
    pub fn new(tick: Tick, bytes: Vec<u8>) -> Self {
        Self {
            tick,
            bytes: bytes.into(),
        }
    }

    /// The tick at which the snapshot was captured.
    #[inline]
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// The serialized state.
    #[inline]
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Length of the serialized state in bytes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns `true` if the snapshot holds no bytes.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
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
    fn clones_share_bytes() {
        let snapshot = SimulationSnapshot::new(Tick::new(5), vec![1, 2, 3]);
        let copy = snapshot.clone();
        assert_eq!(copy.bytes().as_ptr(), snapshot.bytes().as_ptr());
        assert_eq!(copy.tick(), Tick::new(5));
        assert_eq!(copy.len(), 3);
    }

    #[test]
    fn empty_snapshot() {
        let snapshot = SimulationSnapshot::new(Tick::ZERO, Vec::new());
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.len(), 0);
    }
}
