//! Snapshot fingerprints.
//!
//! A [`Fingerprint`] is the FNV-1a 128 hash of a snapshot's bytes. Equal
//! fingerprints are taken as equal state; a mismatch is a divergence.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::InvalidSnapshotReason;
use crate::hash::fnv1a128;
use crate::{SimulationSnapshot, SyncError};

/// A fixed-width, deterministic digest of a [`SimulationSnapshot`].
///
/// The bytes are the big-endian hash value, so [`Display`](fmt::Display) prints
/// the conventional hex form.
///
/// # Examples
///
/// ```
/// use lockstep_resync::{Fingerprint, SimulationSnapshot, Tick};
///
/// let a = SimulationSnapshot::new(Tick::new(10), b"gold=5".to_vec());
/// let b = SimulationSnapshot::new(Tick::new(10), b"gold=5".to_vec());
/// assert_eq!(Fingerprint::of(&a)?, Fingerprint::of(&b)?);
///
/// let empty = SimulationSnapshot::new(Tick::new(10), Vec::new());
/// assert!(Fingerprint::of(&empty).is_err());
/// # Ok::<(), lockstep_resync::SyncError>(())
/// ```
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint([u8; 16]);

impl Fingerprint {
    /// Fingerprints a snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidSnapshot`] for an empty snapshot.
    pub fn of(snapshot: &SimulationSnapshot) -> Result<Self, SyncError> {
        Self::of_bytes(snapshot.bytes())
    }

    /// Fingerprints raw snapshot bytes.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidSnapshot`] if `bytes` is empty.
    pub fn of_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        if bytes.is_empty() {
            return Err(SyncError::InvalidSnapshot {
                reason: InvalidSnapshotReason::Empty,
            });
        }
        Ok(Self(fnv1a128(bytes).to_be_bytes()))
    }

    /// Wraps an already computed digest.
    #[inline]
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// The digest bytes.
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// The digest as an integer.
    #[inline]
    #[must_use]
    pub const fn as_u128(&self) -> u128 {
        u128::from_be_bytes(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self)
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

    #[test]
    fn test_empty_snapshot_is_invalid() {
        let snapshot = SimulationSnapshot::new(Tick::new(3), Vec::new());
        let err = Fingerprint::of(&snapshot).unwrap_err();
        assert!(matches!(
            err,
            SyncError::InvalidSnapshot {
                reason: InvalidSnapshotReason::Empty
            }
        ));
    }

    #[test]
    fn test_display_is_lowercase_hex() {
        let fp = Fingerprint::of_bytes(b"a").unwrap();
        assert_eq!(fp.to_string(), "d228cb696f1a8caf78912b704e4a8964");
        assert_eq!(fp.as_u128(), 0xd228_cb69_6f1a_8caf_7891_2b70_4e4a_8964);
    }

    #[test]
    fn test_tick_does_not_affect_fingerprint() {
        let a = SimulationSnapshot::new(Tick::new(1), vec![9; 32]);
        let b = SimulationSnapshot::new(Tick::new(2), vec![9; 32]);
        assert_eq!(Fingerprint::of(&a).unwrap(), Fingerprint::of(&b).unwrap());
    }

    #[test]
    fn test_different_bytes_differ() {
        let a = Fingerprint::of_bytes(&[1, 2, 3]).unwrap();
        let b = Fingerprint::of_bytes(&[1, 2, 4]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_from_bytes_round_trip() {
        let fp = Fingerprint::of_bytes(b"foobar").unwrap();
        assert_eq!(Fingerprint::from_bytes(*fp.as_bytes()), fp);
    }

    #[test]
    fn test_debug_contains_hex() {
        let fp = Fingerprint::of_bytes(b"foobar").unwrap();
        assert_eq!(
            format!("{:?}", fp),
            "Fingerprint(343e1662793c64bf6f0d3597ba446f18)"
        );
    }
}
