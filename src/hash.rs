//! Deterministic 128-bit hashing.
//!
//! Every peer must compute the same fingerprint for the same snapshot bytes,
//! regardless of process, platform or run. `std`'s `DefaultHasher` is randomly
//! seeded and therefore unusable for this; this module provides FNV-1a with the
//! 128-bit parameters instead.
//!
//! ```
//! use lockstep_resync::hash::{fnv1a128, Fnv1a128Hasher};
//! use std::hash::Hasher;
//!
//! let mut hasher = Fnv1a128Hasher::new();
//! hasher.write(b"foo");
//! hasher.write(b"bar");
//! assert_eq!(hasher.finish_u128(), fnv1a128(b"foobar"));
//! ```
//!
//! FNV-1a is NOT cryptographically secure. It detects accidental divergence,
//! not a peer forging its state.

use std::hash::Hasher;

/// FNV-1a 128-bit offset basis.
const FNV_OFFSET_BASIS: u128 = 0x6c62_272e_07bb_0142_62b8_2175_6295_c58d;

/// FNV-1a 128-bit prime (2^88 + 0x13b).
const FNV_PRIME: u128 = 0x0000_0000_0100_0000_0000_0000_0000_013b;

/// Incremental FNV-1a hasher with a 128-bit state.
///
/// Implements [`Hasher`] so it can hash any `Hash` value; [`Hasher::finish`] folds
/// the state to 64 bits, use [`Fnv1a128Hasher::finish_u128`] for the full width.
#[derive(Debug, Clone)]
pub struct Fnv1a128Hasher {
    state: u128,
}

impl Fnv1a128Hasher {
    /// Creates a hasher at the FNV-1a 128 offset basis.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: FNV_OFFSET_BASIS,
        }
    }

    /// Returns the full 128-bit hash.
    #[inline]
    #[must_use]
    pub const fn finish_u128(&self) -> u128 {
        self.state
    }
}

impl Default for Fnv1a128Hasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher for Fnv1a128Hasher {
    #[inline]
    fn finish(&self) -> u64 {
        // xor-fold the two halves
        ((self.state >> 64) as u64) ^ (self.state as u64)
    }

    #[inline]
    fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.state ^= u128::from(byte);
            self.state = self.state.wrapping_mul(FNV_PRIME);
        }
    }
}

/// Computes the FNV-1a 128 hash of `bytes`.
#[inline]
#[must_use]
pub fn fnv1a128(bytes: &[u8]) -> u128 {
    let mut hasher = Fnv1a128Hasher::new();
    hasher.write(bytes);
    hasher.finish_u128()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input_is_offset_basis() {
        assert_eq!(fnv1a128(b""), FNV_OFFSET_BASIS);
        assert_eq!(Fnv1a128Hasher::new().finish_u128(), FNV_OFFSET_BASIS);
    }

    #[test]
    fn test_known_fnv1a128_values() {
        assert_eq!(fnv1a128(b"a"), 0xd228_cb69_6f1a_8caf_7891_2b70_4e4a_8964);
        assert_eq!(
            fnv1a128(b"foobar"),
            0x343e_1662_793c_64bf_6f0d_3597_ba44_6f18
        );
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let mut hasher = Fnv1a128Hasher::new();
        hasher.write(b"Canvas");
        hasher.write(b"Stream");
        assert_eq!(hasher.finish_u128(), fnv1a128(b"CanvasStream"));
    }

    #[test]
    fn test_single_bit_flip_changes_hash() {
        let a = [0u8; 64];
        let mut b = a;
        b[40] = 1;
        assert_ne!(fnv1a128(&a), fnv1a128(&b));
    }

    #[test]
    fn test_finish_folds_halves() {
        let mut hasher = Fnv1a128Hasher::new();
        hasher.write(b"a");
        let full = hasher.finish_u128();
        assert_eq!(hasher.finish(), ((full >> 64) as u64) ^ (full as u64));
    }

    #[test]
    fn test_hash_trait_integration() {
        use std::hash::Hash;

        let mut h1 = Fnv1a128Hasher::new();
        (42u32, "gold").hash(&mut h1);
        let mut h2 = Fnv1a128Hasher::default();
        (42u32, "gold").hash(&mut h2);
        assert_eq!(h1.finish_u128(), h2.finish_u128());
    }
}
