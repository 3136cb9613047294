//! Configuration of a synchronizer.
//!
//! | Preset | Purpose |
//! |--------|---------|
//! | `SynchronizerConfig::new()` | Defaults: check every 10 ticks |
//! | `SynchronizerConfig::lan()` | Frequent checks, short timeouts |
//! | `SynchronizerConfig::high_latency()` | Sparse checks, tolerant timeouts |
//! | `SynchronizerConfig::debug()` | Check every other tick, low warning thresholds |
//!
//! # Example
//!
//! ```
//! use lockstep_resync::SynchronizerConfig;
//!
//! let config = SynchronizerConfig {
//!     check_interval: 30,
//!     check_offset: 5,
//!     ..SynchronizerConfig::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use web_time::Duration;

use crate::{InvalidConfigKind, SyncError};

/// Tuning knobs of the sync protocol.
///
/// # Forward Compatibility
///
/// New fields may be added to this struct in future versions. Construct it with
/// `..SynchronizerConfig::default()` to keep compiling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynchronizerConfig {
    /// A sync check runs on every tick with `tick % check_interval == check_offset`.
    ///
    /// Must be at least 2: checks are sampled, never run on every tick, and
    /// cannot be switched off. The default of 10 is an arbitrary starting point
    /// with no protocol significance. Tune it to the cost of capturing and
    /// hashing a snapshot of your simulation against how quickly a desync must
    /// be caught.
    ///
    /// Default: 10
    pub check_interval: u32,

    /// Offset into the check interval. Must be smaller than `check_interval`.
    ///
    /// Default: 0
    pub check_offset: u32,

    /// Number of snapshots kept for comparison and evidence.
    ///
    /// Must cover the ticks that pass while a fingerprint travels from the
    /// authority. Snapshots may be whole-world state, so keep it small.
    ///
    /// Default: 16
    pub snapshot_log_capacity: usize,

    /// Advance ticks the authority waits for all acks of a round.
    ///
    /// Peers that have not answered by then are recorded as not agreed.
    ///
    /// Default: 100
    pub ack_timeout_ticks: u32,

    /// Advance ticks a peer keeps a fingerprint for a tick it has not reached.
    ///
    /// Past this the peer answers with a disagreement.
    ///
    /// Default: 50
    pub tick_mismatch_timeout_ticks: u32,

    /// Whether an ack timeout alone triggers a recovery.
    ///
    /// Default: true
    pub resync_on_ack_timeout: bool,

    /// Whether the authority loads the full state it distributes, like every
    /// other peer does.
    ///
    /// Default: false
    pub apply_own_sync_data: bool,

    /// Whether disagreeing peers attach their snapshot to the ack.
    ///
    /// Default: true
    pub send_evidence: bool,

    /// A warning is reported each time this many messages are deferred.
    ///
    /// Default: 256
    pub gate_warning_threshold: usize,

    /// Wall-clock limit for a whole recovery, checked from `poll()`.
    ///
    /// Default: 30s
    pub confirmation_timeout: Duration,

    /// Maximum queued events. The oldest are dropped when the host does not drain them.
    ///
    /// Default: 128
    pub max_event_queue_size: usize,
}

impl Default for SynchronizerConfig {
    fn default() -> Self {
        Self {
            check_interval: 10,
            check_offset: 0,
            snapshot_log_capacity: 16,
            ack_timeout_ticks: 100,
            tick_mismatch_timeout_ticks: 50,
            resync_on_ack_timeout: true,
            apply_own_sync_data: false,
            send_evidence: true,
            gate_warning_threshold: 256,
            confirmation_timeout: Duration::from_secs(30),
            max_event_queue_size: 128,
        }
    }
}

impl SynchronizerConfig {
    /// Creates a new `SynchronizerConfig` with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for local networks: frequent checks and short timeouts.
    #[must_use]
    pub fn lan() -> Self {
        Self {
            check_interval: 5,
            ack_timeout_ticks: 30,
            tick_mismatch_timeout_ticks: 15,
            confirmation_timeout: Duration::from_secs(10),
            ..Self::default()
        }
    }

    /// Preset for slow links: sparse checks and a deeper log.
    #[must_use]
    pub fn high_latency() -> Self {
        Self {
            check_interval: 30,
            snapshot_log_capacity: 32,
            ack_timeout_ticks: 300,
            tick_mismatch_timeout_ticks: 150,
            confirmation_timeout: Duration::from_secs(60),
            ..Self::default()
        }
    }

    /// Preset for development: every other tick is checked, the authority loads
    /// its own state, and deferral warnings fire early.
    #[must_use]
    pub fn debug() -> Self {
        Self {
            check_interval: 2,
            apply_own_sync_data: true,
            gate_warning_threshold: 16,
            ..Self::default()
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidConfig`] if any value is out of range.
    pub fn validate(&self) -> Result<(), SyncError> {
        check_range("check_interval", u64::from(self.check_interval), 2, 100_000)?;
        if self.check_offset >= self.check_interval {
            return Err(InvalidConfigKind::OffsetNotBelowInterval {
                offset: self.check_offset,
                interval: self.check_interval,
            }
            .into());
        }
        check_range(
            "snapshot_log_capacity",
            self.snapshot_log_capacity as u64,
            1,
            1024,
        )?;
        check_range(
            "ack_timeout_ticks",
            u64::from(self.ack_timeout_ticks),
            1,
            1_000_000,
        )?;
        check_range(
            "tick_mismatch_timeout_ticks",
            u64::from(self.tick_mismatch_timeout_ticks),
            1,
            1_000_000,
        )?;
        check_range(
            "gate_warning_threshold",
            self.gate_warning_threshold as u64,
            1,
            1 << 20,
        )?;
        check_range(
            "confirmation_timeout_ms",
            self.confirmation_timeout.as_millis() as u64,
            1,
            600_000,
        )?;
        check_range(
            "max_event_queue_size",
            self.max_event_queue_size as u64,
            1,
            65_536,
        )?;
        Ok(())
    }
}

fn check_range(field: &'static str, actual: u64, min: u64, max: u64) -> Result<(), SyncError> {
    if actual < min || actual > max {
        return Err(InvalidConfigKind::ConfigValueOutOfRange {
            field,
            min,
            max,
            actual,
        }
        .into());
    }
    Ok(())
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
    fn presets_are_valid() {
        for config in [
            SynchronizerConfig::new(),
            SynchronizerConfig::lan(),
            SynchronizerConfig::high_latency(),
            SynchronizerConfig::debug(),
        ] {
            config.validate().unwrap();
        }
    }

    #[test]
    fn interval_below_two_is_rejected() {
        for interval in [0, 1] {
            let config = SynchronizerConfig {
                check_interval: interval,
                check_offset: 0,
                ..SynchronizerConfig::default()
            };
            assert_eq!(
                config.validate().unwrap_err(),
                SyncError::InvalidConfig {
                    kind: InvalidConfigKind::ConfigValueOutOfRange {
                        field: "check_interval",
                        min: 2,
                        max: 100_000,
                        actual: u64::from(interval),
                    }
                }
            );
        }
        let sparsest_allowed = SynchronizerConfig {
            check_interval: 2,
            check_offset: 1,
            ..SynchronizerConfig::default()
        };
        assert!(sparsest_allowed.validate().is_ok());
    }

    #[test]
    fn offset_must_be_below_interval() {
        let config = SynchronizerConfig {
            check_interval: 10,
            check_offset: 10,
            ..SynchronizerConfig::default()
        };
        assert_eq!(
            config.validate().unwrap_err(),
            SyncError::InvalidConfig {
                kind: InvalidConfigKind::OffsetNotBelowInterval {
                    offset: 10,
                    interval: 10
                }
            }
        );
    }

    #[test]
    fn out_of_range_values_name_the_field() {
        let cases: Vec<(SynchronizerConfig, &str)> = vec![
            (
                SynchronizerConfig {
                    snapshot_log_capacity: 0,
                    ..SynchronizerConfig::default()
                },
                "snapshot_log_capacity",
            ),
            (
                SynchronizerConfig {
                    ack_timeout_ticks: 0,
                    ..SynchronizerConfig::default()
                },
                "ack_timeout_ticks",
            ),
            (
                SynchronizerConfig {
                    confirmation_timeout: Duration::ZERO,
                    ..SynchronizerConfig::default()
                },
                "confirmation_timeout_ms",
            ),
            (
                SynchronizerConfig {
                    max_event_queue_size: 0,
                    ..SynchronizerConfig::default()
                },
                "max_event_queue_size",
            ),
        ];
        for (config, field) in cases {
            match config.validate() {
                Err(SyncError::InvalidConfig {
                    kind: InvalidConfigKind::ConfigValueOutOfRange { field: f, .. },
                }) => assert_eq!(f, field),
                other => panic!("expected {} to be rejected, got {:?}", field, other),
            }
        }
    }

    #[test]
    fn defaults_match_documentation() {
        let config = SynchronizerConfig::default();
        assert_eq!(config.check_interval, 10);
        assert_eq!(config.check_offset, 0);
        assert!(config.resync_on_ack_timeout);
        assert!(!config.apply_own_sync_data);
        assert_eq!(config.confirmation_timeout, Duration::from_secs(30));
    }
}
