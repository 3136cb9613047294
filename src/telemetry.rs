//! Structured telemetry for protocol violations.
//!
//! Everything the sync subsystem absorbs instead of surfacing (stale acks,
//! malformed payloads, peers breaking the protocol, timeouts) is reported as a
//! [`SyncViolation`] to a [`ViolationObserver`]. Violations are structured data
//! that can be:
//!
//! - Logged via tracing (the default [`TracingObserver`])
//! - Collected programmatically for testing ([`CollectingObserver`])
//! - Sent to custom observers (metrics, alerting, etc.)
//!
//! # Example
//!
//! ```
//! use lockstep_resync::telemetry::{CollectingObserver, ViolationKind, ViolationObserver};
//! use lockstep_resync::{sync_violation, telemetry::ViolationSeverity, PeerId};
//!
//! let observer = CollectingObserver::new();
//! observer.on_violation(
//!     &sync_violation!(ViolationSeverity::Info, ViolationKind::StaleAck, "stale ack for {}", 7)
//!         .with_peer(PeerId::new(2)),
//! );
//! assert!(observer.has_violation(ViolationKind::StaleAck));
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{PeerId, SyncError, Tick};

/// Severity of a protocol violation.
///
/// Severities are ordered from least to most severe, allowing filtering
/// and comparison operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    /// Expected under normal network conditions. Logged for diagnostics only.
    ///
    /// Example: an ack for a round that already retired.
    Info,
    /// Unexpected but recoverable.
    ///
    /// Example: a broadcast arrived before the local snapshot for its tick.
    Warning,
    /// A peer broke the protocol. The offending message was discarded.
    Error,
    /// The session can no longer guarantee consistency.
    Critical,
}

impl ViolationSeverity {
    /// Returns a string representation suitable for logging/metrics labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }

    /// The severity an absorbed [`SyncError`] is reported at.
    #[must_use]
    pub const fn for_error(error: &SyncError) -> Self {
        match error {
            SyncError::StaleAck { .. } => Self::Info,
            SyncError::InvalidSnapshot { .. } | SyncError::TickMismatch { .. } => Self::Warning,
            SyncError::ProtocolViolation { .. } | SyncError::Codec { .. } => Self::Error,
            SyncError::InvalidConfig { .. } => Self::Error,
            SyncError::ResyncFailed { .. } => Self::Critical,
        }
    }
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Categories of protocol violations.
///
/// # Forward Compatibility
///
/// This enum is marked `#[non_exhaustive]` because new violation categories
/// may be added in future versions. Always include a wildcard arm when matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ViolationKind {
    /// A snapshot could not be fingerprinted.
    InvalidSnapshot,
    /// Fingerprint and local snapshot belong to different ticks.
    TickMismatch,
    /// An ack arrived for a retired or unknown round.
    StaleAck,
    /// A peer broke the protocol.
    ///
    /// Examples:
    /// - Full state received with no recovery in progress
    /// - A non-authority broadcasting a fingerprint
    ProtocolViolation,
    /// Recovery failed.
    ResyncFailed,
    /// The deferral queue misbehaved or grew past its warning threshold.
    MessageGate,
    /// A peer did not answer in time.
    Timeout,
    /// Configuration constraint violated at runtime.
    Configuration,
}

impl ViolationKind {
    /// Returns a string representation suitable for logging/metrics labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidSnapshot => "invalid_snapshot",
            Self::TickMismatch => "tick_mismatch",
            Self::StaleAck => "stale_ack",
            Self::ProtocolViolation => "protocol_violation",
            Self::ResyncFailed => "resync_failed",
            Self::MessageGate => "message_gate",
            Self::Timeout => "timeout",
            Self::Configuration => "configuration",
        }
    }

    /// The category an absorbed [`SyncError`] is reported under.
    #[must_use]
    pub const fn for_error(error: &SyncError) -> Self {
        match error {
            SyncError::InvalidSnapshot { .. } => Self::InvalidSnapshot,
            SyncError::TickMismatch { .. } => Self::TickMismatch,
            SyncError::StaleAck { .. } => Self::StaleAck,
            SyncError::ProtocolViolation { .. } | SyncError::Codec { .. } => {
                Self::ProtocolViolation
            },
            SyncError::ResyncFailed { .. } => Self::ResyncFailed,
            SyncError::InvalidConfig { .. } => Self::Configuration,
        }
    }
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded protocol violation.
///
/// # Serialization
///
/// `tick` and `peer` serialize as plain integers, or `null` when absent.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SyncViolation {
    /// The severity level of this violation.
    pub severity: ViolationSeverity,
    /// The category of the violation.
    pub kind: ViolationKind,
    /// Human-readable description of what went wrong.
    pub message: String,
    /// Source location where the violation was detected (file:line).
    pub location: &'static str,
    /// The advance tick the violation relates to, if any.
    pub tick: Option<Tick>,
    /// The remote peer involved, if any.
    pub peer: Option<PeerId>,
    /// Additional structured context as key-value pairs.
    pub context: BTreeMap<String, String>,
}

impl SyncViolation {
    /// Creates a new violation.
    #[must_use]
    pub fn new(
        severity: ViolationSeverity,
        kind: ViolationKind,
        message: impl Into<String>,
        location: &'static str,
    ) -> Self {
        Self {
            severity,
            kind,
            message: message.into(),
            location,
            tick: None,
            peer: None,
            context: BTreeMap::new(),
        }
    }

    /// Creates a violation describing an absorbed error, with the severity and
    /// kind mapped from the error variant.
    #[must_use]
    pub fn from_error(error: &SyncError, location: &'static str) -> Self {
        Self::new(
            ViolationSeverity::for_error(error),
            ViolationKind::for_error(error),
            error.to_string(),
            location,
        )
    }

    /// Sets the tick the violation relates to.
    #[must_use]
    pub fn with_tick(mut self, tick: Tick) -> Self {
        self.tick = Some(tick);
        self
    }

    /// Sets the remote peer involved.
    #[must_use]
    pub fn with_peer(mut self, peer: PeerId) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Adds a context key-value pair.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Serializes this violation to a JSON string.
    ///
    /// Returns `None` if serialization fails.
    #[cfg(feature = "json")]
    #[must_use]
    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }

    /// Serializes this violation to a pretty-printed JSON string.
    #[cfg(feature = "json")]
    #[must_use]
    pub fn to_json_pretty(&self) -> Option<String> {
        serde_json::to_string_pretty(self).ok()
    }
}

impl std::fmt::Display for SyncViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}/{}] {} (at {}",
            self.severity, self.kind, self.message, self.location
        )?;
        if let Some(tick) = self.tick {
            write!(f, ", tick={tick}")?;
        }
        if let Some(peer) = self.peer {
            write!(f, ", peer={peer}")?;
        }
        if !self.context.is_empty() {
            write!(f, ", context={:?}", self.context)?;
        }
        write!(f, ")")
    }
}

/// Trait for observing protocol violations.
///
/// Implement this trait to react to violations (logging, metrics, alerting).
/// Observers are shared through `Arc`, so they must be `Send + Sync`.
///
/// # Example
///
/// ```
/// use lockstep_resync::telemetry::{SyncViolation, ViolationObserver};
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// #[derive(Default)]
/// struct CountingObserver(AtomicUsize);
///
/// impl ViolationObserver for CountingObserver {
///     fn on_violation(&self, _violation: &SyncViolation) {
///         self.0.fetch_add(1, Ordering::Relaxed);
///     }
/// }
/// ```
pub trait ViolationObserver: Send + Sync {
    /// Called when a violation is detected.
    ///
    /// Runs in-line with message handling and should return quickly.
    fn on_violation(&self, violation: &SyncViolation);
}

/// Built-in observer that logs violations via the `tracing` crate.
///
/// # Log Levels
///
/// - `Info` severity → `tracing::info!`
/// - `Warning` severity → `tracing::warn!`
/// - `Error` and `Critical` severity → `tracing::error!`
#[derive(Debug, Default, Clone)]
pub struct TracingObserver;

impl TracingObserver {
    /// Creates a new tracing observer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn format_optional<T: std::fmt::Display>(value: Option<T>) -> String {
        value.map_or_else(|| "null".to_string(), |v| v.to_string())
    }
}

impl ViolationObserver for TracingObserver {
    fn on_violation(&self, violation: &SyncViolation) {
        let severity = violation.severity.as_str();
        let kind = violation.kind.as_str();
        let location = violation.location;
        let tick = Self::format_optional(violation.tick);
        let peer = Self::format_optional(violation.peer);

        let context = if violation.context.is_empty() {
            "{}".to_string()
        } else {
            let pairs: Vec<String> = violation
                .context
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            format!("{{{}}}", pairs.join(", "))
        };

        match violation.severity {
            ViolationSeverity::Info => {
                tracing::info!(
                    severity,
                    kind,
                    location,
                    tick = %tick,
                    peer = %peer,
                    context = %context,
                    "{}",
                    violation.message
                );
            },
            ViolationSeverity::Warning => {
                tracing::warn!(
                    severity,
                    kind,
                    location,
                    tick = %tick,
                    peer = %peer,
                    context = %context,
                    "{}",
                    violation.message
                );
            },
            ViolationSeverity::Error | ViolationSeverity::Critical => {
                tracing::error!(
                    severity,
                    kind,
                    location,
                    tick = %tick,
                    peer = %peer,
                    context = %context,
                    "{}",
                    violation.message
                );
            },
        }
    }
}

/// Built-in observer that collects violations for testing.
///
/// # Example
///
/// ```
/// use lockstep_resync::telemetry::{
///     CollectingObserver, SyncViolation, ViolationKind, ViolationObserver, ViolationSeverity,
/// };
///
/// let observer = CollectingObserver::new();
/// observer.on_violation(&SyncViolation::new(
///     ViolationSeverity::Warning,
///     ViolationKind::TickMismatch,
///     "test violation",
///     "test.rs:1",
/// ));
///
/// assert_eq!(observer.violations().len(), 1);
/// assert!(observer.has_violation(ViolationKind::TickMismatch));
/// ```
#[derive(Debug, Default)]
pub struct CollectingObserver {
    violations: Mutex<Vec<SyncViolation>>,
}

impl CollectingObserver {
    /// Creates a new collecting observer with an empty violation list.
    #[must_use]
    pub fn new() -> Self {
        Self {
            violations: Mutex::new(Vec::new()),
        }
    }

    /// Returns a copy of all collected violations.
    #[must_use]
    pub fn violations(&self) -> Vec<SyncViolation> {
        self.violations.lock().clone()
    }

    /// Returns the number of collected violations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.violations.lock().len()
    }

    /// Returns true if no violations have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.violations.lock().is_empty()
    }

    /// Checks if any violation of the specified kind has been collected.
    #[must_use]
    pub fn has_violation(&self, kind: ViolationKind) -> bool {
        self.violations.lock().iter().any(|v| v.kind == kind)
    }

    /// Checks if any violation with the specified severity has been collected.
    #[must_use]
    pub fn has_severity(&self, severity: ViolationSeverity) -> bool {
        self.violations
            .lock()
            .iter()
            .any(|v| v.severity == severity)
    }

    /// Returns all violations matching the specified kind.
    #[must_use]
    pub fn violations_of_kind(&self, kind: ViolationKind) -> Vec<SyncViolation> {
        self.violations
            .lock()
            .iter()
            .filter(|v| v.kind == kind)
            .cloned()
            .collect()
    }

    /// Returns all violations at or above the specified severity.
    #[must_use]
    pub fn violations_at_severity(&self, min_severity: ViolationSeverity) -> Vec<SyncViolation> {
        self.violations
            .lock()
            .iter()
            .filter(|v| v.severity >= min_severity)
            .cloned()
            .collect()
    }

    /// Clears all collected violations.
    pub fn clear(&self) {
        self.violations.lock().clear();
    }
}

impl ViolationObserver for CollectingObserver {
    fn on_violation(&self, violation: &SyncViolation) {
        self.violations.lock().push(violation.clone());
    }
}

/// Forwards violations to multiple observers.
///
/// Useful to both log violations and collect them for testing.
#[derive(Default)]
pub struct CompositeObserver {
    observers: Vec<Arc<dyn ViolationObserver>>,
}

impl CompositeObserver {
    /// Creates a new composite observer with no child observers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            observers: Vec::new(),
        }
    }

    /// Adds an observer to the composite.
    pub fn add(&mut self, observer: Arc<dyn ViolationObserver>) {
        self.observers.push(observer);
    }

    /// Creates a composite observer from a list of observers.
    #[must_use]
    pub fn from_observers(observers: Vec<Arc<dyn ViolationObserver>>) -> Self {
        Self { observers }
    }
}

impl ViolationObserver for CompositeObserver {
    fn on_violation(&self, violation: &SyncViolation) {
        for observer in &self.observers {
            observer.on_violation(violation);
        }
    }
}

impl std::fmt::Debug for CompositeObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeObserver")
            .field("num_observers", &self.observers.len())
            .finish()
    }
}

/// Builds a [`SyncViolation`] stamped with the current file and line.
///
/// # Syntax
///
/// ```text
/// sync_violation!(severity, kind, "message");
/// sync_violation!(severity, kind, "message with {}", format_args);
/// ```
#[macro_export]
macro_rules! sync_violation {
    ($severity:expr, $kind:expr, $msg:literal) => {
        $crate::telemetry::SyncViolation::new(
            $severity,
            $kind,
            $msg,
            concat!(file!(), ":", line!()),
        )
    };

    ($severity:expr, $kind:expr, $fmt:literal, $($arg:tt)+) => {
        $crate::telemetry::SyncViolation::new(
            $severity,
            $kind,
            format!($fmt, $($arg)+),
            concat!(file!(), ":", line!()),
        )
    };
}

/// Reports a violation straight to an observer, stamped with the current file and line.
///
/// ```
/// use lockstep_resync::report_violation;
/// use lockstep_resync::telemetry::{CollectingObserver, ViolationKind, ViolationSeverity};
///
/// let observer = CollectingObserver::new();
/// report_violation!(observer, ViolationSeverity::Warning, ViolationKind::MessageGate,
///     "{} messages deferred", 512);
/// assert_eq!(observer.len(), 1);
/// ```
#[macro_export]
macro_rules! report_violation {
    ($observer:expr, $severity:expr, $kind:expr, $($rest:tt)+) => {{
        use $crate::telemetry::ViolationObserver as _;
        let violation = $crate::sync_violation!($severity, $kind, $($rest)+);
        $observer.on_violation(&violation);
    }};
}

/// Asserts that no violations have been collected.
///
/// # Panics
///
/// Panics if the observer contains any violations, printing them for debugging.
#[macro_export]
macro_rules! assert_no_violations {
    ($observer:expr) => {{
        let violations = $observer.violations();
        assert!(
            violations.is_empty(),
            "Expected no violations, but found {}:\n{:#?}",
            violations.len(),
            violations
        );
    }};

    ($observer:expr, $msg:expr) => {{
        let violations = $observer.violations();
        assert!(
            violations.is_empty(),
            "{}\nExpected no violations, but found {}:\n{:#?}",
            $msg,
            violations.len(),
            violations
        );
    }};
}

/// Asserts that a violation of the specified kind was collected.
///
/// # Panics
///
/// Panics if no violation of the specified kind was found.
#[macro_export]
macro_rules! assert_violation {
    ($observer:expr, $kind:expr) => {{
        assert!(
            $observer.has_violation($kind),
            "Expected violation of kind {:?}, but found: {:#?}",
            $kind,
            $observer.violations()
        );
    }};

    ($observer:expr, $kind:expr, $msg:expr) => {{
        assert!(
            $observer.has_violation($kind),
            "{}\nExpected violation of kind {:?}, but found: {:#?}",
            $msg,
            $kind,
            $observer.violations()
        );
    }};
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
    use crate::error::{ProtocolViolationKind, ResyncFailure};
    use crate::SyncId;

    #[test]
    fn test_violation_severity_ordering() {
        assert!(ViolationSeverity::Info < ViolationSeverity::Warning);
        assert!(ViolationSeverity::Warning < ViolationSeverity::Error);
        assert!(ViolationSeverity::Error < ViolationSeverity::Critical);
    }

    #[test]
    fn test_violation_kind_as_str() {
        assert_eq!(ViolationKind::StaleAck.as_str(), "stale_ack");
        assert_eq!(ViolationKind::TickMismatch.as_str(), "tick_mismatch");
        assert_eq!(
            ViolationKind::ProtocolViolation.as_str(),
            "protocol_violation"
        );
        assert_eq!(ViolationKind::MessageGate.as_str(), "message_gate");
    }

    #[test]
    fn test_error_severity_mapping() {
        let stale = SyncError::StaleAck {
            sync_id: SyncId::new(1),
            sender: PeerId::new(2),
        };
        assert_eq!(ViolationSeverity::for_error(&stale), ViolationSeverity::Info);

        let mismatch = SyncError::TickMismatch {
            expected: Tick::new(10),
            actual: Tick::new(9),
        };
        assert_eq!(
            ViolationSeverity::for_error(&mismatch),
            ViolationSeverity::Warning
        );

        let protocol = SyncError::from(ProtocolViolationKind::CheckFromNonAuthority);
        assert_eq!(
            ViolationSeverity::for_error(&protocol),
            ViolationSeverity::Error
        );

        let failed = SyncError::from(ResyncFailure::CaptureFailed { tick: Tick::ZERO });
        assert_eq!(
            ViolationSeverity::for_error(&failed),
            ViolationSeverity::Critical
        );
        assert_eq!(ViolationKind::for_error(&failed), ViolationKind::ResyncFailed);
    }

    #[test]
    fn test_from_error_carries_message() {
        let err = SyncError::StaleAck {
            sync_id: SyncId::new(4),
            sender: PeerId::new(9),
        };
        let violation = SyncViolation::from_error(&err, "here.rs:1");
        assert_eq!(violation.kind, ViolationKind::StaleAck);
        assert_eq!(violation.message, err.to_string());
    }

    #[test]
    fn test_violation_display() {
        let violation = SyncViolation::new(
            ViolationSeverity::Warning,
            ViolationKind::TickMismatch,
            "late",
            "file.rs:3",
        )
        .with_tick(Tick::new(40))
        .with_peer(PeerId::new(2))
        .with_context("retries", "3");
        let text = violation.to_string();
        assert!(text.starts_with("[warning/tick_mismatch] late (at file.rs:3"));
        assert!(text.contains("tick=40"));
        assert!(text.contains("peer=2"));
        assert!(text.contains("retries"));
    }

    #[test]
    fn test_collecting_observer_filters() {
        let observer = CollectingObserver::new();
        observer.on_violation(&sync_violation!(
            ViolationSeverity::Info,
            ViolationKind::StaleAck,
            "stale"
        ));
        observer.on_violation(&sync_violation!(
            ViolationSeverity::Error,
            ViolationKind::ProtocolViolation,
            "bad {}",
            "peer"
        ));
        assert_eq!(observer.len(), 2);
        assert!(observer.has_severity(ViolationSeverity::Info));
        assert_eq!(
            observer
                .violations_at_severity(ViolationSeverity::Warning)
                .len(),
            1
        );
        assert_eq!(
            observer.violations_of_kind(ViolationKind::ProtocolViolation)[0].message,
            "bad peer"
        );
        observer.clear();
        assert!(observer.is_empty());
    }

    #[test]
    fn test_composite_observer_forwards() {
        let a = Arc::new(CollectingObserver::new());
        let b = Arc::new(CollectingObserver::new());
        let mut composite = CompositeObserver::new();
        composite.add(a.clone());
        composite.add(b.clone());
        report_violation!(
            composite,
            ViolationSeverity::Warning,
            ViolationKind::Timeout,
            "slow"
        );
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert!(format!("{:?}", composite).contains("num_observers: 2"));
    }

    #[test]
    fn test_location_is_recorded() {
        let violation = sync_violation!(
            ViolationSeverity::Info,
            ViolationKind::StaleAck,
            "stale"
        );
        assert!(violation.location.starts_with(file!()));
    }

    #[test]
    fn test_tracing_observer_does_not_panic() {
        let observer = TracingObserver::new();
        for severity in [
            ViolationSeverity::Info,
            ViolationSeverity::Warning,
            ViolationSeverity::Error,
            ViolationSeverity::Critical,
        ] {
            observer.on_violation(&SyncViolation::new(
                severity,
                ViolationKind::Configuration,
                "msg",
                "loc",
            ));
        }
    }

    #[cfg(feature = "json")]
    #[test]
    fn test_json_output() {
        let violation = SyncViolation::new(
            ViolationSeverity::Error,
            ViolationKind::ProtocolViolation,
            "bad",
            "x.rs:1",
        )
        .with_tick(Tick::new(100))
        .with_peer(PeerId::new(3));
        let json = violation.to_json().unwrap();
        assert!(json.contains(r#""severity":"error""#));
        assert!(json.contains(r#""kind":"protocol_violation""#));
        assert!(json.contains(r#""tick":100"#));
        assert!(json.contains(r#""peer":3"#));
    }
}
