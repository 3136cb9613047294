//! Common test infrastructure shared across integration tests.
//!
//! This module provides:
//! - `stubs`: a deterministic simulation stub with divergence injection
//! - `test_utils`: an in-memory transport and a cluster harness that delivers
//!   messages through the wire codec in FIFO order
//!
//! # Usage
//!
//! From any integration test file:
//! ```ignore
//! mod common;
//! use common::{Cluster, StubWorld};
//! ```

pub mod stubs;
pub mod test_utils;

#[allow(unused_imports)]
pub use stubs::{StubState, StubWorld};
#[allow(unused_imports)]
pub use test_utils::{Cluster, Envelope, MailboxTransport, Network, Node, AUTHORITY, MAX_DELIVERIES};
