//! Simulation stub for integration tests.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    dead_code
)]

use lockstep_resync::network::codec::{decode, encode};
use lockstep_resync::{LoadError, PeerId, Simulation, SimulationSnapshot, Tick};
use serde::{Deserialize, Serialize};

/// The complete deterministic state of the stub.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StubState {
    pub tick: u32,
    pub value: u64,
    pub applied: Vec<u32>,
}

/// A lockstep simulation whose state advances deterministically from ticks and
/// dispatched messages.
#[derive(Debug, Default)]
pub struct StubWorld {
    pub gs: StubState,
    /// Makes the next `load_full_state` fail.
    pub fail_next_load: bool,
    pub loads: usize,
}

impl StubWorld {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances one tick and returns the new tick.
    pub fn advance(&mut self) -> Tick {
        self.gs.tick += 1;
        self.gs.value = self.gs.value.wrapping_mul(31).wrapping_add(u64::from(self.gs.tick));
        Tick::new(self.gs.tick)
    }

    /// Corrupts the state the way a nondeterminism bug would.
    pub fn corrupt(&mut self, delta: u64) {
        self.gs.value = self.gs.value.wrapping_add(delta);
    }
}

impl Simulation for StubWorld {
    fn capture_snapshot(&mut self) -> SimulationSnapshot {
        SimulationSnapshot::new(Tick::new(self.gs.tick), encode(&self.gs).unwrap())
    }

    fn load_full_state(&mut self, snapshot: &SimulationSnapshot) -> Result<(), LoadError> {
        if std::mem::take(&mut self.fail_next_load) {
            return Err(LoadError::new("injected load failure"));
        }
        let (state, _): (StubState, usize) =
            decode(snapshot.bytes()).map_err(|err| LoadError::new(err.to_string()))?;
        self.gs = state;
        self.loads += 1;
        Ok(())
    }

    fn current_advance_tick(&self) -> Tick {
        Tick::new(self.gs.tick)
    }

    fn dispatch(&mut self, message_id: u32, _raw: &[u8], _sender: PeerId) {
        self.gs.value = self.gs.value.wrapping_add(u64::from(message_id));
        self.gs.applied.push(message_id);
    }
}
