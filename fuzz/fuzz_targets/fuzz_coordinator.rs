//! Fuzz target for coordinator message handling.
//!
//! Feeds arbitrary interleavings of ticks, raw messages and resync triggers into
//! a peer and an authority coordinator.
//!
//! # Safety Properties Tested
//! - No panics on arbitrary message sequences or senders
//! - Only `ResyncFailed` escapes the entry points
//! - A failed recovery leaves the coordinator in the `Failed` phase

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use lockstep_resync::{
    LoadError, MessageKind, PeerId, ResyncPhase, Role, Simulation, SimulationSnapshot,
    SyncError, SyncMessage, SynchronizerBuilder, Tick, Transport,
};

#[derive(Default)]
struct Sim {
    tick: u32,
    state: Vec<u8>,
}

impl Simulation for Sim {
    fn capture_snapshot(&mut self) -> SimulationSnapshot {
        SimulationSnapshot::new(Tick::new(self.tick), self.state.clone())
    }
    fn load_full_state(&mut self, snapshot: &SimulationSnapshot) -> Result<(), LoadError> {
        if snapshot.bytes().first() == Some(&0xff) {
            return Err(LoadError::new("rejected"));
        }
        self.state = snapshot.bytes().to_vec();
        self.tick = snapshot.tick().as_u32();
        Ok(())
    }
    fn current_advance_tick(&self) -> Tick {
        Tick::new(self.tick)
    }
    fn dispatch(&mut self, message_id: u32, raw: &[u8], _sender: PeerId) {
        self.state.push(message_id as u8);
        self.state.extend_from_slice(raw.get(..4).unwrap_or(raw));
    }
}

struct Sink;

impl Transport for Sink {
    fn send_to(&mut self, _peer: PeerId, _msg: &SyncMessage) {}
    fn broadcast(&mut self, _msg: &SyncMessage) {}
}

#[derive(Debug, Arbitrary)]
enum Op {
    Advance,
    Trigger,
    Poll,
    Deliver { kind: u8, game_id: u32, sender: u8, data: Vec<u8> },
    RemovePeer(u8),
}

fn kind(tag: u8, game_id: u32) -> MessageKind {
    match tag % 6 {
        0 => MessageKind::SyncCheckBroadcast,
        1 => MessageKind::SyncCheckAck,
        2 => MessageKind::RequestSync,
        3 => MessageKind::SyncData,
        4 => MessageKind::UnlockGame,
        _ => MessageKind::Game(game_id),
    }
}

fuzz_target!(|input: (bool, Vec<Op>)| {
    let (authority, ops) = input;
    let role = if authority { Role::Authority } else { Role::Peer };
    let local = if authority { PeerId::new(1) } else { PeerId::new(2) };
    let mut builder = SynchronizerBuilder::new(local, role).with_authority(PeerId::new(1));
    for id in 1..=4 {
        if id != local.as_u32() {
            builder = builder.add_peer(PeerId::new(id));
        }
    }
    let sim = Sim {
        tick: 0,
        state: vec![1, 2, 3],
    };
    let mut coordinator = builder.start(sim, Sink).expect("valid setup");

    for op in ops {
        let result = match op {
            Op::Advance => {
                if coordinator.resync_phase() == ResyncPhase::NotSyncing {
                    coordinator.simulation_mut().tick += 1;
                }
                let tick = coordinator.simulation().current_advance_tick();
                coordinator.on_advance_tick(tick)
            },
            Op::Trigger => coordinator.trigger_resync(),
            Op::Poll => coordinator.poll(),
            Op::Deliver {
                kind: tag,
                game_id,
                sender,
                data,
            } => coordinator.on_message(kind(tag, game_id), &data, PeerId::new(u32::from(sender % 5))),
            Op::RemovePeer(peer) => coordinator.remove_peer(PeerId::new(u32::from(peer % 5))),
        };
        if let Err(err) = result {
            assert!(matches!(err, SyncError::ResyncFailed { .. }));
            assert_eq!(coordinator.resync_phase(), ResyncPhase::Failed);
        }
        let _ = coordinator.events().count();
    }
});
