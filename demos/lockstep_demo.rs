//! In-process lockstep session that injects a desync and watches it heal.
//!
//! ```text
//! cargo run --example lockstep_demo -- --peers 4 --ticks 120 --corrupt-peer 3 --corrupt-at 25
//! ```

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use clap::Parser;
use lockstep_resync::network::codec::{decode, encode, encode_message};
use lockstep_resync::{
    LoadError, MessageKind, PeerId, ResyncPhase, Role, Simulation, SimulationSnapshot,
    SyncCoordinator, SyncEvent, SyncMessage, SynchronizerBuilder, SynchronizerConfig, Tick,
    Transport,
};
use serde::{Deserialize, Serialize};

#[derive(Parser)]
struct Opt {
    /// Number of peers, the authority included
    #[arg(short, long, default_value_t = 3)]
    peers: u32,
    /// Ticks to simulate
    #[arg(short, long, default_value_t = 100)]
    ticks: u32,
    /// Sync check interval in ticks
    #[arg(short, long, default_value_t = 10)]
    interval: u32,
    /// Peer whose state gets corrupted
    #[arg(long, default_value_t = 2)]
    corrupt_peer: u32,
    /// Tick at which the corruption happens
    #[arg(long, default_value_t = 15)]
    corrupt_at: u32,
}

/// A tiny economy: every unit of gold gets taxed each tick, orders add gold.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Economy {
    tick: u32,
    gold: u64,
    orders: u32,
}

impl Simulation for Economy {
    fn capture_snapshot(&mut self) -> SimulationSnapshot {
        SimulationSnapshot::new(Tick::new(self.tick), encode(&*self).unwrap_or_default())
    }

    fn load_full_state(&mut self, snapshot: &SimulationSnapshot) -> Result<(), LoadError> {
        let (state, _): (Economy, usize) =
            decode(snapshot.bytes()).map_err(|err| LoadError::new(err.to_string()))?;
        *self = state;
        Ok(())
    }

    fn current_advance_tick(&self) -> Tick {
        Tick::new(self.tick)
    }

    fn dispatch(&mut self, message_id: u32, _raw: &[u8], _sender: PeerId) {
        self.gold += u64::from(message_id);
        self.orders += 1;
    }
}

type Wire = Rc<RefCell<VecDeque<(PeerId, PeerId, MessageKind, Vec<u8>)>>>;

struct LoopbackTransport {
    local: PeerId,
    peers: Vec<PeerId>,
    wire: Wire,
}

impl Transport for LoopbackTransport {
    fn send_to(&mut self, peer: PeerId, msg: &SyncMessage) {
        match encode_message(msg) {
            Ok(bytes) => self
                .wire
                .borrow_mut()
                .push_back((self.local, peer, msg.kind(), bytes)),
            Err(err) => tracing::error!(%err, "dropping unencodable message"),
        }
    }

    fn broadcast(&mut self, msg: &SyncMessage) {
        for peer in self.peers.clone() {
            if peer != self.local {
                self.send_to(peer, msg);
            }
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // configure logging: output sync protocol and demo logs to standard out
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(tracing::Level::INFO)
            .finish(),
    )?;

    let opt = Opt::parse();
    let ids: Vec<PeerId> = (1..=opt.peers.max(1)).map(PeerId::new).collect();
    let authority = PeerId::new(1);
    let wire: Wire = Rc::default();
    let config = SynchronizerConfig {
        check_interval: opt.interval,
        ..SynchronizerConfig::default()
    };

    let mut nodes: BTreeMap<PeerId, SyncCoordinator<Economy, LoopbackTransport>> = BTreeMap::new();
    for &id in &ids {
        let role = if id == authority {
            Role::Authority
        } else {
            Role::Peer
        };
        let mut builder = SynchronizerBuilder::new(id, role)
            .with_authority(authority)
            .with_config(config.clone());
        for &other in ids.iter().filter(|other| **other != id) {
            builder = builder.add_peer(other);
        }
        let transport = LoopbackTransport {
            local: id,
            peers: ids.clone(),
            wire: Rc::clone(&wire),
        };
        nodes.insert(id, builder.start(Economy::default(), transport)?);
    }

    for _ in 0..opt.ticks {
        for (id, node) in &mut nodes {
            if node.resync_phase() != ResyncPhase::NotSyncing {
                continue;
            }
            let sim = node.simulation_mut();
            sim.tick += 1;
            sim.gold = sim.gold.saturating_mul(101) / 100;
            if id.as_u32() == opt.corrupt_peer && sim.tick == opt.corrupt_at {
                tracing::warn!(peer = %id, tick = sim.tick, "injecting desync");
                sim.gold += 1;
            }
            let tick = Tick::new(sim.tick);
            node.on_advance_tick(tick)?;
        }

        // every third tick the authority issues an order to everyone
        if let Some(tick) = nodes.get(&authority).map(|n| n.simulation().tick) {
            if tick % 3 == 0 {
                let mut wire = wire.borrow_mut();
                for &to in &ids {
                    wire.push_back((authority, to, MessageKind::Game(tick % 7 + 1), Vec::new()));
                }
            }
        }

        loop {
            let next = wire.borrow_mut().pop_front();
            let Some((from, to, kind, bytes)) = next else {
                break;
            };
            if let Some(node) = nodes.get_mut(&to) {
                node.on_message(kind, &bytes, from)?;
            }
        }

        for (id, node) in &mut nodes {
            node.poll()?;
            for event in node.events() {
                match event {
                    SyncEvent::SyncCheckPassed { .. } => {
                        tracing::debug!(peer = %id, ?event, "sync event");
                    },
                    _ => tracing::info!(peer = %id, ?event, "sync event"),
                }
            }
        }
    }

    let states: Vec<&Economy> = nodes.values().map(|n| n.simulation()).collect();
    let converged = states.windows(2).all(|w| w[0] == w[1]);
    tracing::info!(converged, final_state = ?states.first(), "session finished");
    Ok(())
}
