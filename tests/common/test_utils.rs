//! In-memory transport and a cluster harness.
//!
//! Every node sends through a [`MailboxTransport`] that encodes messages with the
//! wire codec and appends them to one shared FIFO. [`Cluster::pump`] delivers that
//! FIFO until it drains, so per-sender order holds and every node sees game
//! messages in the same global order.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    dead_code
)]

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::rc::Rc;
use std::sync::Arc;

use lockstep_resync::network::codec::{decode_message, encode_message};
use lockstep_resync::telemetry::CollectingObserver;
use lockstep_resync::{
    CollectingEvidenceSink, MessageKind, PeerId, ResyncPhase, Role, SyncCoordinator, SyncError,
    SyncEvent, SyncMessage, SynchronizerBuilder, SynchronizerConfig, Transport,
};

use super::stubs::StubWorld;

/// The authority of every test cluster.
pub const AUTHORITY: PeerId = PeerId::new(1);

/// Upper bound on deliveries per pump, to turn a message storm into a test failure.
pub const MAX_DELIVERIES: usize = 10_000;

/// One message in flight.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: PeerId,
    pub to: PeerId,
    pub kind: MessageKind,
    pub bytes: Vec<u8>,
}

/// The shared wire.
#[derive(Debug, Default)]
pub struct Network {
    pub queue: VecDeque<Envelope>,
    /// Every envelope ever sent, in send order.
    pub history: Vec<Envelope>,
    pub members: BTreeSet<PeerId>,
}

impl Network {
    fn push(&mut self, envelope: Envelope) {
        self.history.push(envelope.clone());
        self.queue.push_back(envelope);
    }

    /// Number of envelopes of `kind` sent by `from`. A broadcast counts once per receiver.
    #[must_use]
    pub fn count_sent(&self, from: PeerId, kind: MessageKind) -> usize {
        self.history
            .iter()
            .filter(|e| e.from == from && e.kind == kind)
            .count()
    }

    /// Decoded sync messages `from` sent to `to`, in send order.
    #[must_use]
    pub fn sync_messages(&self, from: PeerId, to: PeerId) -> Vec<SyncMessage> {
        self.history
            .iter()
            .filter(|e| e.from == from && e.to == to && e.kind.is_sync())
            .map(|e| decode_message(e.kind, &e.bytes).unwrap())
            .collect()
    }
}

/// A [`Transport`] writing into the shared [`Network`].
pub struct MailboxTransport {
    local: PeerId,
    network: Rc<RefCell<Network>>,
}

impl MailboxTransport {
    fn envelope(&self, to: PeerId, msg: &SyncMessage) -> Envelope {
        Envelope {
            from: self.local,
            to,
            kind: msg.kind(),
            bytes: encode_message(msg).unwrap(),
        }
    }
}

impl Transport for MailboxTransport {
    fn send_to(&mut self, peer: PeerId, msg: &SyncMessage) {
        let envelope = self.envelope(peer, msg);
        self.network.borrow_mut().push(envelope);
    }

    fn broadcast(&mut self, msg: &SyncMessage) {
        let members: Vec<PeerId> = self.network.borrow().members.iter().copied().collect();
        let local = self.local;
        for peer in members.into_iter().filter(|p| *p != local) {
            self.send_to(peer, msg);
        }
    }
}

pub type Node = SyncCoordinator<StubWorld, MailboxTransport>;

/// A whole session: one authority (peer 1) and `n - 1` peers.
pub struct Cluster {
    pub network: Rc<RefCell<Network>>,
    pub nodes: BTreeMap<PeerId, Node>,
    pub observers: BTreeMap<PeerId, Arc<CollectingObserver>>,
    pub evidence: CollectingEvidenceSink,
    /// Fatal errors returned while delivering, with the node that returned them.
    pub failures: Vec<(PeerId, SyncError)>,
}

impl Cluster {
    #[must_use]
    pub fn new(size: u32) -> Self {
        Self::with_config(size, SynchronizerConfig::default())
    }

    #[must_use]
    pub fn with_config(size: u32, config: SynchronizerConfig) -> Self {
        assert!(size >= 1);
        let ids: Vec<PeerId> = (1..=size).map(PeerId::new).collect();
        let network = Rc::new(RefCell::new(Network {
            members: ids.iter().copied().collect(),
            ..Network::default()
        }));
        let evidence = CollectingEvidenceSink::new();
        let mut nodes = BTreeMap::new();
        let mut observers = BTreeMap::new();

        for &id in &ids {
            let observer = Arc::new(CollectingObserver::new());
            let role = if id == AUTHORITY {
                Role::Authority
            } else {
                Role::Peer
            };
            let mut builder = SynchronizerBuilder::new(id, role)
                .with_config(config.clone())
                .with_violation_observer(observer.clone());
            if id == AUTHORITY {
                builder = builder.with_evidence_sink(evidence.clone());
            } else {
                builder = builder.with_authority(AUTHORITY);
            }
            for &other in ids.iter().filter(|other| **other != id) {
                builder = builder.add_peer(other);
            }
            let transport = MailboxTransport {
                local: id,
                network: Rc::clone(&network),
            };
            nodes.insert(id, builder.start(StubWorld::new(), transport).unwrap());
            observers.insert(id, observer);
        }

        Self {
            network,
            nodes,
            observers,
            evidence,
            failures: Vec::new(),
        }
    }

    pub fn node(&self, id: u32) -> &Node {
        &self.nodes[&PeerId::new(id)]
    }

    pub fn node_mut(&mut self, id: u32) -> &mut Node {
        self.nodes.get_mut(&PeerId::new(id)).unwrap()
    }

    pub fn observer(&self, id: u32) -> &CollectingObserver {
        &self.observers[&PeerId::new(id)]
    }

    /// Delivers queued messages until the wire is empty.
    pub fn pump(&mut self) {
        for _ in 0..MAX_DELIVERIES {
            let Some(envelope) = self.network.borrow_mut().queue.pop_front() else {
                return;
            };
            let Some(node) = self.nodes.get_mut(&envelope.to) else {
                continue;
            };
            if let Err(err) = node.on_message(envelope.kind, &envelope.bytes, envelope.from) {
                self.failures.push((envelope.to, err));
            }
        }
        panic!("message storm: wire did not drain after {MAX_DELIVERIES} deliveries");
    }

    /// Advances every node that is not recovering by one tick, then pumps.
    pub fn advance(&mut self) {
        for (id, node) in &mut self.nodes {
            if node.resync_phase() != ResyncPhase::NotSyncing {
                continue;
            }
            let tick = node.simulation_mut().advance();
            if let Err(err) = node.on_advance_tick(tick) {
                self.failures.push((*id, err));
            }
        }
        self.pump();
    }

    pub fn advance_by(&mut self, ticks: u32) {
        for _ in 0..ticks {
            self.advance();
        }
    }

    /// Sends a game message from `from` to every member, itself included.
    pub fn send_game(&mut self, from: u32, message_id: u32) {
        let mut network = self.network.borrow_mut();
        let members: Vec<PeerId> = network.members.iter().copied().collect();
        for to in members {
            network.push(Envelope {
                from: PeerId::new(from),
                to,
                kind: MessageKind::Game(message_id),
                bytes: Vec::new(),
            });
        }
    }

    /// Drains the events of every node.
    pub fn drain_events(&mut self) -> BTreeMap<PeerId, Vec<SyncEvent>> {
        self.nodes
            .iter_mut()
            .map(|(id, node)| (*id, node.events().collect()))
            .collect()
    }

    /// Returns `true` if every node holds the same simulation state.
    #[must_use]
    pub fn converged(&self) -> bool {
        let mut states = self.nodes.values().map(|node| &node.simulation().gs);
        let Some(first) = states.next() else {
            return true;
        };
        states.all(|state| state == first)
    }

    #[must_use]
    pub fn all_idle(&self) -> bool {
        self.nodes
            .values()
            .all(|node| node.resync_phase() == ResyncPhase::NotSyncing && !node.is_locked())
    }
}
