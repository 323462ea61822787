//! Deterministic in-process cluster for integration tests
//!
//! Every node is a bare `ClusterState`; the harness routes outbound
//! messages synchronously, applies acks and feeds migration outcomes back,
//! so each call returns with the cluster quiescent.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use vnetdir::cluster::state::Effects;
use vnetdir::migration::{MigrationOutcome, ObjectClass, SessionId, TransferObject};
use vnetdir::transport::{Outbound, PeerMessage};
use vnetdir::{ClusterState, Config, DomainId, MemoryDomainStore, NodeAddr};

pub fn addr(s: &str) -> NodeAddr {
    s.parse().unwrap()
}

pub struct TestNode {
    pub state: ClusterState,
    pub store: Arc<MemoryDomainStore>,
    outcomes_rx: mpsc::UnboundedReceiver<MigrationOutcome>,
    /// Outcomes reported by this node's sessions, in order
    pub outcomes: Vec<MigrationOutcome>,
    pub sessions: Vec<SessionId>,
}

pub struct TestCluster {
    pub nodes: BTreeMap<NodeAddr, TestNode>,
    pub now: Instant,
    pub t0: Instant,
    down: HashSet<NodeAddr>,
    cut: HashSet<(NodeAddr, NodeAddr)>,
    drop: Option<Box<dyn Fn(&PeerMessage) -> bool>>,
    /// Every delivered message: (from, to, message)
    pub log: Vec<(NodeAddr, NodeAddr, PeerMessage)>,
}

impl TestCluster {
    pub fn new(addrs: &[&str]) -> Self {
        Self::with_config(addrs, |_| {})
    }

    pub fn with_config(addrs: &[&str], tweak: impl Fn(&mut Config)) -> Self {
        let t0 = Instant::now();
        let mut nodes = BTreeMap::new();
        for (i, local) in addrs.iter().enumerate() {
            let mut config = Config::default();
            config.node.address = local.to_string();
            config.node.peers = addrs
                .iter()
                .filter(|a| *a != local)
                .map(|a| a.to_string())
                .collect();
            tweak(&mut config);

            let store = Arc::new(MemoryDomainStore::new());
            let (tx, outcomes_rx) = mpsc::unbounded_channel();
            let mut state = ClusterState::new(config, store.clone(), tx, t0).unwrap();
            state.seed_placement(i as u64 + 1);
            nodes.insert(
                addr(local),
                TestNode {
                    state,
                    store,
                    outcomes_rx,
                    outcomes: Vec::new(),
                    sessions: Vec::new(),
                },
            );
        }
        Self {
            nodes,
            now: t0,
            t0,
            down: HashSet::new(),
            cut: HashSet::new(),
            drop: None,
            log: Vec::new(),
        }
    }

    pub fn node(&self, a: &str) -> &TestNode {
        &self.nodes[&addr(a)]
    }

    pub fn node_mut(&mut self, a: &str) -> &mut TestNode {
        self.nodes.get_mut(&addr(a)).unwrap()
    }

    pub fn elapsed_secs(&self) -> u64 {
        self.now.duration_since(self.t0).as_secs()
    }

    /// Stop a node: it neither ticks nor receives
    pub fn kill(&mut self, a: &str) {
        self.down.insert(addr(a));
    }

    pub fn revive(&mut self, a: &str) {
        self.down.remove(&addr(a));
    }

    /// Cut the link between two nodes in both directions
    pub fn partition(&mut self, a: &str, b: &str) {
        self.cut.insert((addr(a), addr(b)));
        self.cut.insert((addr(b), addr(a)));
    }

    pub fn heal(&mut self, a: &str, b: &str) {
        self.cut.remove(&(addr(a), addr(b)));
        self.cut.remove(&(addr(b), addr(a)));
    }

    /// Silently drop every message matching `pred`
    pub fn drop_messages(&mut self, pred: impl Fn(&PeerMessage) -> bool + 'static) {
        self.drop = Some(Box::new(pred));
    }

    pub fn stop_dropping(&mut self) {
        self.drop = None;
    }

    /// Put a domain with one object of every class on `a`
    pub fn seed_domain(&mut self, a: &str, domain: DomainId, rf: u32) {
        let node = self.node_mut(a);
        node.state.host_domain(domain, rf).unwrap();
        for class in ObjectClass::ALL {
            node.store.insert_object(
                domain,
                TransferObject::new(class, format!("{class}-1"), class.to_string()),
            );
        }
    }

    /// Advance one second: tick every live node, drive sessions on even
    /// seconds, then route everything until quiet.
    pub fn step(&mut self) {
        self.now += Duration::from_secs(1);
        let now = self.now;
        let drive = self.elapsed_secs() % 2 == 0;
        let live: Vec<NodeAddr> = self
            .nodes
            .keys()
            .copied()
            .filter(|a| !self.down.contains(a))
            .collect();

        let mut queue = VecDeque::new();
        for a in &live {
            let effects = self.nodes.get_mut(a).unwrap().state.tick(now);
            self.absorb(*a, effects, &mut queue);
        }
        if drive {
            for a in &live {
                let node = self.nodes.get_mut(a).unwrap();
                let sessions = node.sessions.clone();
                let mut finished = Vec::new();
                for id in sessions {
                    match node.state.drive_session(id, now) {
                        Some(out) => queue.extend(out.into_iter().map(|o| (*a, o))),
                        None => finished.push(id),
                    }
                }
                node.sessions.retain(|id| !finished.contains(id));
            }
        }
        self.route(queue);
    }

    pub fn advance(&mut self, secs: u64) {
        for _ in 0..secs {
            self.step();
        }
    }

    /// Advance until `cond` holds, at most `max_secs` seconds
    pub fn advance_until(&mut self, max_secs: u64, cond: impl Fn(&Self) -> bool) -> bool {
        for _ in 0..max_secs {
            if cond(self) {
                return true;
            }
            self.step();
        }
        cond(self)
    }

    /// Run an admin or collaborator call on one node and route its effects
    pub fn with_node<R>(&mut self, a: &str, f: impl FnOnce(&mut ClusterState, Instant) -> R) -> R {
        let now = self.now;
        let result = f(&mut self.node_mut(a).state, now);
        self.settle();
        result
    }

    /// Start a migration directly on `a`, as the admin API would
    pub fn start_migration(
        &mut self,
        a: &str,
        domain: DomainId,
        destination: &str,
        kind: vnetdir::migration::MigrationKind,
    ) -> SessionId {
        let now = self.now;
        let dest = addr(destination);
        let node = self.node_mut(a);
        let id = node
            .state
            .start_migration(domain, dest, kind, now)
            .unwrap();
        node.sessions.push(id);
        id
    }

    /// Send outbound produced outside a tick
    pub fn send(&mut self, from: &str, out: Vec<Outbound>) {
        let from = addr(from);
        let queue = out.into_iter().map(|o| (from, o)).collect();
        self.route(queue);
    }

    /// Deliver one raw message
    pub fn deliver(&mut self, from: &str, to: &str, message: PeerMessage) {
        self.send(from, vec![Outbound::new(addr(to), message)]);
    }

    fn settle(&mut self) {
        self.route(VecDeque::new());
    }

    fn absorb(
        &mut self,
        at: NodeAddr,
        effects: Effects,
        queue: &mut VecDeque<(NodeAddr, Outbound)>,
    ) {
        let now = self.now;
        let Effects {
            outbound,
            acks,
            started,
        } = effects;
        queue.extend(outbound.into_iter().map(|o| (at, o)));
        for ack in acks {
            queue.extend(ack.apply(now).into_iter().map(|o| (at, o)));
        }
        if let Some(node) = self.nodes.get_mut(&at) {
            node.sessions.extend(started);
        }
    }

    fn route(&mut self, mut queue: VecDeque<(NodeAddr, Outbound)>) {
        loop {
            while let Some((from, Outbound { destination, message })) = queue.pop_front() {
                if self.down.contains(&destination)
                    || self.down.contains(&from)
                    || self.cut.contains(&(from, destination))
                    || self.drop.as_ref().is_some_and(|d| d(&message))
                    || !self.nodes.contains_key(&destination)
                {
                    continue;
                }
                self.log.push((from, destination, message.clone()));
                let now = self.now;
                let effects = self
                    .nodes
                    .get_mut(&destination)
                    .unwrap()
                    .state
                    .handle_message(from, message, now);
                self.absorb(destination, effects, &mut queue);
            }

            // feed finished sessions back, as the outcome loop would
            let mut any = false;
            let addrs: Vec<NodeAddr> = self.nodes.keys().copied().collect();
            for a in addrs {
                let mut finished = Vec::new();
                while let Ok(outcome) = self.nodes.get_mut(&a).unwrap().outcomes_rx.try_recv() {
                    finished.push(outcome);
                }
                for outcome in finished {
                    let node = self.nodes.get_mut(&a).unwrap();
                    let effects = node.state.on_migration_finished(&outcome);
                    node.outcomes.push(outcome);
                    any = true;
                    self.absorb(a, effects, &mut queue);
                }
            }
            if !any && queue.is_empty() {
                break;
            }
        }
    }

    /// How many times `to` received a message matching `pred`
    pub fn received(&self, to: &str, pred: impl Fn(&PeerMessage) -> bool) -> usize {
        let to = addr(to);
        self.log
            .iter()
            .filter(|(_, dest, m)| *dest == to && pred(m))
            .count()
    }

    pub fn leader_of(&self, a: &str) -> Option<NodeAddr> {
        self.node(a).state.membership().leader()
    }
}
