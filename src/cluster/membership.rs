//! Cluster membership table
//!
//! Eventually-consistent view of which nodes exist, whether they are
//! reachable and which domains they host. The table owns:
//! - failure detection (Up → HintDown → Down on missing contact)
//! - leader election (lowest eligible address wins, no voting round)
//! - the partition heuristic for nodes that come back
//! - reconciliation of domain mappings gossiped by peers
//!
//! Nothing here performs I/O. Callers hold the cluster lock while mutating
//! the table and send whatever messages result after releasing it.

use crate::cluster::node::{
    DomainId, DomainLoadStats, Liveness, Node, NodeAddr, PartitionState,
};
use crate::common::{ClusterConfig, Error, Result, METRICS};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Hosting nodes of one domain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DomainHosts {
    pub hosts: BTreeSet<NodeAddr>,
    /// Highest replication factor any node has asserted
    pub replication_factor: u32,
}

/// Domains a node advertises as hosted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingBlob {
    pub node: NodeAddr,
    pub config_version: u64,
    pub domains: Vec<(DomainId, u32)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LivenessTransition {
    pub node: NodeAddr,
    pub from: Liveness,
    pub to: Liveness,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Election {
    pub previous: Option<NodeAddr>,
    pub leader: Option<NodeAddr>,
}

impl Election {
    pub fn changed(&self) -> bool {
        self.previous != self.leader
    }
}

/// What one cluster tick changed
#[derive(Debug, Default)]
pub struct TickReport {
    pub transitions: Vec<LivenessTransition>,
    pub election: Option<Election>,
    /// Nodes whose partition watch expired without incident
    pub partition_cleared: Vec<NodeAddr>,
}

/// Result of registering contact with a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Contact {
    /// First contact, node added to the table
    Added,
    Refreshed,
    /// Node came back from HintDown/Down
    Restored(Liveness),
    /// Inactive node, or status changes currently gated
    Frozen,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: Vec<DomainId>,
    pub kept: usize,
    pub deactivated: Vec<DomainId>,
    pub removed: Vec<DomainId>,
    /// Advertised but refused (recently deleted or invalid)
    pub skipped: Vec<DomainId>,
    pub partition_alert: bool,
}

impl ReconcileReport {
    pub fn changed(&self) -> bool {
        !self.added.is_empty() || !self.deactivated.is_empty() || !self.removed.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
struct PartitionWatch {
    node: NodeAddr,
    ticks_left: u32,
}

pub struct MembershipTable {
    local: NodeAddr,
    config: ClusterConfig,
    nodes: BTreeMap<NodeAddr, Node>,
    domains: HashMap<DomainId, DomainHosts>,
    leader: Option<NodeAddr>,
    leader_absent_ticks: u32,
    election_pending: bool,
    status_change_allow: bool,
    partition_watch: VecDeque<PartitionWatch>,
    recently_deleted: HashMap<DomainId, Instant>,
    mapping_exchange_requested: bool,
    last_mapping_exchange: Instant,
    config_version: u64,
}

impl MembershipTable {
    pub fn new(local: NodeAddr, config: ClusterConfig, now: Instant) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(local, Node::new(local, now));
        Self {
            local,
            config,
            nodes,
            domains: HashMap::new(),
            leader: None,
            leader_absent_ticks: 0,
            election_pending: false,
            status_change_allow: true,
            partition_watch: VecDeque::new(),
            recently_deleted: HashMap::new(),
            mapping_exchange_requested: false,
            last_mapping_exchange: now,
            config_version: 0,
        }
    }

    /// Table seeded from static configuration. Seeding is not a membership
    /// change: the first election waits for the leaderless-tick count.
    pub fn with_bootstrap(
        local: NodeAddr,
        peers: impl IntoIterator<Item = NodeAddr>,
        config: ClusterConfig,
        now: Instant,
    ) -> Self {
        let mut table = Self::new(local, config, now);
        for peer in peers {
            table.nodes.entry(peer).or_insert_with(|| Node::new(peer, now));
        }
        table
    }

    pub fn local(&self) -> NodeAddr {
        self.local
    }

    pub fn leader(&self) -> Option<NodeAddr> {
        self.leader
    }

    pub fn is_leader(&self) -> bool {
        self.leader == Some(self.local)
    }

    pub fn config_version(&self) -> u64 {
        self.config_version
    }

    pub fn node(&self, addr: NodeAddr) -> Option<&Node> {
        self.nodes.get(&addr)
    }

    /// Lookup by textual address; malformed input is simply not found.
    pub fn node_by_str(&self, addr: &str) -> Option<&Node> {
        NodeAddr::parse(addr).and_then(|a| self.nodes.get(&a))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn peers(&self) -> Vec<NodeAddr> {
        self.nodes.keys().filter(|a| **a != self.local).copied().collect()
    }

    /// Peers worth soliciting: everything except administratively frozen nodes
    pub fn contactable_peers(&self) -> Vec<NodeAddr> {
        self.nodes
            .values()
            .filter(|n| n.addr != self.local && n.liveness != Liveness::Inactive)
            .map(|n| n.addr)
            .collect()
    }

    pub fn liveness(&self, addr: NodeAddr) -> Option<Liveness> {
        self.nodes.get(&addr).map(|n| n.liveness)
    }

    pub fn is_live(&self, addr: NodeAddr) -> bool {
        self.liveness(addr).is_some_and(|l| l.is_live())
    }

    pub fn status_change_allowed(&self) -> bool {
        self.status_change_allow
    }

    /// Gate every liveness change (used during bulk reconfiguration)
    pub fn set_status_change_allow(&mut self, allow: bool) {
        if self.status_change_allow != allow {
            info!("Node status changes {}", if allow { "enabled" } else { "disabled" });
        }
        self.status_change_allow = allow;
    }

    // === Administrative membership ===

    /// Add a node. Returns false if it was already known.
    pub fn add_node(&mut self, addr: NodeAddr, now: Instant) -> bool {
        if self.nodes.contains_key(&addr) {
            return false;
        }
        info!("Node {} joined the cluster view", addr);
        self.nodes.insert(addr, Node::new(addr, now));
        self.election_pending = true;
        true
    }

    pub fn remove_node(&mut self, addr: NodeAddr) -> Result<Node> {
        if addr == self.local {
            return Err(Error::InvalidAddress(format!("cannot remove local node {addr}")));
        }
        let node = self
            .nodes
            .remove(&addr)
            .ok_or_else(|| Error::NodeNotFound(addr.to_string()))?;
        for domain in node.hosted.keys() {
            if let Some(entry) = self.domains.get_mut(domain) {
                entry.hosts.remove(&addr);
            }
        }
        self.partition_watch.retain(|w| w.node != addr);
        if self.leader == Some(addr) {
            self.leader = None;
        }
        self.election_pending = true;
        info!("Node {} removed from the cluster view", addr);
        Ok(node)
    }

    /// Full teardown: forget every peer and every hosting record.
    pub fn reset(&mut self, now: Instant) {
        warn!("Resetting cluster membership");
        self.nodes.clear();
        self.nodes.insert(self.local, Node::new(self.local, now));
        self.domains.clear();
        self.leader = None;
        self.leader_absent_ticks = 0;
        self.election_pending = false;
        self.partition_watch.clear();
        self.recently_deleted.clear();
        self.config_version += 1;
    }

    pub fn set_inactive(&mut self, addr: NodeAddr) -> Result<()> {
        let node = self
            .nodes
            .get_mut(&addr)
            .ok_or_else(|| Error::NodeNotFound(addr.to_string()))?;
        if node.liveness != Liveness::Inactive {
            info!("Node {} deactivated ({} -> inactive)", addr, node.liveness);
            node.liveness = Liveness::Inactive;
            node.hint_down_since = None;
            METRICS.liveness_transitions.inc();
        }
        if self.leader == Some(addr) {
            self.election_pending = true;
        }
        Ok(())
    }

    pub fn set_active(&mut self, addr: NodeAddr, now: Instant) -> Result<()> {
        let node = self
            .nodes
            .get_mut(&addr)
            .ok_or_else(|| Error::NodeNotFound(addr.to_string()))?;
        if node.liveness == Liveness::Inactive {
            info!("Node {} reactivated", addr);
            node.liveness = Liveness::Up;
            node.last_contact = now;
            self.election_pending = true;
            METRICS.liveness_transitions.inc();
        }
        Ok(())
    }

    // === Contact and heartbeats ===

    /// Register a successful contact with `addr`.
    pub fn touch(&mut self, addr: NodeAddr, now: Instant) -> Contact {
        let allow = self.status_change_allow;
        let Some(node) = self.nodes.get_mut(&addr) else {
            self.add_node(addr, now);
            return Contact::Added;
        };
        node.last_contact = now;

        match node.liveness {
            Liveness::Inactive => Contact::Frozen,
            Liveness::Up => Contact::Refreshed,
            from @ (Liveness::HintDown | Liveness::Down) => {
                if !allow {
                    return Contact::Frozen;
                }
                node.liveness = Liveness::Up;
                node.hint_down_since = None;
                node.partition = PartitionState::PossiblyDifferent;
                info!("Node {} contact restored ({} -> up)", addr, from);
                METRICS.liveness_transitions.inc();

                self.watch_partition(addr);
                self.election_pending = true;
                self.mapping_exchange_requested = true;
                Contact::Restored(from)
            }
        }
    }

    /// Heartbeat from a peer reporting its own state and its leader.
    pub fn on_heartbeat(
        &mut self,
        from: NodeAddr,
        active: bool,
        config_version: u64,
        leader: Option<NodeAddr>,
        now: Instant,
    ) -> Contact {
        let contact = self.touch(from, now);

        if let Some(node) = self.nodes.get_mut(&from) {
            node.config_version = config_version;
            node.believed_leader = leader;
            match (active, node.liveness) {
                (false, l) if l != Liveness::Inactive => {
                    info!("Node {} reports itself inactive", from);
                    node.liveness = Liveness::Inactive;
                    node.hint_down_since = None;
                    self.election_pending = true;
                    METRICS.liveness_transitions.inc();
                }
                (true, Liveness::Inactive) => {
                    info!("Node {} reports itself active again", from);
                    node.liveness = Liveness::Up;
                    self.election_pending = true;
                    METRICS.liveness_transitions.inc();
                }
                _ => {}
            }
        }

        if self.leader == Some(from) && leader != Some(from) {
            debug!(
                "Leader {} believes {:?} is leader, re-running election",
                from, leader
            );
            self.election_pending = true;
        } else if let Some(claimed) = leader {
            self.consider_leader_claim(claimed);
        }
        contact
    }

    /// A peer solicits our heartbeat, which means it believes it leads.
    pub fn on_heartbeat_request(&mut self, from: NodeAddr, now: Instant) -> Contact {
        let contact = self.touch(from, now);
        self.consider_leader_claim(from);
        contact
    }

    /// Someone claims `claimed` leads; re-elect if our view disagrees.
    fn consider_leader_claim(&mut self, claimed: NodeAddr) {
        if self.leader == Some(claimed) {
            return;
        }
        let eligible = self
            .nodes
            .get(&claimed)
            .is_some_and(|n| n.liveness.is_eligible());
        if eligible {
            debug!(
                "Leader claim for {} conflicts with local view {:?}",
                claimed, self.leader
            );
            self.election_pending = true;
        }
    }

    /// Liveness of every known node, as broadcast by the leader
    pub fn node_status(&self) -> Vec<(NodeAddr, Liveness)> {
        self.nodes.values().map(|n| (n.addr, n.liveness)).collect()
    }

    /// Apply a node status broadcast. Only the believed leader is
    /// authoritative; anyone else's list is treated as a leader claim.
    pub fn apply_node_status(
        &mut self,
        from: NodeAddr,
        entries: &[(NodeAddr, Liveness)],
        now: Instant,
    ) -> Vec<LivenessTransition> {
        self.touch(from, now);
        if self.leader != Some(from) {
            self.consider_leader_claim(from);
            return Vec::new();
        }

        let mut transitions = Vec::new();
        for &(addr, reported) in entries {
            if addr == self.local {
                continue;
            }
            self.add_node(addr, now);
            let allow = self.status_change_allow;
            let Some(node) = self.nodes.get_mut(&addr) else {
                continue;
            };
            let from_state = node.liveness;
            let to_state = match (from_state, reported) {
                (l, Liveness::Inactive) if l != Liveness::Inactive => Liveness::Inactive,
                (Liveness::Inactive, Liveness::Up) => Liveness::Up,
                (Liveness::Up, Liveness::HintDown | Liveness::Down) if allow => Liveness::HintDown,
                (Liveness::HintDown, Liveness::Down) if allow => Liveness::Down,
                (Liveness::HintDown | Liveness::Down, Liveness::Up) if allow => Liveness::Up,
                (l, _) => l,
            };
            if to_state == from_state {
                continue;
            }

            node.liveness = to_state;
            match to_state {
                Liveness::HintDown => node.hint_down_since = Some(now),
                Liveness::Up => {
                    node.hint_down_since = None;
                    node.last_contact = now;
                }
                _ => {}
            }
            info!("Node {} {} -> {} (leader hint)", addr, from_state, to_state);
            METRICS.liveness_transitions.inc();
            transitions.push(LivenessTransition {
                node: addr,
                from: from_state,
                to: to_state,
            });

            if matches!(from_state, Liveness::HintDown | Liveness::Down) && to_state == Liveness::Up
            {
                if let Some(node) = self.nodes.get_mut(&addr) {
                    node.partition = PartitionState::PossiblyDifferent;
                }
                self.watch_partition(addr);
                self.mapping_exchange_requested = true;
            }
        }
        transitions
    }

    // === Periodic evaluation ===

    /// Run one cluster tick: failure detection, partition watch aging and
    /// leader election when due.
    pub fn tick(&mut self, now: Instant) -> TickReport {
        let mut report = TickReport::default();

        if let Some(local) = self.nodes.get_mut(&self.local) {
            if local.liveness != Liveness::Inactive {
                local.last_contact = now;
            }
        }

        if self.status_change_allow {
            self.detect_failures(now, &mut report);
        }
        self.age_partition_watch(&mut report);

        let grace = self.config.deleted_domain_grace();
        self.recently_deleted
            .retain(|_, deleted| now.saturating_duration_since(*deleted) < grace);

        let leader_present = self
            .leader
            .and_then(|l| self.nodes.get(&l))
            .is_some_and(|n| n.liveness.is_eligible());
        if leader_present {
            self.leader_absent_ticks = 0;
        } else {
            self.leader_absent_ticks += 1;
            if self.leader_absent_ticks >= self.config.leader_not_present_count_max {
                debug!("No leader for {} ticks", self.leader_absent_ticks);
                self.election_pending = true;
            }
        }

        if self.election_pending {
            report.election = Some(self.elect());
        }
        report
    }

    /// The leader times out every peer; a follower only its leader.
    fn detect_failures(&mut self, now: Instant, report: &mut TickReport) {
        let is_leader = self.is_leader();
        let hint_after = self.config.hint_no_contact();
        let down_after = self.config.max_no_contact();

        for node in self.nodes.values_mut() {
            if node.addr == self.local {
                continue;
            }
            if !is_leader && Some(node.addr) != self.leader {
                continue;
            }
            let from = node.liveness;
            match from {
                Liveness::Up if now.saturating_duration_since(node.last_contact) > hint_after => {
                    node.liveness = Liveness::HintDown;
                    node.hint_down_since = Some(now);
                }
                Liveness::HintDown => {
                    let since = node.hint_down_since.unwrap_or(node.last_contact);
                    if now.saturating_duration_since(since) > down_after {
                        node.liveness = Liveness::Down;
                    }
                }
                _ => {}
            }
            if node.liveness != from {
                warn!("Node {} {} -> {} (no contact)", node.addr, from, node.liveness);
                METRICS.liveness_transitions.inc();
                report.transitions.push(LivenessTransition {
                    node: node.addr,
                    from,
                    to: node.liveness,
                });
            }
        }
    }

    /// Deterministic election: lowest eligible address wins.
    pub fn elect(&mut self) -> Election {
        self.election_pending = false;
        self.leader_absent_ticks = 0;

        let winner = self
            .nodes
            .values()
            .find(|n| n.liveness.is_eligible())
            .map(|n| n.addr);
        let previous = std::mem::replace(&mut self.leader, winner);
        METRICS.elections.inc();

        if previous != winner {
            match winner {
                Some(leader) if leader == self.local => info!("Local node {} is now leader", leader),
                Some(leader) => info!("Leader is now {}", leader),
                None => warn!("No eligible leader"),
            }
        }
        Election {
            previous,
            leader: winner,
        }
    }

    pub fn request_election(&mut self) {
        self.election_pending = true;
    }

    // === Partition heuristic ===

    fn watch_partition(&mut self, addr: NodeAddr) {
        let ticks = self.config.partition_hint_timeout_ticks;
        if let Some(watch) = self.partition_watch.iter_mut().find(|w| w.node == addr) {
            watch.ticks_left = ticks;
            return;
        }
        if self.partition_watch.len() >= self.config.partition_watch_capacity {
            if let Some(evicted) = self.partition_watch.pop_front() {
                if let Some(node) = self.nodes.get_mut(&evicted.node) {
                    node.partition = PartitionState::Same;
                }
            }
        }
        self.partition_watch.push_back(PartitionWatch {
            node: addr,
            ticks_left: ticks,
        });
    }

    fn age_partition_watch(&mut self, report: &mut TickReport) {
        for watch in self.partition_watch.iter_mut() {
            watch.ticks_left = watch.ticks_left.saturating_sub(1);
        }
        while let Some(pos) = self.partition_watch.iter().position(|w| w.ticks_left == 0) {
            let Some(expired) = self.partition_watch.remove(pos) else {
                break;
            };
            if let Some(node) = self.nodes.get_mut(&expired.node) {
                node.partition = PartitionState::Same;
            }
            debug!("Node {} rejoined cleanly", expired.node);
            report.partition_cleared.push(expired.node);
        }
    }

    /// A node asserted hosting `domain`. If it only just came back, its
    /// state may be stale: alert, then trust it again.
    fn note_domain_assertion(&mut self, addr: NodeAddr, domain: DomainId) -> bool {
        let Some(node) = self.nodes.get_mut(&addr) else {
            return false;
        };
        if node.partition != PartitionState::PossiblyDifferent {
            return false;
        }
        node.partition = PartitionState::RecoveringDifferent;
        warn!(
            "Node {} asserts hosting domain {} right after rejoining; it may have been partitioned and hold stale state",
            addr, domain
        );
        METRICS.partition_alerts.inc();
        node.partition = PartitionState::Same;
        self.partition_watch.retain(|w| w.node != addr);
        true
    }

    pub fn partition_state(&self, addr: NodeAddr) -> Option<PartitionState> {
        self.nodes.get(&addr).map(|n| n.partition)
    }

    // === Domain hosting ===

    pub fn host_domain(&mut self, addr: NodeAddr, domain: DomainId, rf: u32) -> Result<()> {
        if rf == 0 {
            return Err(Error::InvalidReplicationFactor(rf));
        }
        let node = self
            .nodes
            .get_mut(&addr)
            .ok_or_else(|| Error::NodeNotFound(addr.to_string()))?;
        node.hosted.insert(domain, rf);
        node.deactivated.remove(&domain);

        let entry = self.domains.entry(domain).or_default();
        entry.hosts.insert(addr);
        entry.replication_factor = entry.replication_factor.max(rf);
        self.recently_deleted.remove(&domain);

        if addr == self.local {
            self.local_mapping_changed();
        }
        Ok(())
    }

    /// Drop the hosting record outright. Returns false if there was none.
    pub fn unhost_domain(&mut self, addr: NodeAddr, domain: DomainId) -> bool {
        let Some(node) = self.nodes.get_mut(&addr) else {
            return false;
        };
        let existed = node.hosted.remove(&domain).is_some();
        node.deactivated.remove(&domain);
        node.stats.remove(&domain);
        if let Some(entry) = self.domains.get_mut(&domain) {
            entry.hosts.remove(&addr);
        }
        if existed && addr == self.local {
            self.local_mapping_changed();
        }
        existed
    }

    /// Stop counting `addr` as serving `domain` without forgetting it yet.
    pub fn deactivate_domain(&mut self, addr: NodeAddr, domain: DomainId) -> bool {
        let Some(node) = self.nodes.get_mut(&addr) else {
            return false;
        };
        if !node.hosts(domain) {
            return false;
        }
        let changed = node.deactivated.insert(domain);
        if changed && addr == self.local {
            self.local_mapping_changed();
        }
        changed
    }

    /// Remove a domain everywhere and refuse to re-learn it for a while.
    pub fn delete_domain(&mut self, domain: DomainId, now: Instant) -> bool {
        let mut existed = self.domains.remove(&domain).is_some();
        let mut local_changed = false;
        for node in self.nodes.values_mut() {
            if node.hosted.remove(&domain).is_some() {
                existed = true;
                local_changed |= node.addr == self.local;
            }
            node.deactivated.remove(&domain);
            node.stats.remove(&domain);
        }
        self.recently_deleted.insert(domain, now);
        if local_changed {
            self.local_mapping_changed();
        }
        if existed {
            info!("Domain {} deleted", domain);
        }
        existed
    }

    pub fn is_recently_deleted(&self, domain: DomainId) -> bool {
        self.recently_deleted.contains_key(&domain)
    }

    /// Override the desired replication factor of a domain
    pub fn set_replication_factor(&mut self, domain: DomainId, rf: u32) -> Result<()> {
        if rf == 0 {
            return Err(Error::InvalidReplicationFactor(rf));
        }
        self.domains.entry(domain).or_default().replication_factor = rf;
        Ok(())
    }

    pub fn domain(&self, domain: DomainId) -> Option<&DomainHosts> {
        self.domains.get(&domain)
    }

    /// All domains in ascending id order
    pub fn domains(&self) -> Vec<(DomainId, &DomainHosts)> {
        let mut all: Vec<_> = self.domains.iter().map(|(d, h)| (*d, h)).collect();
        all.sort_by_key(|(d, _)| *d);
        all
    }

    /// Live nodes actively serving the domain
    pub fn domain_hosts(&self, domain: DomainId) -> Vec<NodeAddr> {
        let Some(entry) = self.domains.get(&domain) else {
            return Vec::new();
        };
        entry
            .hosts
            .iter()
            .filter(|addr| {
                self.nodes
                    .get(addr)
                    .is_some_and(|n| n.liveness.is_live() && n.hosts_active(domain))
            })
            .copied()
            .collect()
    }

    /// Every node with a hosting record, live or not
    pub fn all_hosts(&self, domain: DomainId) -> Vec<NodeAddr> {
        self.domains
            .get(&domain)
            .map(|e| e.hosts.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn replication_factor(&self, domain: DomainId) -> Option<u32> {
        self.domains.get(&domain).map(|e| e.replication_factor)
    }

    pub fn live_host_count(&self, domain: DomainId) -> usize {
        self.domain_hosts(domain).len()
    }

    /// Domains nobody live serves; highest repair priority
    pub fn domains_without_live_hosts(&self) -> Vec<DomainId> {
        self.domains()
            .into_iter()
            .map(|(d, _)| d)
            .filter(|d| self.live_host_count(*d) == 0)
            .collect()
    }

    /// A random live remote host of the domain
    pub fn random_remote_host(&self, domain: DomainId) -> Option<NodeAddr> {
        let remote: Vec<NodeAddr> = self
            .domain_hosts(domain)
            .into_iter()
            .filter(|a| *a != self.local)
            .collect();
        remote.choose(&mut rand::thread_rng()).copied()
    }

    /// Both hosting indexes agree with each other
    pub fn is_consistent(&self) -> bool {
        let forward = self.nodes.values().all(|node| {
            node.hosted.keys().all(|d| {
                self.domains
                    .get(d)
                    .is_some_and(|e| e.hosts.contains(&node.addr))
            }) && node.deactivated.iter().all(|d| node.hosted.contains_key(d))
        });
        let backward = self.domains.iter().all(|(d, entry)| {
            entry
                .hosts
                .iter()
                .all(|addr| self.nodes.get(addr).is_some_and(|n| n.hosts(*d)))
        });
        forward && backward
    }

    // === Mapping exchange ===

    fn local_mapping_changed(&mut self) {
        self.config_version += 1;
        self.mapping_exchange_requested = true;
    }

    /// Domains the local node actively serves
    pub fn local_mapping(&self) -> MappingBlob {
        let domains = self
            .nodes
            .get(&self.local)
            .map(|n| n.active_domains().collect())
            .unwrap_or_default();
        MappingBlob {
            node: self.local,
            config_version: self.config_version,
            domains,
        }
    }

    /// Reconcile a peer's advertised mapping against our record of it.
    ///
    /// Entries present on both sides are kept, new entries are added, and
    /// entries that disappeared are first deactivated and only removed if
    /// they are still missing from a later advertisement.
    pub fn reconcile_mapping(&mut self, blob: &MappingBlob, now: Instant) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        if blob.node == self.local {
            return report;
        }
        self.touch(blob.node, now);

        if let Some((first, _)) = blob.domains.first() {
            report.partition_alert = self.note_domain_assertion(blob.node, *first);
        }

        let advertised: BTreeMap<DomainId, u32> = blob.domains.iter().copied().collect();
        let grace = self.config.deleted_domain_grace();
        let Some(node) = self.nodes.get_mut(&blob.node) else {
            return report;
        };
        node.config_version = node.config_version.max(blob.config_version);

        for (&domain, &rf) in &advertised {
            if node.hosted.contains_key(&domain) {
                node.hosted.insert(domain, rf);
                node.deactivated.remove(&domain);
                let entry = self.domains.entry(domain).or_default();
                entry.replication_factor = entry.replication_factor.max(rf);
                report.kept += 1;
                continue;
            }
            let deleted = self
                .recently_deleted
                .get(&domain)
                .is_some_and(|at| now.saturating_duration_since(*at) < grace);
            if rf == 0 || deleted {
                report.skipped.push(domain);
                continue;
            }
            node.hosted.insert(domain, rf);
            let entry = self.domains.entry(domain).or_default();
            entry.hosts.insert(blob.node);
            entry.replication_factor = entry.replication_factor.max(rf);
            report.added.push(domain);
        }

        let missing: Vec<DomainId> = node
            .hosted
            .keys()
            .filter(|d| !advertised.contains_key(d))
            .copied()
            .collect();
        for domain in missing {
            if node.deactivated.contains(&domain) {
                node.hosted.remove(&domain);
                node.deactivated.remove(&domain);
                node.stats.remove(&domain);
                if let Some(entry) = self.domains.get_mut(&domain) {
                    entry.hosts.remove(&blob.node);
                }
                report.removed.push(domain);
            } else {
                node.deactivated.insert(domain);
                report.deactivated.push(domain);
            }
        }

        METRICS.mappings_reconciled.inc();
        if report.changed() {
            debug!(
                "Mapping from {}: +{:?} ~{:?} -{:?}",
                blob.node, report.added, report.deactivated, report.removed
            );
        }
        report
    }

    pub fn request_mapping_exchange(&mut self) {
        self.mapping_exchange_requested = true;
    }

    /// Requested explicitly, or the maximum interval has passed
    pub fn mapping_exchange_due(&self, now: Instant) -> bool {
        self.mapping_exchange_requested
            || now.saturating_duration_since(self.last_mapping_exchange)
                >= self.config.exchange_domain_mapping_time_max()
    }

    pub fn mark_mapping_exchanged(&mut self, now: Instant) {
        self.mapping_exchange_requested = false;
        self.last_mapping_exchange = now;
        METRICS.mapping_exchanges.inc();
    }

    // === Statistics ===

    /// Replace the load statistics a node reported. Unknown nodes are ignored.
    pub fn update_stats(&mut self, addr: NodeAddr, stats: Vec<DomainLoadStats>) -> bool {
        let Some(node) = self.nodes.get_mut(&addr) else {
            return false;
        };
        node.stats = stats.into_iter().map(|s| (s.domain, s)).collect();
        true
    }
}
