//! Cluster state owned behind the node's single coarse lock
//!
//! Every inbound event (tick, peer message, admin call, migration outcome)
//! is applied here synchronously. The result is a set of [`Effects`]: sends
//! to dispatch and acknowledgements to deliver, both performed by the caller
//! after it has released the lock.

use crate::cluster::load::{LoadModel, RequestKind, RequestWindows};
use crate::cluster::membership::MembershipTable;
use crate::cluster::node::{DomainId, DomainLoadStats, Liveness, NodeAddr, PartitionState};
use crate::cluster::placement::{PlacementAction, PlacementController};
use crate::common::{Config, Error, Result, METRICS};
use crate::domain_store::DomainStore;
use crate::migration::{
    estimate_weight, AckStatus, CorrelationId, DriveChecks, ForwardingRecord, MigrationKind,
    MigrationOutcome, MigrationRegistry, MigrationSession, ObjectCounts, SessionHandle, SessionId,
    SessionSummary, TransferObject,
};
use crate::transport::{Outbound, PeerMessage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// An acknowledgement routed to its session, applied outside the cluster lock
#[derive(Debug)]
pub struct PendingAck {
    handle: SessionHandle,
    correlation: CorrelationId,
    status: AckStatus,
}

impl PendingAck {
    pub fn apply(self, now: Instant) -> Vec<Outbound> {
        self.handle.lock().on_ack(self.correlation, self.status, now)
    }
}

/// Work left for the caller once the cluster lock is released
#[derive(Debug, Default)]
pub struct Effects {
    pub outbound: Vec<Outbound>,
    pub acks: Vec<PendingAck>,
    /// Sessions started while handling the event; each needs a drive task
    pub started: Vec<SessionId>,
}

impl Effects {
    fn send(&mut self, destination: NodeAddr, message: PeerMessage) {
        self.outbound.push(Outbound::new(destination, message));
    }

    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.acks.is_empty() && self.started.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub addr: NodeAddr,
    pub liveness: Liveness,
    pub partition: PartitionState,
    pub load: f64,
    pub hosted: usize,
    pub deactivated: usize,
    pub config_version: u64,
    pub believed_leader: Option<NodeAddr>,
    pub last_contact_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainStatus {
    pub domain: DomainId,
    pub replication_factor: u32,
    pub hosts: Vec<NodeAddr>,
    pub live_hosts: Vec<NodeAddr>,
    /// Nobody live serves the domain; first in line for repair
    pub no_live_hosts: bool,
    pub forwarding_to: Vec<NodeAddr>,
    pub migrations: Vec<SessionSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub node: NodeAddr,
    pub leader: Option<NodeAddr>,
    pub is_leader: bool,
    pub local_active: bool,
    pub config_version: u64,
    pub status_change_allow: bool,
    pub heavy_load_threshold: f64,
    pub active_weight: u64,
    pub weight_ceiling: u64,
    pub migrations: usize,
    pub domains: usize,
    pub nodes: Vec<NodeStatus>,
    pub generated_at: DateTime<Utc>,
}

pub struct ClusterState {
    local: NodeAddr,
    config: Config,
    membership: MembershipTable,
    placement: PlacementController,
    load: LoadModel,
    registry: MigrationRegistry,
    forwarding: ForwardingRecord,
    windows: HashMap<DomainId, RequestWindows>,
    /// Moved-away domains kept in the store until forwarding ends
    pending_release: HashSet<DomainId>,
    /// Domains last seen without a live host
    orphaned: BTreeSet<DomainId>,
    store: Arc<dyn DomainStore>,
    outcomes: mpsc::UnboundedSender<MigrationOutcome>,
    local_active: bool,
    /// Ticks left to heartbeat every peer after an active-flag change
    announce_ticks: u32,
    ticks: u64,
    last_broadcast: Option<Vec<(NodeAddr, Liveness)>>,
}

impl ClusterState {
    /// Build the state from configuration. Outcomes of locally driven
    /// migrations are reported on `outcomes` and must be fed back through
    /// [`ClusterState::on_migration_finished`].
    pub fn new(
        config: Config,
        store: Arc<dyn DomainStore>,
        outcomes: mpsc::UnboundedSender<MigrationOutcome>,
        now: Instant,
    ) -> Result<Self> {
        let local: NodeAddr = config.node.address.parse()?;
        let peers = config
            .node
            .peers
            .iter()
            .map(|p| p.parse::<NodeAddr>())
            .collect::<Result<Vec<_>>>()?;

        let membership = MembershipTable::with_bootstrap(
            local,
            peers.into_iter().filter(|p| *p != local),
            config.cluster.clone(),
            now,
        );
        let placement =
            PlacementController::new(config.placement.clone(), config.migration.clone());

        let mut state = Self {
            local,
            membership,
            placement,
            load: LoadModel::new(config.load.clone()),
            registry: MigrationRegistry::new(config.migration.weight_ceiling),
            forwarding: ForwardingRecord::new(),
            windows: HashMap::new(),
            pending_release: HashSet::new(),
            orphaned: BTreeSet::new(),
            store,
            outcomes,
            local_active: true,
            announce_ticks: 0,
            ticks: 0,
            last_broadcast: None,
            config,
        };
        // domains the object model already serves
        for domain in state.store.domains() {
            let replication_factor = state.store.replication_factor(domain).unwrap_or(1);
            state
                .membership
                .host_domain(local, domain, replication_factor)?;
        }
        Ok(state)
    }

    /// Make destination picks reproducible
    pub fn seed_placement(&mut self, seed: u64) {
        self.placement = PlacementController::with_seed(
            self.config.placement.clone(),
            self.config.migration.clone(),
            seed,
        );
    }

    pub fn local(&self) -> NodeAddr {
        self.local
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn membership(&self) -> &MembershipTable {
        &self.membership
    }

    pub fn registry(&self) -> &MigrationRegistry {
        &self.registry
    }

    pub fn load_model(&self) -> &LoadModel {
        &self.load
    }

    pub fn is_forwarding(&self, domain: DomainId) -> bool {
        !self.forwarding.destinations(domain).is_empty()
    }

    // === Periodic work ===

    /// One cluster tick: membership evaluation, heartbeats, status and
    /// mapping broadcasts, and placement on the leader.
    pub fn tick(&mut self, now: Instant) -> Effects {
        METRICS.ticks.inc();
        self.ticks += 1;
        let mut fx = Effects::default();

        let stats = self.refresh_local_stats(now);
        let report = self.membership.tick(now);
        if let Some(election) = report.election {
            if election.changed() {
                self.membership.request_mapping_exchange();
                self.last_broadcast = None;
            }
        }
        self.track_orphaned_domains();

        let peers = self.membership.contactable_peers();
        let announcing = self.announce_ticks > 0;
        if announcing {
            self.announce_ticks -= 1;
            for peer in &peers {
                fx.send(*peer, self.heartbeat());
            }
        }
        if self.membership.is_leader() {
            for peer in &peers {
                fx.send(*peer, PeerMessage::HeartbeatRequest);
            }
            let status = self.membership.node_status();
            let every = self.config.cluster.status_broadcast_ticks.max(1);
            if self.last_broadcast.as_ref() != Some(&status) || self.ticks % every == 0 {
                for peer in &peers {
                    fx.send(
                        *peer,
                        PeerMessage::NodeListStatus {
                            config_version: self.membership.config_version(),
                            nodes: status.clone(),
                        },
                    );
                }
                self.last_broadcast = Some(status);
            }
        } else if let Some(leader) = self.membership.leader() {
            if !announcing {
                fx.send(leader, self.heartbeat());
            }
            fx.send(leader, PeerMessage::Statistics { domains: stats });
        }

        if self.membership.mapping_exchange_due(now) {
            let mapping = self.membership.local_mapping();
            for peer in &peers {
                fx.send(*peer, PeerMessage::LocalMapping(mapping.clone()));
            }
            self.membership.mark_mapping_exchanged(now);
        }

        if self.membership.is_leader() {
            let actions = self.placement.evaluate(
                &self.membership,
                &self.load,
                self.registry.active_weight(),
                self.registry.weight_ceiling(),
                now,
            );
            for action in actions {
                self.apply_placement_action(action, now, &mut fx);
            }
        }
        fx
    }

    fn track_orphaned_domains(&mut self) {
        let orphaned: BTreeSet<DomainId> = self
            .membership
            .domains_without_live_hosts()
            .into_iter()
            .collect();
        for domain in orphaned.difference(&self.orphaned) {
            warn!("Domain {} has no live host", domain);
        }
        for domain in self.orphaned.difference(&orphaned) {
            if self.membership.domain(*domain).is_some() {
                info!("Domain {} served again", domain);
            }
        }
        self.orphaned = orphaned;
    }

    /// Domains without a live host as of the last tick
    pub fn orphaned_domains(&self) -> Vec<DomainId> {
        self.orphaned.iter().copied().collect()
    }

    fn heartbeat(&self) -> PeerMessage {
        PeerMessage::Heartbeat {
            active: self.local_active,
            config_version: self.membership.config_version(),
            leader: self.membership.leader(),
        }
    }

    /// Recompute the local node's per-domain statistics
    fn refresh_local_stats(&mut self, now: Instant) -> Vec<DomainLoadStats> {
        let domains: Vec<DomainId> = self
            .membership
            .node(self.local)
            .map(|n| n.active_domains().map(|(d, _)| d).collect())
            .unwrap_or_default();
        let window = self.config.load.rate_window();

        let stats: Vec<DomainLoadStats> = domains
            .into_iter()
            .map(|domain| {
                let counts = self.store.counts(domain);
                let (update_rate, lookup_rate, policy_lookup_rate) = self
                    .windows
                    .entry(domain)
                    .or_insert_with(|| RequestWindows::new(window, now))
                    .rates(now);
                DomainLoadStats {
                    domain,
                    endpoints: counts.endpoints,
                    tunnels: counts.tunnels,
                    update_rate,
                    lookup_rate,
                    policy_lookup_rate,
                }
            })
            .collect();
        self.membership.update_stats(self.local, stats.clone());
        stats
    }

    fn apply_placement_action(&mut self, action: PlacementAction, now: Instant, fx: &mut Effects) {
        match action {
            PlacementAction::StartMigration {
                domain,
                source,
                destination,
                kind,
                ..
            } if source == self.local => match self.start_migration(domain, destination, kind, now) {
                Ok(id) => fx.started.push(id),
                Err(e) => {
                    warn!("Could not migrate domain {} to {}: {}", domain, destination, e);
                    self.placement.migration_finished(domain, destination);
                }
            },
            PlacementAction::StartMigration {
                domain,
                source,
                destination,
                kind,
                ..
            } => fx.send(
                source,
                PeerMessage::StartMigration {
                    domain,
                    destination,
                    kind,
                },
            ),
            PlacementAction::DeactivateReplica { domain, node } => {
                self.membership.deactivate_domain(node, domain);
                if node == self.local {
                    self.release_local_domain(domain, now);
                } else {
                    fx.send(node, PeerMessage::DomainDeactivate { domain });
                }
            }
        }
    }

    // === Migrations ===

    /// Start migrating a locally hosted domain to `destination`.
    pub fn start_migration(
        &mut self,
        domain: DomainId,
        destination: NodeAddr,
        kind: MigrationKind,
        now: Instant,
    ) -> Result<SessionId> {
        if destination == self.local {
            return Err(Error::MigrationRejected {
                domain: domain.0,
                reason: "destination is the local node".into(),
            });
        }
        let dest_node = self
            .membership
            .node(destination)
            .ok_or_else(|| Error::NodeNotFound(destination.to_string()))?;
        if !dest_node.liveness.is_live() {
            return Err(Error::NodeNotLive(destination.to_string()));
        }
        if dest_node.hosts_active(domain) {
            return Err(Error::DomainAlreadyHosted {
                domain: domain.0,
                node: destination.to_string(),
            });
        }
        let replication_factor = self
            .membership
            .node(self.local)
            .and_then(|n| n.hosted.get(&domain).copied())
            .ok_or_else(|| Error::DomainNotHosted {
                domain: domain.0,
                node: self.local.to_string(),
            })?;
        let snapshot = self
            .store
            .snapshot(domain)
            .ok_or(Error::DomainNotFound(domain.0))?;

        if self.registry.has_session(domain, destination) {
            return Err(Error::SessionExists {
                domain: domain.0,
                destination: destination.to_string(),
            });
        }
        let weight = estimate_weight(&ObjectCounts::from_snapshot(&snapshot), &self.config.migration);
        self.registry.admit(weight)?;

        let id = self.registry.allocate_id();
        let outcomes = self.outcomes.clone();
        let session = MigrationSession::new(
            id,
            self.local,
            destination,
            kind,
            replication_factor,
            snapshot,
            weight,
            &self.config.migration,
            now,
            Box::new(move |outcome| {
                // receiver gone means the node is shutting down
                let _ = outcomes.send(outcome);
            }),
        );
        self.registry.register(SessionHandle::new(session))?;

        METRICS.migrations_started.inc();
        info!(
            "Migration {} started: domain {} {} -> {} ({:?}, weight {})",
            id, domain, self.local, destination, kind, weight
        );
        Ok(id)
    }

    /// Drive one session. `None` once the session is finished or gone.
    pub fn drive_session(&mut self, id: SessionId, now: Instant) -> Option<Vec<Outbound>> {
        let handle = self.registry.get(id)?;
        let (domain, destination, completed) = {
            let session = handle.lock();
            (
                session.domain(),
                session.destination(),
                session.is_completed(),
            )
        };
        if completed {
            return None;
        }
        let checks = DriveChecks {
            destination_live: self.membership.is_live(destination),
            domain_valid: self.store.is_domain_valid(domain),
        };
        let out = handle.lock().drive(now, checks);
        Some(out)
    }

    /// Commit or cancel bookkeeping for a finished session. Safe to call
    /// more than once per session: only the first call has any effect.
    pub fn on_migration_finished(&mut self, outcome: &MigrationOutcome) -> Effects {
        let mut fx = Effects::default();
        let Some(weight) = self.registry.release(outcome.session) else {
            debug!("Migration {} already released", outcome.session);
            return fx;
        };
        let MigrationOutcome {
            domain,
            destination,
            ..
        } = *outcome;
        self.placement.migration_finished(domain, destination);
        METRICS.observe_migration(outcome.elapsed);

        if outcome.success {
            METRICS.migrations_committed.inc();
            if let Err(e) =
                self.membership
                    .host_domain(destination, domain, outcome.replication_factor)
            {
                warn!("Committed domain {} on unknown node {}: {}", domain, destination, e);
            }
            self.forwarding.add(domain, destination);
            fx.send(
                destination,
                PeerMessage::DomainActivate {
                    domain,
                    replication_factor: outcome.replication_factor,
                },
            );
            self.store.migration_complete(domain, destination);
            if outcome.kind == MigrationKind::Move {
                self.membership.unhost_domain(self.local, domain);
                self.pending_release.insert(domain);
            }
            info!(
                "Migration {} committed: domain {} now on {} (weight {}, {:.1}s)",
                outcome.session,
                domain,
                destination,
                weight,
                outcome.elapsed.as_secs_f64()
            );
        } else {
            METRICS.migrations_cancelled.inc();
            fx.send(destination, PeerMessage::MigrationCancel { domain });
            self.store.migration_cancelled(domain, destination);
            warn!(
                "Migration {} cancelled: domain {} to {}",
                outcome.session, domain, destination
            );
        }
        fx
    }

    /// Entry point for live updates of a domain. Active sessions admit the
    /// update; committed destinations still being fed receive a copy.
    ///
    /// The object model applies the update to its own state before calling.
    pub fn register_migration_delta(
        &mut self,
        domain: DomainId,
        object: TransferObject,
    ) -> Result<Vec<Outbound>> {
        let mut out = Vec::new();
        for destination in self.forwarding.destinations(domain) {
            out.push(Outbound::new(
                destination,
                PeerMessage::DomainDelta {
                    domain,
                    object: object.clone(),
                },
            ));
            METRICS.deltas_forwarded.inc();
        }
        for handle in self.registry.sessions_for_domain(domain) {
            match handle.lock().register_delta(object.clone()) {
                Ok(()) => METRICS.deltas_admitted.inc(),
                Err(e) => {
                    METRICS.deltas_rejected.inc();
                    return Err(e);
                }
            }
        }
        Ok(out)
    }

    // === Inbound messages ===

    pub fn handle_message(&mut self, from: NodeAddr, message: PeerMessage, now: Instant) -> Effects {
        let mut fx = Effects::default();
        if from == self.local {
            return fx;
        }
        match message {
            PeerMessage::Heartbeat {
                active,
                config_version,
                leader,
            } => {
                self.membership
                    .on_heartbeat(from, active, config_version, leader, now);
            }
            PeerMessage::HeartbeatRequest => {
                self.membership.on_heartbeat_request(from, now);
                fx.send(from, self.heartbeat());
            }
            PeerMessage::NodeListStatus { nodes, .. } => {
                self.membership.apply_node_status(from, &nodes, now);
            }
            PeerMessage::LocalMapping(mapping) => {
                if mapping.node != from {
                    debug!("Mapping for {} relayed by {}, ignored", mapping.node, from);
                    return fx;
                }
                self.membership.reconcile_mapping(&mapping, now);
                let advertised: Vec<DomainId> = mapping.domains.iter().map(|(d, _)| *d).collect();
                for domain in self.forwarding.observe_mapping(from, &advertised) {
                    if self.pending_release.contains(&domain) && !self.is_forwarding(domain) {
                        info!("Domain {} handed over, releasing local copy", domain);
                        self.pending_release.remove(&domain);
                        self.store.discard_domain(domain);
                        self.windows.remove(&domain);
                    }
                }
            }
            PeerMessage::Statistics { domains } => {
                self.membership.touch(from, now);
                self.membership.update_stats(from, domains);
            }
            PeerMessage::StartMigration {
                domain,
                destination,
                kind,
            } => {
                self.membership.touch(from, now);
                if self.membership.leader() != Some(from) {
                    warn!("Migration instruction from non-leader {} ignored", from);
                    return fx;
                }
                match self.start_migration(domain, destination, kind, now) {
                    Ok(id) => fx.started.push(id),
                    Err(e) => warn!(
                        "Instructed migration of domain {} to {} failed: {}",
                        domain, destination, e
                    ),
                }
            }
            PeerMessage::MassTransferObject {
                correlation,
                domain,
                object,
            } => {
                self.membership.touch(from, now);
                let status = self.store.apply_transfer_object(domain, object);
                fx.send(
                    from,
                    PeerMessage::MassTransferAck {
                        correlation,
                        status,
                    },
                );
            }
            PeerMessage::MassTransferAck {
                correlation,
                status,
            } => {
                self.membership.touch(from, now);
                match self.registry.route(correlation) {
                    Some(handle) => fx.acks.push(PendingAck {
                        handle,
                        correlation,
                        status,
                    }),
                    None => debug!("Ack {:?} for unknown migration", correlation),
                }
            }
            PeerMessage::DomainActivate {
                domain,
                replication_factor,
            } => {
                self.membership.touch(from, now);
                self.store.activate_domain(domain, replication_factor);
                match self
                    .membership
                    .host_domain(self.local, domain, replication_factor)
                {
                    Ok(()) => info!("Domain {} activated locally (from {})", domain, from),
                    Err(e) => warn!("Activation of domain {} failed: {}", domain, e),
                }
            }
            PeerMessage::DomainDeactivate { domain } => {
                self.membership.touch(from, now);
                if self.membership.leader() != Some(from) {
                    warn!("Deactivation of domain {} from non-leader {} ignored", domain, from);
                    return fx;
                }
                self.release_local_domain(domain, now);
            }
            PeerMessage::MigrationCancel { domain } => {
                self.membership.touch(from, now);
                self.store.discard_pending(domain);
                debug!("Migration of domain {} from {} cancelled", domain, from);
            }
            PeerMessage::DomainDelta { domain, object } => {
                self.membership.touch(from, now);
                if !self.store.apply_delta(domain, object) {
                    debug!("Delta for unknown domain {} from {}", domain, from);
                }
            }
        }
        fx
    }

    /// Give up the local copy of a domain
    fn release_local_domain(&mut self, domain: DomainId, now: Instant) {
        for handle in self.registry.sessions_for_domain(domain) {
            handle.lock().cancel(now);
        }
        if self.membership.unhost_domain(self.local, domain) {
            info!("Domain {} deactivated locally", domain);
        }
        self.store.discard_domain(domain);
        self.windows.remove(&domain);
        self.pending_release.remove(&domain);
    }

    // === Object model queries ===

    pub fn domain_hosts_for(&self, domain: DomainId) -> Vec<NodeAddr> {
        self.membership.domain_hosts(domain)
    }

    pub fn replication_factor_for(&self, domain: DomainId) -> Option<u32> {
        self.membership.replication_factor(domain)
    }

    pub fn random_remote_host_for(&self, domain: DomainId) -> Option<NodeAddr> {
        self.membership.random_remote_host(domain)
    }

    /// Count one request against the domain's rate windows
    pub fn record_request(&mut self, domain: DomainId, kind: RequestKind, now: Instant) {
        let window = self.config.load.rate_window();
        self.windows
            .entry(domain)
            .or_insert_with(|| RequestWindows::new(window, now))
            .record(kind, 1, now);
    }

    // === Administration ===

    pub fn add_node(&mut self, addr: NodeAddr, now: Instant) -> bool {
        self.membership.add_node(addr, now)
    }

    pub fn remove_node(&mut self, addr: NodeAddr) -> Result<()> {
        self.membership.remove_node(addr)?;
        self.forwarding.remove_destination(addr);
        Ok(())
    }

    /// Full teardown: forget every peer and hosting record, cancel every
    /// migration, then re-host what the local store still serves.
    pub fn reset_cluster(&mut self, now: Instant) -> Result<()> {
        for id in self.registry.ids() {
            if let Some(handle) = self.registry.get(id) {
                handle.lock().cancel(now);
            }
        }
        for domain in self.pending_release.drain() {
            self.store.discard_domain(domain);
        }
        self.membership.reset(now);
        self.forwarding = ForwardingRecord::new();
        self.orphaned.clear();
        self.last_broadcast = None;
        if !self.local_active {
            self.membership.set_inactive(self.local)?;
        }
        for domain in self.store.domains() {
            let replication_factor = self.store.replication_factor(domain).unwrap_or(1);
            self.membership
                .host_domain(self.local, domain, replication_factor)?;
        }
        let membership = &self.membership;
        self.windows.retain(|d, _| membership.domain(*d).is_some());
        Ok(())
    }

    pub fn set_local_active(&mut self, active: bool, now: Instant) -> Result<()> {
        if self.local_active != active {
            self.announce_ticks = self.config.cluster.leader_not_present_count_max;
        }
        self.local_active = active;
        if active {
            self.membership.set_active(self.local, now)
        } else {
            self.membership.set_inactive(self.local)
        }
    }

    pub fn set_heavy_load_threshold(&mut self, threshold: f64) -> Result<()> {
        if !threshold.is_finite() || threshold <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "heavy load threshold must be positive, got {threshold}"
            )));
        }
        self.placement.set_heavy_load_threshold(threshold);
        Ok(())
    }

    pub fn request_mapping_exchange(&mut self) {
        self.membership.request_mapping_exchange();
    }

    pub fn set_status_change_allow(&mut self, allow: bool) {
        self.membership.set_status_change_allow(allow);
    }

    /// Create a domain served by the local node
    pub fn host_domain(&mut self, domain: DomainId, replication_factor: u32) -> Result<()> {
        if replication_factor == 0 {
            return Err(Error::InvalidReplicationFactor(replication_factor));
        }
        self.store.create_domain(domain, replication_factor);
        self.membership
            .host_domain(self.local, domain, replication_factor)
    }

    /// Remove a domain from the cluster view, cancelling its migrations
    pub fn delete_domain(&mut self, domain: DomainId, now: Instant) -> bool {
        for handle in self.registry.sessions_for_domain(domain) {
            handle.lock().cancel(now);
        }
        let existed = self.membership.delete_domain(domain, now);
        self.forwarding.remove_domain(domain);
        self.pending_release.remove(&domain);
        self.windows.remove(&domain);
        self.store.discard_domain(domain);
        existed
    }

    // === Status ===

    fn node_status_of(&self, node: &crate::cluster::node::Node, now: Instant) -> NodeStatus {
        NodeStatus {
            addr: node.addr,
            liveness: node.liveness,
            partition: node.partition,
            load: self.load.node_load(node),
            hosted: node.active_domain_count(),
            deactivated: node.deactivated.len(),
            config_version: node.config_version,
            believed_leader: node.believed_leader,
            last_contact_secs: crate::common::elapsed_secs(now, node.last_contact),
        }
    }

    pub fn status(&self, now: Instant) -> ClusterStatus {
        ClusterStatus {
            node: self.local,
            leader: self.membership.leader(),
            is_leader: self.membership.is_leader(),
            local_active: self.local_active,
            config_version: self.membership.config_version(),
            status_change_allow: self.membership.status_change_allowed(),
            heavy_load_threshold: self.placement.heavy_load_threshold(),
            active_weight: self.registry.active_weight(),
            weight_ceiling: self.registry.weight_ceiling(),
            migrations: self.registry.len(),
            domains: self.membership.domains().len(),
            nodes: self
                .membership
                .nodes()
                .map(|n| self.node_status_of(n, now))
                .collect(),
            generated_at: Utc::now(),
        }
    }

    /// Lookup by textual address; malformed input is "not found"
    pub fn node_status(&self, addr: &str, now: Instant) -> Option<NodeStatus> {
        self.membership
            .node_by_str(addr)
            .map(|n| self.node_status_of(n, now))
    }

    pub fn domain_status(&self, domain: DomainId) -> Option<DomainStatus> {
        let entry = self.membership.domain(domain)?;
        let migrations = self
            .registry
            .summaries()
            .into_iter()
            .filter(|s| s.domain == domain)
            .collect();
        let live_hosts = self.membership.domain_hosts(domain);
        Some(DomainStatus {
            domain,
            replication_factor: entry.replication_factor,
            hosts: entry.hosts.iter().copied().collect(),
            no_live_hosts: live_hosts.is_empty(),
            live_hosts,
            forwarding_to: self.forwarding.destinations(domain),
            migrations,
        })
    }

    pub fn domains_status(&self) -> Vec<DomainStatus> {
        self.membership
            .domains()
            .into_iter()
            .filter_map(|(d, _)| self.domain_status(d))
            .collect()
    }

    pub fn migrations(&self) -> Vec<SessionSummary> {
        self.registry.summaries()
    }
}
