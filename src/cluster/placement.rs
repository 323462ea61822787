//! Replica placement and load balancing
//!
//! Runs on the leader only. Each evaluation compares every domain's live
//! host count with its replication factor and proposes corrective actions,
//! unserved domains and the largest deficits first. It then looks for nodes that have stayed heavily loaded for too long and
//! proposes moving one of their domains to a lightly loaded node.
//!
//! Actions are proposals; the caller starts the sessions and sends the
//! instructions. Proposed moves are remembered as in-flight so the next
//! evaluation does not propose them again before they show up in the
//! membership table.

use crate::cluster::load::{highest_k, lowest_k, LoadModel};
use crate::cluster::membership::MembershipTable;
use crate::cluster::node::{DomainId, Liveness, NodeAddr};
use crate::common::{format_load, MigrationConfig, PlacementConfig, METRICS};
use crate::migration::{estimate_weight, MigrationKind, ObjectCounts};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementAction {
    StartMigration {
        domain: DomainId,
        source: NodeAddr,
        destination: NodeAddr,
        kind: MigrationKind,
        weight: u64,
    },
    DeactivateReplica {
        domain: DomainId,
        node: NodeAddr,
    },
}

#[derive(Debug, Clone, Copy)]
struct InFlightMove {
    source: NodeAddr,
    started: Instant,
}

/// Weight admission for one evaluation round
struct Budget {
    active: u64,
    ceiling: u64,
}

impl Budget {
    fn admit(&mut self, weight: u64) -> bool {
        if self.active == 0 || self.active + weight <= self.ceiling {
            self.active += weight;
            true
        } else {
            false
        }
    }
}

pub struct PlacementController {
    config: PlacementConfig,
    migration: MigrationConfig,
    mismatch_since: HashMap<DomainId, Instant>,
    last_attempt: HashMap<DomainId, Instant>,
    heavy_since: HashMap<NodeAddr, Instant>,
    heavy_last_fix: HashMap<NodeAddr, Instant>,
    in_flight: HashMap<(DomainId, NodeAddr), InFlightMove>,
    rng: StdRng,
}

impl PlacementController {
    pub fn new(config: PlacementConfig, migration: MigrationConfig) -> Self {
        Self::with_rng(config, migration, StdRng::from_entropy())
    }

    /// Deterministic destination picks, for tests
    pub fn with_seed(config: PlacementConfig, migration: MigrationConfig, seed: u64) -> Self {
        Self::with_rng(config, migration, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: PlacementConfig, migration: MigrationConfig, rng: StdRng) -> Self {
        Self {
            config,
            migration,
            mismatch_since: HashMap::new(),
            last_attempt: HashMap::new(),
            heavy_since: HashMap::new(),
            heavy_last_fix: HashMap::new(),
            in_flight: HashMap::new(),
            rng,
        }
    }

    pub fn config(&self) -> &PlacementConfig {
        &self.config
    }

    pub fn heavy_load_threshold(&self) -> f64 {
        self.config.heavy_load_threshold
    }

    pub fn set_heavy_load_threshold(&mut self, threshold: f64) {
        info!("Heavy load threshold set to {}", format_load(threshold));
        self.config.heavy_load_threshold = threshold;
        self.heavy_since.clear();
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Forget an in-flight move once its session ended
    pub fn migration_finished(&mut self, domain: DomainId, destination: NodeAddr) {
        self.in_flight.remove(&(domain, destination));
    }

    /// Moves in flight touching `node` as source or destination
    fn migrations_on(&self, node: NodeAddr) -> usize {
        self.in_flight
            .iter()
            .filter(|((_, dest), m)| *dest == node || m.source == node)
            .count()
    }

    fn pending_for(&self, domain: DomainId) -> usize {
        self.in_flight.keys().filter(|(d, _)| *d == domain).count()
    }

    /// One placement round. Returns nothing unless the local node leads.
    pub fn evaluate(
        &mut self,
        membership: &MembershipTable,
        model: &LoadModel,
        active_weight: u64,
        weight_ceiling: u64,
        now: Instant,
    ) -> Vec<PlacementAction> {
        if !membership.is_leader() {
            // a later leadership term starts its guard timers afresh
            self.mismatch_since.clear();
            self.heavy_since.clear();
            return Vec::new();
        }
        self.expire_in_flight(membership, now);

        let loads: BTreeMap<NodeAddr, f64> = membership
            .nodes()
            .map(|n| (n.addr, model.node_load(n)))
            .collect();
        let mut budget = Budget {
            active: active_weight,
            ceiling: weight_ceiling,
        };

        let mut actions = Vec::new();
        self.repair_replication(membership, &loads, &mut budget, now, &mut actions);
        self.mitigate_heavy_load(membership, model, &loads, &mut budget, now, &mut actions);

        METRICS.placement_actions.add(actions.len() as u64);
        actions
    }

    fn expire_in_flight(&mut self, membership: &MembershipTable, now: Instant) {
        let expiry = self.config.in_flight_expiry();
        self.in_flight.retain(|(domain, dest), m| {
            let landed = membership
                .node(*dest)
                .is_some_and(|n| n.hosts_active(*domain));
            let live = membership.is_live(*dest);
            !landed && live && now.saturating_duration_since(m.started) < expiry
        });
    }

    fn repair_replication(
        &mut self,
        membership: &MembershipTable,
        loads: &BTreeMap<NodeAddr, f64>,
        budget: &mut Budget,
        now: Instant,
        actions: &mut Vec<PlacementAction>,
    ) {
        let attempt_fix = self.config.replication_factor_attempt_fix();
        let fix_retry = self.config.replication_factor_fix_retry();
        let mut mismatched = HashSet::new();

        for (domain, replication_factor) in repair_order(membership) {
            let desired = replication_factor as usize;
            let live = membership.domain_hosts(domain);
            let pending = self.pending_for(domain);
            let under = live.len() + pending < desired;
            let over = pending == 0 && live.len() > desired;
            if !under && !over {
                continue;
            }

            mismatched.insert(domain);
            let since = *self.mismatch_since.entry(domain).or_insert_with(|| {
                debug!(
                    "Domain {} has {} live hosts, wants {}",
                    domain,
                    live.len(),
                    desired
                );
                now
            });
            if now.saturating_duration_since(since) <= attempt_fix {
                continue;
            }
            if self
                .last_attempt
                .get(&domain)
                .is_some_and(|last| now.saturating_duration_since(*last) < fix_retry)
            {
                continue;
            }
            self.last_attempt.insert(domain, now);

            let action = if under {
                self.plan_replica(membership, domain, &live, loads, budget, now)
            } else {
                self.plan_deactivation(domain, &live, loads)
            };
            if let Some(action) = action {
                actions.push(action);
            }
        }

        self.mismatch_since.retain(|d, _| mismatched.contains(d));
    }

    fn plan_replica(
        &mut self,
        membership: &MembershipTable,
        domain: DomainId,
        live: &[NodeAddr],
        loads: &BTreeMap<NodeAddr, f64>,
        budget: &mut Budget,
        now: Instant,
    ) -> Option<PlacementAction> {
        let cap = self.config.max_migrations_per_node;
        let load_of = |addr: &NodeAddr| loads.get(addr).copied().unwrap_or(0.0);

        let sources: Vec<(NodeAddr, f64)> = live
            .iter()
            .filter(|a| self.migrations_on(**a) < cap)
            .map(|a| (*a, load_of(a)))
            .collect();
        let Some((source, _)) = lowest_k(sources, 1).into_iter().next() else {
            if live.is_empty() {
                warn!("Domain {} has no live host to copy from", domain);
            } else {
                debug!("Domain {}: every host is busy migrating", domain);
            }
            return None;
        };

        let candidates: Vec<(NodeAddr, f64)> = membership
            .nodes()
            .filter(|n| {
                n.liveness == Liveness::Up
                    && !n.hosts(domain)
                    && !self.in_flight.contains_key(&(domain, n.addr))
                    && self.migrations_on(n.addr) < cap
            })
            .map(|n| (n.addr, load_of(&n.addr)))
            .collect();
        let lightest = lowest_k(candidates, self.config.light_candidates);
        let Some(min) = lightest.first().map(|(_, load)| *load) else {
            warn!("Domain {} under-replicated, no eligible destination", domain);
            return None;
        };
        let near: Vec<NodeAddr> = lightest
            .iter()
            .filter(|(_, load)| *load <= min + self.config.light_spread)
            .map(|(addr, _)| *addr)
            .collect();
        let destination = *near.choose(&mut self.rng)?;

        let stats = membership.node(source)?.stats_for(domain);
        let weight = estimate_weight(&ObjectCounts::from_stats(&stats), &self.migration);
        if !budget.admit(weight) {
            debug!(
                "Replica of domain {} deferred, weight {} over ceiling",
                domain, weight
            );
            return None;
        }

        info!(
            "Domain {} under-replicated: copying {} -> {}",
            domain, source, destination
        );
        self.in_flight.insert(
            (domain, destination),
            InFlightMove {
                source,
                started: now,
            },
        );
        Some(PlacementAction::StartMigration {
            domain,
            source,
            destination,
            kind: MigrationKind::AddReplica,
            weight,
        })
    }

    /// Never leaves a domain without a live host: two heavy hosts must be
    /// found before the heaviest one gives its replica up.
    fn plan_deactivation(
        &self,
        domain: DomainId,
        live: &[NodeAddr],
        loads: &BTreeMap<NodeAddr, f64>,
    ) -> Option<PlacementAction> {
        let scored: Vec<(NodeAddr, f64)> = live
            .iter()
            .map(|a| (*a, loads.get(a).copied().unwrap_or(0.0)))
            .collect();
        let heaviest = highest_k(scored, 2);
        if heaviest.len() < 2 {
            return None;
        }
        let (node, load) = heaviest[0];
        info!(
            "Domain {} over-replicated: deactivating on {} (load {})",
            domain,
            node,
            format_load(load)
        );
        Some(PlacementAction::DeactivateReplica { domain, node })
    }

    fn mitigate_heavy_load(
        &mut self,
        membership: &MembershipTable,
        model: &LoadModel,
        loads: &BTreeMap<NodeAddr, f64>,
        budget: &mut Budget,
        now: Instant,
        actions: &mut Vec<PlacementAction>,
    ) {
        let threshold = self.config.heavy_load_threshold;
        let attempt_fix = self.config.heavy_load_attempt_fix();
        let fix_retry = self.config.heavy_load_fix_retry();
        let cap = self.config.max_migrations_per_node;

        for node in membership.nodes() {
            let load = loads.get(&node.addr).copied().unwrap_or(0.0);
            if node.liveness != Liveness::Up || load <= threshold {
                self.heavy_since.remove(&node.addr);
                continue;
            }
            let since = *self.heavy_since.entry(node.addr).or_insert(now);
            if now.saturating_duration_since(since) <= attempt_fix {
                continue;
            }
            if self
                .heavy_last_fix
                .get(&node.addr)
                .is_some_and(|last| now.saturating_duration_since(*last) < fix_retry)
            {
                continue;
            }
            if self.migrations_on(node.addr) >= cap {
                continue;
            }
            self.heavy_last_fix.insert(node.addr, now);

            // domain whose move leaves source and target closest in load
            let mut best: Option<(DomainId, NodeAddr, f64)> = None;
            for (domain, _) in node.active_domains() {
                if self.pending_for(domain) > 0 {
                    continue;
                }
                let targets: Vec<(NodeAddr, f64)> = membership
                    .nodes()
                    .filter(|t| {
                        t.addr != node.addr
                            && t.liveness == Liveness::Up
                            && !t.hosts(domain)
                            && self.migrations_on(t.addr) < cap
                    })
                    .map(|t| (t.addr, loads.get(&t.addr).copied().unwrap_or(0.0)))
                    .collect();
                let Some((target, target_load)) = lowest_k(targets, 1).into_iter().next() else {
                    continue;
                };

                let share = model.domain_share(&node.stats_for(domain));
                let source_after = model.node_load_with(load, share, false);
                let target_after = model.node_load_with(target_load, share, true);
                let differential = (source_after - target_after).abs();
                if differential >= (load - target_load).abs() {
                    continue;
                }
                if best.map_or(true, |(_, _, d)| differential < d) {
                    best = Some((domain, target, differential));
                }
            }

            let Some((domain, destination, _)) = best else {
                warn!(
                    "Node {} heavily loaded ({}), no domain move helps",
                    node.addr,
                    format_load(load)
                );
                continue;
            };
            let weight = estimate_weight(
                &ObjectCounts::from_stats(&node.stats_for(domain)),
                &self.migration,
            );
            if !budget.admit(weight) {
                debug!("Load move of domain {} deferred by admission", domain);
                continue;
            }

            warn!(
                "Node {} heavily loaded ({}): moving domain {} to {}",
                node.addr,
                format_load(load),
                domain,
                destination
            );
            self.in_flight.insert(
                (domain, destination),
                InFlightMove {
                    source: node.addr,
                    started: now,
                },
            );
            actions.push(PlacementAction::StartMigration {
                domain,
                source: node.addr,
                destination,
                kind: MigrationKind::Move,
                weight,
            });
        }
    }
}

/// Unserved domains first, then the largest replica deficit
fn repair_order(membership: &MembershipTable) -> Vec<(DomainId, u32)> {
    let unserved: HashSet<DomainId> = membership.domains_without_live_hosts().into_iter().collect();
    let mut order: Vec<(DomainId, u32, usize)> = membership
        .domains()
        .into_iter()
        .map(|(domain, entry)| {
            let deficit = (entry.replication_factor as usize)
                .saturating_sub(membership.live_host_count(domain));
            (domain, entry.replication_factor, deficit)
        })
        .collect();
    order.sort_by_key(|(domain, _, deficit)| {
        (!unserved.contains(domain), Reverse(*deficit), *domain)
    });
    order.into_iter().map(|(d, rf, _)| (d, rf)).collect()
}
