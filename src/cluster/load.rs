//! Load scoring for nodes and hosted domains
//!
//! A domain hosted on a node scores a blend of its request rate and its
//! size (endpoints, tunnels), each expressed as a percentage of a
//! conservative capacity constant. A node scores a blend of the summed
//! rate, its total size and how many domains it hosts relative to the
//! target average. Scores are unbounded above 100.

use crate::cluster::node::{DomainLoadStats, Node};
use crate::common::LoadConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Request classes counted for the rate component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Update,
    Lookup,
    PolicyLookup,
}

#[derive(Debug, Clone, Copy, Default)]
struct RequestCounts {
    updates: u64,
    lookups: u64,
    policy_lookups: u64,
}

impl RequestCounts {
    fn add(&mut self, kind: RequestKind, n: u64) {
        match kind {
            RequestKind::Update => self.updates += n,
            RequestKind::Lookup => self.lookups += n,
            RequestKind::PolicyLookup => self.policy_lookups += n,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct WindowRow {
    started: Instant,
    counts: RequestCounts,
}

/// Two-row request accumulator.
///
/// Requests land in the current row. Once the current row has accumulated
/// for a full window it becomes the previous row and a fresh row starts, so
/// the two rows together always span between one and two windows.
#[derive(Debug, Clone)]
pub struct RequestWindows {
    window: Duration,
    previous: Option<WindowRow>,
    current: WindowRow,
}

impl RequestWindows {
    pub fn new(window: Duration, now: Instant) -> Self {
        Self {
            window,
            previous: None,
            current: WindowRow {
                started: now,
                counts: RequestCounts::default(),
            },
        }
    }

    pub fn record(&mut self, kind: RequestKind, n: u64, now: Instant) {
        self.rotate(now);
        self.current.counts.add(kind, n);
    }

    fn rotate(&mut self, now: Instant) {
        if now.saturating_duration_since(self.current.started) >= self.window {
            self.previous = Some(self.current);
            self.current = WindowRow {
                started: now,
                counts: RequestCounts::default(),
            };
        }
    }

    /// Per-second rates `(update, lookup, policy_lookup)` over both rows
    pub fn rates(&mut self, now: Instant) -> (f64, f64, f64) {
        self.rotate(now);
        let (start, mut total) = match self.previous {
            Some(prev) => (prev.started, prev.counts),
            None => (self.current.started, RequestCounts::default()),
        };
        total.updates += self.current.counts.updates;
        total.lookups += self.current.counts.lookups;
        total.policy_lookups += self.current.counts.policy_lookups;

        // never divide by less than a second
        let elapsed = now.saturating_duration_since(start).as_secs_f64().max(1.0);
        (
            total.updates as f64 / elapsed,
            total.lookups as f64 / elapsed,
            total.policy_lookups as f64 / elapsed,
        )
    }
}

/// Stateless scorer over reported statistics
#[derive(Debug, Clone)]
pub struct LoadModel {
    config: LoadConfig,
}

impl LoadModel {
    pub fn new(config: LoadConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LoadConfig {
        &self.config
    }

    /// Rate component of a domain on a node, in percent
    pub fn rate_load(&self, stats: &DomainLoadStats) -> f64 {
        let c = &self.config;
        (stats.update_rate / c.update_capacity_per_sec
            + stats.lookup_rate / c.lookup_capacity_per_sec
            + stats.policy_lookup_rate / c.policy_lookup_capacity_per_sec)
            * 100.0
    }

    /// Size component of a domain on a node, in percent
    pub fn size_load(&self, stats: &DomainLoadStats) -> f64 {
        let c = &self.config;
        let endpoints = stats.endpoints as f64 / c.endpoint_capacity * 100.0;
        let tunnels = stats.tunnels as f64 / c.tunnel_capacity * 100.0;
        (endpoints + tunnels) / 2.0
    }

    /// Load of one domain hosted on a node
    pub fn domain_load(&self, stats: &DomainLoadStats) -> f64 {
        let c = &self.config;
        (self.rate_load(stats) * c.domain_rate_weight as f64
            + self.size_load(stats) * c.domain_size_weight as f64)
            / 100.0
    }

    /// Aggregate load of a node over its actively served domains
    pub fn node_load(&self, node: &Node) -> f64 {
        let c = &self.config;
        let mut rate = 0.0;
        let mut endpoints = 0u64;
        let mut tunnels = 0u64;
        let mut domains = 0usize;
        for (domain, _) in node.active_domains() {
            let stats = node.stats_for(domain);
            rate += self.rate_load(&stats);
            endpoints += stats.endpoints;
            tunnels += stats.tunnels;
            domains += 1;
        }

        let size = (endpoints as f64 / c.node_endpoint_capacity
            + tunnels as f64 / c.node_tunnel_capacity)
            / 2.0
            * 100.0;
        let count = domains as f64 / c.target_domains_per_node * 100.0;

        (rate * c.node_rate_weight as f64
            + size * c.node_size_weight as f64
            + count * c.node_count_weight as f64)
            / 100.0
    }

    /// What one hosted domain contributes to its node's load. Shares of
    /// all active domains sum to `node_load`.
    pub fn domain_share(&self, stats: &DomainLoadStats) -> f64 {
        let c = &self.config;
        let size = (stats.endpoints as f64 / c.node_endpoint_capacity
            + stats.tunnels as f64 / c.node_tunnel_capacity)
            / 2.0
            * 100.0;
        let count = 100.0 / c.target_domains_per_node;
        (self.rate_load(stats) * c.node_rate_weight as f64
            + size * c.node_size_weight as f64
            + count * c.node_count_weight as f64)
            / 100.0
    }

    /// Node load after adding or removing a domain of the given share
    pub fn node_load_with(&self, node_load: f64, share: f64, adding: bool) -> f64 {
        if adding {
            node_load + share
        } else {
            (node_load - share).max(0.0)
        }
    }
}

/// The `k` lowest-scoring entries, ties kept in input order
pub fn lowest_k<T>(mut scored: Vec<(T, f64)>, k: usize) -> Vec<(T, f64)> {
    scored.sort_by(|a, b| a.1.total_cmp(&b.1));
    scored.truncate(k);
    scored
}

/// The `k` highest-scoring entries, ties kept in input order
pub fn highest_k<T>(mut scored: Vec<(T, f64)>, k: usize) -> Vec<(T, f64)> {
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored.truncate(k);
    scored
}
