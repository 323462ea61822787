//! Cluster metrics
//!
//! Lock-free counters for the control-plane loops, rendered in the
//! Prometheus text format by the admin router.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Bucket boundaries for migration durations (seconds)
const MIGRATION_SECONDS_BUCKETS: [f64; 8] = [1.0, 5.0, 15.0, 30.0, 60.0, 300.0, 900.0, 3600.0];

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Point-in-time value
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Fixed-bucket histogram
#[derive(Debug)]
pub struct Histogram {
    boundaries: Vec<f64>,
    buckets: Vec<AtomicU64>,
    /// Sum in milliseconds
    sum_ms: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn with_buckets(boundaries: &[f64]) -> Self {
        Self {
            boundaries: boundaries.to_vec(),
            buckets: (0..=boundaries.len()).map(|_| AtomicU64::new(0)).collect(),
            sum_ms: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        let idx = self
            .boundaries
            .iter()
            .position(|b| value <= *b)
            .unwrap_or(self.boundaries.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_ms
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative `(upper bound, count)` pairs, ending with +Inf
    pub fn cumulative(&self) -> Vec<(f64, u64)> {
        let mut running = 0;
        let mut out = Vec::with_capacity(self.buckets.len());
        for (i, bucket) in self.buckets.iter().enumerate() {
            running += bucket.load(Ordering::Relaxed);
            let le = self.boundaries.get(i).copied().unwrap_or(f64::INFINITY);
            out.push((le, running));
        }
        out
    }

    pub fn sum(&self) -> f64 {
        self.sum_ms.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Global metrics registry
#[derive(Debug)]
pub struct ClusterMetrics {
    pub ticks: Counter,
    pub elections: Counter,
    pub liveness_transitions: Counter,
    pub partition_alerts: Counter,
    pub mapping_exchanges: Counter,
    pub mappings_reconciled: Counter,

    pub placement_actions: Counter,
    pub migrations_started: Counter,
    pub migrations_committed: Counter,
    pub migrations_cancelled: Counter,
    pub objects_sent: Counter,
    pub objects_retried: Counter,
    pub objects_acked: Counter,
    pub deltas_admitted: Counter,
    pub deltas_rejected: Counter,
    pub deltas_forwarded: Counter,
    pub dispatch_failures: Counter,

    pub active_migrations: Gauge,
    pub active_weight: Gauge,
    pub migration_seconds: Histogram,

    start_time: Instant,
}

impl ClusterMetrics {
    pub fn new() -> Self {
        Self {
            ticks: Counter::new(),
            elections: Counter::new(),
            liveness_transitions: Counter::new(),
            partition_alerts: Counter::new(),
            mapping_exchanges: Counter::new(),
            mappings_reconciled: Counter::new(),
            placement_actions: Counter::new(),
            migrations_started: Counter::new(),
            migrations_committed: Counter::new(),
            migrations_cancelled: Counter::new(),
            objects_sent: Counter::new(),
            objects_retried: Counter::new(),
            objects_acked: Counter::new(),
            deltas_admitted: Counter::new(),
            deltas_rejected: Counter::new(),
            deltas_forwarded: Counter::new(),
            dispatch_failures: Counter::new(),
            active_migrations: Gauge::new(),
            active_weight: Gauge::new(),
            migration_seconds: Histogram::with_buckets(&MIGRATION_SECONDS_BUCKETS),
            start_time: Instant::now(),
        }
    }

    pub fn observe_migration(&self, elapsed: Duration) {
        self.migration_seconds.observe(elapsed.as_secs_f64());
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Render in the Prometheus exposition format
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        let counters: [(&str, &str, &Counter); 17] = [
            ("vnetdir_ticks_total", "Cluster ticks processed", &self.ticks),
            ("vnetdir_elections_total", "Leader elections held", &self.elections),
            (
                "vnetdir_liveness_transitions_total",
                "Node liveness state changes",
                &self.liveness_transitions,
            ),
            (
                "vnetdir_partition_alerts_total",
                "Restored nodes asserting possibly stale state",
                &self.partition_alerts,
            ),
            (
                "vnetdir_mapping_exchanges_total",
                "Local domain mapping broadcasts",
                &self.mapping_exchanges,
            ),
            (
                "vnetdir_mappings_reconciled_total",
                "Peer domain mappings reconciled",
                &self.mappings_reconciled,
            ),
            (
                "vnetdir_placement_actions_total",
                "Placement repair actions taken",
                &self.placement_actions,
            ),
            (
                "vnetdir_migrations_started_total",
                "Migration sessions started",
                &self.migrations_started,
            ),
            (
                "vnetdir_migrations_committed_total",
                "Migration sessions committed",
                &self.migrations_committed,
            ),
            (
                "vnetdir_migrations_cancelled_total",
                "Migration sessions cancelled",
                &self.migrations_cancelled,
            ),
            ("vnetdir_objects_sent_total", "Transfer objects sent", &self.objects_sent),
            (
                "vnetdir_objects_retried_total",
                "Transfer objects re-sent",
                &self.objects_retried,
            ),
            (
                "vnetdir_objects_acked_total",
                "Transfer objects acknowledged",
                &self.objects_acked,
            ),
            (
                "vnetdir_deltas_admitted_total",
                "Live updates admitted into a migration",
                &self.deltas_admitted,
            ),
            (
                "vnetdir_deltas_rejected_total",
                "Live updates rejected by a migration",
                &self.deltas_rejected,
            ),
            (
                "vnetdir_deltas_forwarded_total",
                "Live updates forwarded after commit",
                &self.deltas_forwarded,
            ),
            (
                "vnetdir_dispatch_failures_total",
                "Outbound messages the transport refused",
                &self.dispatch_failures,
            ),
        ];
        for (name, help, counter) in counters {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} counter");
            let _ = writeln!(out, "{name} {}", counter.get());
        }

        let gauges: [(&str, &str, u64); 3] = [
            (
                "vnetdir_active_migrations",
                "Migration sessions in progress",
                self.active_migrations.get(),
            ),
            (
                "vnetdir_active_weight",
                "Summed weight of active migration sessions",
                self.active_weight.get(),
            ),
            ("vnetdir_uptime_seconds", "Process uptime", self.uptime_seconds()),
        ];
        for (name, help, value) in gauges {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} gauge");
            let _ = writeln!(out, "{name} {value}");
        }

        out.push_str("# HELP vnetdir_migration_seconds Migration session duration\n");
        out.push_str("# TYPE vnetdir_migration_seconds histogram\n");
        for (le, count) in self.migration_seconds.cumulative() {
            if le.is_infinite() {
                let _ = writeln!(out, "vnetdir_migration_seconds_bucket{{le=\"+Inf\"}} {count}");
            } else {
                let _ = writeln!(out, "vnetdir_migration_seconds_bucket{{le=\"{le}\"}} {count}");
            }
        }
        let _ = writeln!(
            out,
            "vnetdir_migration_seconds_sum {}",
            self.migration_seconds.sum()
        );
        let _ = writeln!(
            out,
            "vnetdir_migration_seconds_count {}",
            self.migration_seconds.count()
        );

        out
    }
}

impl Default for ClusterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Global metrics instance
pub static METRICS: once_cell::sync::Lazy<ClusterMetrics> =
    once_cell::sync::Lazy::new(ClusterMetrics::new);
