//! Configuration for vnetdir nodes
//!
//! Values come from (lowest to highest priority) built-in defaults, an
//! optional TOML file and `VNETDIR__SECTION__FIELD` environment variables.
//! The node binary applies its command-line flags on top.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Default file name looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "vnetdir";

/// Environment variable prefix
pub const ENV_PREFIX: &str = "VNETDIR";

/// Global configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,

    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub placement: PlacementConfig,

    #[serde(default)]
    pub migration: MigrationConfig,

    #[serde(default)]
    pub load: LoadConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Identity and listening addresses of this node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address peers use to reach this node; also its cluster identity
    #[serde(default = "default_address")]
    pub address: String,

    /// Bind address for the peer + admin HTTP listener
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Statically known peers (bootstrap membership)
    #[serde(default)]
    pub peers: Vec<String>,
}

fn default_address() -> String {
    "127.0.0.1:7400".to_string()
}
fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7400))
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            bind_addr: default_bind_addr(),
            peers: Vec::new(),
        }
    }
}

/// Membership, failure detection and leader election timers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster tick period
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// No contact for longer than this moves an Up node to HintDown
    #[serde(default = "default_hint_no_contact")]
    pub hint_no_contact_secs: u64,

    /// Time spent in HintDown before the node is declared Down
    #[serde(default = "default_max_no_contact")]
    pub max_no_contact_secs: u64,

    /// Consecutive leaderless ticks before an election is forced
    #[serde(default = "default_leader_not_present")]
    pub leader_not_present_count_max: u32,

    /// Ticks a restored node stays on the partition watch list
    #[serde(default = "default_partition_hint_ticks")]
    pub partition_hint_timeout_ticks: u32,

    /// Bound on the partition watch list
    #[serde(default = "default_partition_watch_capacity")]
    pub partition_watch_capacity: usize,

    /// Maximum time between two broadcasts of the local domain mapping
    #[serde(default = "default_exchange_mapping")]
    pub exchange_domain_mapping_time_max_secs: u64,

    /// A deleted domain is not re-learned from peers for this long
    #[serde(default = "default_deleted_grace")]
    pub deleted_domain_grace_secs: u64,

    /// The leader rebroadcasts node status at least every N ticks
    #[serde(default = "default_status_broadcast_ticks")]
    pub status_broadcast_ticks: u64,
}

fn default_tick_interval() -> u64 {
    1000
}
fn default_hint_no_contact() -> u64 {
    10
}
fn default_max_no_contact() -> u64 {
    15
}
fn default_leader_not_present() -> u32 {
    3
}
fn default_partition_hint_ticks() -> u32 {
    3
}
fn default_partition_watch_capacity() -> usize {
    64
}
fn default_exchange_mapping() -> u64 {
    120
}
fn default_deleted_grace() -> u64 {
    300
}
fn default_status_broadcast_ticks() -> u64 {
    5
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval(),
            hint_no_contact_secs: default_hint_no_contact(),
            max_no_contact_secs: default_max_no_contact(),
            leader_not_present_count_max: default_leader_not_present(),
            partition_hint_timeout_ticks: default_partition_hint_ticks(),
            partition_watch_capacity: default_partition_watch_capacity(),
            exchange_domain_mapping_time_max_secs: default_exchange_mapping(),
            deleted_domain_grace_secs: default_deleted_grace(),
            status_broadcast_ticks: default_status_broadcast_ticks(),
        }
    }
}

impl ClusterConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn hint_no_contact(&self) -> Duration {
        Duration::from_secs(self.hint_no_contact_secs)
    }

    pub fn max_no_contact(&self) -> Duration {
        Duration::from_secs(self.max_no_contact_secs)
    }

    pub fn exchange_domain_mapping_time_max(&self) -> Duration {
        Duration::from_secs(self.exchange_domain_mapping_time_max_secs)
    }

    pub fn deleted_domain_grace(&self) -> Duration {
        Duration::from_secs(self.deleted_domain_grace_secs)
    }
}

/// Replication repair and heavy-load mitigation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementConfig {
    /// Mismatch must persist this long before the first repair
    pub replication_factor_attempt_fix_secs: u64,
    /// Minimum spacing between two repair attempts for one domain
    pub replication_factor_fix_retry_secs: u64,
    /// Aggregate node load (percent) considered heavy
    pub heavy_load_threshold: f64,
    /// A node must stay heavy this long before mitigation
    pub heavy_load_attempt_fix_secs: u64,
    /// Minimum spacing between two mitigations of one node
    pub heavy_load_fix_retry_secs: u64,
    /// Concurrency cap: migrations a node may take part in at once
    pub max_migrations_per_node: usize,
    /// How many light candidates are considered for a new replica
    pub light_candidates: usize,
    /// Candidates within this many load points of the lightest are equivalent
    pub light_spread: f64,
    /// Forget a migration we asked for after this long
    pub in_flight_expiry_secs: u64,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            replication_factor_attempt_fix_secs: 15,
            replication_factor_fix_retry_secs: 30,
            heavy_load_threshold: 60.0,
            heavy_load_attempt_fix_secs: 180,
            heavy_load_fix_retry_secs: 300,
            max_migrations_per_node: 2,
            light_candidates: 3,
            light_spread: 5.0,
            in_flight_expiry_secs: 600,
        }
    }
}

impl PlacementConfig {
    pub fn replication_factor_attempt_fix(&self) -> Duration {
        Duration::from_secs(self.replication_factor_attempt_fix_secs)
    }

    pub fn replication_factor_fix_retry(&self) -> Duration {
        Duration::from_secs(self.replication_factor_fix_retry_secs)
    }

    pub fn heavy_load_attempt_fix(&self) -> Duration {
        Duration::from_secs(self.heavy_load_attempt_fix_secs)
    }

    pub fn heavy_load_fix_retry(&self) -> Duration {
        Duration::from_secs(self.heavy_load_fix_retry_secs)
    }

    pub fn in_flight_expiry(&self) -> Duration {
        Duration::from_secs(self.in_flight_expiry_secs)
    }
}

/// Mass transfer pacing, retries and admission control
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Period of the per-session re-drive task
    pub drive_interval_ms: u64,
    /// An object unacknowledged for this long is re-sent on the next drive
    pub ack_timeout_ms: u64,
    /// Sends allowed per object before the session is invalidated
    pub max_retries_per_object: u32,
    /// Ceiling on the summed weight of active sessions
    pub weight_ceiling: u64,
    /// Weight every session carries regardless of size
    pub domain_base_weight: u64,
    pub vnids_per_sec: u64,
    pub policies_per_sec: u64,
    pub subnets_per_sec: u64,
    pub tunnels_per_sec: u64,
    pub endpoints_per_sec: u64,
    pub multicasts_per_sec: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            drive_interval_ms: 2000,
            ack_timeout_ms: 2000,
            max_retries_per_object: 20,
            weight_ceiling: 1000,
            domain_base_weight: 10,
            vnids_per_sec: 50,
            policies_per_sec: 100,
            subnets_per_sec: 100,
            tunnels_per_sec: 250,
            endpoints_per_sec: 500,
            multicasts_per_sec: 100,
        }
    }
}

impl MigrationConfig {
    pub fn drive_interval(&self) -> Duration {
        Duration::from_millis(self.drive_interval_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

/// Capacity constants and weights of the load score
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    /// Request counters rotate after this much accumulation
    pub rate_window_secs: u64,
    pub update_capacity_per_sec: f64,
    pub lookup_capacity_per_sec: f64,
    pub policy_lookup_capacity_per_sec: f64,
    /// Per-domain size capacities
    pub endpoint_capacity: f64,
    pub tunnel_capacity: f64,
    /// Per-node size capacities
    pub node_endpoint_capacity: f64,
    pub node_tunnel_capacity: f64,
    pub target_domains_per_node: f64,
    pub domain_rate_weight: u32,
    pub domain_size_weight: u32,
    pub node_rate_weight: u32,
    pub node_size_weight: u32,
    pub node_count_weight: u32,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            rate_window_secs: 120,
            update_capacity_per_sec: 1000.0,
            lookup_capacity_per_sec: 5000.0,
            policy_lookup_capacity_per_sec: 5000.0,
            endpoint_capacity: 50_000.0,
            tunnel_capacity: 2_000.0,
            node_endpoint_capacity: 500_000.0,
            node_tunnel_capacity: 20_000.0,
            target_domains_per_node: 100.0,
            domain_rate_weight: 34,
            domain_size_weight: 66,
            node_rate_weight: 25,
            node_size_weight: 50,
            node_count_weight: 25,
        }
    }
}

impl LoadConfig {
    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window_secs)
    }
}

impl Config {
    /// Load from `vnetdir.toml` (if present) and the environment.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load from an explicit file (which must exist) or the default lookup.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let config: Config = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("node.peers")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the timers and load model cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.cluster.tick_interval_ms == 0 {
            return Err(Error::InvalidConfig("cluster.tick_interval_ms must be > 0".into()));
        }
        if self.cluster.leader_not_present_count_max == 0 {
            return Err(Error::InvalidConfig(
                "cluster.leader_not_present_count_max must be > 0".into(),
            ));
        }
        if self.migration.drive_interval_ms == 0 {
            return Err(Error::InvalidConfig("migration.drive_interval_ms must be > 0".into()));
        }
        if self.migration.max_retries_per_object == 0 {
            return Err(Error::InvalidConfig(
                "migration.max_retries_per_object must be > 0".into(),
            ));
        }
        if self.placement.heavy_load_threshold <= 0.0 {
            return Err(Error::InvalidConfig(
                "placement.heavy_load_threshold must be positive".into(),
            ));
        }
        let load = &self.load;
        if load.domain_rate_weight + load.domain_size_weight != 100 {
            return Err(Error::InvalidConfig("domain load weights must sum to 100".into()));
        }
        if load.node_rate_weight + load.node_size_weight + load.node_count_weight != 100 {
            return Err(Error::InvalidConfig("node load weights must sum to 100".into()));
        }
        let capacities = [
            load.update_capacity_per_sec,
            load.lookup_capacity_per_sec,
            load.policy_lookup_capacity_per_sec,
            load.endpoint_capacity,
            load.tunnel_capacity,
            load.node_endpoint_capacity,
            load.node_tunnel_capacity,
            load.target_domains_per_node,
        ];
        if capacities.iter().any(|c| *c <= 0.0) {
            return Err(Error::InvalidConfig("load capacities must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let config = Config::default();
        assert_eq!(config.cluster.hint_no_contact(), Duration::from_secs(10));
        assert_eq!(config.cluster.max_no_contact(), Duration::from_secs(15));
        assert_eq!(config.cluster.leader_not_present_count_max, 3);
        assert_eq!(config.cluster.partition_hint_timeout_ticks, 3);
        assert_eq!(
            config.cluster.exchange_domain_mapping_time_max(),
            Duration::from_secs(120)
        );
        assert_eq!(config.migration.max_retries_per_object, 20);
        assert_eq!(config.migration.drive_interval(), Duration::from_secs(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
log_level = "debug"

[node]
address = "10.0.0.5:7400"
peers = ["10.0.0.6:7400", "10.0.0.7:7400"]

[placement]
heavy_load_threshold = 75.0
"#
        )
        .unwrap();

        let config = Config::load_from(Some(file.path())).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.node.address, "10.0.0.5:7400");
        assert_eq!(config.node.peers.len(), 2);
        assert_eq!(config.placement.heavy_load_threshold, 75.0);
        // untouched sections keep their defaults
        assert_eq!(config.placement.replication_factor_attempt_fix_secs, 15);
        assert_eq!(config.cluster.max_no_contact_secs, 15);
    }

    #[test]
    fn test_validate_rejects_bad_weights() {
        let mut config = Config::default();
        config.load.node_count_weight = 30;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.placement.heavy_load_threshold = 0.0;
        assert!(config.validate().is_err());
    }
}
