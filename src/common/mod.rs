//! Common utilities and types shared across vnetdir

pub mod config;
pub mod error;
pub mod metrics;
pub mod utils;

pub use config::{
    ClusterConfig, Config, LoadConfig, MigrationConfig, NodeConfig, PlacementConfig,
};
pub use error::{Error, Result};
pub use metrics::METRICS;
pub use utils::{elapsed_secs, format_load, parse_duration, retry_with_backoff};
