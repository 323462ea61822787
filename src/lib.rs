//! # vnetdir
//!
//! Control plane of a distributed virtual-network directory:
//! - Membership with heartbeat failure detection and deterministic leader election
//! - Hosting maps exchanged between nodes and reconciled into a domain host index
//! - Leader-driven placement that repairs replication and relieves heavy nodes
//! - Staged mass-transfer migrations with retry caps and weight-based admission
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                DirectoryNode                 │
//! │  tick task ─┐   drive tasks ─┐   outcomes ─┐ │
//! │             ▼                ▼             ▼ │
//! │   ┌──────────────────────────────────────┐   │
//! │   │  ClusterState (one coarse lock)      │   │
//! │   │  membership · placement · registry   │   │
//! │   └──────────────┬───────────────────────┘   │
//! │                  │ outbound, after unlock    │
//! └──────────────────┼───────────────────────────┘
//!                    ▼
//!        Transport (HTTP/JSON or in-memory)
//! ```
//!
//! ## Usage
//!
//! ### Start a node
//! ```bash
//! vnetdir-node serve \
//!   --address 10.0.0.1:7400 \
//!   --bind 0.0.0.0:7400 \
//!   --peers 10.0.0.2:7400,10.0.0.3:7400
//! ```
//!
//! ### Use the CLI
//! ```bash
//! vnetdir status
//! vnetdir domain host 42 --replication-factor 2
//! vnetdir node add 10.0.0.4:7400
//! vnetdir threshold 75
//! vnetdir exchange-mapping
//! ```

#![allow(clippy::result_large_err)]

pub mod client;
pub mod cluster;
pub mod common;
pub mod domain_store;
pub mod migration;
pub mod server;
pub mod transport;

// Re-export commonly used types
pub use cluster::{ClusterState, DomainId, Liveness, NodeAddr};
pub use common::{Config, Error, Result};
pub use domain_store::{DomainStore, MemoryDomainStore};
pub use server::{DirectoryNode, NodeHandle};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
