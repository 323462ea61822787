//! Cluster view: node records, membership, load and placement

pub mod load;
pub mod membership;
pub mod node;
pub mod placement;
pub mod state;

pub use load::{LoadModel, RequestKind};
pub use membership::{MappingBlob, MembershipTable};
pub use node::{DomainId, DomainLoadStats, Liveness, Node, NodeAddr, PartitionState};
pub use placement::{PlacementAction, PlacementController};
pub use state::{ClusterState, ClusterStatus, DomainStatus, Effects, NodeStatus};
