//! Peer messaging seam
//!
//! Every send is best-effort and non-blocking: `dispatch` only reports
//! whether the message could be queued locally. Delivery is observed later,
//! through acknowledgements or through the absence of contact.

pub mod http;
pub mod memory;

pub use http::HttpTransport;
pub use memory::{MemoryNetwork, MemoryTransport};

use crate::cluster::membership::MappingBlob;
use crate::cluster::node::{DomainId, DomainLoadStats, Liveness, NodeAddr};
use crate::common::METRICS;
use crate::migration::{AckStatus, CorrelationId, MigrationKind, TransferObject};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Everything nodes say to each other
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    /// Follower to leader: I am alive, this is my state
    Heartbeat {
        active: bool,
        config_version: u64,
        leader: Option<NodeAddr>,
    },
    /// Leader to follower: send me a heartbeat
    HeartbeatRequest,
    NodeListStatus {
        config_version: u64,
        nodes: Vec<(NodeAddr, Liveness)>,
    },
    LocalMapping(MappingBlob),
    Statistics {
        domains: Vec<DomainLoadStats>,
    },
    /// Leader to source: migrate `domain` to `destination`
    StartMigration {
        domain: DomainId,
        destination: NodeAddr,
        kind: MigrationKind,
    },
    MassTransferObject {
        correlation: CorrelationId,
        domain: DomainId,
        object: TransferObject,
    },
    MassTransferAck {
        correlation: CorrelationId,
        status: AckStatus,
    },
    DomainActivate {
        domain: DomainId,
        replication_factor: u32,
    },
    /// Leader to host: stop serving `domain`
    DomainDeactivate {
        domain: DomainId,
    },
    /// Source to destination: drop what was received for `domain`
    MigrationCancel {
        domain: DomainId,
    },
    /// Live update forwarded after a committed migration
    DomainDelta {
        domain: DomainId,
        object: TransferObject,
    },
}

impl PeerMessage {
    pub fn name(&self) -> &'static str {
        match self {
            PeerMessage::Heartbeat { .. } => "heartbeat",
            PeerMessage::HeartbeatRequest => "heartbeat_request",
            PeerMessage::NodeListStatus { .. } => "node_list_status",
            PeerMessage::LocalMapping(_) => "local_mapping",
            PeerMessage::Statistics { .. } => "statistics",
            PeerMessage::StartMigration { .. } => "start_migration",
            PeerMessage::MassTransferObject { .. } => "mass_transfer_object",
            PeerMessage::MassTransferAck { .. } => "mass_transfer_ack",
            PeerMessage::DomainActivate { .. } => "domain_activate",
            PeerMessage::DomainDeactivate { .. } => "domain_deactivate",
            PeerMessage::MigrationCancel { .. } => "migration_cancel",
            PeerMessage::DomainDelta { .. } => "domain_delta",
        }
    }
}

/// Wire unit: a message and who sent it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeAddr,
    pub message: PeerMessage,
}

/// A send decided under the cluster lock, performed after releasing it
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub destination: NodeAddr,
    pub message: PeerMessage,
}

impl Outbound {
    pub fn new(destination: NodeAddr, message: PeerMessage) -> Self {
        Self {
            destination,
            message,
        }
    }
}

/// Local queuing result; says nothing about delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStatus {
    Queued,
    /// No route to the destination right now
    Unreachable,
    /// The transport is shut down or has no runtime to send on
    Closed,
}

impl DispatchStatus {
    pub fn is_queued(&self) -> bool {
        matches!(self, DispatchStatus::Queued)
    }
}

/// Outbound side of peer messaging
pub trait Transport: Send + Sync {
    fn local(&self) -> NodeAddr;

    fn dispatch(&self, destination: NodeAddr, message: PeerMessage) -> DispatchStatus;

    fn send_heartbeat(
        &self,
        leader: NodeAddr,
        active: bool,
        config_version: u64,
        believed_leader: Option<NodeAddr>,
    ) -> DispatchStatus {
        self.dispatch(
            leader,
            PeerMessage::Heartbeat {
                active,
                config_version,
                leader: believed_leader,
            },
        )
    }

    fn send_heartbeat_request(&self, node: NodeAddr) -> DispatchStatus {
        self.dispatch(node, PeerMessage::HeartbeatRequest)
    }

    fn send_node_list_status(
        &self,
        destination: NodeAddr,
        config_version: u64,
        nodes: Vec<(NodeAddr, Liveness)>,
    ) -> DispatchStatus {
        self.dispatch(
            destination,
            PeerMessage::NodeListStatus {
                config_version,
                nodes,
            },
        )
    }

    /// Broadcast; returns how many destinations accepted the message
    fn send_local_mapping(&self, destinations: &[NodeAddr], mapping: &MappingBlob) -> usize {
        destinations
            .iter()
            .filter(|dest| {
                self.dispatch(**dest, PeerMessage::LocalMapping(mapping.clone()))
                    .is_queued()
            })
            .count()
    }

    fn send_mass_transfer_object(
        &self,
        destination: NodeAddr,
        correlation: CorrelationId,
        domain: DomainId,
        object: TransferObject,
    ) -> DispatchStatus {
        self.dispatch(
            destination,
            PeerMessage::MassTransferObject {
                correlation,
                domain,
                object,
            },
        )
    }

    fn send_mass_transfer_ack(
        &self,
        destination: NodeAddr,
        correlation: CorrelationId,
        status: AckStatus,
    ) -> DispatchStatus {
        self.dispatch(
            destination,
            PeerMessage::MassTransferAck {
                correlation,
                status,
            },
        )
    }

    fn send_domain_activate(
        &self,
        destination: NodeAddr,
        domain: DomainId,
        replication_factor: u32,
    ) -> DispatchStatus {
        self.dispatch(
            destination,
            PeerMessage::DomainActivate {
                domain,
                replication_factor,
            },
        )
    }

    fn send_domain_deactivate(&self, destination: NodeAddr, domain: DomainId) -> DispatchStatus {
        self.dispatch(destination, PeerMessage::DomainDeactivate { domain })
    }

    fn send_migration_cancel(&self, destination: NodeAddr, domain: DomainId) -> DispatchStatus {
        self.dispatch(destination, PeerMessage::MigrationCancel { domain })
    }
}

/// Dispatch a batch decided under the cluster lock. Failures are counted
/// and otherwise left to the retry and timeout machinery.
pub fn dispatch_all(transport: &dyn Transport, outbound: Vec<Outbound>) -> usize {
    let mut failed = 0;
    for Outbound {
        destination,
        message,
    } in outbound
    {
        let name = message.name();
        let status = transport.dispatch(destination, message);
        if !status.is_queued() {
            debug!("Dispatch of {} to {} failed: {:?}", name, destination, status);
            METRICS.dispatch_failures.inc();
            failed += 1;
        }
    }
    failed
}
