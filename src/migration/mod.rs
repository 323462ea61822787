//! Mass transfer of a domain to another node
//!
//! A [`MigrationSession`] streams a domain's objects to a destination stage
//! by stage, the [`MigrationRegistry`] owns the live sessions and the global
//! weight counter used for admission control, and the [`ForwardingRecord`]
//! keeps committed destinations fed with live updates until they advertise
//! the domain themselves.

pub mod forwarding;
pub mod registry;
pub mod session;

pub use forwarding::ForwardingRecord;
pub use registry::{MigrationRegistry, SessionSummary};
pub use session::{CompletionCallback, DriveChecks, MigrationSession, SessionHandle};

use crate::cluster::node::{DomainId, DomainLoadStats, NodeAddr};
use crate::common::MigrationConfig;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Transfer stages, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Start,
    Vnids,
    Policies,
    Subnets,
    Tunnels,
    Endpoints,
    Multicasts,
    Finished,
}

impl Stage {
    pub fn next(self) -> Stage {
        match self {
            Stage::Start => Stage::Vnids,
            Stage::Vnids => Stage::Policies,
            Stage::Policies => Stage::Subnets,
            Stage::Subnets => Stage::Tunnels,
            Stage::Tunnels => Stage::Endpoints,
            Stage::Endpoints => Stage::Multicasts,
            Stage::Multicasts | Stage::Finished => Stage::Finished,
        }
    }

    /// Object class drained in this stage; none for Start and Finished
    pub fn object_class(self) -> Option<ObjectClass> {
        match self {
            Stage::Vnids => Some(ObjectClass::Vnid),
            Stage::Policies => Some(ObjectClass::Policy),
            Stage::Subnets => Some(ObjectClass::Subnet),
            Stage::Tunnels => Some(ObjectClass::Tunnel),
            Stage::Endpoints => Some(ObjectClass::Endpoint),
            Stage::Multicasts => Some(ObjectClass::Multicast),
            Stage::Start | Stage::Finished => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Start => "start",
            Stage::Vnids => "vnids",
            Stage::Policies => "policies",
            Stage::Subnets => "subnets",
            Stage::Tunnels => "tunnels",
            Stage::Endpoints => "endpoints",
            Stage::Multicasts => "multicasts",
            Stage::Finished => "finished",
        };
        f.write_str(s)
    }
}

/// Kinds of tenant objects carried by a mass transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectClass {
    Vnid,
    Policy,
    Subnet,
    Tunnel,
    Endpoint,
    Multicast,
}

impl ObjectClass {
    pub const ALL: [ObjectClass; 6] = [
        ObjectClass::Vnid,
        ObjectClass::Policy,
        ObjectClass::Subnet,
        ObjectClass::Tunnel,
        ObjectClass::Endpoint,
        ObjectClass::Multicast,
    ];

    pub fn stage(self) -> Stage {
        match self {
            ObjectClass::Vnid => Stage::Vnids,
            ObjectClass::Policy => Stage::Policies,
            ObjectClass::Subnet => Stage::Subnets,
            ObjectClass::Tunnel => Stage::Tunnels,
            ObjectClass::Endpoint => Stage::Endpoints,
            ObjectClass::Multicast => Stage::Multicasts,
        }
    }

    /// Classes that change while a domain is live
    pub fn is_live_update(self) -> bool {
        matches!(
            self,
            ObjectClass::Tunnel | ObjectClass::Endpoint | ObjectClass::Multicast
        )
    }

    /// Configured throughput for this class, objects per second
    pub fn rate(self, config: &MigrationConfig) -> u64 {
        match self {
            ObjectClass::Vnid => config.vnids_per_sec,
            ObjectClass::Policy => config.policies_per_sec,
            ObjectClass::Subnet => config.subnets_per_sec,
            ObjectClass::Tunnel => config.tunnels_per_sec,
            ObjectClass::Endpoint => config.endpoints_per_sec,
            ObjectClass::Multicast => config.multicasts_per_sec,
        }
    }
}

impl fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ObjectClass::Vnid => "vnid",
            ObjectClass::Policy => "policy",
            ObjectClass::Subnet => "subnet",
            ObjectClass::Tunnel => "tunnel",
            ObjectClass::Endpoint => "endpoint",
            ObjectClass::Multicast => "multicast",
        };
        f.write_str(s)
    }
}

/// One object as carried on the wire; the payload is opaque to the core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferObject {
    pub class: ObjectClass,
    pub key: String,
    pub payload: Bytes,
}

impl TransferObject {
    pub fn new(class: ObjectClass, key: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            class,
            key: key.into(),
            payload: payload.into(),
        }
    }
}

/// Everything a domain consists of at the moment a migration starts
#[derive(Debug, Clone, Default)]
pub struct DomainSnapshot {
    pub domain: DomainId,
    pub objects: Vec<TransferObject>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectCounts {
    pub vnids: u64,
    pub policies: u64,
    pub subnets: u64,
    pub tunnels: u64,
    pub endpoints: u64,
    pub multicasts: u64,
}

impl ObjectCounts {
    pub fn get(&self, class: ObjectClass) -> u64 {
        match class {
            ObjectClass::Vnid => self.vnids,
            ObjectClass::Policy => self.policies,
            ObjectClass::Subnet => self.subnets,
            ObjectClass::Tunnel => self.tunnels,
            ObjectClass::Endpoint => self.endpoints,
            ObjectClass::Multicast => self.multicasts,
        }
    }

    fn bump(&mut self, class: ObjectClass) {
        match class {
            ObjectClass::Vnid => self.vnids += 1,
            ObjectClass::Policy => self.policies += 1,
            ObjectClass::Subnet => self.subnets += 1,
            ObjectClass::Tunnel => self.tunnels += 1,
            ObjectClass::Endpoint => self.endpoints += 1,
            ObjectClass::Multicast => self.multicasts += 1,
        }
    }

    pub fn from_snapshot(snapshot: &DomainSnapshot) -> Self {
        let mut counts = Self::default();
        for object in &snapshot.objects {
            counts.bump(object.class);
        }
        counts
    }

    /// Rough counts from reported load statistics (leader side, where the
    /// object model of a remote domain is not available)
    pub fn from_stats(stats: &DomainLoadStats) -> Self {
        Self {
            vnids: 1,
            tunnels: stats.tunnels,
            endpoints: stats.endpoints,
            ..Default::default()
        }
    }
}

/// Heuristic cost of a migration: a base unit plus, per class, the seconds
/// needed to push that many objects at the configured rate.
pub fn estimate_weight(counts: &ObjectCounts, config: &MigrationConfig) -> u64 {
    ObjectClass::ALL
        .iter()
        .map(|class| counts.get(*class).div_ceil(class.rate(config).max(1)))
        .sum::<u64>()
        + config.domain_base_weight
}

/// Destination's verdict on one transferred object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Ok,
    /// Try again later
    Busy,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationKind {
    /// Copy; the source keeps hosting
    AddReplica,
    /// Copy, then the source gives the domain up
    Move,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// Correlation id of one object send: session id in the high half,
/// per-session sequence number in the low half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub u64);

impl CorrelationId {
    pub fn new(session: SessionId, seq: u32) -> Self {
        Self(((session.0 as u64) << 32) | seq as u64)
    }

    pub fn session(&self) -> SessionId {
        SessionId((self.0 >> 32) as u32)
    }

    pub fn seq(&self) -> u32 {
        self.0 as u32
    }
}

/// Reported once per session through the completion callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationOutcome {
    pub session: SessionId,
    pub domain: DomainId,
    pub source: NodeAddr,
    pub destination: NodeAddr,
    pub kind: MigrationKind,
    pub success: bool,
    pub weight: u64,
    pub replication_factor: u32,
    pub elapsed: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order() {
        let mut stage = Stage::Start;
        let mut seen = Vec::new();
        while stage != Stage::Finished {
            stage = stage.next();
            if let Some(class) = stage.object_class() {
                assert_eq!(class.stage(), stage);
                seen.push(class);
            }
        }
        assert_eq!(seen, ObjectClass::ALL);
        assert_eq!(Stage::Finished.next(), Stage::Finished);
        assert!(Stage::Tunnels < Stage::Endpoints);
    }

    #[test]
    fn test_correlation_id_halves() {
        let id = CorrelationId::new(SessionId(7), 42);
        assert_eq!(id.session(), SessionId(7));
        assert_eq!(id.seq(), 42);
        assert_ne!(id, CorrelationId::new(SessionId(8), 42));
    }

    #[test]
    fn test_estimate_weight() {
        let config = MigrationConfig::default();
        let counts = ObjectCounts {
            vnids: 1,
            endpoints: 1001,
            tunnels: 250,
            ..Default::default()
        };
        // base 10 + ceil(1/50) + ceil(1001/500) + ceil(250/250)
        assert_eq!(estimate_weight(&counts, &config), 10 + 1 + 3 + 1);
        assert_eq!(
            estimate_weight(&ObjectCounts::default(), &config),
            config.domain_base_weight
        );
    }

    #[test]
    fn test_live_update_classes() {
        assert!(ObjectClass::Endpoint.is_live_update());
        assert!(!ObjectClass::Policy.is_live_update());
    }
}
