//! Node identity, liveness and per-node records

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use tokio::time::Instant;

/// Port assumed when a node address is given without one
pub const DEFAULT_NODE_PORT: u16 = 7400;

/// Cluster identity of a directory node.
///
/// Ordering is the address ordering used by leader election.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeAddr(SocketAddr);

impl NodeAddr {
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    /// Lenient parse for lookups: malformed input is "not found", not an error.
    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }
}

impl FromStr for NodeAddr {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Self(addr));
        }
        s.parse::<IpAddr>()
            .map(|ip| Self(SocketAddr::new(ip, DEFAULT_NODE_PORT)))
            .map_err(|_| crate::Error::InvalidAddress(s.to_string()))
    }
}

impl From<SocketAddr> for NodeAddr {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tenant virtual network, the unit of replication and migration
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct DomainId(pub u32);

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Node liveness as seen by the local membership table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Up,
    HintDown,
    Down,
    /// Administratively frozen; no timeout applies until reactivation
    Inactive,
}

impl Liveness {
    /// Counts as a live host for replication purposes
    pub fn is_live(&self) -> bool {
        matches!(self, Liveness::Up | Liveness::HintDown)
    }

    /// May win a leader election
    pub fn is_eligible(&self) -> bool {
        matches!(self, Liveness::Up | Liveness::HintDown)
    }
}

impl fmt::Display for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Liveness::Up => write!(f, "up"),
            Liveness::HintDown => write!(f, "hint-down"),
            Liveness::Down => write!(f, "down"),
            Liveness::Inactive => write!(f, "inactive"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionState {
    Same,
    PossiblyDifferent,
    RecoveringDifferent,
}

/// Load counters a node reports for one hosted domain
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainLoadStats {
    pub domain: DomainId,
    pub endpoints: u64,
    pub tunnels: u64,
    /// Requests per second averaged over the rate window
    pub update_rate: f64,
    pub lookup_rate: f64,
    pub policy_lookup_rate: f64,
}

impl DomainLoadStats {
    pub fn empty(domain: DomainId) -> Self {
        Self {
            domain,
            ..Default::default()
        }
    }
}

/// Everything the membership table knows about one node
#[derive(Debug, Clone)]
pub struct Node {
    pub addr: NodeAddr,
    pub liveness: Liveness,
    pub partition: PartitionState,
    /// Hosted domains with the replication factor this node asserted
    pub hosted: BTreeMap<DomainId, u32>,
    /// Hosted domains the node stopped advertising (pending removal)
    pub deactivated: BTreeSet<DomainId>,
    pub last_contact: Instant,
    pub hint_down_since: Option<Instant>,
    pub config_version: u64,
    /// Who this node last told us it believes is leader
    pub believed_leader: Option<NodeAddr>,
    pub stats: HashMap<DomainId, DomainLoadStats>,
}

impl Node {
    pub fn new(addr: NodeAddr, now: Instant) -> Self {
        Self {
            addr,
            liveness: Liveness::Up,
            partition: PartitionState::Same,
            hosted: BTreeMap::new(),
            deactivated: BTreeSet::new(),
            last_contact: now,
            hint_down_since: None,
            config_version: 0,
            believed_leader: None,
            stats: HashMap::new(),
        }
    }

    pub fn hosts(&self, domain: DomainId) -> bool {
        self.hosted.contains_key(&domain)
    }

    /// Hosts the domain and still serves it
    pub fn hosts_active(&self, domain: DomainId) -> bool {
        self.hosts(domain) && !self.deactivated.contains(&domain)
    }

    /// Actively served domains
    pub fn active_domains(&self) -> impl Iterator<Item = (DomainId, u32)> + '_ {
        self.hosted
            .iter()
            .filter(|(d, _)| !self.deactivated.contains(d))
            .map(|(d, rf)| (*d, *rf))
    }

    pub fn active_domain_count(&self) -> usize {
        self.active_domains().count()
    }

    pub fn stats_for(&self, domain: DomainId) -> DomainLoadStats {
        self.stats
            .get(&domain)
            .cloned()
            .unwrap_or_else(|| DomainLoadStats::empty(domain))
    }
}
