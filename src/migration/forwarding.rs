//! Live-update forwarding after a committed migration
//!
//! Once a migration commits, the source keeps forwarding updates for the
//! domain to the destination until the destination's own mapping broadcast
//! shows it advertising the domain.

use crate::cluster::node::{DomainId, NodeAddr};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

#[derive(Debug, Default)]
pub struct ForwardingRecord {
    targets: HashMap<DomainId, BTreeSet<NodeAddr>>,
}

impl ForwardingRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, domain: DomainId, destination: NodeAddr) {
        self.targets.entry(domain).or_default().insert(destination);
    }

    pub fn destinations(&self, domain: DomainId) -> Vec<NodeAddr> {
        self.targets
            .get(&domain)
            .map(|d| d.iter().copied().collect())
            .unwrap_or_default()
    }

    /// `from` advertised these domains; stop forwarding them to it.
    /// Returns the domains forwarding stopped for.
    pub fn observe_mapping(&mut self, from: NodeAddr, domains: &[DomainId]) -> Vec<DomainId> {
        let mut stopped = Vec::new();
        for domain in domains {
            let Some(dests) = self.targets.get_mut(domain) else {
                continue;
            };
            if dests.remove(&from) {
                debug!("Stopped forwarding domain {} to {}", domain, from);
                stopped.push(*domain);
            }
            if dests.is_empty() {
                self.targets.remove(domain);
            }
        }
        stopped
    }

    pub fn remove_domain(&mut self, domain: DomainId) {
        self.targets.remove(&domain);
    }

    /// Drop every record pointing at a node that left the cluster
    pub fn remove_destination(&mut self, destination: NodeAddr) {
        self.targets.retain(|_, dests| {
            dests.remove(&destination);
            !dests.is_empty()
        });
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.targets.values().map(BTreeSet::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forwarding_stops_on_observed_mapping() {
        let b: NodeAddr = "10.0.0.2".parse().unwrap();
        let c: NodeAddr = "10.0.0.3".parse().unwrap();
        let mut fwd = ForwardingRecord::new();
        fwd.add(DomainId(1), b);
        fwd.add(DomainId(1), c);
        fwd.add(DomainId(2), b);
        assert_eq!(fwd.len(), 3);

        // b advertises domain 1 only
        assert_eq!(fwd.observe_mapping(b, &[DomainId(1)]), vec![DomainId(1)]);
        assert_eq!(fwd.destinations(DomainId(1)), vec![c]);
        assert_eq!(fwd.destinations(DomainId(2)), vec![b]);

        fwd.remove_destination(b);
        assert!(fwd.destinations(DomainId(2)).is_empty());
        fwd.remove_domain(DomainId(1));
        assert!(fwd.is_empty());
    }
}
