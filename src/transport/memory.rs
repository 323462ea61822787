//! In-process transport
//!
//! Nodes register an inbox with a shared [`MemoryNetwork`]; dispatching
//! pushes the envelope into the destination's inbox. The network records
//! every send and can cut links to simulate partitions.

use super::{DispatchStatus, Envelope, PeerMessage, Transport};
use crate::cluster::node::NodeAddr;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

#[derive(Default)]
struct NetworkInner {
    inboxes: HashMap<NodeAddr, mpsc::UnboundedSender<Envelope>>,
    /// Directed links that drop everything
    cut: HashSet<(NodeAddr, NodeAddr)>,
    history: Vec<(NodeAddr, Envelope)>,
}

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a node; returns its inbox and a transport sending as it
    pub fn register(&self, addr: NodeAddr) -> (MemoryTransport, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().inboxes.insert(addr, tx);
        (self.transport(addr), rx)
    }

    /// A transport for `addr` without an inbox (send-only)
    pub fn transport(&self, addr: NodeAddr) -> MemoryTransport {
        MemoryTransport {
            local: addr,
            network: self.clone(),
        }
    }

    pub fn unregister(&self, addr: NodeAddr) {
        self.lock().inboxes.remove(&addr);
    }

    /// Cut both directions between two nodes
    pub fn partition(&self, a: NodeAddr, b: NodeAddr) {
        let mut inner = self.lock();
        inner.cut.insert((a, b));
        inner.cut.insert((b, a));
    }

    pub fn heal(&self, a: NodeAddr, b: NodeAddr) {
        let mut inner = self.lock();
        inner.cut.remove(&(a, b));
        inner.cut.remove(&(b, a));
    }

    /// Every dispatched envelope with its destination, oldest first
    pub fn history(&self) -> Vec<(NodeAddr, Envelope)> {
        self.lock().history.clone()
    }

    /// Messages sent to `destination` matching a predicate
    pub fn sent_to(&self, destination: NodeAddr, pred: impl Fn(&PeerMessage) -> bool) -> usize {
        self.lock()
            .history
            .iter()
            .filter(|(dest, env)| *dest == destination && pred(&env.message))
            .count()
    }

    pub fn clear_history(&self) {
        self.lock().history.clear();
    }

    fn deliver(&self, destination: NodeAddr, envelope: Envelope) -> DispatchStatus {
        let mut inner = self.lock();
        inner.history.push((destination, envelope.clone()));
        if inner.cut.contains(&(envelope.from, destination)) {
            return DispatchStatus::Unreachable;
        }
        match inner.inboxes.get(&destination) {
            Some(tx) if tx.send(envelope).is_ok() => DispatchStatus::Queued,
            Some(_) => DispatchStatus::Closed,
            None => DispatchStatus::Unreachable,
        }
    }
}

#[derive(Clone)]
pub struct MemoryTransport {
    local: NodeAddr,
    network: MemoryNetwork,
}

impl MemoryTransport {
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

impl Transport for MemoryTransport {
    fn local(&self) -> NodeAddr {
        self.local
    }

    fn dispatch(&self, destination: NodeAddr, message: PeerMessage) -> DispatchStatus {
        self.network.deliver(
            destination,
            Envelope {
                from: self.local,
                message,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_delivery_and_partition() {
        let net = MemoryNetwork::new();
        let a: NodeAddr = "10.0.0.1".parse().unwrap();
        let b: NodeAddr = "10.0.0.2".parse().unwrap();
        let (ta, _rx_a) = net.register(a);
        let (_tb, mut rx_b) = net.register(b);

        assert_eq!(ta.send_heartbeat_request(b), DispatchStatus::Queued);
        let env = rx_b.recv().await.unwrap();
        assert_eq!(env.from, a);
        assert_eq!(env.message, PeerMessage::HeartbeatRequest);

        net.partition(a, b);
        assert_eq!(ta.send_heartbeat_request(b), DispatchStatus::Unreachable);
        net.heal(a, b);
        assert!(ta.send_heartbeat_request(b).is_queued());

        let unknown: NodeAddr = "10.0.0.9".parse().unwrap();
        assert_eq!(ta.send_heartbeat_request(unknown), DispatchStatus::Unreachable);
        assert_eq!(net.sent_to(b, |m| *m == PeerMessage::HeartbeatRequest), 3);
    }

    #[tokio::test]
    async fn test_closed_inbox() {
        let net = MemoryNetwork::new();
        let a: NodeAddr = "10.0.0.1".parse().unwrap();
        let b: NodeAddr = "10.0.0.2".parse().unwrap();
        let ta = net.transport(a);
        let (_, rx_b) = net.register(b);
        drop(rx_b);
        assert_eq!(ta.send_domain_deactivate(b, crate::DomainId(1)), DispatchStatus::Closed);
        assert_eq!(ta.send_migration_cancel(b, crate::DomainId(1)), DispatchStatus::Closed);
    }
}
