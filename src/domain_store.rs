//! Tenant object model seam
//!
//! The directory core never interprets tenant objects. It asks the store
//! for a snapshot when a migration starts, hands received objects to it on
//! the destination, and tells it when a migration commits or is cancelled.

use crate::cluster::node::{DomainId, NodeAddr};
use crate::migration::{AckStatus, DomainSnapshot, ObjectClass, ObjectCounts, TransferObject};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Object model backend for hosted domains
pub trait DomainStore: Send + Sync {
    /// Locally served domains
    fn domains(&self) -> Vec<DomainId>;

    /// Create an empty, locally served domain
    fn create_domain(&self, domain: DomainId, replication_factor: u32);

    /// Replication factor recorded when the domain was created or activated
    fn replication_factor(&self, domain: DomainId) -> Option<u32>;

    fn is_domain_valid(&self, domain: DomainId) -> bool;

    fn snapshot(&self, domain: DomainId) -> Option<DomainSnapshot>;

    fn counts(&self, domain: DomainId) -> ObjectCounts;

    /// Destination side: hold a received object until activation
    fn apply_transfer_object(&self, domain: DomainId, object: TransferObject) -> AckStatus;

    /// Destination side: apply a forwarded live update
    fn apply_delta(&self, domain: DomainId, object: TransferObject) -> bool;

    /// Destination side: received state becomes authoritative
    fn activate_domain(&self, domain: DomainId, replication_factor: u32);

    /// Drop all local state of the domain, partial or active
    fn discard_domain(&self, domain: DomainId);

    /// Drop objects received for a cancelled migration; active state stays
    fn discard_pending(&self, domain: DomainId);

    fn migration_complete(&self, domain: DomainId, destination: NodeAddr);

    fn migration_cancelled(&self, domain: DomainId, destination: NodeAddr);
}

/// Notifications the in-memory store records, newest last
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Activated { domain: DomainId, replication_factor: u32 },
    Discarded { domain: DomainId },
    PendingDiscarded { domain: DomainId },
    MigrationComplete { domain: DomainId, destination: NodeAddr },
    MigrationCancelled { domain: DomainId, destination: NodeAddr },
}

type Objects = BTreeMap<(ObjectClass, String), TransferObject>;

#[derive(Default)]
struct Inner {
    active: HashMap<DomainId, Objects>,
    pending: HashMap<DomainId, Objects>,
    replication: HashMap<DomainId, u32>,
    events: Vec<StoreEvent>,
    busy: bool,
}

/// In-memory object model (default)
#[derive(Default)]
pub struct MemoryDomainStore {
    inner: Mutex<Inner>,
}

impl MemoryDomainStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add or replace an object of an active domain, creating the domain
    pub fn insert_object(&self, domain: DomainId, object: TransferObject) {
        let mut inner = self.lock();
        inner.replication.entry(domain).or_insert(1);
        inner
            .active
            .entry(domain)
            .or_default()
            .insert((object.class, object.key.clone()), object);
    }

    pub fn object(&self, domain: DomainId, class: ObjectClass, key: &str) -> Option<TransferObject> {
        self.lock()
            .active
            .get(&domain)
            .and_then(|objects| objects.get(&(class, key.to_string())).cloned())
    }

    pub fn object_count(&self, domain: DomainId) -> usize {
        self.lock().active.get(&domain).map_or(0, BTreeMap::len)
    }

    pub fn pending_count(&self, domain: DomainId) -> usize {
        self.lock().pending.get(&domain).map_or(0, BTreeMap::len)
    }

    /// Answer every received object with `Busy` while set
    pub fn set_busy(&self, busy: bool) {
        self.lock().busy = busy;
    }

    pub fn events(&self) -> Vec<StoreEvent> {
        self.lock().events.clone()
    }
}

impl DomainStore for MemoryDomainStore {
    fn domains(&self) -> Vec<DomainId> {
        let mut domains: Vec<_> = self.lock().active.keys().copied().collect();
        domains.sort();
        domains
    }

    fn create_domain(&self, domain: DomainId, replication_factor: u32) {
        let mut inner = self.lock();
        inner.active.entry(domain).or_default();
        inner.replication.insert(domain, replication_factor);
    }

    fn replication_factor(&self, domain: DomainId) -> Option<u32> {
        let inner = self.lock();
        if !inner.active.contains_key(&domain) {
            return None;
        }
        inner.replication.get(&domain).copied()
    }

    fn is_domain_valid(&self, domain: DomainId) -> bool {
        self.lock().active.contains_key(&domain)
    }

    fn snapshot(&self, domain: DomainId) -> Option<DomainSnapshot> {
        let inner = self.lock();
        let objects = inner.active.get(&domain)?;
        Some(DomainSnapshot {
            domain,
            objects: objects.values().cloned().collect(),
        })
    }

    fn counts(&self, domain: DomainId) -> ObjectCounts {
        self.snapshot(domain)
            .map(|s| ObjectCounts::from_snapshot(&s))
            .unwrap_or_default()
    }

    fn apply_transfer_object(&self, domain: DomainId, object: TransferObject) -> AckStatus {
        let mut inner = self.lock();
        if inner.busy {
            return AckStatus::Busy;
        }
        inner
            .pending
            .entry(domain)
            .or_default()
            .insert((object.class, object.key.clone()), object);
        AckStatus::Ok
    }

    fn apply_delta(&self, domain: DomainId, object: TransferObject) -> bool {
        let mut inner = self.lock();
        let key = (object.class, object.key.clone());
        if let Some(objects) = inner.active.get_mut(&domain) {
            objects.insert(key, object);
            return true;
        }
        if let Some(objects) = inner.pending.get_mut(&domain) {
            objects.insert(key, object);
            return true;
        }
        false
    }

    fn activate_domain(&self, domain: DomainId, replication_factor: u32) {
        let mut inner = self.lock();
        let received = inner.pending.remove(&domain).unwrap_or_default();
        let objects = inner.active.entry(domain).or_default();
        let count = received.len();
        objects.extend(received);
        inner.replication.insert(domain, replication_factor);
        debug!("Activated domain {} with {} received objects", domain, count);
        inner.events.push(StoreEvent::Activated {
            domain,
            replication_factor,
        });
    }

    fn discard_domain(&self, domain: DomainId) {
        let mut inner = self.lock();
        inner.pending.remove(&domain);
        inner.active.remove(&domain);
        inner.replication.remove(&domain);
        inner.events.push(StoreEvent::Discarded { domain });
    }

    fn discard_pending(&self, domain: DomainId) {
        let mut inner = self.lock();
        if let Some(objects) = inner.pending.remove(&domain) {
            debug!("Dropped {} received objects of domain {}", objects.len(), domain);
        }
        inner.events.push(StoreEvent::PendingDiscarded { domain });
    }

    fn migration_complete(&self, domain: DomainId, destination: NodeAddr) {
        self.lock()
            .events
            .push(StoreEvent::MigrationComplete { domain, destination });
    }

    fn migration_cancelled(&self, domain: DomainId, destination: NodeAddr) {
        self.lock()
            .events
            .push(StoreEvent::MigrationCancelled { domain, destination });
    }
}
