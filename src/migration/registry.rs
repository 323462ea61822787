//! Live migration sessions and the global weight counter

use super::{CorrelationId, MigrationKind, SessionHandle, SessionId, Stage};
use crate::cluster::node::{DomainId, NodeAddr};
use crate::common::{Error, Result, METRICS};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

struct Entry {
    domain: DomainId,
    destination: NodeAddr,
    weight: u64,
    handle: SessionHandle,
}

/// What the admin surface shows about a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub domain: DomainId,
    pub source: NodeAddr,
    pub destination: NodeAddr,
    pub kind: MigrationKind,
    pub stage: Stage,
    pub weight: u64,
    pub valid: bool,
    pub pending: usize,
    pub unacked: usize,
}

/// Owned by the cluster state; every call happens under the cluster lock.
pub struct MigrationRegistry {
    sessions: HashMap<SessionId, Entry>,
    by_target: HashMap<(DomainId, NodeAddr), SessionId>,
    next_id: u32,
    active_weight: u64,
    weight_ceiling: u64,
}

impl MigrationRegistry {
    pub fn new(weight_ceiling: u64) -> Self {
        Self {
            sessions: HashMap::new(),
            by_target: HashMap::new(),
            next_id: 1,
            active_weight: 0,
            weight_ceiling,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn active_weight(&self) -> u64 {
        self.active_weight
    }

    pub fn weight_ceiling(&self) -> u64 {
        self.weight_ceiling
    }

    /// Next unused session id; never zero
    pub fn allocate_id(&mut self) -> SessionId {
        loop {
            let id = SessionId(self.next_id);
            self.next_id = self.next_id.wrapping_add(1).max(1);
            if !self.sessions.contains_key(&id) {
                return id;
            }
        }
    }

    /// Admission check. An idle registry always admits, so a single domain
    /// heavier than the ceiling can still migrate.
    pub fn admit(&self, weight: u64) -> Result<()> {
        if self.sessions.is_empty() || self.active_weight + weight <= self.weight_ceiling {
            Ok(())
        } else {
            Err(Error::AdmissionDenied {
                requested: weight,
                active: self.active_weight,
                ceiling: self.weight_ceiling,
            })
        }
    }

    pub fn has_session(&self, domain: DomainId, destination: NodeAddr) -> bool {
        self.by_target.contains_key(&(domain, destination))
    }

    /// Track a new session and charge its weight
    pub fn register(&mut self, handle: SessionHandle) -> Result<SessionId> {
        let (id, domain, destination, weight) = {
            let session = handle.lock();
            (
                session.id(),
                session.domain(),
                session.destination(),
                session.weight(),
            )
        };
        if self.has_session(domain, destination) {
            return Err(Error::SessionExists {
                domain: domain.0,
                destination: destination.to_string(),
            });
        }

        self.by_target.insert((domain, destination), id);
        self.sessions.insert(
            id,
            Entry {
                domain,
                destination,
                weight,
                handle,
            },
        );
        self.active_weight += weight;
        self.publish_gauges();
        Ok(id)
    }

    pub fn get(&self, id: SessionId) -> Option<SessionHandle> {
        self.sessions.get(&id).map(|e| e.handle.clone())
    }

    /// Owning session of an acknowledgement
    pub fn route(&self, correlation: CorrelationId) -> Option<SessionHandle> {
        self.get(correlation.session())
    }

    pub fn sessions_for_domain(&self, domain: DomainId) -> Vec<SessionHandle> {
        self.sessions
            .values()
            .filter(|e| e.domain == domain)
            .map(|e| e.handle.clone())
            .collect()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.sessions.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Forget a session and refund its weight. Only the first call for an
    /// id returns `Some`, so the refund happens exactly once.
    pub fn release(&mut self, id: SessionId) -> Option<u64> {
        let entry = self.sessions.remove(&id)?;
        self.by_target.remove(&(entry.domain, entry.destination));
        self.active_weight = self.active_weight.saturating_sub(entry.weight);
        self.publish_gauges();
        debug!(
            "Released migration {} (weight {}, active {})",
            id, entry.weight, self.active_weight
        );
        Some(entry.weight)
    }

    pub fn summaries(&self) -> Vec<SessionSummary> {
        let mut out: Vec<SessionSummary> = self
            .sessions
            .values()
            .map(|e| {
                let s = e.handle.lock();
                SessionSummary {
                    id: s.id(),
                    domain: s.domain(),
                    source: s.source(),
                    destination: s.destination(),
                    kind: s.kind(),
                    stage: s.stage(),
                    weight: e.weight,
                    valid: s.is_valid(),
                    pending: s.pending_count(),
                    unacked: s.unacked_count(),
                }
            })
            .collect();
        out.sort_by_key(|s| s.id);
        out
    }

    fn publish_gauges(&self) {
        METRICS.active_migrations.set(self.sessions.len() as u64);
        METRICS.active_weight.set(self.active_weight);
    }
}
