//! One domain migration, source side
//!
//! The session walks the stage order, keeping for the current stage a
//! pending set and an unacknowledged set bounded by the stage's in-flight
//! limit. It never sends anything itself: `drive` and `on_ack` return the
//! messages to dispatch once the caller has released its locks.

use super::{
    AckStatus, CorrelationId, DomainSnapshot, MigrationKind, MigrationOutcome, ObjectClass,
    SessionId, Stage, TransferObject,
};
use crate::cluster::node::{DomainId, NodeAddr};
use crate::common::{Error, MigrationConfig, Result, METRICS};
use crate::transport::{Outbound, PeerMessage};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Invoked exactly once when the session commits or is cancelled
pub type CompletionCallback = Box<dyn FnOnce(MigrationOutcome) + Send>;

/// Facts about the outside world consulted before each drive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriveChecks {
    pub destination_live: bool,
    pub domain_valid: bool,
}

#[derive(Debug, Clone)]
struct InFlight {
    object: TransferObject,
    sent_at: Instant,
}

#[derive(Debug, Default)]
struct StageQueue {
    pending: BTreeMap<String, TransferObject>,
    unacked: HashMap<CorrelationId, InFlight>,
    max_in_flight: usize,
}

impl StageQueue {
    fn is_drained(&self) -> bool {
        self.pending.is_empty() && self.unacked.is_empty()
    }
}

pub struct MigrationSession {
    id: SessionId,
    domain: DomainId,
    source: NodeAddr,
    destination: NodeAddr,
    kind: MigrationKind,
    replication_factor: u32,
    weight: u64,
    stage: Stage,
    queues: BTreeMap<ObjectClass, StageQueue>,
    /// Sends per object, keyed by class and object key
    retries: HashMap<(ObjectClass, String), u32>,
    next_seq: u32,
    valid: bool,
    completed: bool,
    success: Option<bool>,
    max_retries: u32,
    ack_timeout: Duration,
    started: Instant,
    on_complete: Option<CompletionCallback>,
}

impl std::fmt::Debug for MigrationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationSession")
            .field("id", &self.id)
            .field("domain", &self.domain)
            .field("destination", &self.destination)
            .field("stage", &self.stage)
            .field("valid", &self.valid)
            .field("completed", &self.completed)
            .finish()
    }
}

impl MigrationSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: SessionId,
        source: NodeAddr,
        destination: NodeAddr,
        kind: MigrationKind,
        replication_factor: u32,
        snapshot: DomainSnapshot,
        weight: u64,
        config: &MigrationConfig,
        now: Instant,
        on_complete: CompletionCallback,
    ) -> Self {
        let drive_secs = config.drive_interval().as_secs_f64();
        let mut queues: BTreeMap<ObjectClass, StageQueue> = ObjectClass::ALL
            .iter()
            .map(|class| {
                let max_in_flight = ((class.rate(config) as f64 * drive_secs) as usize).max(1);
                (
                    *class,
                    StageQueue {
                        max_in_flight,
                        ..Default::default()
                    },
                )
            })
            .collect();

        for object in snapshot.objects {
            if let Some(queue) = queues.get_mut(&object.class) {
                queue.pending.insert(object.key.clone(), object);
            }
        }

        Self {
            id,
            domain: snapshot.domain,
            source,
            destination,
            kind,
            replication_factor,
            weight,
            stage: Stage::Start,
            queues,
            retries: HashMap::new(),
            next_seq: 0,
            valid: true,
            completed: false,
            success: None,
            max_retries: config.max_retries_per_object,
            ack_timeout: config.ack_timeout(),
            started: now,
            on_complete: Some(on_complete),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn domain(&self) -> DomainId {
        self.domain
    }

    pub fn source(&self) -> NodeAddr {
        self.source
    }

    pub fn destination(&self) -> NodeAddr {
        self.destination
    }

    pub fn kind(&self) -> MigrationKind {
        self.kind
    }

    pub fn weight(&self) -> u64 {
        self.weight
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// `Some(true)` once committed, `Some(false)` once cancelled
    pub fn success(&self) -> Option<bool> {
        self.success
    }

    pub fn pending_count(&self) -> usize {
        self.queues.values().map(|q| q.pending.len()).sum()
    }

    pub fn unacked_count(&self) -> usize {
        self.queues.values().map(|q| q.unacked.len()).sum()
    }

    /// Correlation ids currently awaiting acknowledgement
    pub fn unacked(&self) -> Vec<CorrelationId> {
        self.queues
            .values()
            .flat_map(|q| q.unacked.keys().copied())
            .collect()
    }

    /// One scheduled drive: validate, re-send timed out objects, then move
    /// the stage cursor forward as far as the queues allow.
    pub fn drive(&mut self, now: Instant, checks: DriveChecks) -> Vec<Outbound> {
        if self.completed {
            return Vec::new();
        }
        if !checks.destination_live {
            warn!(
                "Migration {} of domain {}: destination {} no longer live",
                self.id, self.domain, self.destination
            );
            self.valid = false;
        } else if !checks.domain_valid {
            warn!(
                "Migration {} of domain {}: domain no longer valid",
                self.id, self.domain
            );
            self.valid = false;
        }
        if !self.valid {
            self.complete(false, now);
            return Vec::new();
        }

        let mut out = Vec::new();
        let timeout = self.ack_timeout;
        let expired: Vec<(ObjectClass, CorrelationId)> = self
            .queues
            .iter()
            .flat_map(|(class, q)| {
                q.unacked
                    .iter()
                    .filter(move |(_, f)| now.saturating_duration_since(f.sent_at) >= timeout)
                    .map(move |(id, _)| (*class, *id))
            })
            .collect();

        for (class, correlation) in expired {
            let Some(inflight) = self
                .queues
                .get_mut(&class)
                .and_then(|q| q.unacked.remove(&correlation))
            else {
                continue;
            };
            if !self.send(inflight.object, now, &mut out) {
                self.complete(false, now);
                return Vec::new();
            }
        }

        if !self.advance(now, &mut out) {
            self.complete(false, now);
            return Vec::new();
        }
        if self.stage == Stage::Finished {
            self.complete(true, now);
        }
        out
    }

    /// Acknowledgement for one object. Acks after completion are ignored.
    pub fn on_ack(
        &mut self,
        correlation: CorrelationId,
        status: AckStatus,
        now: Instant,
    ) -> Vec<Outbound> {
        if self.completed {
            debug!("Ack {:?} for completed migration {}", correlation, self.id);
            return Vec::new();
        }
        let Some((class, queue)) = self
            .queues
            .iter_mut()
            .find(|(_, q)| q.unacked.contains_key(&correlation))
        else {
            debug!("Stale ack {:?} for migration {}", correlation, self.id);
            return Vec::new();
        };
        let class = *class;

        match status {
            AckStatus::Ok => {
                if let Some(inflight) = queue.unacked.remove(&correlation) {
                    self.retries.remove(&(class, inflight.object.key));
                }
                METRICS.objects_acked.inc();
            }
            AckStatus::Busy | AckStatus::Rejected => {
                // left unacked, re-sent once its ack timeout passes
                debug!(
                    "Migration {}: {} object not accepted ({:?})",
                    self.id, class, status
                );
            }
        }

        let mut out = Vec::new();
        if !self.advance(now, &mut out) {
            self.complete(false, now);
            return Vec::new();
        }
        if self.stage == Stage::Finished {
            self.complete(true, now);
        }
        out
    }

    /// Admit a live update that arrived while the transfer runs. A class
    /// that already drained rewinds the cursor to its stage. Other classes
    /// are rejected until the session ends; the caller retries.
    pub fn register_delta(&mut self, object: TransferObject) -> Result<()> {
        if self.completed || !self.valid {
            return Err(Error::MigrationRejected {
                domain: self.domain.0,
                reason: format!("migration {} no longer accepting updates", self.id),
            });
        }
        if !object.class.is_live_update() {
            return Err(Error::MigrationRejected {
                domain: self.domain.0,
                reason: format!("{} changes wait for migration {} to end", object.class, self.id),
            });
        }
        let class_stage = object.class.stage();
        let Some(queue) = self.queues.get_mut(&object.class) else {
            return Err(Error::Internal(format!("no queue for {}", object.class)));
        };
        queue.pending.insert(object.key.clone(), object);

        if class_stage < self.stage {
            debug!(
                "Migration {}: delta rewinds cursor {} -> {}",
                self.id, self.stage, class_stage
            );
            self.stage = class_stage;
        }
        Ok(())
    }

    /// Cancel from outside (administrative or domain deleted)
    pub fn cancel(&mut self, now: Instant) {
        if self.completed {
            return;
        }
        info!("Migration {} of domain {} cancelled", self.id, self.domain);
        self.valid = false;
        self.complete(false, now);
    }

    /// Send one object; false if its send budget is exhausted, which
    /// invalidates the session.
    fn send(&mut self, object: TransferObject, now: Instant, out: &mut Vec<Outbound>) -> bool {
        let counter = self
            .retries
            .entry((object.class, object.key.clone()))
            .or_insert(0);
        if *counter >= self.max_retries {
            warn!(
                "Migration {} of domain {}: {} {} unacknowledged after {} sends",
                self.id, self.domain, object.class, object.key, counter
            );
            self.valid = false;
            return false;
        }
        *counter += 1;
        if *counter > 1 {
            METRICS.objects_retried.inc();
        }

        let correlation = CorrelationId::new(self.id, self.next_seq);
        self.next_seq = self.next_seq.wrapping_add(1);

        out.push(Outbound {
            destination: self.destination,
            message: PeerMessage::MassTransferObject {
                correlation,
                domain: self.domain,
                object: object.clone(),
            },
        });
        if let Some(queue) = self.queues.get_mut(&object.class) {
            queue.unacked.insert(
                correlation,
                InFlight {
                    object,
                    sent_at: now,
                },
            );
        }
        METRICS.objects_sent.inc();
        true
    }

    /// Fill the current stage up to its in-flight limit and move past
    /// every stage that has fully drained.
    fn advance(&mut self, now: Instant, out: &mut Vec<Outbound>) -> bool {
        loop {
            let Some(class) = self.stage.object_class() else {
                if self.stage == Stage::Start {
                    self.stage = self.stage.next();
                    continue;
                }
                return true;
            };

            loop {
                let next = match self.queues.get_mut(&class) {
                    Some(q) if q.unacked.len() < q.max_in_flight => q.pending.pop_first(),
                    _ => None,
                };
                let Some((_, object)) = next else {
                    break;
                };
                if !self.send(object, now, out) {
                    return false;
                }
            }

            if self.queues.get(&class).map_or(true, StageQueue::is_drained) {
                debug!("Migration {}: stage {} drained", self.id, self.stage);
                self.stage = self.stage.next();
            } else {
                return true;
            }
        }
    }

    fn complete(&mut self, success: bool, now: Instant) {
        if self.completed {
            return;
        }
        self.completed = true;
        self.success = Some(success);
        if !success {
            self.valid = false;
        }

        let outcome = MigrationOutcome {
            session: self.id,
            domain: self.domain,
            source: self.source,
            destination: self.destination,
            kind: self.kind,
            success,
            weight: self.weight,
            replication_factor: self.replication_factor,
            elapsed: now.saturating_duration_since(self.started),
        };
        if let Some(callback) = self.on_complete.take() {
            callback(outcome);
        }

        for queue in self.queues.values_mut() {
            queue.pending.clear();
            queue.unacked.clear();
        }
        self.retries.clear();
    }
}

/// Shared handle to a session; the session lock is only ever taken after
/// the cluster lock, never the other way round.
#[derive(Debug, Clone)]
pub struct SessionHandle(Arc<Mutex<MigrationSession>>);

impl SessionHandle {
    pub fn new(session: MigrationSession) -> Self {
        Self(Arc::new(Mutex::new(session)))
    }

    pub fn lock(&self) -> MutexGuard<'_, MigrationSession> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const LIVE: DriveChecks = DriveChecks {
        destination_live: true,
        domain_valid: true,
    };

    fn addr(s: &str) -> NodeAddr {
        s.parse().unwrap()
    }

    fn snapshot() -> DomainSnapshot {
        DomainSnapshot {
            domain: DomainId(1),
            objects: vec![
                TransferObject::new(ObjectClass::Vnid, "vnid-1", "v"),
                TransferObject::new(ObjectClass::Policy, "pol-1", "p"),
                TransferObject::new(ObjectClass::Tunnel, "tun-1", "t"),
                TransferObject::new(ObjectClass::Endpoint, "ep-1", "e"),
                TransferObject::new(ObjectClass::Endpoint, "ep-2", "e"),
            ],
        }
    }

    fn session(
        snapshot: DomainSnapshot,
        config: &MigrationConfig,
        now: Instant,
    ) -> (MigrationSession, Arc<Mutex<Vec<MigrationOutcome>>>) {
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let sink = outcomes.clone();
        let s = MigrationSession::new(
            SessionId(3),
            addr("10.0.0.1"),
            addr("10.0.0.2"),
            MigrationKind::AddReplica,
            2,
            snapshot,
            12,
            config,
            now,
            Box::new(move |o| sink.lock().unwrap().push(o)),
        );
        (s, outcomes)
    }

    fn correlations(out: &[Outbound]) -> Vec<CorrelationId> {
        out.iter()
            .filter_map(|o| match &o.message {
                PeerMessage::MassTransferObject { correlation, .. } => Some(*correlation),
                _ => None,
            })
            .collect()
    }

    fn ack_all(s: &mut MigrationSession, mut out: Vec<Outbound>, now: Instant) {
        while !out.is_empty() {
            let mut next = Vec::new();
            for id in correlations(&out) {
                next.extend(s.on_ack(id, AckStatus::Ok, now));
            }
            out = next;
        }
    }

    #[test]
    fn test_session_drains_all_stages() {
        let t0 = Instant::now();
        let config = MigrationConfig::default();
        let (mut s, outcomes) = session(snapshot(), &config, t0);

        let out = s.drive(t0, LIVE);
        // first non-empty stage is vnids
        assert_eq!(s.stage(), Stage::Vnids);
        assert_eq!(out.len(), 1);
        assert!(out.iter().all(|o| o.destination == addr("10.0.0.2")));

        ack_all(&mut s, out, t0);
        assert_eq!(s.stage(), Stage::Finished);
        assert!(s.is_completed());
        assert_eq!(s.success(), Some(true));
        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].success);
        assert_eq!(outcomes[0].weight, 12);
    }

    #[test]
    fn test_empty_domain_finishes_on_first_drive() {
        let t0 = Instant::now();
        let config = MigrationConfig::default();
        let empty = DomainSnapshot {
            domain: DomainId(1),
            objects: vec![],
        };
        let (mut s, outcomes) = session(empty, &config, t0);
        assert!(s.drive(t0, LIVE).is_empty());
        assert_eq!(s.success(), Some(true));
        assert_eq!(outcomes.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_in_flight_limit_bounds_sends() {
        let t0 = Instant::now();
        let config = MigrationConfig {
            vnids_per_sec: 1,
            drive_interval_ms: 1000,
            ..Default::default()
        };
        let snap = DomainSnapshot {
            domain: DomainId(1),
            objects: (0..3)
                .map(|i| TransferObject::new(ObjectClass::Vnid, format!("v{i}"), "x"))
                .collect(),
        };
        let (mut s, _) = session(snap, &config, t0);
        let out = s.drive(t0, LIVE);
        assert_eq!(out.len(), 1);
        assert_eq!(s.pending_count(), 2);

        let next = s.on_ack(correlations(&out)[0], AckStatus::Ok, t0);
        assert_eq!(next.len(), 1);
        assert_eq!(s.pending_count(), 1);
    }

    #[test]
    fn test_retry_cap_invalidates_once() {
        let t0 = Instant::now();
        let config = MigrationConfig::default();
        let snap = DomainSnapshot {
            domain: DomainId(1),
            objects: vec![TransferObject::new(ObjectClass::Vnid, "v", "x")],
        };
        let (mut s, outcomes) = session(snap, &config, t0);

        let first = s.drive(t0, LIVE);
        let stale = correlations(&first)[0];
        let step = config.ack_timeout();
        let mut now = t0;
        for _ in 1..config.max_retries_per_object {
            now += step;
            assert_eq!(s.drive(now, LIVE).len(), 1);
            assert!(s.is_valid());
        }
        now += step;
        assert!(s.drive(now, LIVE).is_empty());
        assert!(!s.is_valid());
        assert_eq!(s.success(), Some(false));

        // late ack and further drives change nothing
        assert!(s.on_ack(stale, AckStatus::Ok, now).is_empty());
        assert!(s.drive(now + step, LIVE).is_empty());
        assert_eq!(outcomes.lock().unwrap().len(), 1);
        assert_eq!(s.unacked_count(), 0);
    }

    #[test]
    fn test_resend_uses_fresh_correlation() {
        let t0 = Instant::now();
        let config = MigrationConfig::default();
        let snap = DomainSnapshot {
            domain: DomainId(1),
            objects: vec![TransferObject::new(ObjectClass::Vnid, "v", "x")],
        };
        let (mut s, _) = session(snap, &config, t0);
        let first = correlations(&s.drive(t0, LIVE))[0];
        // not timed out yet
        assert!(s.drive(t0 + Duration::from_millis(500), LIVE).is_empty());
        let second = correlations(&s.drive(t0 + config.ack_timeout(), LIVE))[0];
        assert_ne!(first, second);
        assert_eq!(second.session(), SessionId(3));

        // the superseded id no longer routes to an object
        assert!(s.on_ack(first, AckStatus::Ok, t0).is_empty());
        assert_eq!(s.unacked_count(), 1);
    }

    #[test]
    fn test_destination_down_cancels() {
        let t0 = Instant::now();
        let config = MigrationConfig::default();
        let (mut s, outcomes) = session(snapshot(), &config, t0);
        s.drive(t0, LIVE);
        let out = s.drive(
            t0,
            DriveChecks {
                destination_live: false,
                domain_valid: true,
            },
        );
        assert!(out.is_empty());
        assert_eq!(s.success(), Some(false));
        assert!(!outcomes.lock().unwrap()[0].success);
    }

    #[test]
    fn test_delta_rewinds_cursor() {
        let t0 = Instant::now();
        let config = MigrationConfig::default();
        let (mut s, _) = session(snapshot(), &config, t0);

        let out = s.drive(t0, LIVE);
        let mut out = s.on_ack(correlations(&out)[0], AckStatus::Ok, t0);
        // ack stages until endpoints are in flight
        while s.stage() < Stage::Endpoints {
            let ids = correlations(&out);
            out = ids
                .into_iter()
                .flat_map(|id| s.on_ack(id, AckStatus::Ok, t0))
                .collect();
        }
        assert_eq!(s.stage(), Stage::Endpoints);

        s.register_delta(TransferObject::new(ObjectClass::Tunnel, "tun-2", "t"))
            .unwrap();
        assert_eq!(s.stage(), Stage::Tunnels);

        // the rewound tunnel is sent on the next drive
        let resent = s.drive(t0, LIVE);
        assert_eq!(correlations(&resent).len(), 1);
        assert_eq!(s.stage(), Stage::Tunnels);
    }

    #[test]
    fn test_delta_rejected_after_completion() {
        let t0 = Instant::now();
        let config = MigrationConfig::default();
        let (mut s, _) = session(snapshot(), &config, t0);
        s.cancel(t0);
        let err = s
            .register_delta(TransferObject::new(ObjectClass::Endpoint, "ep-9", "e"))
            .unwrap_err();
        assert!(matches!(err, Error::MigrationRejected { domain: 1, .. }));
    }

    #[test]
    fn test_delta_of_static_class_rejected_mid_transfer() {
        let t0 = Instant::now();
        let config = MigrationConfig::default();
        let (mut s, _) = session(snapshot(), &config, t0);
        s.drive(t0, LIVE);

        let err = s
            .register_delta(TransferObject::new(ObjectClass::Policy, "pol-2", "p"))
            .unwrap_err();
        assert!(matches!(err, Error::MigrationRejected { domain: 1, .. }));
        assert_eq!(s.stage(), Stage::Vnids);

        s.register_delta(TransferObject::new(ObjectClass::Multicast, "mc-1", "m"))
            .unwrap();
        assert!(!s.is_completed());
    }

    #[test]
    fn test_callback_fires_once_under_repeated_completion() {
        let t0 = Instant::now();
        let config = MigrationConfig::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut s = MigrationSession::new(
            SessionId(1),
            addr("10.0.0.1"),
            addr("10.0.0.2"),
            MigrationKind::Move,
            1,
            snapshot(),
            5,
            &config,
            t0,
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        s.cancel(t0);
        s.cancel(t0);
        s.drive(t0, LIVE);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handle_survives_poison() {
        let t0 = Instant::now();
        let config = MigrationConfig::default();
        let (s, _) = session(snapshot(), &config, t0);
        let handle = SessionHandle::new(s);
        let poisoner = handle.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock();
            panic!("poison");
        })
        .join();
        assert_eq!(handle.lock().id(), SessionId(3));
    }
}
