//! Directory node service
//!
//! Owns the [`ClusterState`] behind one async mutex and runs the periodic
//! work around it: the cluster tick, one drive task per migration session
//! and the loop that feeds migration outcomes back into the state. Sends are
//! always dispatched after the lock is released.

pub mod http;

use crate::cluster::load::RequestKind;
use crate::cluster::node::{DomainId, NodeAddr};
use crate::cluster::state::{ClusterState, Effects};
use crate::common::{Config, Result};
use crate::domain_store::DomainStore;
use crate::migration::{MigrationKind, MigrationOutcome, SessionId, TransferObject};
use crate::transport::{dispatch_all, Envelope, Transport};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

/// Cheap, clonable access to a running node
#[derive(Clone)]
pub struct NodeHandle {
    state: Arc<Mutex<ClusterState>>,
    transport: Arc<dyn Transport>,
    tick_interval: Duration,
    drive_interval: Duration,
    shutdown: Arc<watch::Sender<bool>>,
}

impl NodeHandle {
    pub fn local(&self) -> NodeAddr {
        self.transport.local()
    }

    /// Run `f` under the cluster lock
    pub async fn with_state<R>(&self, f: impl FnOnce(&mut ClusterState, Instant) -> R) -> R {
        let mut state = self.state.lock().await;
        f(&mut state, Instant::now())
    }

    /// Perform the work an event left behind; call without the lock held
    pub fn apply(&self, effects: Effects) {
        let Effects {
            outbound,
            acks,
            started,
        } = effects;
        dispatch_all(self.transport.as_ref(), outbound);
        for ack in acks {
            let out = ack.apply(Instant::now());
            dispatch_all(self.transport.as_ref(), out);
        }
        for id in started {
            self.spawn_drive(id);
        }
    }

    pub async fn tick(&self) {
        let effects = self.with_state(|state, now| state.tick(now)).await;
        self.apply(effects);
    }

    pub async fn handle_envelope(&self, envelope: Envelope) {
        let Envelope { from, message } = envelope;
        debug!("Received {} from {}", message.name(), from);
        let effects = self
            .with_state(|state, now| state.handle_message(from, message, now))
            .await;
        self.apply(effects);
    }

    pub async fn on_migration_finished(&self, outcome: MigrationOutcome) {
        let effects = self
            .with_state(|state, _| state.on_migration_finished(&outcome))
            .await;
        self.apply(effects);
    }

    pub async fn start_migration(
        &self,
        domain: DomainId,
        destination: NodeAddr,
        kind: MigrationKind,
    ) -> Result<SessionId> {
        let id = self
            .with_state(|state, now| state.start_migration(domain, destination, kind, now))
            .await?;
        self.spawn_drive(id);
        Ok(id)
    }

    /// Live update from the object model, see
    /// [`ClusterState::register_migration_delta`]
    pub async fn register_migration_delta(
        &self,
        domain: DomainId,
        object: TransferObject,
    ) -> Result<()> {
        let out = self
            .with_state(|state, _| state.register_migration_delta(domain, object))
            .await?;
        dispatch_all(self.transport.as_ref(), out);
        Ok(())
    }

    pub async fn record_request(&self, domain: DomainId, kind: RequestKind) {
        self.with_state(|state, now| state.record_request(domain, kind, now))
            .await;
    }

    /// Re-drive one session every drive interval until it is finished
    pub fn spawn_drive(&self, id: SessionId) -> JoinHandle<()> {
        let node = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(node.drive_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.changed() => break,
                }
                let out = node
                    .with_state(|state, now| state.drive_session(id, now))
                    .await;
                match out {
                    Some(out) => {
                        dispatch_all(node.transport.as_ref(), out);
                    }
                    None => break,
                }
            }
            debug!("Drive task for migration {} finished", id);
        })
    }

    /// Feed envelopes from an in-process inbox into the node
    pub fn spawn_inbox(&self, mut inbox: mpsc::UnboundedReceiver<Envelope>) -> JoinHandle<()> {
        let node = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    envelope = inbox.recv() => match envelope {
                        Some(envelope) => node.handle_envelope(envelope).await,
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    /// Stop every background task of this node
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    fn spawn_ticks(&self) -> JoinHandle<()> {
        let node = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(node.tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => node.tick().await,
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    fn spawn_outcomes(
        &self,
        mut outcomes: mpsc::UnboundedReceiver<MigrationOutcome>,
    ) -> JoinHandle<()> {
        let node = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    outcome = outcomes.recv() => match outcome {
                        Some(outcome) => node.on_migration_finished(outcome).await,
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}

/// A directory node before its background tasks are started
pub struct DirectoryNode {
    handle: NodeHandle,
    outcomes: mpsc::UnboundedReceiver<MigrationOutcome>,
    bind_addr: SocketAddr,
}

impl DirectoryNode {
    pub fn new(
        config: Config,
        store: Arc<dyn DomainStore>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let (tx, outcomes) = mpsc::unbounded_channel();
        let bind_addr = config.node.bind_addr;
        let tick_interval = config.cluster.tick_interval();
        let drive_interval = config.migration.drive_interval();
        let state = ClusterState::new(config, store, tx, Instant::now())?;
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            handle: NodeHandle {
                state: Arc::new(Mutex::new(state)),
                transport,
                tick_interval,
                drive_interval,
                shutdown: Arc::new(shutdown),
            },
            outcomes,
            bind_addr,
        })
    }

    pub fn handle(&self) -> NodeHandle {
        self.handle.clone()
    }

    /// Start the tick and outcome loops
    pub fn spawn(self) -> (NodeHandle, Vec<JoinHandle<()>>) {
        let tasks = vec![
            self.handle.spawn_ticks(),
            self.handle.spawn_outcomes(self.outcomes),
        ];
        (self.handle, tasks)
    }

    /// Run the node with its HTTP listener until ctrl-c
    pub async fn serve(self) -> Result<()> {
        let bind_addr = self.bind_addr;
        let (handle, tasks) = self.spawn();
        info!("Starting directory node {}", handle.local());
        info!("  HTTP: {}", bind_addr);

        let router = http::create_router(handle.clone());
        let listener = tokio::net::TcpListener::bind(bind_addr).await?;
        let server = axum::serve(listener, router);
        info!("Directory node ready");

        tokio::select! {
            res = server => {
                if let Err(e) = res {
                    error!("HTTP server error: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
            }
        }

        handle.shutdown();
        for task in tasks {
            if let Err(e) = task.await {
                error!("Background task failed: {}", e);
            }
        }
        Ok(())
    }
}
