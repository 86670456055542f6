//! Coordinator wiring
//!
//! Owns one instance of every component for one origin and hands out
//! [`ContextSession`]s to execution contexts. The host layer reaches the
//! registry through [`Coordinator::registry`].

use crate::arbiter::ClaimArbiter;
use crate::backend::DeviceBackend;
use crate::broadcaster::EventBroadcaster;
use crate::config::{CoordinatorConfig, SharedWorkerPorts};
use crate::registry::DeviceRegistry;
use crate::scheduler::TransferScheduler;
use crate::session::{ContextSession, SessionDirectory};
use protocol::{FlowId, SessionId, SessionKind, SessionRef};
use std::sync::Arc;
use tracing::{debug, info};

/// Cross-context device-session coordinator for one origin
pub struct Coordinator {
    shared_worker_ports: SharedWorkerPorts,
    broadcaster: Arc<EventBroadcaster>,
    registry: Arc<DeviceRegistry>,
    sessions: Arc<SessionDirectory>,
    scheduler: Arc<TransferScheduler>,
    arbiter: ClaimArbiter,
}

impl Coordinator {
    /// Build a coordinator from configuration
    pub fn new(config: &CoordinatorConfig, backend: Arc<dyn DeviceBackend>) -> Arc<Self> {
        let broadcaster = Arc::new(EventBroadcaster::new(config.events.buffer_capacity));
        let registry = Arc::new(DeviceRegistry::new(
            config.coordinator.origin.clone(),
            config.devices.filters.clone(),
            broadcaster.clone(),
        ));
        let sessions = Arc::new(SessionDirectory::new());
        let scheduler = Arc::new(TransferScheduler::new(
            registry.clone(),
            sessions.clone(),
            backend,
            config.scheduler.max_pending_transfers,
        ));
        let arbiter = ClaimArbiter::new(
            registry.clone(),
            broadcaster.clone(),
            scheduler.clone(),
            sessions.clone(),
        );

        info!(
            "Coordinator for {} ready (shared worker ports: {:?})",
            config.coordinator.origin, config.sessions.shared_worker_ports
        );

        Arc::new(Self {
            shared_worker_ports: config.sessions.shared_worker_ports,
            broadcaster,
            registry,
            sessions,
            scheduler,
            arbiter,
        })
    }

    /// Start a session for a new execution context
    pub fn create_session(self: &Arc<Self>, kind: SessionKind) -> ContextSession {
        let session = self.sessions.register(kind);
        info!("Session {} ({}) created", session.id.0, kind);
        ContextSession::new(session, FlowId::MAIN, self.clone())
    }

    /// Start a session for a port connecting to shared worker `worker`
    ///
    /// With coalesced ports, every port of the same worker shares one
    /// session and submits on its own flow.
    pub fn connect_shared_worker_port(self: &Arc<Self>, worker: &str) -> ContextSession {
        match self.shared_worker_ports {
            SharedWorkerPorts::Independent => self.create_session(SessionKind::SharedWorkerPort),
            SharedWorkerPorts::Coalesced => {
                let (session, flow) = self.sessions.join_shared_worker(worker);
                info!(
                    "Port of shared worker '{}' joined session {} on flow {}",
                    worker, session.id.0, flow.0
                );
                ContextSession::new(session, flow, self.clone())
            }
        }
    }

    /// Forcibly terminate a session (the context crashed or was killed)
    ///
    /// Every context still attached to it sees `UnknownSession` from then on.
    pub fn terminate_session(&self, id: SessionId) -> bool {
        if !self.sessions.remove(id) {
            return false;
        }
        info!("Session {} terminated", id.0);
        self.release(id);
        true
    }

    /// A context detached; the session ends with its last context
    pub(crate) fn leave(&self, session: SessionRef) {
        if self.sessions.leave(session.id) {
            info!("Session {} ({}) ended", session.id.0, session.kind);
            self.release(session.id);
        } else {
            debug!(
                "Session {} still has {} contexts attached",
                session.id.0,
                self.sessions.ports(session.id)
            );
        }
    }

    fn release(&self, id: SessionId) {
        self.arbiter.release_session(id);
        self.broadcaster.unsubscribe(id);
    }

    /// Sessions that have not terminated
    pub fn live_sessions(&self) -> Vec<SessionRef> {
        self.sessions.live()
    }

    /// Registry, for the host layer's connect and disconnect reports
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn arbiter(&self) -> &ClaimArbiter {
        &self.arbiter
    }

    pub fn scheduler(&self) -> &TransferScheduler {
        &self.scheduler
    }

    pub fn broadcaster(&self) -> &EventBroadcaster {
        &self.broadcaster
    }

    pub(crate) fn sessions(&self) -> &SessionDirectory {
        &self.sessions
    }
}
