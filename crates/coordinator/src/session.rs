//! Execution-context sessions
//!
//! [`SessionDirectory`] is the table of live sessions. A session is dead as
//! soon as it leaves the directory; the arbiter and scheduler check liveness
//! under the device record lock, so nothing can be claimed or queued for a
//! session whose termination has started.
//!
//! [`ContextSession`] is what a page or worker holds: its view of the
//! registry, its handles and claims, event subscription and transfer
//! submission, all checked against the capability table for its kind.

use crate::broadcaster::EventStream;
use crate::capability::{self, Operation};
use crate::coordinator::Coordinator;
use crate::scheduler::{CancelOutcome, TransferFuture};
use protocol::{
    CoordinatorError, DeviceHandle, DeviceId, DeviceIdentity, DeviceInfo, FlowId, InterfaceKey,
    Result, SessionId, SessionKind, SessionRef, TransferRequest,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

#[derive(Debug)]
struct SessionEntry {
    kind: SessionKind,
    /// Ports attached to a coalesced shared worker session
    ports: usize,
    next_flow: u32,
    shared_worker: Option<String>,
}

#[derive(Debug)]
struct DirectoryState {
    live: HashMap<SessionId, SessionEntry>,
    shared_workers: HashMap<String, SessionId>,
    next_session: u64,
}

/// Table of live sessions
#[derive(Debug)]
pub(crate) struct SessionDirectory {
    state: RwLock<DirectoryState>,
}

impl SessionDirectory {
    pub(crate) fn new() -> Self {
        Self {
            state: RwLock::new(DirectoryState {
                live: HashMap::new(),
                shared_workers: HashMap::new(),
                next_session: 1,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, DirectoryState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, DirectoryState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new single-context session
    pub(crate) fn register(&self, kind: SessionKind) -> SessionRef {
        let mut state = self.write();
        let id = SessionId(state.next_session);
        state.next_session += 1;
        state.live.insert(
            id,
            SessionEntry {
                kind,
                ports: 1,
                next_flow: 1,
                shared_worker: None,
            },
        );
        SessionRef { id, kind }
    }

    /// Attach a port to the coalesced session of shared worker `name`
    ///
    /// The first port creates the session. Every port gets its own flow.
    pub(crate) fn join_shared_worker(&self, name: &str) -> (SessionRef, FlowId) {
        let mut state = self.write();
        let kind = SessionKind::SharedWorkerPort;

        if let Some(id) = state.shared_workers.get(name).copied()
            && let Some(entry) = state.live.get_mut(&id)
        {
            let flow = FlowId(entry.next_flow);
            entry.next_flow += 1;
            entry.ports += 1;
            return (SessionRef { id, kind }, flow);
        }

        let id = SessionId(state.next_session);
        state.next_session += 1;
        state.live.insert(
            id,
            SessionEntry {
                kind,
                ports: 1,
                next_flow: 1,
                shared_worker: Some(name.to_string()),
            },
        );
        state.shared_workers.insert(name.to_string(), id);
        (SessionRef { id, kind }, FlowId::MAIN)
    }

    /// Detach one context from its session
    ///
    /// Returns `true` if that was the last context and the session is now
    /// dead.
    pub(crate) fn leave(&self, id: SessionId) -> bool {
        let mut state = self.write();
        let Some(entry) = state.live.get_mut(&id) else {
            return false;
        };
        entry.ports = entry.ports.saturating_sub(1);
        if entry.ports > 0 {
            return false;
        }
        Self::remove_locked(&mut state, id);
        true
    }

    /// Mark a session dead regardless of attached contexts
    pub(crate) fn remove(&self, id: SessionId) -> bool {
        Self::remove_locked(&mut self.write(), id)
    }

    fn remove_locked(state: &mut DirectoryState, id: SessionId) -> bool {
        let Some(entry) = state.live.remove(&id) else {
            return false;
        };
        if let Some(name) = entry.shared_worker {
            state.shared_workers.remove(&name);
        }
        true
    }

    pub(crate) fn ensure_live(&self, id: SessionId) -> Result<()> {
        if self.read().live.contains_key(&id) {
            Ok(())
        } else {
            Err(CoordinatorError::UnknownSession(id.0))
        }
    }

    pub(crate) fn is_live(&self, id: SessionId) -> bool {
        self.read().live.contains_key(&id)
    }

    /// Number of contexts attached to a session
    pub(crate) fn ports(&self, id: SessionId) -> usize {
        self.read().live.get(&id).map_or(0, |entry| entry.ports)
    }

    pub(crate) fn live(&self) -> Vec<SessionRef> {
        let mut live: Vec<SessionRef> = self
            .read()
            .live
            .iter()
            .map(|(id, entry)| SessionRef {
                id: *id,
                kind: entry.kind,
            })
            .collect();
        live.sort_by_key(|session| session.id);
        live
    }
}

/// One execution context's view of the coordinator
///
/// Terminates on drop, releasing every claim and handle the session holds.
/// For a coalesced shared worker that happens when its last port goes.
pub struct ContextSession {
    session: SessionRef,
    flow: FlowId,
    coordinator: Arc<Coordinator>,
    terminated: AtomicBool,
}

impl ContextSession {
    pub(crate) fn new(session: SessionRef, flow: FlowId, coordinator: Arc<Coordinator>) -> Self {
        debug!(
            "Session {} ({}) attached with flow {}",
            session.id.0, session.kind, flow.0
        );
        Self {
            session,
            flow,
            coordinator,
            terminated: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> SessionId {
        self.session.id
    }

    pub fn kind(&self) -> SessionKind {
        self.session.kind
    }

    /// Flow this context submits transfers on
    pub fn flow(&self) -> FlowId {
        self.flow
    }

    pub fn session_ref(&self) -> SessionRef {
        self.session
    }

    /// Whether the session has not terminated
    pub fn is_live(&self) -> bool {
        self.coordinator.sessions().is_live(self.session.id)
    }

    fn allow(&self, operation: Operation) -> Result<()> {
        capability::check(self.session, operation)?;
        self.coordinator.sessions().ensure_live(self.session.id)
    }

    /// Authorized devices that are currently connected
    pub fn devices(&self) -> Result<Vec<DeviceInfo>> {
        self.allow(Operation::ListDevices)?;
        Ok(self.coordinator.registry().list_authorized_devices())
    }

    /// Grant the origin access to a device identity (privileged)
    pub fn grant_access(&self, identity: DeviceIdentity) -> Result<Vec<DeviceInfo>> {
        self.allow(Operation::GrantAccess)?;
        Ok(self.coordinator.registry().grant_access(identity))
    }

    /// Withdraw a grant (privileged)
    pub fn revoke_access(&self, identity: &DeviceIdentity) -> Result<bool> {
        self.allow(Operation::RevokeAccess)?;
        Ok(self.coordinator.registry().revoke_access(identity))
    }

    pub fn open(&self, device: DeviceId) -> Result<DeviceHandle> {
        self.allow(Operation::Open)?;
        self.coordinator.arbiter().open(self.session, device)
    }

    pub fn select_configuration(&self, handle: DeviceHandle, index: u8) -> Result<()> {
        self.allow(Operation::SelectConfiguration)?;
        self.coordinator
            .arbiter()
            .select_configuration(self.session, handle, index)
    }

    pub fn claim_interface(&self, handle: DeviceHandle, interface: u8) -> Result<()> {
        self.allow(Operation::ClaimInterface)?;
        self.coordinator
            .arbiter()
            .claim_interface(self.session, handle, interface)
    }

    pub fn release_interface(&self, handle: DeviceHandle, interface: u8) -> Result<()> {
        self.allow(Operation::ReleaseInterface)?;
        self.coordinator
            .arbiter()
            .release_interface(self.session, handle, interface)
    }

    pub fn close(&self, handle: DeviceHandle) -> Result<()> {
        self.allow(Operation::Close)?;
        self.coordinator.arbiter().close(self.session, handle)
    }

    /// Submit a transfer on this context's flow
    pub fn transfer(&self, handle: DeviceHandle, request: TransferRequest) -> Result<TransferFuture> {
        self.allow(Operation::Transfer)?;
        self.coordinator
            .scheduler()
            .submit(self.session.id, self.flow, handle, request)
    }

    /// Best-effort cancellation of a transfer
    pub fn cancel(&self, transfer: &TransferFuture) -> CancelOutcome {
        self.coordinator.scheduler().cancel(transfer)
    }

    /// Subscribe to state-change events from now on
    pub fn events(&self) -> Result<EventStream> {
        self.allow(Operation::Subscribe)?;
        let stream = self.coordinator.broadcaster().subscribe(self.session.id);

        // Lost a race with termination: do not leave a channel behind
        if !self.is_live() {
            self.coordinator.broadcaster().unsubscribe(self.session.id);
            return Err(CoordinatorError::UnknownSession(self.session.id.0));
        }
        Ok(stream)
    }

    /// Handles held by this session
    pub fn handles(&self) -> Vec<DeviceHandle> {
        self.coordinator.arbiter().handles_of(self.session.id)
    }

    /// Interfaces claimed by this session
    pub fn claimed_interfaces(&self) -> Vec<InterfaceKey> {
        self.coordinator.arbiter().claims_of(self.session.id)
    }

    /// Detach this context; idempotent
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            "Context of session {} ({}) terminating",
            self.session.id.0, self.session.kind
        );
        self.coordinator.leave(self.session);
    }
}

impl std::fmt::Debug for ContextSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextSession")
            .field("session", &self.session)
            .field("flow", &self.flow)
            .finish()
    }
}

impl Drop for ContextSession {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_leave() {
        let directory = SessionDirectory::new();
        let page = directory.register(SessionKind::Window);
        let worker = directory.register(SessionKind::DedicatedWorker);
        assert_ne!(page.id, worker.id);
        assert_eq!(directory.live().len(), 2);

        assert!(directory.leave(page.id));
        assert!(!directory.leave(page.id));
        assert_eq!(
            directory.ensure_live(page.id),
            Err(CoordinatorError::UnknownSession(page.id.0))
        );
        assert!(directory.ensure_live(worker.id).is_ok());
    }

    #[test]
    fn test_coalesced_ports_share_session() {
        let directory = SessionDirectory::new();
        let (first, flow_a) = directory.join_shared_worker("sync");
        let (second, flow_b) = directory.join_shared_worker("sync");
        let (other, _) = directory.join_shared_worker("other");

        assert_eq!(first.id, second.id);
        assert_ne!(first.id, other.id);
        assert_ne!(flow_a, flow_b);
        assert_eq!(directory.ports(first.id), 2);

        assert!(!directory.leave(first.id));
        assert!(directory.is_live(first.id));
        assert!(directory.leave(first.id));
        assert!(!directory.is_live(first.id));

        // A new port after the last one left starts a fresh session
        let (again, flow) = directory.join_shared_worker("sync");
        assert_ne!(again.id, first.id);
        assert_eq!(flow, FlowId::MAIN);
    }

    #[test]
    fn test_forced_remove() {
        let directory = SessionDirectory::new();
        let (port, _) = directory.join_shared_worker("sync");
        directory.join_shared_worker("sync");

        assert!(directory.remove(port.id));
        assert!(!directory.is_live(port.id));
        assert!(!directory.remove(port.id));
    }
}
