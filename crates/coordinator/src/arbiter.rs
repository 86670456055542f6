//! Exclusive open and interface ownership
//!
//! Opening a device is exclusive on its own: at most one handle per device
//! exists at a time. Interface claims are a second layer, held by the
//! handle's owner. Every operation here is a compare-and-set on the device
//! record under its lock; contention is reported immediately, nothing waits
//! for another session.

use crate::broadcaster::EventBroadcaster;
use crate::registry::{Claim, DeviceRegistry, OpenHandle, lock};
use crate::scheduler::{DispatchOp, TransferScheduler};
use crate::session::SessionDirectory;
use protocol::{
    ClaimState, CoordinatorError, DeviceHandle, DeviceId, InterfaceKey, Result, SessionEvent,
    SessionId, SessionRef,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info};

/// Grants handles and interface claims
pub struct ClaimArbiter {
    registry: Arc<DeviceRegistry>,
    broadcaster: Arc<EventBroadcaster>,
    scheduler: Arc<TransferScheduler>,
    sessions: Arc<SessionDirectory>,
    next_handle: AtomicU32,
}

impl ClaimArbiter {
    pub(crate) fn new(
        registry: Arc<DeviceRegistry>,
        broadcaster: Arc<EventBroadcaster>,
        scheduler: Arc<TransferScheduler>,
        sessions: Arc<SessionDirectory>,
    ) -> Self {
        Self {
            registry,
            broadcaster,
            scheduler,
            sessions,
            next_handle: AtomicU32::new(1),
        }
    }

    /// Open a device
    ///
    /// Fails with `AlreadyOpen` naming the holder's kind while any handle to
    /// the device exists, including one held by the caller.
    pub fn open(&self, session: SessionRef, device: DeviceId) -> Result<DeviceHandle> {
        let record = self
            .registry
            .record(device)
            .ok_or_else(|| CoordinatorError::unauthorized("device not granted to this origin"))?;
        let mut record = lock(&record);

        self.sessions.ensure_live(session.id)?;
        // Revocation disconnects, so a connected record is always granted
        if !record.is_connected() {
            return Err(CoordinatorError::DeviceDisconnected { device });
        }
        if let Some(open) = record.open_handle() {
            debug!(
                "Session {} denied open of {:?}: held by a {} session",
                session.id.0, device, open.owner_kind
            );
            return Err(CoordinatorError::AlreadyOpen {
                holder: open.owner_kind,
            });
        }

        let handle = DeviceHandle {
            id: self.next_handle.fetch_add(1, Ordering::Relaxed),
            device,
            generation: record.info().generation,
        };
        let queue = self.scheduler.start(handle, record.info().clone())?;
        record.set_open_handle(OpenHandle {
            handle,
            owner: session.id,
            owner_kind: session.kind,
            queue,
        });

        info!(
            "Session {} ({}) opened {:?} as handle {}",
            session.id.0, session.kind, device, handle.id
        );
        Ok(handle)
    }

    /// Claim an interface of the active configuration
    ///
    /// Idempotent for the owner. Ownership by any other session is reported
    /// as `InterfaceBusy` before the handle itself is looked at.
    pub fn claim_interface(
        &self,
        session: SessionRef,
        handle: DeviceHandle,
        interface: u8,
    ) -> Result<()> {
        let record = self
            .registry
            .record(handle.device)
            .ok_or(CoordinatorError::InvalidHandle(handle.id))?;
        let mut record = lock(&record);

        self.sessions.ensure_live(session.id)?;
        let key = record.interface_key(interface);
        if let Some(claim) = record.claim(&key)
            && claim.session != session.id
        {
            return Err(CoordinatorError::InterfaceBusy {
                interface: key,
                holder: claim.kind,
            });
        }

        let queue = record.validate_handle(session.id, handle)?.queue.clone();
        if !record
            .active_configuration()
            .is_some_and(|config| config.has_interface(interface))
        {
            return Err(CoordinatorError::UnknownInterface { interface: key });
        }
        if record.claim(&key).is_some() {
            return Ok(());
        }

        record.insert_claim(
            key,
            Claim {
                session: session.id,
                kind: session.kind,
            },
        );
        queue.push(DispatchOp::ClaimInterface(interface));
        self.broadcaster.publish(SessionEvent::InterfaceClaimChanged {
            interface: key,
            state: ClaimState::Claimed { kind: session.kind },
        });

        info!("Session {} claimed {}", session.id.0, key);
        Ok(())
    }

    /// Release an interface the session owns
    pub fn release_interface(
        &self,
        session: SessionRef,
        handle: DeviceHandle,
        interface: u8,
    ) -> Result<()> {
        let record = self
            .registry
            .record(handle.device)
            .ok_or(CoordinatorError::InvalidHandle(handle.id))?;
        let mut record = lock(&record);

        self.sessions.ensure_live(session.id)?;
        let queue = record.validate_handle(session.id, handle)?.queue.clone();
        let key = record.interface_key(interface);
        if record.owner_of(&key) != Some(session.id) {
            return Err(CoordinatorError::NotOwner { interface: key });
        }

        record.remove_claim(&key);
        queue.push(DispatchOp::ReleaseInterface(interface));
        self.broadcaster.publish(SessionEvent::InterfaceClaimChanged {
            interface: key,
            state: ClaimState::Unclaimed,
        });

        info!("Session {} released {}", session.id.0, key);
        Ok(())
    }

    /// Close a handle, releasing the session's claims on it
    ///
    /// Closing a handle that is already closed (or belongs to an earlier
    /// generation) is a no-op. Transfers still queued resolve `Cancelled`.
    pub fn close(&self, session: SessionRef, handle: DeviceHandle) -> Result<()> {
        let Some(record) = self.registry.record(handle.device) else {
            return Ok(());
        };
        let mut record = lock(&record);

        self.sessions.ensure_live(session.id)?;
        match record.open_handle() {
            Some(open) if open.handle == handle && open.owner != session.id => {
                return Err(CoordinatorError::InvalidHandle(handle.id));
            }
            Some(open) if open.handle == handle => {}
            _ => return Ok(()),
        }

        let released = record.release_claims_of(session.id, &self.broadcaster);
        // Dropping the handle flushes its queue and stops the dispatcher
        drop(record.take_open_handle());

        info!(
            "Session {} closed handle {} ({} interfaces released)",
            session.id.0, handle.id, released
        );
        Ok(())
    }

    /// Select the active configuration by index
    ///
    /// Refused while any interface of the device is claimed.
    pub fn select_configuration(
        &self,
        session: SessionRef,
        handle: DeviceHandle,
        index: u8,
    ) -> Result<()> {
        let record = self
            .registry
            .record(handle.device)
            .ok_or(CoordinatorError::InvalidHandle(handle.id))?;
        let mut record = lock(&record);

        self.sessions.ensure_live(session.id)?;
        let queue = record.validate_handle(session.id, handle)?.queue.clone();
        let Some(config) = record.info().configurations.get(index as usize) else {
            return Err(CoordinatorError::InvalidConfiguration {
                device: handle.device,
                index,
            });
        };
        let value = config.value;

        if let Some((key, claim)) = record.claims().next() {
            return Err(CoordinatorError::InterfaceBusy {
                interface: *key,
                holder: claim.kind,
            });
        }
        if record.active_config_index() == index {
            return Ok(());
        }

        record.set_active_configuration(index);
        queue.push(DispatchOp::SelectConfiguration(value));

        info!(
            "Session {} selected configuration {} (value {}) on {:?}",
            session.id.0, index, value, handle.device
        );
        Ok(())
    }

    /// Forced close of everything a session holds
    ///
    /// The session must already be marked dead in the directory, so no new
    /// claim or handle can appear for it while this runs.
    pub(crate) fn release_session(&self, session: SessionId) {
        for record in self.registry.records() {
            let mut record = lock(&record);
            let released = record.release_claims_of(session, &self.broadcaster);
            let owns_handle = record
                .open_handle()
                .is_some_and(|open| open.owner == session);

            if owns_handle {
                drop(record.take_open_handle());
            }
            if released > 0 || owns_handle {
                info!(
                    "Released {} interfaces{} of {:?} held by terminated session {}",
                    released,
                    if owns_handle { " and the handle" } else { "" },
                    record.info().id,
                    session.0
                );
            }
        }
    }

    /// Ownership state of an interface
    pub fn claim_state(&self, interface: InterfaceKey) -> ClaimState {
        self.registry
            .record(interface.device)
            .and_then(|record| lock(&record).claim(&interface))
            .map_or(ClaimState::Unclaimed, |claim| ClaimState::Claimed {
                kind: claim.kind,
            })
    }

    /// Interfaces currently claimed by `session`
    pub fn claims_of(&self, session: SessionId) -> Vec<InterfaceKey> {
        let mut claims: Vec<InterfaceKey> = self
            .registry
            .records()
            .iter()
            .flat_map(|record| {
                lock(record)
                    .claims()
                    .filter(|(_, claim)| claim.session == session)
                    .map(|(key, _)| *key)
                    .collect::<Vec<_>>()
            })
            .collect();
        claims.sort();
        claims
    }

    /// Handles currently held by `session`
    pub fn handles_of(&self, session: SessionId) -> Vec<DeviceHandle> {
        let mut handles: Vec<DeviceHandle> = self
            .registry
            .records()
            .iter()
            .filter_map(|record| {
                lock(record)
                    .open_handle()
                    .filter(|open| open.owner == session)
                    .map(|open| open.handle)
            })
            .collect();
        handles.sort_by_key(|handle| handle.id);
        handles
    }
}
