//! Device registry
//!
//! Per-origin catalog of host-attached devices and the source of truth for
//! their connection state. Each tracked device lives in its own
//! mutex-guarded [`DeviceRecord`] holding its open handle and interface
//! claims, so operations on different devices proceed in parallel while
//! everything touching one device (including host connect/disconnect) is
//! linearized on that record's lock.
//!
//! Lock order: registry tables, then a device record, then the session
//! directory.

use crate::broadcaster::EventBroadcaster;
use crate::scheduler::{HandleQueue, ShutdownReason};
use protocol::{
    ClaimState, ConfigurationDescriptor, ConnectionState, CoordinatorError, DeviceHandle,
    DeviceId, DeviceIdentity, DeviceInfo, HostDeviceReport, HostKey, InterfaceKey, SessionEvent,
    SessionId, SessionKind,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

/// Linux Foundation vendor ID used by root hubs
const ROOT_HUB_VENDOR_ID: u16 = 0x1d6b;
/// USB hub device class
const HUB_CLASS: u8 = 9;

/// Ownership of one interface
#[derive(Debug, Clone, Copy)]
pub(crate) struct Claim {
    pub(crate) session: SessionId,
    pub(crate) kind: SessionKind,
}

/// The single open channel to a device
pub(crate) struct OpenHandle {
    pub(crate) handle: DeviceHandle,
    pub(crate) owner: SessionId,
    pub(crate) owner_kind: SessionKind,
    pub(crate) queue: Arc<HandleQueue>,
}

impl Drop for OpenHandle {
    fn drop(&mut self) {
        // Stops the dispatcher once its queue drains
        self.queue.shutdown(ShutdownReason::Closed);
    }
}

/// Mutable state of one device
pub(crate) struct DeviceRecord {
    info: DeviceInfo,
    host_key: Option<HostKey>,
    /// Index into `info.configurations`
    active_config: u8,
    handle: Option<OpenHandle>,
    claims: BTreeMap<InterfaceKey, Claim>,
}

impl DeviceRecord {
    fn new(id: DeviceId, report: &HostDeviceReport) -> Self {
        Self {
            info: DeviceInfo {
                id,
                identity: report.identity.clone(),
                state: ConnectionState::Disconnected,
                generation: 0,
                manufacturer: None,
                product: None,
                configurations: Vec::new(),
            },
            host_key: None,
            active_config: 0,
            handle: None,
            claims: BTreeMap::new(),
        }
    }

    pub(crate) fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.info.is_connected()
    }

    pub(crate) fn active_config_index(&self) -> u8 {
        self.active_config
    }

    /// Currently selected configuration
    pub(crate) fn active_configuration(&self) -> Option<&ConfigurationDescriptor> {
        self.info.configurations.get(self.active_config as usize)
    }

    pub(crate) fn set_active_configuration(&mut self, index: u8) {
        self.active_config = index;
    }

    /// Key for `interface` under the active configuration
    pub(crate) fn interface_key(&self, interface: u8) -> InterfaceKey {
        InterfaceKey {
            device: self.info.id,
            configuration: self.active_config,
            interface,
        }
    }

    pub(crate) fn owner_of(&self, key: &InterfaceKey) -> Option<SessionId> {
        self.claims.get(key).map(|claim| claim.session)
    }

    pub(crate) fn claim(&self, key: &InterfaceKey) -> Option<Claim> {
        self.claims.get(key).copied()
    }

    pub(crate) fn claims(&self) -> impl Iterator<Item = (&InterfaceKey, &Claim)> {
        self.claims.iter()
    }

    pub(crate) fn insert_claim(&mut self, key: InterfaceKey, claim: Claim) {
        self.claims.insert(key, claim);
    }

    pub(crate) fn remove_claim(&mut self, key: &InterfaceKey) -> Option<Claim> {
        self.claims.remove(key)
    }

    pub(crate) fn open_handle(&self) -> Option<&OpenHandle> {
        self.handle.as_ref()
    }

    pub(crate) fn set_open_handle(&mut self, open: OpenHandle) {
        self.handle = Some(open);
    }

    pub(crate) fn take_open_handle(&mut self) -> Option<OpenHandle> {
        self.handle.take()
    }

    /// Check that `handle` is the live handle of this device and is held by
    /// `session`
    pub(crate) fn validate_handle(
        &self,
        session: SessionId,
        handle: DeviceHandle,
    ) -> Result<&OpenHandle, CoordinatorError> {
        if handle.device != self.info.id {
            return Err(CoordinatorError::InvalidHandle(handle.id));
        }
        if !self.is_connected() || handle.generation != self.info.generation {
            return Err(CoordinatorError::DeviceDisconnected {
                device: self.info.id,
            });
        }
        match &self.handle {
            Some(open) if open.handle == handle && open.owner == session => Ok(open),
            _ => Err(CoordinatorError::InvalidHandle(handle.id)),
        }
    }

    /// Release every claim held by `session`, notifying subscribers
    pub(crate) fn release_claims_of(
        &mut self,
        session: SessionId,
        broadcaster: &EventBroadcaster,
    ) -> usize {
        let keys: Vec<InterfaceKey> = self
            .claims
            .iter()
            .filter(|(_, claim)| claim.session == session)
            .map(|(key, _)| *key)
            .collect();

        for key in &keys {
            self.claims.remove(key);
            broadcaster.publish(SessionEvent::InterfaceClaimChanged {
                interface: *key,
                state: ClaimState::Unclaimed,
            });
        }
        keys.len()
    }

    fn connect(&mut self, report: &HostDeviceReport, broadcaster: &EventBroadcaster) -> DeviceInfo {
        self.info.state = ConnectionState::Connected;
        self.info.generation += 1;
        self.info.manufacturer = report.manufacturer.clone();
        self.info.product = report.product.clone();
        self.info.configurations = report.configurations.clone();
        self.host_key = Some(report.host_key);
        self.active_config = 0;

        info!(
            "Device {:?} ({}) connected at bus {} address {}, generation {}",
            self.info.id,
            self.info.identity,
            report.host_key.bus,
            report.host_key.address,
            self.info.generation
        );

        broadcaster.publish(SessionEvent::DeviceConnected {
            device: self.info.clone(),
        });
        self.info.clone()
    }

    /// Disconnect cascade
    ///
    /// Every claim reverts to unclaimed (each notified), the handle is
    /// invalidated and its queue flushed with `DeviceDisconnected`, then the
    /// disconnect itself is published.
    fn disconnect(&mut self, broadcaster: &EventBroadcaster) {
        if !self.is_connected() {
            return;
        }

        for key in std::mem::take(&mut self.claims).into_keys() {
            broadcaster.publish(SessionEvent::InterfaceClaimChanged {
                interface: key,
                state: ClaimState::Unclaimed,
            });
        }

        if let Some(open) = self.handle.take() {
            debug!(
                "Invalidating handle {} of device {:?}",
                open.handle.id, self.info.id
            );
            open.queue.shutdown(ShutdownReason::Disconnected);
        }

        self.info.state = ConnectionState::Disconnected;
        self.host_key = None;

        info!(
            "Device {:?} ({}) disconnected, generation {}",
            self.info.id, self.info.identity, self.info.generation
        );

        broadcaster.publish(SessionEvent::DeviceDisconnected {
            device: self.info.id,
            generation: self.info.generation,
        });
    }
}

#[derive(Default)]
struct RegistryTables {
    /// Identities granted to the origin
    authorized: HashSet<DeviceIdentity>,
    /// Everything the host reports as attached, authorized or not
    attached: HashMap<HostKey, HostDeviceReport>,
    /// Records of authorized devices, connected or remembered
    devices: HashMap<DeviceId, Arc<Mutex<DeviceRecord>>>,
    /// Stable IDs of devices with a serial number
    by_identity: HashMap<DeviceIdentity, DeviceId>,
    /// Connected devices by host location
    by_host_key: HashMap<HostKey, DeviceId>,
    next_device_id: u32,
}

/// Per-origin device catalog
pub struct DeviceRegistry {
    origin: String,
    filters: Vec<String>,
    broadcaster: Arc<EventBroadcaster>,
    tables: RwLock<RegistryTables>,
}

impl DeviceRegistry {
    /// Create an empty registry
    ///
    /// `filters` are `VID:PID` patterns (`*` wildcards allowed); an empty
    /// list admits every device.
    pub fn new(
        origin: impl Into<String>,
        filters: Vec<String>,
        broadcaster: Arc<EventBroadcaster>,
    ) -> Self {
        Self {
            origin: origin.into(),
            filters,
            broadcaster,
            tables: RwLock::new(RegistryTables {
                next_device_id: 1,
                ..Default::default()
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryTables> {
        self.tables.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryTables> {
        self.tables.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Origin this registry belongs to
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Authorized devices that are currently connected
    pub fn list_authorized_devices(&self) -> Vec<DeviceInfo> {
        let records: Vec<_> = self.read().devices.values().cloned().collect();
        let mut devices: Vec<DeviceInfo> = records
            .iter()
            .filter_map(|record| {
                let record = lock(record);
                record.is_connected().then(|| record.info().clone())
            })
            .collect();
        devices.sort_by_key(|device| device.id);
        devices
    }

    /// Snapshot of one device, connected or remembered
    pub fn device(&self, id: DeviceId) -> Option<DeviceInfo> {
        self.record(id).map(|record| lock(&record).info().clone())
    }

    /// Whether `identity` has been granted to the origin
    pub fn is_authorized(&self, identity: &DeviceIdentity) -> bool {
        self.read().authorized.contains(identity)
    }

    /// Number of devices the host reports as attached (after filtering)
    pub fn attached_count(&self) -> usize {
        self.read().attached.len()
    }

    pub(crate) fn record(&self, id: DeviceId) -> Option<Arc<Mutex<DeviceRecord>>> {
        self.read().devices.get(&id).cloned()
    }

    pub(crate) fn records(&self) -> Vec<Arc<Mutex<DeviceRecord>>> {
        self.read().devices.values().cloned().collect()
    }

    /// Host attach notification
    ///
    /// Returns the device if it was surfaced to sessions. Devices that are
    /// filtered out, root hubs, and devices the origin was never granted
    /// are remembered (or ignored) without any event.
    pub fn on_host_connect(&self, report: HostDeviceReport) -> Option<DeviceInfo> {
        let identity = &report.identity;
        let mut tables = self.write();
        self.retire_replaced_locked(&mut tables, &report);

        // Root hubs cannot be handed to a session
        if identity.vendor_id == ROOT_HUB_VENDOR_ID && report.class == HUB_CLASS {
            debug!(
                "Skipping root hub: bus={}, addr={}, vid={:#x}, pid={:#x}",
                report.host_key.bus, report.host_key.address, identity.vendor_id, identity.product_id
            );
            return None;
        }

        if !Self::check_filter(identity.vendor_id, identity.product_id, &self.filters) {
            debug!(
                "Device ignored by filter: bus={}, addr={}, vid={:#x}, pid={:#x}",
                report.host_key.bus, report.host_key.address, identity.vendor_id, identity.product_id
            );
            return None;
        }

        tables.attached.insert(report.host_key, report.clone());

        if !tables.authorized.contains(identity) {
            debug!("Device {} attached but not granted to {}", identity, self.origin);
            return None;
        }

        Some(self.connect_locked(&mut tables, &report))
    }

    /// Host detach notification
    pub fn on_host_disconnect(&self, host_key: HostKey) {
        let mut tables = self.write();
        if tables.attached.remove(&host_key).is_none() {
            debug!(
                "Detach of untracked device at bus {} address {}",
                host_key.bus, host_key.address
            );
        }
        if let Some(id) = tables.by_host_key.remove(&host_key) {
            self.disconnect_locked(&mut tables, id);
        }
    }

    /// Authorize `identity` for the origin
    ///
    /// A matching device that is already attached is promoted to connected
    /// and announced. Returns the promoted devices.
    pub(crate) fn grant_access(&self, identity: DeviceIdentity) -> Vec<DeviceInfo> {
        let mut tables = self.write();
        if !tables.authorized.insert(identity.clone()) {
            debug!("{} already granted to {}", identity, self.origin);
            return Vec::new();
        }
        info!("Granted {} to {}", identity, self.origin);

        let mut pending: Vec<HostDeviceReport> = tables
            .attached
            .values()
            .filter(|report| {
                report.identity == identity && !tables.by_host_key.contains_key(&report.host_key)
            })
            .cloned()
            .collect();
        pending.sort_by_key(|report| (report.host_key.bus, report.host_key.address));

        pending
            .iter()
            .map(|report| self.connect_locked(&mut tables, report))
            .collect()
    }

    /// Withdraw a grant
    ///
    /// Connected devices with this identity go through the disconnect
    /// cascade. They stay host-attached and come back on a new grant.
    pub(crate) fn revoke_access(&self, identity: &DeviceIdentity) -> bool {
        let mut tables = self.write();
        if !tables.authorized.remove(identity) {
            return false;
        }
        info!("Revoked {} from {}", identity, self.origin);

        let affected: Vec<(HostKey, DeviceId)> = tables
            .by_host_key
            .iter()
            .filter(|(_, id)| {
                tables
                    .devices
                    .get(id)
                    .is_some_and(|record| &lock(record).info().identity == identity)
            })
            .map(|(key, id)| (*key, *id))
            .collect();

        for (host_key, id) in affected {
            tables.by_host_key.remove(&host_key);
            self.disconnect_locked(&mut tables, id);
        }
        true
    }

    /// Drop whatever was tracked at the report's host key if it is a
    /// different device; its detach was never reported
    fn retire_replaced_locked(&self, tables: &mut RegistryTables, report: &HostDeviceReport) {
        let key = report.host_key;
        if tables
            .attached
            .get(&key)
            .is_some_and(|previous| previous.identity != report.identity)
        {
            tables.attached.remove(&key);
        }

        let Some(id) = tables.by_host_key.get(&key).copied() else {
            return;
        };
        let replaced = tables
            .devices
            .get(&id)
            .is_none_or(|record| lock(record).info().identity != report.identity);
        if replaced {
            debug!(
                "Host key bus={} addr={} now reports {}, dropping {:?}",
                key.bus, key.address, report.identity, id
            );
            tables.by_host_key.remove(&key);
            self.disconnect_locked(tables, id);
        }
    }

    fn connect_locked(&self, tables: &mut RegistryTables, report: &HostDeviceReport) -> DeviceInfo {
        if let Some(id) = tables.by_host_key.get(&report.host_key).copied()
            && let Some(record) = tables.devices.get(&id)
        {
            // Repeated attach report for a device we already track; a
            // different device at this key was retired by the caller
            return lock(record).info().clone();
        }

        let known = tables.by_identity.get(&report.identity).copied();
        let id = match known {
            Some(id) => {
                // Same serial already live elsewhere: the old generation ends
                // before the new one starts
                let stale: Vec<HostKey> = tables
                    .by_host_key
                    .iter()
                    .filter(|(_, existing)| **existing == id)
                    .map(|(key, _)| *key)
                    .collect();
                for key in stale {
                    tables.by_host_key.remove(&key);
                }
                if let Some(record) = tables.devices.get(&id) {
                    lock(record).disconnect(&self.broadcaster);
                }
                id
            }
            None => {
                let id = DeviceId(tables.next_device_id);
                tables.next_device_id += 1;
                tables
                    .devices
                    .insert(id, Arc::new(Mutex::new(DeviceRecord::new(id, report))));
                if report.identity.is_persistent() {
                    tables.by_identity.insert(report.identity.clone(), id);
                }
                debug!("Assigned {:?} to {}", id, report.identity);
                id
            }
        };

        tables.by_host_key.insert(report.host_key, id);
        let record = tables
            .devices
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(DeviceRecord::new(id, report))))
            .clone();
        lock(&record).connect(report, &self.broadcaster)
    }

    fn disconnect_locked(&self, tables: &mut RegistryTables, id: DeviceId) {
        let Some(record) = tables.devices.get(&id).cloned() else {
            return;
        };
        let mut record = lock(&record);
        record.disconnect(&self.broadcaster);

        // Devices without a serial cannot be recognized again
        if !record.info().identity.is_persistent() {
            tables.devices.remove(&id);
        }
    }

    /// Check if a VID/PID pair is allowed by the filters
    pub fn check_filter(vid: u16, pid: u16, filters: &[String]) -> bool {
        // If no filters are defined, all devices are allowed
        if filters.is_empty() {
            return true;
        }

        // Filter format: "0xVID:0xPID" or "0xVID:*", validated by the config loader
        filters.iter().any(|filter| {
            let Some((filter_vid, filter_pid)) = filter.split_once(':') else {
                return false;
            };
            matches_id(filter_vid, vid) && matches_id(filter_pid, pid)
        })
    }
}

fn matches_id(pattern: &str, id: u16) -> bool {
    if pattern == "*" {
        return true;
    }
    let hex = pattern
        .strip_prefix("0x")
        .or_else(|| pattern.strip_prefix("0X"))
        .unwrap_or(pattern);
    u16::from_str_radix(hex, 16).is_ok_and(|v| v == id)
}

pub(crate) fn lock(record: &Mutex<DeviceRecord>) -> MutexGuard<'_, DeviceRecord> {
    record.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{
        create_mock_anonymous_report, create_mock_report, create_mock_root_hub_report,
    };

    fn registry() -> (DeviceRegistry, Arc<EventBroadcaster>) {
        let broadcaster = Arc::new(EventBroadcaster::new(64));
        (
            DeviceRegistry::new("https://example.test", Vec::new(), broadcaster.clone()),
            broadcaster,
        )
    }

    #[test]
    fn test_check_filter() {
        let filters = vec!["0x1234:0x5678".to_string(), "0xabcd:*".to_string()];

        assert!(DeviceRegistry::check_filter(0x1234, 0x5678, &filters));
        assert!(DeviceRegistry::check_filter(0xabcd, 0x0001, &filters));
        assert!(!DeviceRegistry::check_filter(0x1234, 0x0000, &filters));
        assert!(!DeviceRegistry::check_filter(0x0000, 0x5678, &filters));
        assert!(DeviceRegistry::check_filter(0x0000, 0x0000, &[]));
    }

    #[test]
    fn test_check_filter_uppercase_prefix() {
        let filters = vec!["0X1234:0X5678".to_string(), "0XABCD:*".to_string()];

        assert!(DeviceRegistry::check_filter(0x1234, 0x5678, &filters));
        assert!(DeviceRegistry::check_filter(0xabcd, 0x0042, &filters));
        assert!(!DeviceRegistry::check_filter(0x1234, 0x0001, &filters));
    }

    #[test]
    fn test_uppercase_filter_surfaces_matching_device() {
        let broadcaster = Arc::new(EventBroadcaster::new(8));
        let registry = DeviceRegistry::new(
            "https://example.test",
            vec!["0X1234:*".to_string()],
            broadcaster,
        );

        let report = create_mock_report(1, 0x1234, 0x5678);
        registry.grant_access(report.identity.clone());
        assert!(registry.on_host_connect(report).is_some());
        assert_eq!(registry.list_authorized_devices().len(), 1);
    }

    #[test]
    fn test_new_device_at_reused_host_key_replaces_old() {
        let (registry, broadcaster) = registry();
        let old = create_mock_report(1, 0x1234, 0x5678);
        // Same bus and address, different serial
        let new = create_mock_report(129, 0xabcd, 0x0001);
        assert_eq!(old.host_key, new.host_key);
        registry.grant_access(old.identity.clone());
        registry.grant_access(new.identity.clone());

        let first = registry.on_host_connect(old).unwrap();
        let mut events = broadcaster.subscribe(SessionId(1));
        let second = registry.on_host_connect(new.clone()).unwrap();

        assert_ne!(second.id, first.id);
        assert_eq!(second.identity, new.identity);
        assert_eq!(
            registry.device(first.id).unwrap().state,
            ConnectionState::Disconnected
        );
        let listed: Vec<_> = registry
            .list_authorized_devices()
            .into_iter()
            .map(|info| info.id)
            .collect();
        assert_eq!(listed, vec![second.id]);

        assert_eq!(
            events.try_next(),
            Some(SessionEvent::DeviceDisconnected {
                device: first.id,
                generation: 1
            })
        );
        assert!(matches!(
            events.try_next(),
            Some(SessionEvent::DeviceConnected { device }) if device.id == second.id
        ));

        // A detach at that key now belongs to the new device
        registry.on_host_disconnect(new.host_key);
        assert!(registry.list_authorized_devices().is_empty());
    }

    #[test]
    fn test_ungranted_device_at_reused_host_key_retires_old() {
        let (registry, _) = registry();
        let old = create_mock_report(1, 0x1234, 0x5678);
        registry.grant_access(old.identity.clone());
        let first = registry.on_host_connect(old).unwrap();

        let new = create_mock_report(129, 0xabcd, 0x0001);
        assert!(registry.on_host_connect(new.clone()).is_none());
        assert!(registry.list_authorized_devices().is_empty());
        assert_eq!(
            registry.device(first.id).unwrap().state,
            ConnectionState::Disconnected
        );

        // Granting the newcomer later surfaces it at that key
        let promoted = registry.grant_access(new.identity);
        assert_eq!(promoted.len(), 1);
        assert_ne!(promoted[0].id, first.id);
    }

    #[test]
    fn test_unauthorized_device_is_not_surfaced() {
        let (registry, _) = registry();
        let report = create_mock_report(1, 0x1234, 0x5678);

        assert!(registry.on_host_connect(report).is_none());
        assert!(registry.list_authorized_devices().is_empty());
        assert_eq!(registry.attached_count(), 1);
    }

    #[test]
    fn test_grant_promotes_attached_device() {
        let (registry, broadcaster) = registry();
        let mut events = broadcaster.subscribe(SessionId(1));
        let report = create_mock_report(1, 0x1234, 0x5678);
        registry.on_host_connect(report.clone());

        let promoted = registry.grant_access(report.identity.clone());
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].generation, 1);
        assert_eq!(registry.list_authorized_devices().len(), 1);
        assert!(matches!(
            events.try_next(),
            Some(SessionEvent::DeviceConnected { .. })
        ));

        // Granting twice changes nothing
        assert!(registry.grant_access(report.identity).is_empty());
        assert!(events.try_next().is_none());
    }

    #[test]
    fn test_reconnect_keeps_id_and_bumps_generation() {
        let (registry, _) = registry();
        let report = create_mock_report(1, 0x1234, 0x5678);
        registry.grant_access(report.identity.clone());

        let first = registry.on_host_connect(report.clone()).unwrap();
        registry.on_host_disconnect(report.host_key);
        assert!(registry.list_authorized_devices().is_empty());
        assert_eq!(registry.device(first.id).unwrap().state, ConnectionState::Disconnected);

        let mut moved = report.clone();
        moved.host_key.address += 1;
        let second = registry.on_host_connect(moved).unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.generation, first.generation + 1);
    }

    #[test]
    fn test_anonymous_device_gets_fresh_id() {
        let (registry, _) = registry();
        let report = create_mock_anonymous_report(2, 0x1234, 0x9999);
        registry.grant_access(report.identity.clone());

        let first = registry.on_host_connect(report.clone()).unwrap();
        registry.on_host_disconnect(report.host_key);
        assert!(registry.device(first.id).is_none());

        let second = registry.on_host_connect(report).unwrap();
        assert_ne!(second.id, first.id);
    }

    #[test]
    fn test_root_hub_and_filters_are_ignored() {
        let broadcaster = Arc::new(EventBroadcaster::new(8));
        let registry = DeviceRegistry::new(
            "https://example.test",
            vec!["0x1234:*".to_string()],
            broadcaster,
        );

        let hub = create_mock_root_hub_report(1);
        registry.grant_access(hub.identity.clone());
        assert!(registry.on_host_connect(hub).is_none());

        let other = create_mock_report(2, 0x4321, 0x0001);
        registry.grant_access(other.identity.clone());
        assert!(registry.on_host_connect(other).is_none());
        assert_eq!(registry.attached_count(), 0);
    }

    #[test]
    fn test_revoke_disconnects() {
        let (registry, broadcaster) = registry();
        let report = create_mock_report(1, 0x1234, 0x5678);
        registry.grant_access(report.identity.clone());
        let device = registry.on_host_connect(report.clone()).unwrap();

        let mut events = broadcaster.subscribe(SessionId(1));
        assert!(registry.revoke_access(&report.identity));
        assert!(!registry.revoke_access(&report.identity));
        assert!(registry.list_authorized_devices().is_empty());
        assert_eq!(
            events.try_next(),
            Some(SessionEvent::DeviceDisconnected {
                device: device.id,
                generation: 1
            })
        );

        // Still attached, so a new grant brings it back
        let promoted = registry.grant_access(report.identity);
        assert_eq!(promoted[0].id, device.id);
        assert_eq!(promoted[0].generation, 2);
    }
}
