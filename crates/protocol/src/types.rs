//! Device, session and transfer type definitions
//!
//! This module defines the values exchanged between execution contexts and
//! the coordinator: device identities and descriptors, session identities,
//! handles, interface keys, and transfer requests.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Registry-assigned device identifier
///
/// Stable across reconnects of the same physical device when the serial
/// number matches. Devices without a serial number get a new ID on every
/// attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

/// Execution context session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

/// Logical flow within one session
///
/// A shared worker serving several ports submits on behalf of each port with
/// a distinct flow. Sequence numbers are allocated per flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowId(pub u32);

impl FlowId {
    /// Flow used by sessions that never split their submissions
    pub const MAIN: FlowId = FlowId(0);
}

/// Host-side location of an attached device (bus, address)
///
/// Reported by the host layer on attach and used again on detach. It is not
/// an identity: the same physical device may come back at another location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostKey {
    /// Bus number
    pub bus: u8,
    /// Device address on the bus
    pub address: u8,
}

/// Kind of execution context owning a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// A page (the only privileged kind)
    Window,
    /// A dedicated worker spawned by a page
    DedicatedWorker,
    /// One port connected to a shared worker
    SharedWorkerPort,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKind::Window => write!(f, "window"),
            SessionKind::DedicatedWorker => write!(f, "dedicated-worker"),
            SessionKind::SharedWorkerPort => write!(f, "shared-worker-port"),
        }
    }
}

/// A session as seen by the arbiter: who it is and what kind it is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionRef {
    pub id: SessionId,
    pub kind: SessionKind,
}

/// Stable identity of a physical device
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// Serial number string (if the device reports one)
    pub serial_number: Option<String>,
}

impl DeviceIdentity {
    /// Create an identity
    pub fn new(vendor_id: u16, product_id: u16, serial_number: Option<&str>) -> Self {
        Self {
            vendor_id,
            product_id,
            serial_number: serial_number.map(str::to_string),
        }
    }

    /// Whether reconnects of this device can be recognized
    pub fn is_persistent(&self) -> bool {
        self.serial_number.is_some()
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)?;
        if let Some(serial) = &self.serial_number {
            write!(f, " ({})", serial)?;
        }
        Ok(())
    }
}

/// Connection state of a registered device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Interface within a configuration
///
/// Only the interface number and endpoint addresses are read by the
/// coordinator, to route endpoint transfers to the owning claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    /// bInterfaceNumber
    pub number: u8,
    /// Endpoint addresses (direction bit included)
    pub endpoints: Vec<u8>,
}

/// Configuration descriptor, opaque apart from its interface list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationDescriptor {
    /// bConfigurationValue
    pub value: u8,
    /// Interfaces of this configuration
    pub interfaces: Vec<InterfaceDescriptor>,
    /// Complete configuration descriptor as read from the device (header,
    /// interface, endpoint and class-specific descriptors, `wTotalLength`
    /// bytes), passed through untouched. Empty when it could not be read.
    #[serde(with = "serde_bytes")]
    pub raw: Vec<u8>,
}

/// bDescriptorType of a configuration descriptor
pub const CONFIGURATION_DESCRIPTOR_TYPE: u8 = 0x02;

/// Length of the configuration descriptor header
pub const CONFIGURATION_HEADER_LEN: usize = 9;

impl ConfigurationDescriptor {
    /// `wTotalLength` from a configuration descriptor header
    ///
    /// Returns `None` if `header` is not a configuration descriptor.
    pub fn total_length(header: &[u8]) -> Option<usize> {
        if header.len() < CONFIGURATION_HEADER_LEN || header[1] != CONFIGURATION_DESCRIPTOR_TYPE {
            return None;
        }
        let total = usize::from(u16::from_le_bytes([header[2], header[3]]));
        (total >= CONFIGURATION_HEADER_LEN).then_some(total)
    }

    /// Check whether this configuration has the given interface
    pub fn has_interface(&self, number: u8) -> bool {
        self.interfaces.iter().any(|i| i.number == number)
    }

    /// Find the interface that owns an endpoint address
    pub fn interface_for_endpoint(&self, endpoint: u8) -> Option<u8> {
        self.interfaces
            .iter()
            .find(|i| i.endpoints.contains(&endpoint))
            .map(|i| i.number)
    }
}

/// Attach report from the host layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostDeviceReport {
    /// Where the device is attached
    pub host_key: HostKey,
    /// Identity of the device
    pub identity: DeviceIdentity,
    /// USB device class
    pub class: u8,
    /// Manufacturer string (if available)
    pub manufacturer: Option<String>,
    /// Product string (if available)
    pub product: Option<String>,
    /// Ordered configuration descriptors
    pub configurations: Vec<ConfigurationDescriptor>,
}

/// Device information surfaced to sessions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Registry-assigned device identifier
    pub id: DeviceId,
    /// Stable identity
    pub identity: DeviceIdentity,
    /// Current connection state
    pub state: ConnectionState,
    /// Connection generation, incremented on every connect
    pub generation: u64,
    /// Manufacturer string (if available)
    pub manufacturer: Option<String>,
    /// Product string (if available)
    pub product: Option<String>,
    /// Ordered configuration descriptors
    pub configurations: Vec<ConfigurationDescriptor>,
}

impl DeviceInfo {
    /// Whether the device is currently connected
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

/// Open channel to a device
///
/// Returned by a successful open. Only valid for the generation it was opened
/// in; a disconnect invalidates it even if the device comes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceHandle {
    /// Handle identifier, unique for the coordinator lifetime
    pub id: u32,
    /// Device this handle was opened on
    pub device: DeviceId,
    /// Connection generation at open time
    pub generation: u64,
}

/// Interface of a device: (device, configuration index, interface number)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InterfaceKey {
    pub device: DeviceId,
    pub configuration: u8,
    pub interface: u8,
}

impl fmt::Display for InterfaceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "device {} config {} interface {}",
            self.device.0, self.configuration, self.interface
        )
    }
}

/// Ownership state of an interface as seen by subscribers
///
/// Carries the owner's kind, never its identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimState {
    Unclaimed,
    Claimed { kind: SessionKind },
}

/// Transfer request
///
/// Data is passed to the device layer untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferRequest {
    /// Control transfer (endpoint 0), no claim required
    Control {
        /// Request type byte (bmRequestType)
        request_type: u8,
        /// Request byte (bRequest)
        request: u8,
        /// Value parameter (wValue)
        value: u16,
        /// Index parameter (wIndex)
        index: u16,
        /// Data to send (OUT) or buffer length hint (IN)
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    /// Interrupt transfer
    Interrupt {
        /// Endpoint address (includes direction bit)
        endpoint: u8,
        /// Data to send (OUT) or buffer length hint (IN)
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
        /// Timeout in milliseconds
        timeout_ms: u32,
    },
    /// Bulk transfer
    Bulk {
        /// Endpoint address (includes direction bit)
        endpoint: u8,
        /// Data to send (OUT) or buffer length hint (IN)
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
        /// Timeout in milliseconds
        timeout_ms: u32,
    },
}

impl TransferRequest {
    /// Endpoint address for endpoint transfers, `None` for control
    pub fn endpoint(&self) -> Option<u8> {
        match self {
            TransferRequest::Control { .. } => None,
            TransferRequest::Interrupt { endpoint, .. } | TransferRequest::Bulk { endpoint, .. } => {
                Some(*endpoint)
            }
        }
    }
}

/// Identifies one submitted transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferTicket {
    /// Issuing session
    pub session: SessionId,
    /// Flow within the session
    pub flow: FlowId,
    /// Handle the transfer was queued on
    pub handle: DeviceHandle,
    /// Per-flow sequence number, starting at 0
    pub sequence: u64,
}

/// Successful transfer completion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferCompletion {
    /// The transfer that completed
    pub ticket: TransferTicket,
    /// Data received (IN), empty for OUT
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}
