//! Shared types for the USB session coordinator
//!
//! This crate defines the values exchanged between execution contexts (pages,
//! dedicated workers, shared worker ports) and the coordinator: device
//! identities and descriptors, handles, interface keys, transfer requests,
//! events, and the error taxonomy.
//!
//! # Example
//!
//! ```
//! use protocol::{DeviceIdentity, InterfaceKey, DeviceId};
//!
//! let identity = DeviceIdentity::new(0x1234, 0x5678, Some("SN000001"));
//! assert!(identity.is_persistent());
//!
//! let key = InterfaceKey { device: DeviceId(1), configuration: 0, interface: 2 };
//! assert_eq!(key.to_string(), "device 1 config 0 interface 2");
//! ```

pub mod error;
pub mod events;
pub mod types;

pub use error::{CoordinatorError, Result, UsbError};
pub use events::SessionEvent;
pub use types::{
    CONFIGURATION_DESCRIPTOR_TYPE, CONFIGURATION_HEADER_LEN, ClaimState, ConfigurationDescriptor, ConnectionState, DeviceHandle, DeviceId,
    DeviceIdentity, DeviceInfo, FlowId, HostDeviceReport, HostKey, InterfaceDescriptor,
    InterfaceKey, SessionId, SessionKind, SessionRef, TransferCompletion, TransferRequest,
    TransferTicket,
};
