//! State-change events delivered to sessions

use crate::types::{ClaimState, DeviceId, DeviceInfo, InterfaceKey};
use serde::{Deserialize, Serialize};

/// Event delivered to subscribed sessions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEvent {
    /// An authorized device connected (or was just granted while attached)
    DeviceConnected { device: DeviceInfo },

    /// An authorized device disconnected; all claims and the handle of
    /// `generation` are gone
    DeviceDisconnected { device: DeviceId, generation: u64 },

    /// Ownership of an interface changed
    InterfaceClaimChanged {
        interface: InterfaceKey,
        state: ClaimState,
    },

    /// The subscriber fell behind and `missed` older events were dropped
    Lagged { missed: u64 },
}

impl SessionEvent {
    /// Device this event concerns, if any
    pub fn device_id(&self) -> Option<DeviceId> {
        match self {
            SessionEvent::DeviceConnected { device } => Some(device.id),
            SessionEvent::DeviceDisconnected { device, .. } => Some(*device),
            SessionEvent::InterfaceClaimChanged { interface, .. } => Some(interface.device),
            SessionEvent::Lagged { .. } => None,
        }
    }
}
