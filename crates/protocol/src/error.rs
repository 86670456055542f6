//! Coordinator error types

use crate::types::{DeviceId, InterfaceKey, SessionKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Device layer error
///
/// Mirrors the libusb error codes the device layer can report for a single
/// transfer.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum UsbError {
    /// Transfer timed out
    #[error("transfer timed out")]
    Timeout,
    /// Endpoint stalled (protocol error)
    #[error("endpoint stalled")]
    Stall,
    /// Device was disconnected
    #[error("no such device")]
    NoDevice,
    /// Device returned more data than requested
    #[error("buffer overflow")]
    Overflow,
    /// Device layer honored a cancellation
    #[error("transfer cancelled by device layer")]
    Cancelled,
    /// Access denied by the host
    #[error("access denied")]
    Access,
    /// I/O error
    #[error("I/O error")]
    Io,
    /// Other error with message
    #[error("{message}")]
    Other { message: String },
}

/// Errors returned to execution contexts
///
/// Arbitration errors are always returned synchronously from the call that
/// caused them. Transfer errors resolve the affected transfer future only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinatorError {
    /// Device already has an open handle, held by a session of `holder` kind
    #[error("device already open by a {holder} session")]
    AlreadyOpen { holder: SessionKind },

    /// Interface is claimed by another session
    #[error("{interface} is claimed by a {holder} session")]
    InterfaceBusy {
        interface: InterfaceKey,
        holder: SessionKind,
    },

    /// Caller does not own the interface
    #[error("session does not own {interface}")]
    NotOwner { interface: InterfaceKey },

    /// Device disconnected (or its handle belongs to an older generation)
    #[error("device {} disconnected", .device.0)]
    DeviceDisconnected { device: DeviceId },

    /// Transfer cancelled before reaching the device
    #[error("transfer cancelled")]
    Cancelled,

    /// Operation not permitted for this session or device
    #[error("unauthorized: {reason}")]
    Unauthorized { reason: String },

    /// Handle is closed or not held by this session
    #[error("invalid device handle {0}")]
    InvalidHandle(u32),

    /// Interface does not exist in the active configuration
    #[error("{interface} does not exist")]
    UnknownInterface { interface: InterfaceKey },

    /// Endpoint does not belong to any interface of the active configuration
    #[error("endpoint {endpoint:#04x} does not exist on device {}", .device.0)]
    UnknownEndpoint { device: DeviceId, endpoint: u8 },

    /// Configuration index out of range
    #[error("configuration {index} does not exist on device {}", .device.0)]
    InvalidConfiguration { device: DeviceId, index: u8 },

    /// Session already terminated
    #[error("session {0} is not live")]
    UnknownSession(u64),

    /// Too many transfers pending on one handle
    #[error("transfer queue full ({limit} pending)")]
    QueueFull { limit: usize },

    /// Device layer failed the transfer
    #[error("transfer failed: {0}")]
    Transfer(#[from] UsbError),
}

impl CoordinatorError {
    /// Create an unauthorized error
    pub fn unauthorized(reason: impl Into<String>) -> Self {
        CoordinatorError::Unauthorized {
            reason: reason.into(),
        }
    }
}

/// Type alias for coordinator results
pub type Result<T> = std::result::Result<T, CoordinatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoordinatorError::AlreadyOpen {
            holder: SessionKind::DedicatedWorker,
        };
        assert_eq!(
            err.to_string(),
            "device already open by a dedicated-worker session"
        );

        let err = CoordinatorError::InterfaceBusy {
            interface: InterfaceKey {
                device: DeviceId(3),
                configuration: 0,
                interface: 1,
            },
            holder: SessionKind::Window,
        };
        assert!(err.to_string().contains("device 3 config 0 interface 1"));
        assert!(err.to_string().contains("window"));
    }

    #[test]
    fn test_usb_error_conversion() {
        let err: CoordinatorError = UsbError::Stall.into();
        assert_eq!(err, CoordinatorError::Transfer(UsbError::Stall));
        assert_eq!(err.to_string(), "transfer failed: endpoint stalled");
    }
}
