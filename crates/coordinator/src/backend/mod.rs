//! Device layer seam
//!
//! The coordinator never speaks USB itself. A [`DeviceBackend`] opens the
//! single OS-level channel to a device and returns a [`DeviceIo`] that the
//! handle's dispatcher thread drives, one operation at a time.
//!
//! Two backends are provided:
//! - [`LoopbackBackend`]: in-memory devices for tests and the demo binary
//! - `RusbBackend` (feature `rusb`): real devices through libusb

use protocol::{DeviceInfo, TransferRequest, UsbError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub mod loopback;
#[cfg(feature = "rusb")]
pub mod libusb;

pub use loopback::LoopbackBackend;
#[cfg(feature = "rusb")]
pub use libusb::RusbBackend;

/// Opens device channels
pub trait DeviceBackend: Send + Sync + 'static {
    /// Open the OS-level channel to `device`
    ///
    /// Called on the handle's dispatcher thread, never under a coordinator
    /// lock, so it may block on the host.
    fn open(&self, device: &DeviceInfo) -> Result<Box<dyn DeviceIo>, UsbError>;
}

/// One open channel to a device
///
/// Owned by a single dispatcher thread; operations arrive in queue order.
pub trait DeviceIo: Send {
    /// Execute a transfer
    ///
    /// `cancel` is raised when the issuing session cancels a transfer that
    /// was already dispatched. Implementations that can abort return
    /// `Err(UsbError::Cancelled)`; whatever is returned is what the session
    /// sees.
    fn execute(&mut self, request: &TransferRequest, cancel: &CancelSignal)
    -> Result<Vec<u8>, UsbError>;

    /// Claim an interface at the OS level
    fn claim_interface(&mut self, _interface: u8) -> Result<(), UsbError> {
        Ok(())
    }

    /// Release an interface at the OS level
    fn release_interface(&mut self, _interface: u8) -> Result<(), UsbError> {
        Ok(())
    }

    /// Switch the active configuration
    fn select_configuration(&mut self, _value: u8) -> Result<(), UsbError> {
        Ok(())
    }
}

/// Cancellation flag forwarded to the device layer
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    /// Create a lowered signal
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Check whether the signal was raised
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_signal_is_shared() {
        let signal = CancelSignal::new();
        let forwarded = signal.clone();
        assert!(!forwarded.is_cancelled());

        signal.cancel();
        assert!(forwarded.is_cancelled());
    }
}
