//! Test utilities for the USB session coordinator
//!
//! Provides mock host reports and helper functions for testing across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::create_mock_report;
//!
//! # fn main() {
//! let report = create_mock_report(1, 0x1234, 0x5678);
//! assert_eq!(report.identity.vendor_id, 0x1234);
//! # }
//! ```

use protocol::{
    ConfigurationDescriptor, DeviceIdentity, HostDeviceReport, HostKey, InterfaceDescriptor,
    TransferRequest,
};
use std::future::Future;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Bulk IN endpoint of interface 0 in the mock configuration
pub const MOCK_BULK_IN: u8 = 0x81;
/// Bulk OUT endpoint of interface 0 in the mock configuration
pub const MOCK_BULK_OUT: u8 = 0x01;
/// Interrupt IN endpoint of interface 1 in the mock configuration
pub const MOCK_INTERRUPT_IN: u8 = 0x82;

/// Create a mock host report for a device with a serial number
///
/// The device sits at bus 1, address `id % 128` and exposes one configuration
/// from [`create_mock_configuration`].
///
/// # Example
/// ```
/// use common::test_utils::create_mock_report;
///
/// let report = create_mock_report(1, 0x1234, 0x5678);
/// assert_eq!(report.host_key.address, 1);
/// assert_eq!(report.identity.serial_number.as_deref(), Some("SN000001"));
/// ```
pub fn create_mock_report(id: u32, vendor_id: u16, product_id: u16) -> HostDeviceReport {
    HostDeviceReport {
        host_key: HostKey {
            bus: 1,
            address: (id % 128) as u8,
        },
        identity: DeviceIdentity {
            vendor_id,
            product_id,
            serial_number: Some(format!("SN{:06}", id)),
        },
        class: 0x00,
        manufacturer: Some(format!("Test Manufacturer {}", id)),
        product: Some(format!("Test Product {}", id)),
        configurations: vec![create_mock_configuration()],
    }
}

/// Create a mock host report for a device without a serial number
pub fn create_mock_anonymous_report(id: u32, vendor_id: u16, product_id: u16) -> HostDeviceReport {
    let mut report = create_mock_report(id, vendor_id, product_id);
    report.identity.serial_number = None;
    report
}

/// Create a mock root hub report (never tracked by the registry)
pub fn create_mock_root_hub_report(id: u32) -> HostDeviceReport {
    let mut report = create_mock_report(id, 0x1d6b, 0x0002);
    report.class = 0x09;
    report
}

/// Create a mock configuration with two interfaces
///
/// Interface 0 has a bulk IN/OUT pair, interface 1 has an interrupt IN.
pub fn create_mock_configuration() -> ConfigurationDescriptor {
    ConfigurationDescriptor {
        value: 1,
        interfaces: vec![
            InterfaceDescriptor {
                number: 0,
                endpoints: vec![MOCK_BULK_IN, MOCK_BULK_OUT],
            },
            InterfaceDescriptor {
                number: 1,
                endpoints: vec![MOCK_INTERRUPT_IN],
            },
        ],
        raw: create_mock_config_descriptor(),
    }
}

/// Create a bulk OUT request carrying `data`
pub fn bulk_out(data: Vec<u8>) -> TransferRequest {
    TransferRequest::Bulk {
        endpoint: MOCK_BULK_OUT,
        data,
        timeout_ms: 1000,
    }
}

/// Create a bulk IN request reading up to `length` bytes
pub fn bulk_in(length: usize) -> TransferRequest {
    TransferRequest::Bulk {
        endpoint: MOCK_BULK_IN,
        data: vec![0; length],
        timeout_ms: 1000,
    }
}

/// Create a GET_DESCRIPTOR(Device) control request
pub fn get_device_descriptor() -> TransferRequest {
    TransferRequest::Control {
        request_type: 0x80,
        request: 0x06,
        value: 0x0100,
        index: 0,
        data: vec![0; 18],
    }
}

/// Run a future with a timeout
///
/// # Example
/// ```
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

/// Raw configuration descriptor matching [`create_mock_configuration`]
pub fn create_mock_config_descriptor() -> Vec<u8> {
    vec![
        // Configuration: 48 bytes total, 2 interfaces, value 1
        0x09, 0x02, 0x30, 0x00, 0x02, 0x01, 0x00, 0x80, 0x32,
        // Interface 0, vendor class, 2 endpoints
        0x09, 0x04, 0x00, 0x00, 0x02, 0xFF, 0x00, 0x00, 0x00,
        0x07, 0x05, MOCK_BULK_IN, 0x02, 0x00, 0x02, 0x00,
        0x07, 0x05, MOCK_BULK_OUT, 0x02, 0x00, 0x02, 0x00,
        // Interface 1, vendor class, 1 endpoint
        0x09, 0x04, 0x01, 0x00, 0x01, 0xFF, 0x00, 0x00, 0x00,
        0x07, 0x05, MOCK_INTERRUPT_IN, 0x03, 0x08, 0x00, 0x0A,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_mock_report() {
        let report = create_mock_report(42, 0xABCD, 0x1234);

        assert_eq!(report.identity.vendor_id, 0xABCD);
        assert_eq!(report.identity.product_id, 0x1234);
        assert_eq!(report.host_key.address, 42);
        assert_eq!(report.configurations.len(), 1);
        assert_eq!(
            report.configurations[0].interface_for_endpoint(MOCK_INTERRUPT_IN),
            Some(1)
        );
    }

    #[test]
    fn test_mock_config_descriptor_is_complete() {
        let raw = create_mock_config_descriptor();
        assert_eq!(
            ConfigurationDescriptor::total_length(&raw),
            Some(raw.len())
        );
        assert_eq!(create_mock_configuration().raw, raw);
    }

    #[test]
    fn test_anonymous_report_has_no_serial() {
        let report = create_mock_anonymous_report(3, 0x1111, 0x2222);
        assert!(!report.identity.is_persistent());
    }

    #[test]
    fn test_config_descriptor_length() {
        let raw = create_mock_config_descriptor();
        assert_eq!(raw.len(), u16::from_le_bytes([raw[2], raw[3]]) as usize);
        assert_eq!(raw[4] as usize, create_mock_configuration().interfaces.len());
    }

    #[tokio::test]
    async fn test_with_timeout_success() {
        let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await;

        assert!(result.is_ok());
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_with_timeout_failure() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            42
        })
        .await;

        assert!(result.is_err());
    }
}
