//! libusb device layer
//!
//! Opens real devices through rusb and executes transfers synchronously on
//! the handle's dispatcher thread. Kernel drivers are detached when an
//! interface is claimed and reattached when it is released.

use super::{CancelSignal, DeviceBackend, DeviceIo};
use protocol::{
    CONFIGURATION_DESCRIPTOR_TYPE, CONFIGURATION_HEADER_LEN, ConfigurationDescriptor,
    DeviceIdentity, DeviceInfo, HostDeviceReport, HostKey, InterfaceDescriptor, TransferRequest,
    UsbError,
};
use rusb::{Context, DeviceHandle, UsbContext};
use std::time::Duration;
use tracing::{debug, warn};

/// Default timeout for control transfers (5 seconds)
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// GET_DESCRIPTOR as a standard device-to-host request
const GET_DESCRIPTOR_REQUEST_TYPE: u8 = 0x80;
const GET_DESCRIPTOR: u8 = 0x06;

/// Default control IN buffer when the request carries no length hint
const DEFAULT_CONTROL_BUFFER: usize = 64;

/// Backend for real devices
pub struct RusbBackend {
    context: Context,
}

impl RusbBackend {
    /// Create a backend with its own libusb context
    pub fn new() -> Result<Self, rusb::Error> {
        Ok(Self {
            context: Context::new()?,
        })
    }

    /// Find the device matching `info`'s identity among attached devices
    fn find(&self, info: &DeviceInfo) -> Result<rusb::Device<Context>, UsbError> {
        let devices = self.context.devices().map_err(map_rusb_error)?;

        for device in devices.iter() {
            let Ok(desc) = device.device_descriptor() else {
                continue;
            };
            if desc.vendor_id() != info.identity.vendor_id
                || desc.product_id() != info.identity.product_id
            {
                continue;
            }

            let Some(expected) = info.identity.serial_number.as_deref() else {
                return Ok(device);
            };
            let serial = device
                .open()
                .ok()
                .and_then(|handle| handle.read_serial_number_string_ascii(&desc).ok());
            if serial.as_deref() == Some(expected) {
                return Ok(device);
            }
        }

        Err(UsbError::NoDevice)
    }
}

impl RusbBackend {
    /// Build host attach reports for every device currently on the bus
    ///
    /// Devices whose descriptor cannot be read are skipped. String
    /// descriptors are read only if the device can be opened.
    pub fn enumerate(&self) -> Result<Vec<HostDeviceReport>, UsbError> {
        let devices = self.context.devices().map_err(map_rusb_error)?;
        let mut reports = Vec::new();

        for device in devices.iter() {
            let Ok(desc) = device.device_descriptor() else {
                continue;
            };

            let handle = device.open().ok();
            let strings = handle.as_ref().map(|handle| {
                let read = |index: Option<u8>| {
                    index.and_then(|idx| handle.read_string_descriptor_ascii(idx).ok())
                };
                (
                    read(desc.manufacturer_string_index()),
                    read(desc.product_string_index()),
                    read(desc.serial_number_string_index()),
                )
            });
            let (manufacturer, product, serial_number) = strings.unwrap_or((None, None, None));

            let configurations = (0..desc.num_configurations())
                .filter_map(|index| Some((index, device.config_descriptor(index).ok()?)))
                .map(|(index, config)| ConfigurationDescriptor {
                    value: config.number(),
                    interfaces: config
                        .interfaces()
                        .filter_map(|interface| {
                            let alt = interface.descriptors().next()?;
                            Some(InterfaceDescriptor {
                                number: interface.number(),
                                endpoints: alt
                                    .endpoint_descriptors()
                                    .map(|endpoint| endpoint.address())
                                    .collect(),
                            })
                        })
                        .collect(),
                    raw: handle
                        .as_ref()
                        .and_then(|handle| read_config_descriptor(handle, index))
                        .unwrap_or_default(),
                })
                .collect();

            reports.push(HostDeviceReport {
                host_key: HostKey {
                    bus: device.bus_number(),
                    address: device.address(),
                },
                identity: DeviceIdentity {
                    vendor_id: desc.vendor_id(),
                    product_id: desc.product_id(),
                    serial_number,
                },
                class: desc.class_code(),
                manufacturer,
                product,
                configurations,
            });
        }

        debug!("Enumerated {} devices", reports.len());
        Ok(reports)
    }
}

/// Read configuration `index` in full with GET_DESCRIPTOR
///
/// The header comes first to learn `wTotalLength`, then the whole block.
fn read_config_descriptor(handle: &DeviceHandle<Context>, index: u8) -> Option<Vec<u8>> {
    let value = (u16::from(CONFIGURATION_DESCRIPTOR_TYPE) << 8) | u16::from(index);
    let read = |len: usize| {
        let mut buffer = vec![0u8; len];
        let read = handle
            .read_control(
                GET_DESCRIPTOR_REQUEST_TYPE,
                GET_DESCRIPTOR,
                value,
                0,
                &mut buffer,
                DEFAULT_TIMEOUT,
            )
            .map_err(|e| debug!("Configuration {} descriptor read failed: {}", index, e))
            .ok()?;
        buffer.truncate(read);
        Some(buffer)
    };

    let total = ConfigurationDescriptor::total_length(&read(CONFIGURATION_HEADER_LEN)?)?;
    let raw = read(total)?;
    (raw.len() == total).then_some(raw)
}

impl DeviceBackend for RusbBackend {
    fn open(&self, info: &DeviceInfo) -> Result<Box<dyn DeviceIo>, UsbError> {
        let device = self.find(info)?;
        let handle = device.open().map_err(|e| {
            warn!("Failed to open device {}: {}", info.identity, e);
            map_rusb_error(e)
        })?;

        debug!("Opened device {:?} ({})", info.id, info.identity);
        Ok(Box::new(RusbIo {
            handle,
            detached: Vec::new(),
        }))
    }
}

struct RusbIo {
    handle: DeviceHandle<Context>,
    /// Interfaces whose kernel driver we detached
    detached: Vec<u8>,
}

impl DeviceIo for RusbIo {
    fn execute(
        &mut self,
        request: &TransferRequest,
        cancel: &CancelSignal,
    ) -> Result<Vec<u8>, UsbError> {
        // Synchronous libusb transfers cannot be aborted once submitted
        if cancel.is_cancelled() {
            return Err(UsbError::Cancelled);
        }

        match request {
            TransferRequest::Control {
                request_type,
                request,
                value,
                index,
                data,
            } => self.control(*request_type, *request, *value, *index, data),
            TransferRequest::Bulk {
                endpoint,
                data,
                timeout_ms,
            } => self.endpoint(*endpoint, data, *timeout_ms, false),
            TransferRequest::Interrupt {
                endpoint,
                data,
                timeout_ms,
            } => self.endpoint(*endpoint, data, *timeout_ms, true),
        }
    }

    fn claim_interface(&mut self, interface: u8) -> Result<(), UsbError> {
        match self.handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!("Detaching kernel driver from interface {}", interface);
                match self.handle.detach_kernel_driver(interface) {
                    Ok(()) => self.detached.push(interface),
                    Err(e) => warn!(
                        "Failed to detach kernel driver from interface {}: {}",
                        interface, e
                    ),
                }
            }
            Ok(false) => {}
            Err(e) => debug!(
                "Could not check kernel driver status for interface {}: {}",
                interface, e
            ),
        }

        self.handle
            .claim_interface(interface)
            .map_err(map_rusb_error)
    }

    fn release_interface(&mut self, interface: u8) -> Result<(), UsbError> {
        let result = self
            .handle
            .release_interface(interface)
            .map_err(map_rusb_error);

        if let Some(pos) = self.detached.iter().position(|i| *i == interface) {
            self.detached.remove(pos);
            if let Err(e) = self.handle.attach_kernel_driver(interface) {
                debug!(
                    "Could not reattach kernel driver to interface {}: {}",
                    interface, e
                );
            }
        }

        result
    }

    fn select_configuration(&mut self, value: u8) -> Result<(), UsbError> {
        self.handle
            .set_active_configuration(value)
            .map_err(map_rusb_error)
    }
}

impl RusbIo {
    fn control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<Vec<u8>, UsbError> {
        debug!(
            "Control transfer: request_type={:#x}, request={:#x}, value={:#x}, index={:#x}, data_len={}",
            request_type,
            request,
            value,
            index,
            data.len()
        );

        if request_type & 0x80 != 0 {
            let len = if data.is_empty() {
                DEFAULT_CONTROL_BUFFER
            } else {
                data.len()
            };
            let mut buffer = vec![0u8; len];
            let read = self
                .handle
                .read_control(request_type, request, value, index, &mut buffer, DEFAULT_TIMEOUT)
                .map_err(map_rusb_error)?;
            buffer.truncate(read);
            Ok(buffer)
        } else {
            self.handle
                .write_control(request_type, request, value, index, data, DEFAULT_TIMEOUT)
                .map_err(map_rusb_error)?;
            Ok(Vec::new())
        }
    }

    fn endpoint(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout_ms: u32,
        interrupt: bool,
    ) -> Result<Vec<u8>, UsbError> {
        let timeout = Duration::from_millis(u64::from(timeout_ms));

        if endpoint & 0x80 != 0 {
            let mut buffer = vec![0u8; data.len()];
            let read = if interrupt {
                self.handle.read_interrupt(endpoint, &mut buffer, timeout)
            } else {
                self.handle.read_bulk(endpoint, &mut buffer, timeout)
            }
            .map_err(map_rusb_error)?;
            buffer.truncate(read);
            Ok(buffer)
        } else {
            if interrupt {
                self.handle.write_interrupt(endpoint, data, timeout)
            } else {
                self.handle.write_bulk(endpoint, data, timeout)
            }
            .map_err(map_rusb_error)?;
            Ok(Vec::new())
        }
    }
}

impl Drop for RusbIo {
    fn drop(&mut self) {
        for interface in std::mem::take(&mut self.detached) {
            let _ = self.handle.release_interface(interface);
            if let Err(e) = self.handle.attach_kernel_driver(interface) {
                debug!(
                    "Could not reattach kernel driver to interface {}: {}",
                    interface, e
                );
            }
        }
    }
}

/// Map rusb::Error to the device layer error
pub fn map_rusb_error(err: rusb::Error) -> UsbError {
    match err {
        rusb::Error::Timeout => UsbError::Timeout,
        rusb::Error::Pipe => UsbError::Stall,
        rusb::Error::NoDevice => UsbError::NoDevice,
        rusb::Error::Overflow => UsbError::Overflow,
        rusb::Error::Io => UsbError::Io,
        rusb::Error::Access => UsbError::Access,
        rusb::Error::Interrupted => UsbError::Cancelled,
        _ => UsbError::Other {
            message: err.to_string(),
        },
    }
}
