//! In-memory loopback devices
//!
//! Every opened device echoes bulk and interrupt OUT data back on the IN
//! endpoint with the same number. The backend records each executed operation
//! and can be told to stall endpoints, fail opens, add latency, or hold all
//! transfers until released. Held transfers may also be set to ignore
//! cancellation.

use super::{CancelSignal, DeviceBackend, DeviceIo};
use protocol::{DeviceId, DeviceInfo, TransferRequest, UsbError};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

/// Poll interval while a held transfer waits for release or cancellation
const HOLD_POLL: Duration = Duration::from_millis(5);

/// Operation observed by the loopback device layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopbackOp {
    Opened,
    Transfer(TransferRequest),
    ClaimInterface(u8),
    ReleaseInterface(u8),
    SelectConfiguration(u8),
    Closed,
}

#[derive(Debug, Default)]
struct LoopbackState {
    log: Vec<(DeviceId, LoopbackOp)>,
    stalled: HashSet<(DeviceId, u8)>,
    buffers: HashMap<(DeviceId, u8), VecDeque<u8>>,
    claimed: HashMap<DeviceId, BTreeSet<u8>>,
    fail_open: bool,
    latency: Duration,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<LoopbackState>,
    held: Mutex<bool>,
    released: Condvar,
    ignore_cancel: AtomicBool,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, device: DeviceId, op: LoopbackOp) {
        self.state().log.push((device, op));
    }

    /// Block while held; gives up early if `cancel` is raised unless
    /// cancellation is being ignored
    fn wait_released(&self, cancel: &CancelSignal) -> Result<(), UsbError> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        while *held {
            if cancel.is_cancelled() && !self.ignore_cancel.load(Ordering::Acquire) {
                return Err(UsbError::Cancelled);
            }
            held = self
                .released
                .wait_timeout(held, HOLD_POLL)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
        Ok(())
    }
}

/// In-memory backend
///
/// Clones share state, so a test can keep one clone for inspection while the
/// coordinator owns another.
#[derive(Debug, Clone, Default)]
pub struct LoopbackBackend {
    shared: Arc<Shared>,
}

impl LoopbackBackend {
    /// Create a backend with no faults configured
    pub fn new() -> Self {
        Self::default()
    }

    /// Make transfers on `endpoint` of `device` fail with a stall
    pub fn stall_endpoint(&self, device: DeviceId, endpoint: u8) {
        self.shared.state().stalled.insert((device, endpoint));
    }

    /// Make subsequent opens fail with `Access`
    pub fn fail_open(&self, fail: bool) {
        self.shared.state().fail_open = fail;
    }

    /// Delay every transfer by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.shared.state().latency = latency;
    }

    /// Hold every transfer until [`release`](Self::release)
    pub fn hold(&self) {
        *self.shared.held.lock().unwrap_or_else(|e| e.into_inner()) = true;
    }

    /// Keep held transfers waiting for release even after a cancel
    ///
    /// Models a device layer that has already committed the I/O.
    pub fn ignore_cancel(&self, ignore: bool) {
        self.shared.ignore_cancel.store(ignore, Ordering::Release);
    }

    /// Let held transfers proceed
    pub fn release(&self) {
        *self.shared.held.lock().unwrap_or_else(|e| e.into_inner()) = false;
        self.shared.released.notify_all();
    }

    /// Operations seen for `device`, in execution order
    pub fn operations(&self, device: DeviceId) -> Vec<LoopbackOp> {
        self.shared
            .state()
            .log
            .iter()
            .filter(|(id, _)| *id == device)
            .map(|(_, op)| op.clone())
            .collect()
    }

    /// Transfers executed on `device`, in execution order
    pub fn transfers(&self, device: DeviceId) -> Vec<TransferRequest> {
        self.operations(device)
            .into_iter()
            .filter_map(|op| match op {
                LoopbackOp::Transfer(request) => Some(request),
                _ => None,
            })
            .collect()
    }

    /// Interfaces currently claimed at the device layer
    pub fn claimed_interfaces(&self, device: DeviceId) -> Vec<u8> {
        self.shared
            .state()
            .claimed
            .get(&device)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }
}

impl DeviceBackend for LoopbackBackend {
    fn open(&self, device: &DeviceInfo) -> Result<Box<dyn DeviceIo>, UsbError> {
        if self.shared.state().fail_open {
            debug!("Loopback open refused for device {:?}", device.id);
            return Err(UsbError::Access);
        }

        self.shared.record(device.id, LoopbackOp::Opened);
        Ok(Box::new(LoopbackIo {
            shared: self.shared.clone(),
            device: device.id,
        }))
    }
}

struct LoopbackIo {
    shared: Arc<Shared>,
    device: DeviceId,
}

impl LoopbackIo {
    fn endpoint_transfer(&self, endpoint: u8, data: &[u8]) -> Result<Vec<u8>, UsbError> {
        let mut state = self.shared.state();
        if state.stalled.contains(&(self.device, endpoint)) {
            return Err(UsbError::Stall);
        }

        if endpoint & 0x80 != 0 {
            let buffer = state.buffers.entry((self.device, endpoint)).or_default();
            let len = data.len().min(buffer.len());
            Ok(buffer.drain(..len).collect())
        } else {
            state
                .buffers
                .entry((self.device, endpoint | 0x80))
                .or_default()
                .extend(data.iter().copied());
            Ok(Vec::new())
        }
    }
}

impl DeviceIo for LoopbackIo {
    fn execute(
        &mut self,
        request: &TransferRequest,
        cancel: &CancelSignal,
    ) -> Result<Vec<u8>, UsbError> {
        self.shared.wait_released(cancel)?;

        let latency = self.shared.state().latency;
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        self.shared
            .record(self.device, LoopbackOp::Transfer(request.clone()));

        match request {
            TransferRequest::Control {
                request_type,
                request,
                value,
                data,
                ..
            } => {
                if request_type & 0x80 == 0 {
                    return Ok(Vec::new());
                }
                // GET_DESCRIPTOR answers with a pattern tagged by the
                // descriptor type; everything else reads back zeros
                let fill = if *request == 0x06 { (value >> 8) as u8 } else { 0 };
                Ok(vec![fill; data.len()])
            }
            TransferRequest::Bulk { endpoint, data, .. }
            | TransferRequest::Interrupt { endpoint, data, .. } => {
                self.endpoint_transfer(*endpoint, data)
            }
        }
    }

    fn claim_interface(&mut self, interface: u8) -> Result<(), UsbError> {
        self.shared
            .record(self.device, LoopbackOp::ClaimInterface(interface));
        self.shared
            .state()
            .claimed
            .entry(self.device)
            .or_default()
            .insert(interface);
        Ok(())
    }

    fn release_interface(&mut self, interface: u8) -> Result<(), UsbError> {
        self.shared
            .record(self.device, LoopbackOp::ReleaseInterface(interface));
        if let Some(set) = self.shared.state().claimed.get_mut(&self.device) {
            set.remove(&interface);
        }
        Ok(())
    }

    fn select_configuration(&mut self, value: u8) -> Result<(), UsbError> {
        self.shared
            .record(self.device, LoopbackOp::SelectConfiguration(value));
        Ok(())
    }
}

impl Drop for LoopbackIo {
    fn drop(&mut self) {
        let mut state = self.shared.state();
        state.claimed.remove(&self.device);
        state.log.push((self.device, LoopbackOp::Closed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{ConnectionState, DeviceIdentity};

    fn device(id: u32) -> DeviceInfo {
        DeviceInfo {
            id: DeviceId(id),
            identity: DeviceIdentity::new(0x1234, 0x5678, Some("SN1")),
            state: ConnectionState::Connected,
            generation: 1,
            manufacturer: None,
            product: None,
            configurations: Vec::new(),
        }
    }

    #[test]
    fn test_bulk_loopback() {
        let backend = LoopbackBackend::new();
        let mut io = backend.open(&device(1)).unwrap();
        let cancel = CancelSignal::new();

        let out = TransferRequest::Bulk {
            endpoint: 0x01,
            data: vec![1, 2, 3],
            timeout_ms: 100,
        };
        assert_eq!(io.execute(&out, &cancel).unwrap(), Vec::<u8>::new());

        let read = TransferRequest::Bulk {
            endpoint: 0x81,
            data: vec![0; 2],
            timeout_ms: 100,
        };
        assert_eq!(io.execute(&read, &cancel).unwrap(), vec![1, 2]);
        assert_eq!(io.execute(&read, &cancel).unwrap(), vec![3]);
        assert_eq!(backend.transfers(DeviceId(1)).len(), 3);
    }

    #[test]
    fn test_stalled_endpoint() {
        let backend = LoopbackBackend::new();
        backend.stall_endpoint(DeviceId(1), 0x81);
        let mut io = backend.open(&device(1)).unwrap();

        let read = TransferRequest::Bulk {
            endpoint: 0x81,
            data: vec![0; 8],
            timeout_ms: 100,
        };
        assert_eq!(
            io.execute(&read, &CancelSignal::new()),
            Err(UsbError::Stall)
        );
    }

    #[test]
    fn test_held_transfer_honors_cancel() {
        let backend = LoopbackBackend::new();
        backend.hold();
        let mut io = backend.open(&device(1)).unwrap();

        let cancel = CancelSignal::new();
        cancel.cancel();
        let read = TransferRequest::Bulk {
            endpoint: 0x81,
            data: vec![0; 8],
            timeout_ms: 100,
        };
        assert_eq!(io.execute(&read, &cancel), Err(UsbError::Cancelled));
        assert!(backend.transfers(DeviceId(1)).is_empty());
    }

    #[test]
    fn test_committed_transfer_completes_despite_cancel() {
        let backend = LoopbackBackend::new();
        backend.hold();
        backend.ignore_cancel(true);
        let mut io = backend.open(&device(1)).unwrap();

        let cancel = CancelSignal::new();
        cancel.cancel();
        let releaser = {
            let backend = backend.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                backend.release();
            })
        };

        let out = TransferRequest::Bulk {
            endpoint: 0x01,
            data: vec![9],
            timeout_ms: 100,
        };
        assert_eq!(io.execute(&out, &cancel), Ok(Vec::new()));
        releaser.join().unwrap();
        assert_eq!(backend.transfers(DeviceId(1)), vec![out]);
    }

    #[test]
    fn test_claims_dropped_on_close() {
        let backend = LoopbackBackend::new();
        let mut io = backend.open(&device(2)).unwrap();
        io.claim_interface(0).unwrap();
        io.claim_interface(1).unwrap();
        io.release_interface(0).unwrap();
        assert_eq!(backend.claimed_interfaces(DeviceId(2)), vec![1]);

        drop(io);
        assert!(backend.claimed_interfaces(DeviceId(2)).is_empty());
        assert_eq!(
            backend.operations(DeviceId(2)).last(),
            Some(&LoopbackOp::Closed)
        );
    }

    #[test]
    fn test_fail_open() {
        let backend = LoopbackBackend::new();
        backend.fail_open(true);
        assert!(matches!(backend.open(&device(1)), Err(UsbError::Access)));
    }
}
