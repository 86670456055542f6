//! Per-handle dispatcher thread
//!
//! Each open handle gets a dedicated OS thread that owns the device channel
//! and executes queued operations one at a time. Device I/O is blocking, so
//! it never runs on a session's scheduler or under a coordinator lock. The
//! thread exits once its queue is shut down and drained, dropping (and so
//! closing) the device channel.

use crate::backend::{DeviceBackend, DeviceIo};
use crate::scheduler::{DispatchOp, HandleQueue, TransferSlot};
use async_channel::Receiver;
use protocol::{CoordinatorError, DeviceInfo, TransferCompletion, UsbError};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Dispatcher for one open handle
struct Dispatcher {
    queue: Arc<HandleQueue>,
    receiver: Receiver<DispatchOp>,
    device: DeviceInfo,
    io: Result<Box<dyn DeviceIo>, UsbError>,
}

impl Dispatcher {
    /// Run until the queue is shut down and drained
    fn run(mut self) {
        let handle = self.queue.handle();
        info!(
            "Dispatcher for handle {} (device {:?}) started",
            handle.id, self.device.id
        );

        while let Ok(op) = self.receiver.recv_blocking() {
            self.dispatch(op);
        }

        info!("Dispatcher for handle {} stopped", handle.id);
    }

    fn dispatch(&mut self, op: DispatchOp) {
        match op {
            DispatchOp::Transfer(slot) => self.transfer(&slot),
            DispatchOp::ClaimInterface(interface) => {
                self.control_op("claim interface", |io| io.claim_interface(interface))
            }
            DispatchOp::ReleaseInterface(interface) => {
                self.control_op("release interface", |io| io.release_interface(interface))
            }
            DispatchOp::SelectConfiguration(value) => {
                self.control_op("select configuration", |io| io.select_configuration(value))
            }
        }
    }

    fn transfer(&mut self, slot: &TransferSlot) {
        let Some((request, reply)) = slot.begin_dispatch() else {
            // Cancelled or flushed while queued
            self.queue.forget(slot.id());
            return;
        };
        let ticket = slot.ticket();

        let result = match self.io.as_mut() {
            Ok(io) => {
                // A panicking device layer fails this transfer only
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    io.execute(&request, slot.cancel_signal())
                }))
                .unwrap_or_else(|e| {
                    error!("Panic in device layer on handle {}: {:?}", ticket.handle.id, e);
                    Err(UsbError::Other {
                        message: "device layer panicked".to_string(),
                    })
                })
            }
            Err(e) => Err(e.clone()),
        };

        let device = ticket.handle.device;
        let outcome = if self.queue.is_disconnected() {
            Err(CoordinatorError::DeviceDisconnected { device })
        } else {
            match result {
                Ok(data) => Ok(TransferCompletion { ticket, data }),
                Err(UsbError::NoDevice) => Err(CoordinatorError::DeviceDisconnected { device }),
                Err(UsbError::Cancelled) => Err(CoordinatorError::Cancelled),
                Err(e) => {
                    warn!(
                        "Transfer seq {} on handle {} failed: {}",
                        ticket.sequence, ticket.handle.id, e
                    );
                    Err(CoordinatorError::Transfer(e))
                }
            }
        };

        slot.finish();
        self.queue.forget(slot.id());
        let _ = reply.send(outcome);
    }

    fn control_op<F>(&mut self, what: &str, op: F)
    where
        F: FnOnce(&mut dyn DeviceIo) -> Result<(), UsbError>,
    {
        if self.queue.is_shut_down() {
            return;
        }
        match self.io.as_mut() {
            Ok(io) => match op(io.as_mut()) {
                Ok(()) => debug!("Handle {}: {} done", self.queue.handle().id, what),
                Err(e) => warn!(
                    "Handle {}: failed to {}: {}",
                    self.queue.handle().id,
                    what,
                    e
                ),
            },
            Err(e) => debug!(
                "Handle {}: skipping {}, device not open: {}",
                self.queue.handle().id,
                what,
                e
            ),
        }
    }
}

/// Spawn the dispatcher thread for a freshly created queue
///
/// The device channel is opened on the new thread; if that fails every
/// transfer on the handle resolves with the open error.
pub(crate) fn spawn_dispatcher(
    queue: Arc<HandleQueue>,
    receiver: Receiver<DispatchOp>,
    backend: Arc<dyn DeviceBackend>,
    device: DeviceInfo,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    let name = format!("usb-dispatch-{}", queue.handle().id);
    std::thread::Builder::new().name(name).spawn(move || {
        let io = backend.open(&device);
        if let Err(e) = &io {
            warn!("Failed to open device {:?}: {}", device.id, e);
        }

        Dispatcher {
            queue,
            receiver,
            device,
            io,
        }
        .run()
    })
}
