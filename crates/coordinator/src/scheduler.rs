//! Transfer scheduling
//!
//! Every open handle owns one FIFO queue drained by one dispatcher thread, so
//! operations reach the device strictly in queue order. Sequence numbers are
//! allocated per (session, flow) under the same lock that enqueues, which
//! keeps each flow's sub-order identical to its submission order.
//!
//! A transfer lives in a [`TransferSlot`] shared between the queue, the
//! dispatcher and the caller's [`TransferFuture`]. The slot's state decides
//! races between dispatch, cancellation and a disconnect flush:
//!
//! ```text
//! Queued --dispatch--> InFlight --complete--> Finished
//!    \--cancel/flush-----------------------> Finished
//! ```

use crate::backend::{CancelSignal, DeviceBackend};
use crate::dispatch::spawn_dispatcher;
use crate::registry::DeviceRegistry;
use crate::session::SessionDirectory;
use async_channel::{Sender, unbounded};
use protocol::{
    CoordinatorError, DeviceHandle, DeviceInfo, FlowId, SessionId, TransferCompletion,
    TransferRequest, TransferTicket,
};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, info, trace};

/// Result a transfer future resolves to
pub type TransferResult = protocol::Result<TransferCompletion>;

/// Outcome of a cancellation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Transfer was still queued; it resolved `Cancelled` and never reaches
    /// the device
    Dropped,
    /// Transfer was already dispatched; the device layer was asked to abort
    /// and its answer decides the result
    Forwarded,
    /// Transfer had already completed
    AlreadyFinished,
}

/// Operation queued for a handle's dispatcher
pub(crate) enum DispatchOp {
    Transfer(Arc<TransferSlot>),
    ClaimInterface(u8),
    ReleaseInterface(u8),
    SelectConfiguration(u8),
}

enum SlotState {
    Queued {
        request: TransferRequest,
        reply: oneshot::Sender<TransferResult>,
    },
    InFlight,
    Finished,
}

/// Shared state of one submitted transfer
pub(crate) struct TransferSlot {
    id: u64,
    ticket: TransferTicket,
    cancel: CancelSignal,
    state: Mutex<SlotState>,
}

impl TransferSlot {
    fn state(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn ticket(&self) -> TransferTicket {
        self.ticket
    }

    pub(crate) fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    /// Move a queued transfer in flight, handing its request to the dispatcher
    pub(crate) fn begin_dispatch(
        &self,
    ) -> Option<(TransferRequest, oneshot::Sender<TransferResult>)> {
        let mut state = self.state();
        match std::mem::replace(&mut *state, SlotState::InFlight) {
            SlotState::Queued { request, reply } => Some((request, reply)),
            other => {
                *state = other;
                None
            }
        }
    }

    /// Resolve a transfer that never left the queue
    fn resolve_queued(&self, result: TransferResult) -> bool {
        let mut state = self.state();
        match std::mem::replace(&mut *state, SlotState::Finished) {
            SlotState::Queued { reply, .. } => {
                let _ = reply.send(result);
                true
            }
            other => {
                *state = other;
                false
            }
        }
    }

    pub(crate) fn finish(&self) {
        *self.state() = SlotState::Finished;
    }

    fn cancel(&self) -> CancelOutcome {
        if self.resolve_queued(Err(CoordinatorError::Cancelled)) {
            return CancelOutcome::Dropped;
        }
        match *self.state() {
            SlotState::InFlight => {
                self.cancel.cancel();
                CancelOutcome::Forwarded
            }
            _ => CancelOutcome::AlreadyFinished,
        }
    }
}

/// Why a queue is being shut down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ShutdownReason {
    /// The owning session closed the handle
    Closed,
    /// The device went away
    Disconnected,
}

struct QueueState {
    next_transfer: u64,
    next_sequence: HashMap<(SessionId, FlowId), u64>,
    pending: HashMap<u64, Arc<TransferSlot>>,
    shut_down: bool,
}

/// FIFO queue of one open handle
pub(crate) struct HandleQueue {
    handle: DeviceHandle,
    max_pending: usize,
    sender: Sender<DispatchOp>,
    disconnected: AtomicBool,
    state: Mutex<QueueState>,
}

impl HandleQueue {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn handle(&self) -> DeviceHandle {
        self.handle
    }

    /// Whether the device disconnected while this queue was live
    pub(crate) fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.state().shut_down
    }

    /// Number of transfers queued or in flight
    pub(crate) fn pending(&self) -> usize {
        self.state().pending.len()
    }

    /// Queue a transfer behind everything already queued
    fn enqueue(
        self: &Arc<Self>,
        session: SessionId,
        flow: FlowId,
        request: TransferRequest,
    ) -> Result<TransferFuture, CoordinatorError> {
        let mut state = self.state();
        if state.shut_down {
            return Err(CoordinatorError::InvalidHandle(self.handle.id));
        }
        if state.pending.len() >= self.max_pending {
            return Err(CoordinatorError::QueueFull {
                limit: self.max_pending,
            });
        }

        let sequence = state.next_sequence.entry((session, flow)).or_insert(0);
        let ticket = TransferTicket {
            session,
            flow,
            handle: self.handle,
            sequence: *sequence,
        };
        *sequence += 1;

        let id = state.next_transfer;
        state.next_transfer += 1;

        let (reply, receiver) = oneshot::channel();
        let slot = Arc::new(TransferSlot {
            id,
            ticket,
            cancel: CancelSignal::new(),
            state: Mutex::new(SlotState::Queued { request, reply }),
        });

        self.sender
            .try_send(DispatchOp::Transfer(slot.clone()))
            .map_err(|_| CoordinatorError::InvalidHandle(self.handle.id))?;
        state.pending.insert(id, slot.clone());

        trace!(
            "Queued transfer {} (session {}, flow {}, seq {}) on handle {}",
            id, session.0, flow.0, ticket.sequence, self.handle.id
        );

        Ok(TransferFuture {
            ticket,
            receiver,
            slot,
            queue: self.clone(),
        })
    }

    /// Queue a non-transfer operation; dropped silently once shut down
    pub(crate) fn push(&self, op: DispatchOp) {
        if !self.is_shut_down() {
            let _ = self.sender.try_send(op);
        }
    }

    /// Forget a transfer once it no longer needs flushing
    pub(crate) fn forget(&self, id: u64) {
        self.state().pending.remove(&id);
    }

    fn cancel(&self, slot: &TransferSlot) -> CancelOutcome {
        let outcome = slot.cancel();
        if outcome == CancelOutcome::Dropped {
            self.forget(slot.id());
            debug!(
                "Dropped queued transfer seq {} on handle {}",
                slot.ticket().sequence,
                self.handle.id
            );
        }
        outcome
    }

    /// Stop accepting work and flush everything still queued
    ///
    /// Queued transfers resolve `Cancelled` on close and `DeviceDisconnected`
    /// on disconnect. Dispatched transfers are asked to abort; after a
    /// disconnect the dispatcher reports them as `DeviceDisconnected`
    /// whatever the device layer says. Idempotent.
    pub(crate) fn shutdown(&self, reason: ShutdownReason) {
        if reason == ShutdownReason::Disconnected {
            self.disconnected.store(true, Ordering::SeqCst);
        }

        let slots: Vec<Arc<TransferSlot>> = {
            let mut state = self.state();
            if state.shut_down && reason == ShutdownReason::Closed {
                return;
            }
            state.shut_down = true;
            state.pending.drain().map(|(_, slot)| slot).collect()
        };

        let error = match reason {
            ShutdownReason::Closed => CoordinatorError::Cancelled,
            ShutdownReason::Disconnected => CoordinatorError::DeviceDisconnected {
                device: self.handle.device,
            },
        };

        let mut flushed = 0;
        for slot in &slots {
            if slot.resolve_queued(Err(error.clone())) {
                flushed += 1;
            } else {
                slot.cancel_signal().cancel();
            }
        }
        self.sender.close();

        if flushed > 0 || reason == ShutdownReason::Disconnected {
            info!(
                "Flushed {} queued transfers on handle {} ({:?})",
                flushed, self.handle.id, reason
            );
        }
    }
}

/// Completion of a submitted transfer
///
/// Resolves without blocking the submitting thread. Dropping the future does
/// not cancel the transfer; use [`cancel`](Self::cancel).
pub struct TransferFuture {
    ticket: TransferTicket,
    receiver: oneshot::Receiver<TransferResult>,
    slot: Arc<TransferSlot>,
    queue: Arc<HandleQueue>,
}

impl TransferFuture {
    /// Identity of this transfer
    pub fn ticket(&self) -> TransferTicket {
        self.ticket
    }

    /// Best-effort cancellation
    pub fn cancel(&self) -> CancelOutcome {
        self.queue.cancel(&self.slot)
    }
}

impl std::fmt::Debug for TransferFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferFuture")
            .field("ticket", &self.ticket)
            .finish()
    }
}

impl Future for TransferFuture {
    type Output = TransferResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(CoordinatorError::Cancelled)))
    }
}

/// Serializes transfers onto open handles
pub struct TransferScheduler {
    registry: Arc<DeviceRegistry>,
    sessions: Arc<SessionDirectory>,
    backend: Arc<dyn DeviceBackend>,
    max_pending: usize,
}

impl TransferScheduler {
    pub(crate) fn new(
        registry: Arc<DeviceRegistry>,
        sessions: Arc<SessionDirectory>,
        backend: Arc<dyn DeviceBackend>,
        max_pending: usize,
    ) -> Self {
        Self {
            registry,
            sessions,
            backend,
            max_pending: max_pending.max(1),
        }
    }

    /// Create the queue and dispatcher thread for a freshly opened handle
    pub(crate) fn start(
        &self,
        handle: DeviceHandle,
        device: DeviceInfo,
    ) -> Result<Arc<HandleQueue>, CoordinatorError> {
        let (sender, receiver) = unbounded();
        let queue = Arc::new(HandleQueue {
            handle,
            max_pending: self.max_pending,
            sender,
            disconnected: AtomicBool::new(false),
            state: Mutex::new(QueueState {
                next_transfer: 0,
                next_sequence: HashMap::new(),
                pending: HashMap::new(),
                shut_down: false,
            }),
        });

        spawn_dispatcher(queue.clone(), receiver, self.backend.clone(), device).map_err(
            |e| {
                CoordinatorError::Transfer(protocol::UsbError::Other {
                    message: format!("failed to spawn dispatcher: {}", e),
                })
            },
        )?;

        Ok(queue)
    }

    /// Submit a transfer on `handle`
    ///
    /// Endpoint transfers require the session to own the interface holding
    /// the endpoint in the active configuration. Control transfers only
    /// require the handle.
    pub fn submit(
        &self,
        session: SessionId,
        flow: FlowId,
        handle: DeviceHandle,
        request: TransferRequest,
    ) -> Result<TransferFuture, CoordinatorError> {
        let record = self
            .registry
            .record(handle.device)
            .ok_or(CoordinatorError::InvalidHandle(handle.id))?;
        let record = record.lock().unwrap_or_else(|e| e.into_inner());

        self.sessions.ensure_live(session)?;
        let queue = record.validate_handle(session, handle)?.queue.clone();

        if let Some(endpoint) = request.endpoint() {
            let interface = record
                .active_configuration()
                .and_then(|config| config.interface_for_endpoint(endpoint))
                .ok_or(CoordinatorError::UnknownEndpoint {
                    device: handle.device,
                    endpoint,
                })?;
            let key = record.interface_key(interface);
            if record.owner_of(&key) != Some(session) {
                return Err(CoordinatorError::NotOwner { interface: key });
            }
        }

        queue.enqueue(session, flow, request)
    }

    /// Best-effort cancellation of a submitted transfer
    pub fn cancel(&self, transfer: &TransferFuture) -> CancelOutcome {
        transfer.cancel()
    }

    /// Number of transfers queued or in flight on `handle`
    pub fn pending(&self, handle: DeviceHandle) -> usize {
        self.registry
            .record(handle.device)
            .and_then(|record| {
                let record = record.lock().unwrap_or_else(|e| e.into_inner());
                record
                    .open_handle()
                    .filter(|open| open.handle == handle)
                    .map(|open| open.queue.pending())
            })
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::DeviceId;

    fn queue(max_pending: usize) -> (Arc<HandleQueue>, async_channel::Receiver<DispatchOp>) {
        let (sender, receiver) = unbounded();
        let queue = Arc::new(HandleQueue {
            handle: DeviceHandle {
                id: 1,
                device: DeviceId(1),
                generation: 1,
            },
            max_pending,
            sender,
            disconnected: AtomicBool::new(false),
            state: Mutex::new(QueueState {
                next_transfer: 0,
                next_sequence: HashMap::new(),
                pending: HashMap::new(),
                shut_down: false,
            }),
        });
        (queue, receiver)
    }

    fn request() -> TransferRequest {
        TransferRequest::Control {
            request_type: 0x00,
            request: 0x09,
            value: 1,
            index: 0,
            data: Vec::new(),
        }
    }

    #[test]
    fn test_sequence_per_flow() {
        let (queue, _rx) = queue(16);
        let s = SessionId(1);

        let a0 = queue.enqueue(s, FlowId(0), request()).unwrap();
        let b0 = queue.enqueue(s, FlowId(1), request()).unwrap();
        let a1 = queue.enqueue(s, FlowId(0), request()).unwrap();

        assert_eq!(a0.ticket().sequence, 0);
        assert_eq!(b0.ticket().sequence, 0);
        assert_eq!(a1.ticket().sequence, 1);
        assert_eq!(queue.pending(), 3);
    }

    #[test]
    fn test_queue_full() {
        let (queue, _rx) = queue(2);
        let s = SessionId(1);
        let _a = queue.enqueue(s, FlowId::MAIN, request()).unwrap();
        let _b = queue.enqueue(s, FlowId::MAIN, request()).unwrap();

        let err = queue.enqueue(s, FlowId::MAIN, request()).unwrap_err();
        assert_eq!(err, CoordinatorError::QueueFull { limit: 2 });
    }

    #[tokio::test]
    async fn test_cancel_queued_transfer() {
        let (queue, rx) = queue(16);
        let future = queue
            .enqueue(SessionId(1), FlowId::MAIN, request())
            .unwrap();

        assert_eq!(future.cancel(), CancelOutcome::Dropped);
        assert_eq!(future.cancel(), CancelOutcome::AlreadyFinished);
        assert_eq!(queue.pending(), 0);
        assert_eq!(future.await, Err(CoordinatorError::Cancelled));

        // The dispatcher finds a tombstone
        match rx.try_recv() {
            Ok(DispatchOp::Transfer(slot)) => assert!(slot.begin_dispatch().is_none()),
            _ => panic!("expected queued transfer"),
        }
    }

    #[tokio::test]
    async fn test_cancel_in_flight_is_forwarded() {
        let (queue, rx) = queue(16);
        let future = queue
            .enqueue(SessionId(1), FlowId::MAIN, request())
            .unwrap();

        let Ok(DispatchOp::Transfer(slot)) = rx.try_recv() else {
            panic!("expected queued transfer");
        };
        let (_request, _reply) = slot.begin_dispatch().unwrap();

        assert_eq!(future.cancel(), CancelOutcome::Forwarded);
        assert!(slot.cancel_signal().is_cancelled());
    }

    #[tokio::test]
    async fn test_disconnect_flush() {
        let (queue, _rx) = queue(16);
        let first = queue
            .enqueue(SessionId(1), FlowId::MAIN, request())
            .unwrap();
        let second = queue
            .enqueue(SessionId(1), FlowId::MAIN, request())
            .unwrap();

        queue.shutdown(ShutdownReason::Disconnected);
        assert!(queue.is_disconnected());

        let expected = Err(CoordinatorError::DeviceDisconnected {
            device: DeviceId(1),
        });
        assert_eq!(first.await, expected);
        assert_eq!(second.await, expected);
        assert!(matches!(
            queue.enqueue(SessionId(1), FlowId::MAIN, request()),
            Err(CoordinatorError::InvalidHandle(1))
        ));
    }

    #[tokio::test]
    async fn test_close_flush_cancels() {
        let (queue, _rx) = queue(16);
        let future = queue
            .enqueue(SessionId(1), FlowId::MAIN, request())
            .unwrap();

        queue.shutdown(ShutdownReason::Closed);
        queue.shutdown(ShutdownReason::Closed);
        assert_eq!(future.await, Err(CoordinatorError::Cancelled));
    }
}
