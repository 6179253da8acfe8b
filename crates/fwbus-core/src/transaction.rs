//! Transaction engine.
//!
//! Issues asynchronous read/write/lock requests, correlates every response
//! with its request through the transport closure value, and resolves each
//! request exactly once: on response, on timeout, on bus reset, or on
//! cancellation. No retries happen here.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};
use tracing::{debug, error, instrument, trace, warn};

use crate::cycle_time::{CycleClock, CycleTimestamp};
use crate::dispatcher::{DispatcherState, on_dispatch_thread};
use crate::error::FwError;
use crate::events::{BusEvent, Outbox};
use crate::node::GenerationTracker;
use crate::protocol::{MAX_BLOCK_PAYLOAD, OFFSET_SPACE_END, QUADLET_SIZE, Rcode, Tcode};
use crate::sync::lock;
use crate::transport::{BusTransport, OutboundRequest};

/// Identifier of one submitted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u64);

/// Final outcome of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Complete,
    ConflictError,
    DataError,
    TypeError,
    AddressError,
    SendError,
    Busy,
    NoAck,
    /// No response within the configured window.
    Timeout,
    /// The generation changed while the transaction was pending.
    BusReset,
    /// The dispatcher stopped or the controller went away.
    Cancelled,
}

impl From<Rcode> for Outcome {
    fn from(rcode: Rcode) -> Self {
        match rcode {
            Rcode::Complete => Outcome::Complete,
            Rcode::ConflictError => Outcome::ConflictError,
            Rcode::DataError => Outcome::DataError,
            Rcode::TypeError => Outcome::TypeError,
            Rcode::AddressError => Outcome::AddressError,
            Rcode::SendError => Outcome::SendError,
            Rcode::Cancelled => Outcome::Cancelled,
            Rcode::Busy => Outcome::Busy,
            Rcode::Generation => Outcome::BusReset,
            Rcode::NoAck => Outcome::NoAck,
        }
    }
}

impl Outcome {
    pub fn is_complete(self) -> bool {
        self == Outcome::Complete
    }

    /// Rejections reported by the remote node itself.
    pub fn is_remote_error(self) -> bool {
        matches!(
            self,
            Outcome::ConflictError | Outcome::DataError | Outcome::TypeError | Outcome::AddressError
        )
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nick = match self {
            Outcome::Complete => "complete",
            Outcome::ConflictError => "conflict-error",
            Outcome::DataError => "data-error",
            Outcome::TypeError => "type-error",
            Outcome::AddressError => "address-error",
            Outcome::SendError => "send-error",
            Outcome::Busy => "busy",
            Outcome::NoAck => "no-ack",
            Outcome::Timeout => "timeout",
            Outcome::BusReset => "bus-reset",
            Outcome::Cancelled => "cancelled",
        };
        f.write_str(nick)
    }
}

/// Lifecycle timestamps of a transaction in the cycle-time domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransactionTimestamps {
    /// Client-side enqueue.
    pub initiate: CycleTimestamp,
    /// Dispatch onto the bus.
    pub sent: CycleTimestamp,
    /// Remote acknowledgement; absent when nothing came back.
    pub received: Option<CycleTimestamp>,
    /// Delivery of the result.
    pub finish: CycleTimestamp,
}

/// An asynchronous request to one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRequest {
    pub tcode: Tcode,
    pub destination: u16,
    /// 48-bit offset in the destination's address space.
    pub offset: u64,
    /// Write data or lock operands (argument first).
    pub payload: Vec<u8>,
    /// Bytes expected back for reads and locks, bytes written otherwise.
    pub length: usize,
    /// Falls back to the engine default when `None`.
    pub timeout: Option<Duration>,
    /// Generation the destination was resolved in; the current one when `None`.
    pub generation: Option<u32>,
}

impl TransactionRequest {
    pub fn read_quadlet(destination: u16, offset: u64) -> Self {
        Self {
            tcode: Tcode::ReadQuadletRequest,
            destination,
            offset,
            payload: Vec::new(),
            length: QUADLET_SIZE,
            timeout: None,
            generation: None,
        }
    }

    pub fn read_block(destination: u16, offset: u64, length: usize) -> Self {
        Self {
            tcode: Tcode::ReadBlockRequest,
            destination,
            offset,
            payload: Vec::new(),
            length,
            timeout: None,
            generation: None,
        }
    }

    pub fn write_quadlet(destination: u16, offset: u64, value: u32) -> Self {
        Self {
            tcode: Tcode::WriteQuadletRequest,
            destination,
            offset,
            payload: value.to_be_bytes().to_vec(),
            length: QUADLET_SIZE,
            timeout: None,
            generation: None,
        }
    }

    pub fn write_block(destination: u16, offset: u64, data: Vec<u8>) -> Self {
        let length = data.len();
        Self {
            tcode: Tcode::WriteBlockRequest,
            destination,
            offset,
            payload: data,
            length,
            timeout: None,
            generation: None,
        }
    }

    /// Lock request; `operands` is argument then data for the variants that
    /// take an argument, data only otherwise.
    pub fn lock(destination: u16, offset: u64, tcode: Tcode, operands: Vec<u8>) -> Self {
        let length = if tcode.lock_has_argument() {
            operands.len() / 2
        } else {
            operands.len()
        };
        Self {
            tcode,
            destination,
            offset,
            payload: operands,
            length,
            timeout: None,
            generation: None,
        }
    }

    /// 32-bit compare-and-swap.
    pub fn compare_swap(destination: u16, offset: u64, expected: u32, new: u32) -> Self {
        let mut operands = expected.to_be_bytes().to_vec();
        operands.extend_from_slice(&new.to_be_bytes());
        Self::lock(destination, offset, Tcode::LockCompareSwap, operands)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Only send while `generation` is current.
    pub fn with_generation(mut self, generation: u32) -> Self {
        self.generation = Some(generation);
        self
    }

    /// Check payload and length against the tcode.
    pub fn validate(&self) -> Result<(), FwError> {
        let invalid = |msg: String| Err(FwError::InvalidArgument(msg));

        if !self.tcode.is_request() {
            return invalid(format!("{} is not a request tcode", self.tcode));
        }
        let span = self.length.max(self.payload.len()) as u64;
        let end = self.offset.checked_add(span);
        if self.offset >= OFFSET_SPACE_END || end.is_none_or(|end| end > OFFSET_SPACE_END) {
            return invalid(format!("offset 0x{:X} outside 48-bit space", self.offset));
        }

        match self.tcode {
            Tcode::ReadQuadletRequest | Tcode::WriteQuadletRequest => {
                let data_len = if self.tcode.is_write() {
                    self.payload.len()
                } else {
                    QUADLET_SIZE
                };
                if self.length != QUADLET_SIZE || data_len != QUADLET_SIZE {
                    return invalid(format!("{} transfers exactly 4 bytes", self.tcode));
                }
                if self.tcode.is_read() && !self.payload.is_empty() {
                    return invalid("read request carries no payload".into());
                }
            }
            Tcode::ReadBlockRequest => {
                if self.length == 0 || self.length > MAX_BLOCK_PAYLOAD {
                    return invalid(format!("block length {} out of range", self.length));
                }
                if !self.payload.is_empty() {
                    return invalid("read request carries no payload".into());
                }
            }
            Tcode::WriteBlockRequest => {
                if self.payload.is_empty() || self.payload.len() > MAX_BLOCK_PAYLOAD {
                    return invalid(format!("block length {} out of range", self.payload.len()));
                }
                if self.length != self.payload.len() {
                    return invalid("length differs from payload size".into());
                }
            }
            Tcode::LockVendorDependent => {
                if self.payload.is_empty() || self.payload.len() > MAX_BLOCK_PAYLOAD {
                    return invalid("vendor-dependent lock needs operands".into());
                }
            }
            tcode => {
                let operand = if tcode.lock_has_argument() {
                    self.payload.len() / 2
                } else {
                    self.payload.len()
                };
                let expected_total = if tcode.lock_has_argument() {
                    operand * 2
                } else {
                    operand
                };
                if !matches!(operand, 4 | 8) || expected_total != self.payload.len() {
                    return invalid(format!(
                        "{} with {} operand bytes",
                        tcode,
                        self.payload.len()
                    ));
                }
                if self.length != operand {
                    return invalid("length differs from operand size".into());
                }
            }
        }

        if self.tcode != Tcode::ReadBlockRequest
            && self.tcode != Tcode::WriteBlockRequest
            && self.offset % QUADLET_SIZE as u64 != 0
        {
            return invalid(format!("offset 0x{:X} is not quadlet aligned", self.offset));
        }
        Ok(())
    }

    fn data(&self) -> &[u8] {
        if self.tcode.is_read() {
            &[]
        } else {
            &self.payload
        }
    }
}

/// Result of a transaction, produced exactly once per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionResult {
    pub id: TransactionId,
    pub outcome: Outcome,
    /// Response data of reads and locks that completed.
    pub payload: Vec<u8>,
    pub timestamps: TransactionTimestamps,
    /// Generation captured at submission.
    pub generation: u32,
    pub timeout: Duration,
}

impl TransactionResult {
    pub fn is_complete(&self) -> bool {
        self.outcome.is_complete()
    }

    /// Response data, or the error matching an unsuccessful outcome.
    pub fn into_payload(self) -> Result<Vec<u8>, FwError> {
        match FwError::from_outcome(
            self.outcome,
            self.timeout.as_millis() as u64,
            self.generation,
        ) {
            None => Ok(self.payload),
            Some(err) => Err(err),
        }
    }

    /// First response quadlet (big-endian).
    pub fn quadlet(self) -> Result<u32, FwError> {
        let payload = self.into_payload()?;
        if payload.len() < QUADLET_SIZE {
            return Err(FwError::InvalidArgument(format!(
                "response of {} bytes holds no quadlet",
                payload.len()
            )));
        }
        Ok(BigEndian::read_u32(&payload))
    }
}

type Completion = Box<dyn FnOnce(TransactionResult) + Send>;

struct Pending {
    tcode: Tcode,
    destination: u16,
    offset: u64,
    length: usize,
    generation: u32,
    timeout: Duration,
    deadline: Instant,
    initiate: CycleTimestamp,
    sent: CycleTimestamp,
    on_complete: Completion,
}

/// Issues requests and matches their completions.
pub struct TransactionEngine {
    transport: Arc<dyn BusTransport>,
    tracker: Arc<GenerationTracker>,
    clock: Arc<CycleClock>,
    outbox: Arc<Outbox>,
    pending: Mutex<HashMap<u64, Pending>>,
    next_id: AtomicU64,
    default_timeout: Duration,
    closed: AtomicBool,
}

impl TransactionEngine {
    pub(crate) fn new(
        transport: Arc<dyn BusTransport>,
        tracker: Arc<GenerationTracker>,
        clock: Arc<CycleClock>,
        outbox: Arc<Outbox>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            tracker,
            clock,
            outbox,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            default_timeout,
            closed: AtomicBool::new(false),
        }
    }

    /// Refuse further submissions. Requests already accepted stay pending
    /// until resolved.
    pub(crate) fn close(&self) {
        let _pending = lock(&self.pending);
        self.closed.store(true, Ordering::Release);
    }

    /// Check if the engine still accepts submissions.
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Number of transactions awaiting completion.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Submit without blocking; `on_complete` receives the result.
    ///
    /// Validation failures, a pinned generation that is no longer current,
    /// an identical request already in flight, submission after the
    /// dispatcher stopped, and transport refusals are reported synchronously.
    #[instrument(skip(self, request, on_complete), fields(
        tcode = %request.tcode,
        dest = %format!("{:04X}", request.destination),
        offset = %format!("0x{:012X}", request.offset),
    ))]
    pub fn submit_with<F>(
        &self,
        request: TransactionRequest,
        on_complete: F,
    ) -> Result<TransactionId, FwError>
    where
        F: FnOnce(TransactionResult) + Send + 'static,
    {
        request.validate()?;

        // The generation is captured once; the node ID is only valid for it.
        let current = self.tracker.current_generation();
        let generation = match request.generation {
            Some(pinned) if pinned != current => {
                debug!(pinned, current, "Request for a past generation refused");
                return Err(FwError::BusReset {
                    generation: current,
                });
            }
            Some(pinned) => pinned,
            None => current,
        };
        let initiate = self.clock.sample()?;
        let timeout = request.timeout.unwrap_or(self.default_timeout);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        {
            let mut pending = lock(&self.pending);
            if self.closed.load(Ordering::Acquire) {
                return Err(FwError::InvalidState {
                    state: DispatcherState::Stopped,
                    action: "submit",
                });
            }
            let busy = pending.values().any(|p| {
                p.destination == request.destination
                    && p.offset == request.offset
                    && p.generation == generation
            });
            if busy {
                return Err(FwError::InFlight {
                    node: request.destination,
                    offset: request.offset,
                });
            }
            pending.insert(
                id,
                Pending {
                    tcode: request.tcode,
                    destination: request.destination,
                    offset: request.offset,
                    length: request.length,
                    generation,
                    timeout,
                    deadline: Instant::now() + timeout,
                    initiate,
                    sent: initiate,
                    on_complete: Box::new(on_complete),
                },
            );
        }

        let outbound = OutboundRequest {
            closure: id,
            tcode: request.tcode,
            destination: request.destination,
            offset: request.offset,
            generation,
            data: request.data(),
            length: request.length,
        };
        if let Err(e) = self.transport.send_request(&outbound) {
            lock(&self.pending).remove(&id);
            warn!(error = %e, "Send request failed");
            return Err(e.into());
        }

        let sent = self.clock.sample_or_last();
        if let Some(p) = lock(&self.pending).get_mut(&id) {
            p.sent = sent;
        }
        trace!(id, generation, "Request dispatched");
        Ok(TransactionId(id))
    }

    /// Submit and wait for the result.
    ///
    /// Returns within the request timeout even when no dispatcher is running.
    pub fn submit(&self, request: TransactionRequest) -> Result<TransactionResult, FwError> {
        if on_dispatch_thread() {
            return Err(FwError::WouldBlockDispatcher);
        }
        let timeout = request.timeout.unwrap_or(self.default_timeout);
        let (tx, rx) = mpsc::channel();
        let id = self.submit_with(request, move |result| {
            let _ = tx.send(result);
        })?;

        match rx.recv_timeout(timeout) {
            Ok(result) => Ok(result),
            Err(RecvTimeoutError::Timeout) => {
                self.expire_one(id);
                rx.recv().map_err(|_| FwError::Cancelled)
            }
            Err(RecvTimeoutError::Disconnected) => Err(FwError::Cancelled),
        }
    }

    pub fn read_quadlet(&self, destination: u16, offset: u64) -> Result<u32, FwError> {
        self.submit(TransactionRequest::read_quadlet(destination, offset))?
            .quadlet()
    }

    pub fn read_block(
        &self,
        destination: u16,
        offset: u64,
        length: usize,
    ) -> Result<Vec<u8>, FwError> {
        self.submit(TransactionRequest::read_block(destination, offset, length))?
            .into_payload()
    }

    pub fn write_quadlet(&self, destination: u16, offset: u64, value: u32) -> Result<(), FwError> {
        self.submit(TransactionRequest::write_quadlet(destination, offset, value))?
            .into_payload()
            .map(|_| ())
    }

    pub fn write_block(&self, destination: u16, offset: u64, data: Vec<u8>) -> Result<(), FwError> {
        self.submit(TransactionRequest::write_block(destination, offset, data))?
            .into_payload()
            .map(|_| ())
    }

    /// Returns the previous value; the swap happened if it equals `expected`.
    pub fn compare_swap(
        &self,
        destination: u16,
        offset: u64,
        expected: u32,
        new: u32,
    ) -> Result<u32, FwError> {
        self.submit(TransactionRequest::compare_swap(
            destination,
            offset,
            expected,
            new,
        ))?
        .quadlet()
    }

    /// Resolve the transaction a response event belongs to.
    pub(crate) fn complete(
        &self,
        closure: u64,
        rcode: Rcode,
        payload: Vec<u8>,
        request_tstamp: Option<u16>,
        response_tstamp: Option<u16>,
    ) {
        let Some(pending) = lock(&self.pending).remove(&closure) else {
            debug!(closure, rcode = %rcode, "Response for unknown or resolved transaction");
            return;
        };

        // Reference first, so both ticks lie before it.
        let finish = self.clock.sample_or_last();
        let sent = request_tstamp.and_then(|t| self.clock.convert(t).ok());
        let received = response_tstamp
            .and_then(|t| self.clock.convert(t).ok())
            .or(Some(finish));

        let mut outcome = Outcome::from(rcode);
        if outcome.is_complete() && !self.tracker.is_current(pending.generation) {
            outcome = Outcome::BusReset;
        }
        let payload = if outcome.is_complete() && pending.tcode.has_response_payload() {
            payload
        } else {
            Vec::new()
        };

        self.deliver(
            closure,
            pending,
            outcome,
            payload,
            sent,
            received,
            finish,
        );
    }

    /// Fail transactions whose generation is no longer current.
    pub(crate) fn fail_stale(&self, current_generation: u32) -> usize {
        self.fail_where(Outcome::BusReset, |p| p.generation != current_generation)
    }

    /// Fail every pending transaction with `outcome`.
    pub(crate) fn fail_all(&self, outcome: Outcome) -> usize {
        self.fail_where(outcome, |_| true)
    }

    /// Time out transactions whose deadline has passed.
    pub(crate) fn expire(&self, now: Instant) -> usize {
        self.fail_where(Outcome::Timeout, |p| p.deadline <= now)
    }

    fn expire_one(&self, id: TransactionId) {
        let Some(pending) = lock(&self.pending).remove(&id.0) else {
            return;
        };
        let finish = self.clock.sample_or_last();
        self.deliver(
            id.0,
            pending,
            Outcome::Timeout,
            Vec::new(),
            None,
            None,
            finish,
        );
    }

    fn fail_where(&self, outcome: Outcome, predicate: impl Fn(&Pending) -> bool) -> usize {
        let failed: Vec<(u64, Pending)> = {
            let mut pending = lock(&self.pending);
            let ids: Vec<u64> = pending
                .iter()
                .filter(|(_, p)| predicate(p))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|p| (id, p)))
                .collect()
        };
        if failed.is_empty() {
            return 0;
        }

        let finish = self.clock.sample_or_last();
        let count = failed.len();
        for (id, pending) in failed {
            self.deliver(
                id,
                pending,
                outcome,
                Vec::new(),
                None,
                None,
                finish,
            );
        }
        debug!(count, outcome = %outcome, "Pending transactions resolved");
        count
    }

    fn deliver(
        &self,
        id: u64,
        pending: Pending,
        outcome: Outcome,
        mut payload: Vec<u8>,
        sent: Option<CycleTimestamp>,
        received: Option<CycleTimestamp>,
        finish: CycleTimestamp,
    ) {
        let timestamps = TransactionTimestamps {
            initiate: pending.initiate,
            sent: sent.unwrap_or(pending.sent),
            received,
            finish,
        };
        payload.truncate(pending.length);

        self.outbox.push(BusEvent::TransactionComplete {
            id: TransactionId(id),
            tcode: pending.tcode,
            destination: pending.destination,
            offset: pending.offset,
            outcome,
            timestamps,
        });

        let result = TransactionResult {
            id: TransactionId(id),
            outcome,
            payload,
            timestamps,
            generation: pending.generation,
            timeout: pending.timeout,
        };
        let on_complete = pending.on_complete;
        if catch_unwind(AssertUnwindSafe(move || on_complete(result))).is_err() {
            error!(id, "Completion callback panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{SimBus, SimNode, TransportEvent};

    const REMOTE: u16 = 0xFFC1;

    struct Fixture {
        bus: Arc<SimBus>,
        tracker: Arc<GenerationTracker>,
        outbox: Arc<Outbox>,
        engine: TransactionEngine,
    }

    fn fixture(node: SimNode) -> Fixture {
        let bus = Arc::new(SimBus::new());
        bus.add_node(REMOTE, node);
        let tracker = Arc::new(GenerationTracker::new(bus.node_info().unwrap()));
        let clock = Arc::new(CycleClock::new(bus.clone()));
        let outbox = Arc::new(Outbox::default());
        let engine = TransactionEngine::new(
            bus.clone(),
            tracker.clone(),
            clock,
            outbox.clone(),
            Duration::from_millis(50),
        );
        Fixture {
            bus,
            tracker,
            outbox,
            engine,
        }
    }

    fn pump(f: &Fixture) {
        while let Some(event) = f.bus.next_event(Duration::ZERO).unwrap() {
            match event {
                TransportEvent::Response {
                    closure,
                    rcode,
                    payload,
                    request_tstamp,
                    response_tstamp,
                } => f
                    .engine
                    .complete(closure, rcode, payload, request_tstamp, response_tstamp),
                TransportEvent::BusReset(snapshot) => {
                    if let Some(s) = f.tracker.on_bus_reset(snapshot) {
                        f.engine.fail_stale(s.generation);
                    }
                }
                _ => {}
            }
        }
    }

    fn collect(f: &Fixture, request: TransactionRequest) -> mpsc::Receiver<TransactionResult> {
        let (tx, rx) = mpsc::channel();
        f.engine
            .submit_with(request, move |result| {
                let _ = tx.send(result);
            })
            .unwrap();
        rx
    }

    #[test]
    fn test_validate_lengths() {
        assert!(TransactionRequest::read_quadlet(REMOTE, 0x100).validate().is_ok());
        let mut bad = TransactionRequest::read_quadlet(REMOTE, 0x100);
        bad.length = 8;
        assert!(bad.validate().is_err());

        let mut short = TransactionRequest::write_quadlet(REMOTE, 0x100, 1);
        short.payload.truncate(2);
        assert!(short.validate().is_err());

        assert!(TransactionRequest::read_block(REMOTE, 0x101, 3).validate().is_ok());
        assert!(TransactionRequest::read_block(REMOTE, 0x100, 0).validate().is_err());
        assert!(
            TransactionRequest::read_block(REMOTE, 0x100, MAX_BLOCK_PAYLOAD + 1)
                .validate()
                .is_err()
        );
        assert!(
            TransactionRequest::write_block(REMOTE, 0x100, Vec::new())
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_validate_addressing() {
        assert!(TransactionRequest::read_quadlet(REMOTE, 0x102).validate().is_err());
        assert!(
            TransactionRequest::read_quadlet(REMOTE, OFFSET_SPACE_END)
                .validate()
                .is_err()
        );
        assert!(
            TransactionRequest::read_block(REMOTE, OFFSET_SPACE_END - 4, 8)
                .validate()
                .is_err()
        );
        let mut response = TransactionRequest::read_quadlet(REMOTE, 0);
        response.tcode = Tcode::ReadQuadletResponse;
        assert!(response.validate().is_err());
    }

    #[test]
    fn test_validate_huge_length_is_rejected() {
        assert!(matches!(
            TransactionRequest::read_block(REMOTE, 0x100, usize::MAX).validate(),
            Err(FwError::InvalidArgument(_))
        ));
        let mut write = TransactionRequest::write_block(REMOTE, OFFSET_SPACE_END - 4, vec![0; 4]);
        write.length = usize::MAX;
        assert!(matches!(write.validate(), Err(FwError::InvalidArgument(_))));
    }

    #[test]
    fn test_validate_lock_operands() {
        assert!(TransactionRequest::compare_swap(REMOTE, 0, 1, 2).validate().is_ok());
        let fetch_add = TransactionRequest::lock(REMOTE, 0, Tcode::LockFetchAdd, vec![0; 8]);
        assert_eq!(fetch_add.length, 8);
        assert!(fetch_add.validate().is_ok());
        let odd = TransactionRequest::lock(REMOTE, 0, Tcode::LockMaskSwap, vec![0; 12]);
        assert!(odd.validate().is_err());
        let wide = TransactionRequest::lock(REMOTE, 0, Tcode::LockWrapAdd, vec![0; 16]);
        assert_eq!(wide.length, 8);
        assert!(wide.validate().is_ok());
    }

    #[test]
    fn test_rcode_to_outcome() {
        assert_eq!(Outcome::from(Rcode::Generation), Outcome::BusReset);
        assert_eq!(Outcome::from(Rcode::AddressError), Outcome::AddressError);
        assert!(Outcome::TypeError.is_remote_error());
        assert!(!Outcome::Timeout.is_remote_error());
    }

    #[test]
    fn test_read_completes_with_ordered_timestamps() {
        let f = fixture(SimNode::new().with_quadlet(0x400, 0x0404_ABCD));
        let rx = collect(&f, TransactionRequest::read_quadlet(REMOTE, 0x400));
        pump(&f);
        let result = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(result.outcome, Outcome::Complete);
        let ts = result.timestamps;
        let received = ts.received.unwrap();
        assert!(ts.initiate <= ts.sent, "{ts:?}");
        assert!(ts.sent <= received, "{ts:?}");
        assert!(received <= ts.finish, "{ts:?}");
        assert_eq!(result.quadlet().unwrap(), 0x0404_ABCD);
        assert_eq!(f.engine.pending_count(), 0);
        assert!(matches!(
            f.outbox.drain().as_slice(),
            [BusEvent::TransactionComplete {
                outcome: Outcome::Complete,
                ..
            }]
        ));
    }

    #[test]
    fn test_remote_error_surfaces() {
        let f = fixture(SimNode::new());
        let rx = collect(&f, TransactionRequest::read_quadlet(REMOTE, 0x400));
        pump(&f);
        let result = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(result.outcome, Outcome::AddressError);
        assert!(result.payload.is_empty());
        assert!(matches!(
            result.into_payload(),
            Err(FwError::RemoteError(Outcome::AddressError))
        ));
    }

    #[test]
    fn test_duplicate_target_in_flight() {
        let f = fixture(SimNode::new().silent());
        let _rx = collect(&f, TransactionRequest::read_quadlet(REMOTE, 0x400));
        let err = f
            .engine
            .submit_with(TransactionRequest::read_quadlet(REMOTE, 0x400), |_| {})
            .unwrap_err();
        assert!(matches!(err, FwError::InFlight { node: REMOTE, offset: 0x400 }));
        // A different offset is independent.
        let _other = collect(&f, TransactionRequest::read_quadlet(REMOTE, 0x404));
        assert_eq!(f.engine.pending_count(), 2);
    }

    #[test]
    fn test_expire_times_out() {
        let f = fixture(SimNode::new().silent());
        let rx = collect(&f, TransactionRequest::read_quadlet(REMOTE, 0x400));
        assert_eq!(f.engine.expire(Instant::now()), 0);
        assert_eq!(f.engine.expire(Instant::now() + Duration::from_millis(60)), 1);
        let result = rx.try_recv().unwrap();
        assert_eq!(result.outcome, Outcome::Timeout);
        assert!(result.timestamps.received.is_none());
        assert!(matches!(
            result.into_payload(),
            Err(FwError::Timeout { timeout_ms: 50 })
        ));
    }

    #[test]
    fn test_blocking_submit_times_out_without_dispatcher() {
        let f = fixture(SimNode::new().silent());
        let started = Instant::now();
        let result = f
            .engine
            .submit(
                TransactionRequest::read_quadlet(REMOTE, 0x400)
                    .with_timeout(Duration::from_millis(30)),
            )
            .unwrap();
        assert_eq!(result.outcome, Outcome::Timeout);
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_bus_reset_fails_pending() {
        let f = fixture(SimNode::new().silent());
        let rx = collect(&f, TransactionRequest::read_quadlet(REMOTE, 0x400));
        f.bus.bus_reset();
        pump(&f);
        assert_eq!(rx.try_recv().unwrap().outcome, Outcome::BusReset);
    }

    #[test]
    fn test_stale_generation_response_is_bus_reset() {
        let f = fixture(SimNode::new().with_quadlet(0x400, 1));
        // The transport moved on before the request was sent.
        f.bus.bus_reset();
        let rx = collect(&f, TransactionRequest::read_quadlet(REMOTE, 0x400));
        pump(&f);
        assert_eq!(rx.try_recv().unwrap().outcome, Outcome::BusReset);
    }

    #[test]
    fn test_fail_all_cancels() {
        let f = fixture(SimNode::new().silent());
        let a = collect(&f, TransactionRequest::read_quadlet(REMOTE, 0x400));
        let b = collect(&f, TransactionRequest::read_quadlet(REMOTE, 0x404));
        assert_eq!(f.engine.fail_all(Outcome::Cancelled), 2);
        assert_eq!(a.try_recv().unwrap().outcome, Outcome::Cancelled);
        assert_eq!(b.try_recv().unwrap().outcome, Outcome::Cancelled);
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let f = fixture(SimNode::new().with_quadlet(0x400, 1));
        f.engine
            .submit_with(TransactionRequest::read_quadlet(REMOTE, 0x400), |result| {
                if result.is_complete() {
                    panic!("callback bug");
                }
            })
            .unwrap();
        pump(&f);
        assert_eq!(f.engine.pending_count(), 0);
        let rx = collect(&f, TransactionRequest::read_quadlet(REMOTE, 0x400));
        pump(&f);
        assert!(rx.try_recv().unwrap().is_complete());
    }

    #[test]
    fn test_closed_engine_refuses_submissions() {
        let f = fixture(SimNode::new().with_quadlet(0x400, 7));
        let accepted = collect(&f, TransactionRequest::read_quadlet(REMOTE, 0x400));
        f.engine.close();
        assert!(!f.engine.is_open());

        let err = f
            .engine
            .submit_with(TransactionRequest::read_quadlet(REMOTE, 0x404), |_| {})
            .unwrap_err();
        assert!(matches!(err, FwError::InvalidState { action: "submit", .. }));
        let err = f
            .engine
            .submit(TransactionRequest::read_quadlet(REMOTE, 0x404))
            .unwrap_err();
        assert!(matches!(err, FwError::InvalidState { action: "submit", .. }));
        assert_eq!(f.bus.sent_requests().len(), 1);

        // Work accepted before closing still resolves.
        pump(&f);
        assert_eq!(accepted.try_recv().unwrap().quadlet().unwrap(), 7);
        assert_eq!(f.engine.pending_count(), 0);
    }

    #[test]
    fn test_past_generation_is_not_sent() {
        let f = fixture(SimNode::new().with_quadlet(0x400, 7));
        let generation = f.tracker.current_generation();
        f.bus.bus_reset();
        pump(&f);

        let err = f
            .engine
            .submit_with(
                TransactionRequest::read_quadlet(REMOTE, 0x400).with_generation(generation),
                |_| {},
            )
            .unwrap_err();
        assert!(matches!(err, FwError::BusReset { generation: 2 }));
        assert!(f.bus.sent_requests().is_empty());
        assert_eq!(f.engine.pending_count(), 0);
    }

    #[test]
    fn test_pinned_generation_rejected_by_transport() {
        // The tracker has not seen the reset yet; the controller has.
        let f = fixture(SimNode::new().with_quadlet(0x400, 7));
        let generation = f.tracker.current_generation();
        f.bus.bus_reset();

        let rx = collect(
            &f,
            TransactionRequest::write_quadlet(REMOTE, 0x400, 9).with_generation(generation),
        );
        pump(&f);
        assert_eq!(rx.try_recv().unwrap().outcome, Outcome::BusReset);
        assert_eq!(f.bus.sent_requests()[0].generation, generation);
        assert_eq!(f.bus.node_memory(REMOTE, 0x400, 4), Some(vec![0, 0, 0, 7]));
    }

    #[test]
    fn test_compare_swap_returns_old_value() {
        let f = fixture(SimNode::new().with_quadlet(0x800, 7));
        let rx = collect(&f, TransactionRequest::compare_swap(REMOTE, 0x800, 7, 9));
        pump(&f);
        assert_eq!(rx.try_recv().unwrap().quadlet().unwrap(), 7);
        assert_eq!(f.bus.node_memory(REMOTE, 0x800, 4), Some(vec![0, 0, 0, 9]));
    }
}
