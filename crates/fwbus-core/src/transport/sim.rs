//! Simulated bus for testing and demos.
//!
//! One local controller plus any number of remote nodes backed by byte
//! memory. Requests are answered immediately on the event queue, the cycle
//! timer runs off the host monotonic clock, and requests to the local node
//! loop back as inbound requests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use tracing::{debug, trace};

use super::traits::{BusTransport, InboundRequest, OutboundRequest, TransportError, TransportEvent};
use crate::cycle_time::{CycleTime, tstamp_of};
use crate::node::NodeSnapshot;
use crate::protocol::constants::*;
use crate::protocol::{ConfigRom, Rcode, Tcode};
use crate::sync::{lock, wait_timeout};

/// GUID of the simulated local controller.
pub const SIM_GUID: u64 = 0x0001_F200_00C0_FFEE;
/// Vendor and model IDs written into the simulated configuration ROM.
pub const SIM_VENDOR_ID: u32 = 0x00_01F2;
pub const SIM_MODEL_ID: u32 = 0x00_1394;

const NANOS_PER_CYCLE: u128 = 125_000;

/// Produces FCP response frames for one command frame.
pub type FcpResponder = Arc<dyn Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync>;

/// Behaviour of a simulated remote node.
#[derive(Clone, Default)]
pub struct SimNode {
    memory: BTreeMap<u64, u8>,
    silent: bool,
    rcode: Option<Rcode>,
    fcp: Option<FcpResponder>,
}

impl SimNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quadlet(self, offset: u64, value: u32) -> Self {
        self.with_block(offset, &value.to_be_bytes())
    }

    pub fn with_block(mut self, offset: u64, data: &[u8]) -> Self {
        for (i, byte) in data.iter().enumerate() {
            self.memory.insert(offset + i as u64, *byte);
        }
        self
    }

    /// Never answer; requests stay pending until they time out.
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    /// Answer every request with `rcode`.
    pub fn with_rcode(mut self, rcode: Rcode) -> Self {
        self.rcode = Some(rcode);
        self
    }

    /// Accept FCP commands and answer with the frames `responder` returns.
    pub fn with_fcp<F>(mut self, responder: F) -> Self
    where
        F: Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync + 'static,
    {
        self.fcp = Some(Arc::new(responder));
        self
    }

    fn read(&self, offset: u64, length: usize) -> Option<Vec<u8>> {
        (0..length as u64)
            .map(|i| self.memory.get(&(offset + i)).copied())
            .collect()
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> bool {
        let mapped = (0..data.len() as u64).all(|i| self.memory.contains_key(&(offset + i)));
        if mapped {
            for (i, byte) in data.iter().enumerate() {
                self.memory.insert(offset + i as u64, *byte);
            }
        }
        mapped
    }
}

/// A request as it left the simulated controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentRequest {
    pub tcode: Tcode,
    pub destination: u16,
    pub offset: u64,
    pub generation: u32,
    pub data: Vec<u8>,
}

/// A response given to an inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentResponse {
    pub handle: u32,
    pub rcode: Rcode,
    pub payload: Vec<u8>,
}

struct Loopback {
    closure: u64,
    tcode: Tcode,
    request_tstamp: u16,
}

struct SimState {
    snapshot: NodeSnapshot,
    events: VecDeque<TransportEvent>,
    queued: u64,
    taken: u64,
    allocations: BTreeMap<u64, u64>,
    nodes: HashMap<u16, SimNode>,
    sent: Vec<SentRequest>,
    responses: Vec<SentResponse>,
    loopback: HashMap<u32, Loopback>,
    next_handle: u32,
    connected: bool,
}

impl SimState {
    fn queue(&mut self, event: TransportEvent) {
        self.events.push_back(event);
        self.queued += 1;
    }
}

/// In-memory bus transport.
pub struct SimBus {
    state: Mutex<SimState>,
    cond: Condvar,
    epoch: Instant,
}

enum Reply {
    None,
    Response(Rcode, Vec<u8>),
    Fcp(FcpResponder, Vec<u8>),
}

impl SimBus {
    /// Bus with the local node at `ffc0` and generation 1.
    pub fn new() -> Self {
        let snapshot = NodeSnapshot {
            node_id: LOCAL_BUS,
            local_node_id: LOCAL_BUS,
            root_node_id: LOCAL_BUS | 1,
            bus_manager_node_id: LOCAL_BUS | 1,
            ir_manager_node_id: LOCAL_BUS | 1,
            generation: 1,
            config_rom: ConfigRom::synthesize(SIM_GUID, SIM_VENDOR_ID, SIM_MODEL_ID).to_bytes(),
        };
        Self {
            state: Mutex::new(SimState {
                snapshot,
                events: VecDeque::new(),
                queued: 0,
                taken: 0,
                allocations: BTreeMap::new(),
                nodes: HashMap::new(),
                sent: Vec::new(),
                responses: Vec::new(),
                loopback: HashMap::new(),
                next_handle: 1,
                connected: true,
            }),
            cond: Condvar::new(),
            epoch: Instant::now(),
        }
    }

    /// Attach or replace a remote node.
    pub fn add_node(&self, node_id: u16, node: SimNode) {
        lock(&self.state).nodes.insert(node_id, node);
    }

    /// Detach a remote node; later requests to it get no ack.
    pub fn remove_node(&self, node_id: u16) {
        lock(&self.state).nodes.remove(&node_id);
    }

    /// Current contents of a remote node's memory.
    pub fn node_memory(&self, node_id: u16, offset: u64, length: usize) -> Option<Vec<u8>> {
        lock(&self.state).nodes.get(&node_id)?.read(offset, length)
    }

    /// Start a new generation and queue the bus reset event.
    pub fn bus_reset(&self) -> u32 {
        let mut state = lock(&self.state);
        state.snapshot.generation = state.snapshot.generation.wrapping_add(1);
        let snapshot = state.snapshot.clone();
        debug!(generation = snapshot.generation, "Simulated bus reset");
        state.queue(TransportEvent::BusReset(snapshot.clone()));
        self.cond.notify_all();
        snapshot.generation
    }

    /// Queue a bus reset event reporting `generation` without changing the bus.
    pub fn replay_bus_reset(&self, generation: u32) {
        let mut state = lock(&self.state);
        let mut snapshot = state.snapshot.clone();
        snapshot.generation = generation;
        state.queue(TransportEvent::BusReset(snapshot));
        self.cond.notify_all();
    }

    pub fn disconnect(&self) {
        let mut state = lock(&self.state);
        if state.connected {
            state.connected = false;
            state.queue(TransportEvent::Disconnected);
            self.cond.notify_all();
        }
    }

    /// Deliver a request from `source` to the local node, whether or not
    /// the addressed range is allocated. Returns the response handle.
    pub fn inject_request(&self, source: u16, tcode: Tcode, offset: u64, payload: &[u8]) -> u32 {
        let length = if tcode.is_read() {
            if tcode.is_quadlet() { QUADLET_SIZE } else { payload.len() }
        } else {
            payload.len()
        };
        let payload = if tcode.is_read() { Vec::new() } else { payload.to_vec() };
        self.inject_read_or_write(source, tcode, offset, length, payload)
    }

    /// Deliver a block read of `length` bytes from `source`.
    pub fn inject_read(&self, source: u16, offset: u64, length: usize) -> u32 {
        self.inject_read_or_write(source, Tcode::ReadBlockRequest, offset, length, Vec::new())
    }

    fn inject_read_or_write(
        &self,
        source: u16,
        tcode: Tcode,
        offset: u64,
        length: usize,
        payload: Vec<u8>,
    ) -> u32 {
        let tstamp = self.tick();
        let mut state = lock(&self.state);
        let handle = state.next_handle;
        state.next_handle = state.next_handle.wrapping_add(1);
        let request = InboundRequest {
            handle,
            tcode,
            offset,
            source,
            destination: state.snapshot.local_node_id,
            generation: state.snapshot.generation,
            length,
            payload,
            tstamp: Some(tstamp),
        };
        state.queue(TransportEvent::Request(request));
        self.cond.notify_all();
        handle
    }

    /// Requests sent so far.
    pub fn sent_requests(&self) -> Vec<SentRequest> {
        lock(&self.state).sent.clone()
    }

    /// Responses given to inbound requests so far.
    pub fn responses(&self) -> Vec<SentResponse> {
        lock(&self.state).responses.clone()
    }

    /// Wait until the response for `handle` is sent.
    pub fn wait_response(&self, handle: u32, timeout: Duration) -> Option<SentResponse> {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);
        loop {
            if let Some(resp) = state.responses.iter().find(|r| r.handle == handle) {
                return Some(resp.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = wait_timeout(&self.cond, state, deadline - now);
        }
    }

    /// Check if `[offset, offset + length)` is inside an allocation.
    pub fn is_allocated(&self, offset: u64, length: u64) -> bool {
        let state = lock(&self.state);
        state
            .allocations
            .range(..=offset)
            .next_back()
            .is_some_and(|(start, len)| offset + length <= start + len)
    }

    fn now(&self) -> CycleTime {
        let elapsed = self.epoch.elapsed();
        let nanos = elapsed.as_nanos();
        let cycles = nanos / NANOS_PER_CYCLE;
        let sec = (cycles / u128::from(CYCLES_PER_SEC)) as u32;
        let cycle = (cycles % u128::from(CYCLES_PER_SEC)) as u32;
        let offset = ((nanos % NANOS_PER_CYCLE) * u128::from(OFFSETS_PER_CYCLE) / NANOS_PER_CYCLE) as u32;
        CycleTime::from_fields(sec, cycle, offset, elapsed)
    }

    fn tick(&self) -> u16 {
        tstamp_of(&self.now())
    }

    fn execute(node: &mut SimNode, request: &OutboundRequest<'_>) -> Reply {
        if node.silent {
            return Reply::None;
        }
        if let Some(rcode) = node.rcode {
            return Reply::Response(rcode, Vec::new());
        }

        let tcode = request.tcode;
        if tcode.is_read() {
            return match node.read(request.offset, request.length) {
                Some(data) => Reply::Response(Rcode::Complete, data),
                None => Reply::Response(Rcode::AddressError, Vec::new()),
            };
        }
        if tcode.is_write() {
            if request.offset == FCP_COMMAND_ADDR {
                if let Some(fcp) = &node.fcp {
                    return Reply::Fcp(Arc::clone(fcp), request.data.to_vec());
                }
            }
            let rcode = if node.write(request.offset, request.data) {
                Rcode::Complete
            } else {
                Rcode::AddressError
            };
            return Reply::Response(rcode, Vec::new());
        }

        match lock_operation(tcode, request.data) {
            None => Reply::Response(Rcode::TypeError, Vec::new()),
            Some((size, op)) => match node.read(request.offset, size) {
                None => Reply::Response(Rcode::AddressError, Vec::new()),
                Some(old) => {
                    let new = op(&old);
                    node.write(request.offset, &new);
                    Reply::Response(Rcode::Complete, old)
                }
            },
        }
    }

    fn push_response(&self, closure: u64, rcode: Rcode, payload: Vec<u8>, request_tstamp: u16) {
        let response_tstamp = self.tick();
        let mut state = lock(&self.state);
        state.queue(TransportEvent::Response {
            closure,
            rcode,
            payload,
            request_tstamp: Some(request_tstamp),
            response_tstamp: Some(response_tstamp),
        });
        self.cond.notify_all();
    }

    fn push_fcp_responses(&self, source: u16, frames: Vec<Vec<u8>>) {
        for frame in frames {
            let length = frame.len() as u64;
            if !self.is_allocated(FCP_RESPONSE_ADDR, length) {
                debug!("FCP response dropped, response register not allocated");
                continue;
            }
            self.inject_read_or_write(
                source,
                Tcode::WriteBlockRequest,
                FCP_RESPONSE_ADDR,
                frame.len(),
                frame,
            );
        }
    }
}

impl Default for SimBus {
    fn default() -> Self {
        Self::new()
    }
}

type LockOp = Box<dyn Fn(&[u8]) -> Vec<u8>>;

/// Operand size and update function of an extended lock.
fn lock_operation(tcode: Tcode, operands: &[u8]) -> Option<(usize, LockOp)> {
    let size = if tcode.lock_has_argument() {
        operands.len() / 2
    } else {
        operands.len()
    };
    if !matches!(size, 4 | 8) {
        return None;
    }
    let (arg, data) = if tcode.lock_has_argument() {
        (be(&operands[..size]), operands[size..].to_vec())
    } else {
        (0, operands.to_vec())
    };
    let data_be = be(&data);
    let mask = if size == 4 { u64::from(u32::MAX) } else { u64::MAX };
    let encode = move |v: u64| -> Vec<u8> {
        let mut buf = vec![0; size];
        if size == 4 {
            BigEndian::write_u32(&mut buf, v as u32);
        } else {
            BigEndian::write_u64(&mut buf, v);
        }
        buf
    };

    let op: LockOp = match tcode {
        Tcode::LockMaskSwap => Box::new(move |old| encode((data_be & arg) | (be(old) & !arg))),
        Tcode::LockCompareSwap => Box::new(move |old| {
            let old = be(old);
            encode(if old == arg { data_be } else { old })
        }),
        Tcode::LockFetchAdd => Box::new(move |old| encode(be(old).wrapping_add(data_be) & mask)),
        Tcode::LockLittleAdd => Box::new(move |old| {
            let mut buf = vec![0; size];
            if size == 4 {
                let sum = LittleEndian::read_u32(old).wrapping_add(LittleEndian::read_u32(&data));
                LittleEndian::write_u32(&mut buf, sum);
            } else {
                let sum = LittleEndian::read_u64(old).wrapping_add(LittleEndian::read_u64(&data));
                LittleEndian::write_u64(&mut buf, sum);
            }
            buf
        }),
        Tcode::LockBoundedAdd => Box::new(move |old| {
            let old = be(old);
            encode(if old != arg { old.wrapping_add(data_be) & mask } else { old })
        }),
        Tcode::LockWrapAdd => Box::new(move |old| {
            let old = be(old);
            encode(if old != arg { old.wrapping_add(data_be) & mask } else { data_be })
        }),
        _ => return None,
    };
    Some((size, op))
}

fn be(bytes: &[u8]) -> u64 {
    match bytes.len() {
        4 => u64::from(BigEndian::read_u32(bytes)),
        8 => BigEndian::read_u64(bytes),
        _ => 0,
    }
}

impl BusTransport for SimBus {
    fn node_info(&self) -> Result<NodeSnapshot, TransportError> {
        let state = lock(&self.state);
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        Ok(state.snapshot.clone())
    }

    fn send_request(&self, request: &OutboundRequest<'_>) -> Result<(), TransportError> {
        let request_tstamp = self.tick();
        let reply = {
            let mut state = lock(&self.state);
            if !state.connected {
                return Err(TransportError::Disconnected);
            }
            state.sent.push(SentRequest {
                tcode: request.tcode,
                destination: request.destination,
                offset: request.offset,
                generation: request.generation,
                data: request.data.to_vec(),
            });
            trace!(
                tcode = %request.tcode,
                dest = %format!("{:04X}", request.destination),
                offset = %format!("0x{:012X}", request.offset),
                "Simulated request"
            );

            if request.generation != state.snapshot.generation {
                Reply::Response(Rcode::Generation, Vec::new())
            } else if request.destination == state.snapshot.local_node_id {
                let handle = state.next_handle;
                state.next_handle = state.next_handle.wrapping_add(1);
                state.loopback.insert(
                    handle,
                    Loopback {
                        closure: request.closure,
                        tcode: request.tcode,
                        request_tstamp,
                    },
                );
                let inbound = InboundRequest {
                    handle,
                    tcode: request.tcode,
                    offset: request.offset,
                    source: state.snapshot.local_node_id,
                    destination: state.snapshot.local_node_id,
                    generation: state.snapshot.generation,
                    length: request.length,
                    payload: request.data.to_vec(),
                    tstamp: Some(request_tstamp),
                };
                state.queue(TransportEvent::Request(inbound));
                self.cond.notify_all();
                Reply::None
            } else {
                match state.nodes.get_mut(&request.destination) {
                    None => Reply::Response(Rcode::NoAck, Vec::new()),
                    Some(node) => Self::execute(node, request),
                }
            }
        };

        match reply {
            Reply::None => {}
            Reply::Response(rcode, payload) => {
                self.push_response(request.closure, rcode, payload, request_tstamp)
            }
            Reply::Fcp(responder, command) => {
                self.push_response(request.closure, Rcode::Complete, Vec::new(), request_tstamp);
                let frames = responder(&command);
                self.push_fcp_responses(request.destination, frames);
            }
        }
        Ok(())
    }

    fn send_response(&self, handle: u32, rcode: Rcode, payload: &[u8]) -> Result<(), TransportError> {
        let loopback = {
            let mut state = lock(&self.state);
            if !state.connected {
                return Err(TransportError::Disconnected);
            }
            state.responses.push(SentResponse {
                handle,
                rcode,
                payload: payload.to_vec(),
            });
            self.cond.notify_all();
            state.loopback.remove(&handle)
        };
        if let Some(lb) = loopback {
            let payload = if rcode == Rcode::Complete && lb.tcode.has_response_payload() {
                payload.to_vec()
            } else {
                Vec::new()
            };
            self.push_response(lb.closure, rcode, payload, lb.request_tstamp);
        }
        Ok(())
    }

    fn allocate(&self, offset: u64, length: u64) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        let end = offset + length;
        let clash = state
            .allocations
            .iter()
            .find(|&(&start, &len)| offset < start + len && start < end);
        if let Some((&start, &len)) = clash {
            return Err(TransportError::AllocateFailed {
                offset,
                length,
                reason: format!("overlaps 0x{:012X}+0x{:X}", start, len),
            });
        }
        state.allocations.insert(offset, length);
        Ok(())
    }

    fn deallocate(&self, offset: u64) -> Result<(), TransportError> {
        match lock(&self.state).allocations.remove(&offset) {
            Some(_) => Ok(()),
            None => Err(TransportError::NotAllocated { offset }),
        }
    }

    fn read_cycle_time(&self) -> Result<CycleTime, TransportError> {
        if !lock(&self.state).connected {
            return Err(TransportError::ClockRead("controller disconnected".into()));
        }
        Ok(self.now())
    }

    fn next_event(&self, timeout: Duration) -> Result<Option<TransportEvent>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);
        loop {
            if let Some(event) = state.events.pop_front() {
                state.taken += 1;
                return Ok(Some(event));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            state = wait_timeout(&self.cond, state, deadline - now);
        }
    }

    fn events_queued(&self) -> u64 {
        lock(&self.state).queued
    }

    fn events_taken(&self) -> u64 {
        lock(&self.state).taken
    }

    fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }
}
