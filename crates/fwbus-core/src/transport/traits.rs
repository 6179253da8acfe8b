//! Bus transport layer abstraction.
//!
//! Defines the `BusTransport` trait: the contract of one local controller
//! node as exposed by the kernel (request submission, address allocation,
//! responses, cycle timer, and an event stream), allowing different
//! implementations (simulated bus, character device, ...).

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::cycle_time::CycleTime;
use crate::node::NodeSnapshot;
use crate::protocol::{Rcode, Tcode};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("Not a character device: {}", path.display())]
    NotCharDevice { path: PathBuf },

    #[error("Not a FireWire character device: {}", path.display())]
    NotFirewire { path: PathBuf },

    #[error("Send request failed: {0}")]
    SendFailed(String),

    #[error("Send response failed: {0}")]
    RespondFailed(String),

    #[error("Allocation of 0x{offset:012X}+0x{length:X} failed: {reason}")]
    AllocateFailed {
        offset: u64,
        length: u64,
        reason: String,
    },

    #[error("No allocation at 0x{offset:012X}")]
    NotAllocated { offset: u64 },

    #[error("Cycle timer read failed: {0}")]
    ClockRead(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// An asynchronous request handed to the controller.
#[derive(Debug, Clone, Copy)]
pub struct OutboundRequest<'a> {
    /// Opaque value echoed back in the matching `TransportEvent::Response`.
    pub closure: u64,
    pub tcode: Tcode,
    pub destination: u16,
    pub offset: u64,
    /// Generation the destination node ID is valid for.
    pub generation: u32,
    /// Outgoing data (write/lock operands); empty for reads.
    pub data: &'a [u8],
    /// Bytes expected back for reads, bytes sent otherwise.
    pub length: usize,
}

/// A request from another node against locally allocated address space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRequest {
    /// Handle to quote in the response.
    pub handle: u32,
    pub tcode: Tcode,
    pub offset: u64,
    pub source: u16,
    pub destination: u16,
    pub generation: u32,
    /// Bytes addressed by the request; reads carry no payload.
    pub length: usize,
    pub payload: Vec<u8>,
    /// 16-bit cycle timestamp of packet arrival, when known.
    pub tstamp: Option<u16>,
}

impl InboundRequest {
    /// Check if `[offset, offset + length)` lies inside `[start, end)`.
    pub fn within(&self, start: u64, end: u64) -> bool {
        self.offset >= start && self.offset + self.length as u64 <= end
    }
}

/// Events produced by the controller, consumed by the dispatcher.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Bus reset with the topology that resulted from it.
    BusReset(NodeSnapshot),
    /// Completion of an outbound request.
    Response {
        closure: u64,
        rcode: Rcode,
        payload: Vec<u8>,
        /// Cycle timestamp at which the request left the controller.
        request_tstamp: Option<u16>,
        /// Cycle timestamp at which the response (or ack) arrived.
        response_tstamp: Option<u16>,
    },
    /// Inbound request against an allocated region.
    Request(InboundRequest),
    /// The controller went away.
    Disconnected,
}

/// Abstract bus transport interface.
///
/// This trait enables:
/// - The simulated in-memory bus used by tests and the demo
/// - A character-device backend
/// - Future alternative backends
pub trait BusTransport: Send + Sync {
    /// Current topology of the local node.
    fn node_info(&self) -> Result<NodeSnapshot, TransportError>;

    /// Queue an asynchronous request; completion arrives as an event.
    fn send_request(&self, request: &OutboundRequest<'_>) -> Result<(), TransportError>;

    /// Answer an inbound request.
    fn send_response(&self, handle: u32, rcode: Rcode, payload: &[u8])
    -> Result<(), TransportError>;

    /// Reserve `[offset, offset + length)` of local address space.
    fn allocate(&self, offset: u64, length: u64) -> Result<(), TransportError>;

    /// Release a reservation made by `allocate`.
    fn deallocate(&self, offset: u64) -> Result<(), TransportError>;

    /// Read the cycle timer of the controller.
    fn read_cycle_time(&self) -> Result<CycleTime, TransportError>;

    /// Wait up to `timeout` for the next event.
    fn next_event(&self, timeout: Duration) -> Result<Option<TransportEvent>, TransportError>;

    /// Number of events queued since the transport was opened.
    fn events_queued(&self) -> u64;

    /// Number of events handed out by `next_event`.
    fn events_taken(&self) -> u64;

    /// Check if the controller is still present.
    fn is_connected(&self) -> bool;
}
