//! Error taxonomy of the bus layer.

use std::path::PathBuf;

use thiserror::Error;

use crate::dispatcher::DispatcherState;
use crate::transaction::Outcome;
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum FwError {
    #[error("Invalid target {}: {reason}", path.display())]
    InvalidTarget { path: PathBuf, reason: String },

    #[error(
        "Region 0x{start:012X}..0x{end:012X} overlaps reserved 0x{existing_start:012X}..0x{existing_end:012X}"
    )]
    AddressConflict {
        start: u64,
        end: u64,
        existing_start: u64,
        existing_end: u64,
    },

    #[error("No region reserved at 0x{start:012X}")]
    RegionNotReserved { start: u64 },

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Bus reset while pending (generation {generation})")]
    BusReset { generation: u32 },

    #[error("FCP exchange already pending for node {node:04X}")]
    Busy { node: u16 },

    #[error("Transaction already in flight to {node:04X}:0x{offset:012X}")]
    InFlight { node: u16, offset: u64 },

    #[error("Cycle clock unavailable: {0}")]
    ClockUnavailable(String),

    #[error("Remote node answered {0}")]
    RemoteError(Outcome),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Dispatcher is {state}, cannot {action}")]
    InvalidState {
        state: DispatcherState,
        action: &'static str,
    },

    #[error("Blocking call on the dispatcher thread would deadlock")]
    WouldBlockDispatcher,

    #[error("Transport error: {0}")]
    Transport(TransportError),
}

impl From<TransportError> for FwError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotFound { path } => FwError::InvalidTarget {
                path,
                reason: "does not exist".into(),
            },
            TransportError::NotCharDevice { path } => FwError::InvalidTarget {
                path,
                reason: "is not a character device".into(),
            },
            TransportError::NotFirewire { path } => FwError::InvalidTarget {
                path,
                reason: "is not a FireWire character device".into(),
            },
            TransportError::ClockRead(msg) => FwError::ClockUnavailable(msg),
            other => FwError::Transport(other),
        }
    }
}

impl FwError {
    /// Error for an unsuccessful transaction outcome, `None` on success.
    pub fn from_outcome(outcome: Outcome, timeout_ms: u64, generation: u32) -> Option<Self> {
        match outcome {
            Outcome::Complete => None,
            Outcome::Timeout => Some(FwError::Timeout { timeout_ms }),
            Outcome::BusReset => Some(FwError::BusReset { generation }),
            Outcome::Cancelled => Some(FwError::Cancelled),
            other => Some(FwError::RemoteError(other)),
        }
    }
}
