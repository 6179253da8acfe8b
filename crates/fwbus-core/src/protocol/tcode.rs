//! Transaction codes of asynchronous packets.
//!
//! The lock variants use the extended tcode numbering of the Linux
//! character-device ABI, so a `Tcode` converts losslessly to and from the
//! value carried in `fw_cdev_send_request`.

use std::fmt;

use super::constants::*;

/// Transaction code of an asynchronous request or response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tcode {
    WriteQuadletRequest,
    WriteBlockRequest,
    WriteResponse,
    ReadQuadletRequest,
    ReadBlockRequest,
    ReadQuadletResponse,
    ReadBlockResponse,
    CycleStart,
    LockRequest,
    StreamData,
    LockResponse,
    LockMaskSwap,
    LockCompareSwap,
    LockFetchAdd,
    LockLittleAdd,
    LockBoundedAdd,
    LockWrapAdd,
    LockVendorDependent,
}

impl Tcode {
    /// Raw value as used by the kernel ABI.
    pub const fn value(self) -> u8 {
        match self {
            Tcode::WriteQuadletRequest => TCODE_WRITE_QUADLET_REQUEST,
            Tcode::WriteBlockRequest => TCODE_WRITE_BLOCK_REQUEST,
            Tcode::WriteResponse => TCODE_WRITE_RESPONSE,
            Tcode::ReadQuadletRequest => TCODE_READ_QUADLET_REQUEST,
            Tcode::ReadBlockRequest => TCODE_READ_BLOCK_REQUEST,
            Tcode::ReadQuadletResponse => TCODE_READ_QUADLET_RESPONSE,
            Tcode::ReadBlockResponse => TCODE_READ_BLOCK_RESPONSE,
            Tcode::CycleStart => TCODE_CYCLE_START,
            Tcode::LockRequest => TCODE_LOCK_REQUEST,
            Tcode::StreamData => TCODE_STREAM_DATA,
            Tcode::LockResponse => TCODE_LOCK_RESPONSE,
            Tcode::LockMaskSwap => TCODE_LOCK_MASK_SWAP,
            Tcode::LockCompareSwap => TCODE_LOCK_COMPARE_SWAP,
            Tcode::LockFetchAdd => TCODE_LOCK_FETCH_ADD,
            Tcode::LockLittleAdd => TCODE_LOCK_LITTLE_ADD,
            Tcode::LockBoundedAdd => TCODE_LOCK_BOUNDED_ADD,
            Tcode::LockWrapAdd => TCODE_LOCK_WRAP_ADD,
            Tcode::LockVendorDependent => TCODE_LOCK_VENDOR_DEPENDENT,
        }
    }

    /// Parse a raw kernel value.
    pub fn from_value(value: u8) -> Option<Self> {
        let tcode = match value {
            TCODE_WRITE_QUADLET_REQUEST => Tcode::WriteQuadletRequest,
            TCODE_WRITE_BLOCK_REQUEST => Tcode::WriteBlockRequest,
            TCODE_WRITE_RESPONSE => Tcode::WriteResponse,
            TCODE_READ_QUADLET_REQUEST => Tcode::ReadQuadletRequest,
            TCODE_READ_BLOCK_REQUEST => Tcode::ReadBlockRequest,
            TCODE_READ_QUADLET_RESPONSE => Tcode::ReadQuadletResponse,
            TCODE_READ_BLOCK_RESPONSE => Tcode::ReadBlockResponse,
            TCODE_CYCLE_START => Tcode::CycleStart,
            TCODE_LOCK_REQUEST => Tcode::LockRequest,
            TCODE_STREAM_DATA => Tcode::StreamData,
            TCODE_LOCK_RESPONSE => Tcode::LockResponse,
            TCODE_LOCK_MASK_SWAP => Tcode::LockMaskSwap,
            TCODE_LOCK_COMPARE_SWAP => Tcode::LockCompareSwap,
            TCODE_LOCK_FETCH_ADD => Tcode::LockFetchAdd,
            TCODE_LOCK_LITTLE_ADD => Tcode::LockLittleAdd,
            TCODE_LOCK_BOUNDED_ADD => Tcode::LockBoundedAdd,
            TCODE_LOCK_WRAP_ADD => Tcode::LockWrapAdd,
            TCODE_LOCK_VENDOR_DEPENDENT => Tcode::LockVendorDependent,
            _ => return None,
        };
        Some(tcode)
    }

    pub fn is_read(self) -> bool {
        matches!(self, Tcode::ReadQuadletRequest | Tcode::ReadBlockRequest)
    }

    pub fn is_write(self) -> bool {
        matches!(self, Tcode::WriteQuadletRequest | Tcode::WriteBlockRequest)
    }

    /// Check if this is one of the extended lock requests.
    pub fn is_lock(self) -> bool {
        matches!(
            self,
            Tcode::LockMaskSwap
                | Tcode::LockCompareSwap
                | Tcode::LockFetchAdd
                | Tcode::LockLittleAdd
                | Tcode::LockBoundedAdd
                | Tcode::LockWrapAdd
                | Tcode::LockVendorDependent
        )
    }

    /// Check if a node may originate this code as a request.
    pub fn is_request(self) -> bool {
        self.is_read() || self.is_write() || self.is_lock()
    }

    /// Check if the request carries a response payload back.
    pub fn has_response_payload(self) -> bool {
        self.is_read() || self.is_lock()
    }

    /// Quadlet variants always transfer exactly four bytes.
    pub fn is_quadlet(self) -> bool {
        matches!(self, Tcode::ReadQuadletRequest | Tcode::WriteQuadletRequest)
    }

    /// Check if a lock request carries an argument operand before the data operand.
    pub fn lock_has_argument(self) -> bool {
        matches!(
            self,
            Tcode::LockMaskSwap
                | Tcode::LockCompareSwap
                | Tcode::LockBoundedAdd
                | Tcode::LockWrapAdd
        )
    }

    /// Short lowercase name, matching the nicknames printed by tools.
    pub fn nick(self) -> &'static str {
        match self {
            Tcode::WriteQuadletRequest => "write-quadlet-request",
            Tcode::WriteBlockRequest => "write-block-request",
            Tcode::WriteResponse => "write-response",
            Tcode::ReadQuadletRequest => "read-quadlet-request",
            Tcode::ReadBlockRequest => "read-block-request",
            Tcode::ReadQuadletResponse => "read-quadlet-response",
            Tcode::ReadBlockResponse => "read-block-response",
            Tcode::CycleStart => "cycle-start",
            Tcode::LockRequest => "lock-request",
            Tcode::StreamData => "stream-data",
            Tcode::LockResponse => "lock-response",
            Tcode::LockMaskSwap => "lock-mask-swap",
            Tcode::LockCompareSwap => "lock-compare-swap",
            Tcode::LockFetchAdd => "lock-fetch-add",
            Tcode::LockLittleAdd => "lock-little-add",
            Tcode::LockBoundedAdd => "lock-bounded-add",
            Tcode::LockWrapAdd => "lock-wrap-add",
            Tcode::LockVendorDependent => "lock-vendor-dependent",
        }
    }
}

impl fmt::Display for Tcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.nick())
    }
}
