//! Response codes of asynchronous transactions.

use std::fmt;

use super::constants::*;

/// Response code, either sent by the remote node or synthesized by the
/// local controller for local failures (send error, generation, no ack).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rcode {
    Complete,
    ConflictError,
    DataError,
    TypeError,
    AddressError,
    SendError,
    Cancelled,
    Busy,
    Generation,
    NoAck,
}

impl Rcode {
    pub const fn value(self) -> u32 {
        match self {
            Rcode::Complete => RCODE_COMPLETE,
            Rcode::ConflictError => RCODE_CONFLICT_ERROR,
            Rcode::DataError => RCODE_DATA_ERROR,
            Rcode::TypeError => RCODE_TYPE_ERROR,
            Rcode::AddressError => RCODE_ADDRESS_ERROR,
            Rcode::SendError => RCODE_SEND_ERROR,
            Rcode::Cancelled => RCODE_CANCELLED,
            Rcode::Busy => RCODE_BUSY,
            Rcode::Generation => RCODE_GENERATION,
            Rcode::NoAck => RCODE_NO_ACK,
        }
    }

    pub fn from_value(value: u32) -> Option<Self> {
        let rcode = match value {
            RCODE_COMPLETE => Rcode::Complete,
            RCODE_CONFLICT_ERROR => Rcode::ConflictError,
            RCODE_DATA_ERROR => Rcode::DataError,
            RCODE_TYPE_ERROR => Rcode::TypeError,
            RCODE_ADDRESS_ERROR => Rcode::AddressError,
            RCODE_SEND_ERROR => Rcode::SendError,
            RCODE_CANCELLED => Rcode::Cancelled,
            RCODE_BUSY => Rcode::Busy,
            RCODE_GENERATION => Rcode::Generation,
            RCODE_NO_ACK => Rcode::NoAck,
            _ => return None,
        };
        Some(rcode)
    }

    /// Codes a responder may put on the wire.
    pub fn is_wire_code(self) -> bool {
        matches!(
            self,
            Rcode::Complete
                | Rcode::ConflictError
                | Rcode::DataError
                | Rcode::TypeError
                | Rcode::AddressError
        )
    }

    pub fn nick(self) -> &'static str {
        match self {
            Rcode::Complete => "complete",
            Rcode::ConflictError => "conflict-error",
            Rcode::DataError => "data-error",
            Rcode::TypeError => "type-error",
            Rcode::AddressError => "address-error",
            Rcode::SendError => "send-error",
            Rcode::Cancelled => "cancelled",
            Rcode::Busy => "busy",
            Rcode::Generation => "generation",
            Rcode::NoAck => "no-ack",
        }
    }
}

impl fmt::Display for Rcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.nick())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_roundtrip() {
        for raw in 0u32..0x20 {
            if let Some(rcode) = Rcode::from_value(raw) {
                assert_eq!(rcode.value(), raw);
            }
        }
        assert_eq!(Rcode::from_value(0x1), None);
    }

    #[test]
    fn test_wire_codes() {
        assert!(Rcode::AddressError.is_wire_code());
        assert!(!Rcode::Generation.is_wire_code());
        assert!(!Rcode::NoAck.is_wire_code());
    }
}
