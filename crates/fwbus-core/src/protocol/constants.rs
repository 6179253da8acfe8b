//! Protocol constants from IEEE 1394 / IEEE 1212 and the Linux FireWire ABI.
//!
//! Numeric values follow `linux/firewire-constants.h`.

// ============================================================================
// Address Space
// ============================================================================

/// Upper bound (exclusive) of the 48-bit node offset space.
pub const OFFSET_SPACE_END: u64 = 0x1_0000_0000_0000;

/// Base of the CSR register space on every node.
pub const CSR_REGISTER_BASE: u64 = 0xFFFF_F000_0000;

/// Configuration ROM location in CSR space.
pub const CSR_CONFIG_ROM: u64 = CSR_REGISTER_BASE + 0x400;
pub const CSR_CONFIG_ROM_END: u64 = CSR_REGISTER_BASE + 0x800;

/// Size of a quadlet in bytes.
pub const QUADLET_SIZE: usize = 4;

/// Largest block payload accepted by the transaction engine (S1600 limit).
pub const MAX_BLOCK_PAYLOAD: usize = 0x2000;

// ============================================================================
// Node Addressing
// ============================================================================

/// Mask of the 6-bit physical ID inside a 16-bit node ID.
pub const NODE_PHYSICAL_ID_MASK: u16 = 0x003F;

/// Local bus ID as seen in node IDs (`0x3ff << 6`).
pub const LOCAL_BUS: u16 = 0xFFC0;

/// Broadcast physical ID.
pub const BROADCAST_PHYSICAL_ID: u16 = 0x3F;

// ============================================================================
// Transaction Codes (tcode)
// ============================================================================

pub const TCODE_WRITE_QUADLET_REQUEST: u8 = 0x0;
pub const TCODE_WRITE_BLOCK_REQUEST: u8 = 0x1;
pub const TCODE_WRITE_RESPONSE: u8 = 0x2;
pub const TCODE_READ_QUADLET_REQUEST: u8 = 0x4;
pub const TCODE_READ_BLOCK_REQUEST: u8 = 0x5;
pub const TCODE_READ_QUADLET_RESPONSE: u8 = 0x6;
pub const TCODE_READ_BLOCK_RESPONSE: u8 = 0x7;
pub const TCODE_CYCLE_START: u8 = 0x8;
pub const TCODE_LOCK_REQUEST: u8 = 0x9;
pub const TCODE_STREAM_DATA: u8 = 0xA;
pub const TCODE_LOCK_RESPONSE: u8 = 0xB;

// Extended tcodes of lock requests, as encoded by the Linux ABI (0x10 | extcode).
pub const TCODE_LOCK_MASK_SWAP: u8 = 0x11;
pub const TCODE_LOCK_COMPARE_SWAP: u8 = 0x12;
pub const TCODE_LOCK_FETCH_ADD: u8 = 0x13;
pub const TCODE_LOCK_LITTLE_ADD: u8 = 0x14;
pub const TCODE_LOCK_BOUNDED_ADD: u8 = 0x15;
pub const TCODE_LOCK_WRAP_ADD: u8 = 0x16;
pub const TCODE_LOCK_VENDOR_DEPENDENT: u8 = 0x17;

// ============================================================================
// Response Codes (rcode)
// ============================================================================

pub const RCODE_COMPLETE: u32 = 0x0;
pub const RCODE_CONFLICT_ERROR: u32 = 0x4;
pub const RCODE_DATA_ERROR: u32 = 0x5;
pub const RCODE_TYPE_ERROR: u32 = 0x6;
pub const RCODE_ADDRESS_ERROR: u32 = 0x7;

// Linux-specific codes for local failures.
pub const RCODE_SEND_ERROR: u32 = 0x10;
pub const RCODE_CANCELLED: u32 = 0x11;
pub const RCODE_BUSY: u32 = 0x12;
pub const RCODE_GENERATION: u32 = 0x13;
pub const RCODE_NO_ACK: u32 = 0x14;

// ============================================================================
// Cycle Timer
// ============================================================================

/// Isochronous cycles per second.
pub const CYCLES_PER_SEC: u32 = 8000;

/// Offset ticks (24.576 MHz) per cycle.
pub const OFFSETS_PER_CYCLE: u32 = 3072;

/// Seconds field of the cycle timer wraps at this value (7 bits).
pub const CYCLE_TIMER_SEC_WRAP: u32 = 128;

pub const CYCLE_TIMER_SEC_MASK: u32 = 0xFE00_0000;
pub const CYCLE_TIMER_SEC_SHIFT: u32 = 25;
pub const CYCLE_TIMER_CYCLE_MASK: u32 = 0x01FF_F000;
pub const CYCLE_TIMER_CYCLE_SHIFT: u32 = 12;
pub const CYCLE_TIMER_OFFSET_MASK: u32 = 0x0000_0FFF;

/// Event timestamps carry 3 bits of seconds above a 13-bit cycle count.
pub const TSTAMP_SEC_MASK: u16 = 0xE000;
pub const TSTAMP_SEC_SHIFT: u16 = 13;
pub const TSTAMP_CYCLE_MASK: u16 = 0x1FFF;

// ============================================================================
// Function Control Protocol
// ============================================================================

/// Target address of FCP command frames.
pub const FCP_COMMAND_ADDR: u64 = 0xFFFF_F000_0B00;

/// Target address of FCP response frames.
pub const FCP_RESPONSE_ADDR: u64 = 0xFFFF_F000_0D00;

/// Size of both FCP frame registers.
pub const FCP_MAX_FRAME_BYTES: usize = 0x200;

/// Minimum AV/C frame: ctype/response, subunit address, opcode.
pub const FCP_MIN_FRAME_BYTES: usize = 3;

// AV/C ctype values (command frames).
pub const AVC_CTYPE_CONTROL: u8 = 0x00;
pub const AVC_CTYPE_STATUS: u8 = 0x01;
pub const AVC_CTYPE_SPECIFIC_INQUIRY: u8 = 0x02;
pub const AVC_CTYPE_NOTIFY: u8 = 0x03;
pub const AVC_CTYPE_GENERAL_INQUIRY: u8 = 0x04;

// AV/C response values (response frames).
pub const AVC_RESPONSE_NOT_IMPLEMENTED: u8 = 0x08;
pub const AVC_RESPONSE_ACCEPTED: u8 = 0x09;
pub const AVC_RESPONSE_REJECTED: u8 = 0x0A;
pub const AVC_RESPONSE_IN_TRANSITION: u8 = 0x0B;
pub const AVC_RESPONSE_IMPLEMENTED_STABLE: u8 = 0x0C;
pub const AVC_RESPONSE_CHANGED: u8 = 0x0D;
pub const AVC_RESPONSE_INTERIM: u8 = 0x0F;

// ============================================================================
// Configuration ROM
// ============================================================================

/// Bus name quadlet of the bus information block: ASCII "1394".
pub const BUS_NAME_1394: u32 = 0x3133_3934;

/// Length of the IEEE 1394 bus information block in quadlets (after the header).
pub const BUS_INFO_LENGTH: u8 = 4;

// Root directory keys (key type + key id).
pub const ROM_KEY_VENDOR_ID: u8 = 0x03;
pub const ROM_KEY_NODE_CAPABILITIES: u8 = 0x0C;
pub const ROM_KEY_MODEL_ID: u8 = 0x17;
pub const ROM_KEY_UNIT_DIRECTORY: u8 = 0xD1;
