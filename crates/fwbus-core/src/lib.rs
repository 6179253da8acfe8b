//! FwBus-Core: asynchronous IEEE 1394 transactions and event dispatch.
//!
//! This crate provides the bus layer of a FireWire host: outbound
//! read/write/lock transactions, responders for local address space, FCP
//! command/response exchanges and a per-handle event dispatcher.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Constants, transaction and response codes, configuration ROM
//! - **Transport**: Controller abstraction (simulated bus, character device probing)
//! - **Node**: Bus generation tracking and topology snapshots
//! - **Cycle time**: Cycle timer sampling and timestamp expansion
//! - **Transaction**: Request submission and completion matching
//! - **Responder**: Reserved address regions and their handlers
//! - **FCP**: Function Control Protocol exchanges
//! - **Dispatcher / Events**: Event loop and observer registry
//! - **Bus**: The handle tying it all together
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use fwbus_core::{BusConfig, FwBus, SimBus, SimNode};
//!
//! let sim = Arc::new(SimBus::new());
//! sim.add_node(0xffc1, SimNode::new().with_quadlet(0xffff_f000_0404, 0x3133_3934));
//!
//! let bus = FwBus::new(sim, BusConfig::default()).expect("bind failed");
//! bus.start().expect("start failed");
//! let value = bus.engine().read_quadlet(0xffc1, 0xffff_f000_0404).expect("read failed");
//! println!("{value:08x}");
//! ```

pub mod bus;
pub mod config;
pub mod cycle_time;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod fcp;
pub mod node;
pub mod protocol;
pub mod responder;
mod sync;
pub mod transaction;
pub mod transport;

// Re-exports for convenience
pub use bus::FwBus;
pub use config::BusConfig;
pub use cycle_time::{CycleClock, CycleTime, CycleTimestamp};
pub use dispatcher::{Dispatcher, DispatcherState};
pub use error::FwError;
pub use events::{
    BusEvent, BusObserver, EventKind, HandlerRegistry, HandlerToken, NullObserver,
    TracingObserver,
};
pub use fcp::{FcpResponse, FcpTransceiver};
pub use node::{GenerationTracker, NodeSnapshot};
pub use protocol::{ConfigRom, Rcode, Tcode};
pub use responder::{AddressRegion, RequestHandler, Responder, ResponderReply};
pub use transaction::{
    Outcome, TransactionEngine, TransactionId, TransactionRequest, TransactionResult,
    TransactionTimestamps,
};
pub use transport::{
    BusTransport, FwCharDevice, InboundRequest, SimBus, SimNode, TransportError, TransportEvent,
};
