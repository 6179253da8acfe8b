//! Transport layer module.

pub mod cdev;
pub mod sim;
pub mod traits;

pub use cdev::FwCharDevice;
pub use sim::{SentRequest, SentResponse, SimBus, SimNode};
pub use traits::{BusTransport, InboundRequest, OutboundRequest, TransportError, TransportEvent};
