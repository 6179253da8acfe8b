//! Protocol module - IEEE 1394 asynchronous protocol definitions.

pub mod config_rom;
pub mod constants;
pub mod rcode;
pub mod tcode;

pub use config_rom::{ConfigRom, ConfigRomError, RomEntry};
pub use constants::*;
pub use rcode::Rcode;
pub use tcode::Tcode;
