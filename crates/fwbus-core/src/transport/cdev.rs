//! Linux FireWire character devices.
//!
//! Probing only: a path is accepted when it names a `/dev/fw*` character
//! device. Identity data is read from the matching sysfs node.

use std::fs;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, NativeEndian};
use tracing::{debug, info, instrument};

use super::traits::TransportError;
use crate::protocol::{ConfigRom, QUADLET_SIZE};

const SYSFS_DEVICES: &str = "/sys/bus/firewire/devices";

/// A probed FireWire character device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FwCharDevice {
    path: PathBuf,
    name: String,
    guid: Option<u64>,
    config_rom: Option<Vec<u8>>,
}

impl FwCharDevice {
    /// Check that `path` is a FireWire character device and gather what
    /// sysfs knows about it.
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn probe<P: AsRef<Path>>(path: P) -> Result<Self, TransportError> {
        let path = path.as_ref();
        let metadata = fs::metadata(path).map_err(|_| TransportError::NotFound {
            path: path.to_path_buf(),
        })?;
        if !metadata.file_type().is_char_device() {
            return Err(TransportError::NotCharDevice {
                path: path.to_path_buf(),
            });
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| n.starts_with("fw"))
            .ok_or_else(|| TransportError::NotFirewire {
                path: path.to_path_buf(),
            })?
            .to_string();

        let sysfs = Path::new(SYSFS_DEVICES).join(&name);
        let guid = fs::read_to_string(sysfs.join("guid"))
            .ok()
            .and_then(|s| parse_guid(&s));
        let config_rom = fs::read(sysfs.join("config_rom"))
            .ok()
            .map(|raw| rom_from_sysfs(&raw));
        debug!(sysfs = %sysfs.display(), found_rom = config_rom.is_some(), "Sysfs attributes read");
        info!(name = %name, "FireWire device probed");

        Ok(Self {
            path: path.to_path_buf(),
            name,
            guid,
            config_rom,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn guid(&self) -> Option<u64> {
        self.guid
    }

    /// Raw big-endian ROM image, when sysfs exposed it.
    pub fn config_rom_bytes(&self) -> Option<&[u8]> {
        self.config_rom.as_deref()
    }

    pub fn config_rom(&self) -> Option<ConfigRom> {
        self.config_rom
            .as_deref()
            .and_then(|raw| ConfigRom::from_bytes(raw).ok())
    }
}

/// Sysfs exposes ROM quadlets in host byte order.
fn rom_from_sysfs(raw: &[u8]) -> Vec<u8> {
    raw.chunks_exact(QUADLET_SIZE)
        .flat_map(|q| NativeEndian::read_u32(q).to_be_bytes())
        .collect()
}

fn parse_guid(text: &str) -> Option<u64> {
    let text = text.trim();
    let hex = text.strip_prefix("0x").unwrap_or(text);
    u64::from_str_radix(hex, 16).ok()
}
