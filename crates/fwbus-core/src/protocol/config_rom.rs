//! Configuration ROM image (IEEE 1212 / IEEE 1394 bus information block).

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use thiserror::Error;

use super::constants::{
    BUS_INFO_LENGTH, BUS_NAME_1394, QUADLET_SIZE, ROM_KEY_MODEL_ID, ROM_KEY_NODE_CAPABILITIES,
    ROM_KEY_VENDOR_ID,
};

#[derive(Error, Debug)]
pub enum ConfigRomError {
    #[error("Image too small: expected at least {expected} bytes, got {actual}")]
    TooSmall { expected: usize, actual: usize },
    #[error("Image length {0} is not a multiple of a quadlet")]
    Unaligned(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One directory entry: 8-bit key (2-bit type, 6-bit id) and 24-bit value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RomEntry {
    pub key: u8,
    pub value: u32,
}

impl RomEntry {
    pub fn from_quadlet(quadlet: u32) -> Self {
        Self {
            key: (quadlet >> 24) as u8,
            value: quadlet & 0x00FF_FFFF,
        }
    }

    /// 0: immediate, 1: CSR offset, 2: leaf, 3: directory.
    pub fn key_type(&self) -> u8 {
        self.key >> 6
    }

    pub fn key_id(&self) -> u8 {
        self.key & 0x3F
    }

    fn to_quadlet(self) -> u32 {
        (u32::from(self.key) << 24) | (self.value & 0x00FF_FFFF)
    }
}

/// Node capabilities from the third quadlet of the bus information block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusCapabilities {
    pub irmc: bool,
    pub cmc: bool,
    pub isc: bool,
    pub bmc: bool,
    pub pmc: bool,
    pub cyc_clk_acc: u8,
    pub max_rec: u8,
    pub max_rom: u8,
    pub generation: u8,
    pub link_speed: u8,
}

impl BusCapabilities {
    pub fn from_quadlet(q: u32) -> Self {
        Self {
            irmc: q & 0x8000_0000 != 0,
            cmc: q & 0x4000_0000 != 0,
            isc: q & 0x2000_0000 != 0,
            bmc: q & 0x1000_0000 != 0,
            pmc: q & 0x0800_0000 != 0,
            cyc_clk_acc: ((q >> 16) & 0xFF) as u8,
            max_rec: ((q >> 12) & 0xF) as u8,
            max_rom: ((q >> 8) & 0x3) as u8,
            generation: ((q >> 4) & 0xF) as u8,
            link_speed: (q & 0x7) as u8,
        }
    }

    /// Largest asynchronous payload the node accepts (`2^(max_rec + 1)`).
    pub fn max_payload(&self) -> usize {
        if self.max_rec == 0 || self.max_rec > 0xD {
            return 0;
        }
        1usize << (self.max_rec + 1)
    }
}

/// Parsed view over a raw configuration ROM image.
///
/// The image is kept as host-order quadlets; `to_bytes` gives back the
/// big-endian wire image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigRom {
    quadlets: Vec<u32>,
}

impl ConfigRom {
    /// Header quadlet plus the bus information block.
    pub const MIN_SIZE: usize = (1 + BUS_INFO_LENGTH as usize) * QUADLET_SIZE;

    /// Parse a big-endian image as read from the bus.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ConfigRomError> {
        if data.len() < Self::MIN_SIZE {
            return Err(ConfigRomError::TooSmall {
                expected: Self::MIN_SIZE,
                actual: data.len(),
            });
        }
        if data.len() % QUADLET_SIZE != 0 {
            return Err(ConfigRomError::Unaligned(data.len()));
        }
        let mut cursor = Cursor::new(data);
        let mut quadlets = Vec::with_capacity(data.len() / QUADLET_SIZE);
        for _ in 0..data.len() / QUADLET_SIZE {
            quadlets.push(cursor.read_u32::<BigEndian>()?);
        }
        Ok(Self { quadlets })
    }

    pub fn from_quadlets(quadlets: Vec<u32>) -> Result<Self, ConfigRomError> {
        let actual = quadlets.len() * QUADLET_SIZE;
        if actual < Self::MIN_SIZE {
            return Err(ConfigRomError::TooSmall {
                expected: Self::MIN_SIZE,
                actual,
            });
        }
        Ok(Self { quadlets })
    }

    /// Build a minimal general-format ROM with a root directory.
    pub fn synthesize(guid: u64, vendor_id: u32, model_id: u32) -> Self {
        // irmc, cmc, isc set; max_rec 8 (512 bytes); link speed S400.
        let capabilities = 0xE000_8002;
        let mut quadlets = vec![
            0,
            BUS_NAME_1394,
            capabilities,
            (guid >> 32) as u32,
            guid as u32,
        ];
        quadlets[0] = (u32::from(BUS_INFO_LENGTH) << 24) | (u32::from(BUS_INFO_LENGTH) << 16);
        quadlets[0] |= u32::from(crc16(&quadlets[1..=BUS_INFO_LENGTH as usize]));

        let entries = [
            RomEntry {
                key: ROM_KEY_VENDOR_ID,
                value: vendor_id,
            },
            RomEntry {
                key: ROM_KEY_NODE_CAPABILITIES,
                value: 0x0000_83C0,
            },
            RomEntry {
                key: ROM_KEY_MODEL_ID,
                value: model_id,
            },
        ];
        let body: Vec<u32> = entries.iter().map(|e| e.to_quadlet()).collect();
        quadlets.push(((body.len() as u32) << 16) | u32::from(crc16(&body)));
        quadlets.extend(body);

        Self { quadlets }
    }

    pub fn quadlets(&self) -> &[u32] {
        &self.quadlets
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.quadlets.len() * QUADLET_SIZE);
        for &q in &self.quadlets {
            // Writing into a Vec cannot fail.
            let _ = buf.write_u32::<BigEndian>(q);
        }
        buf
    }

    pub fn bus_info_length(&self) -> usize {
        (self.quadlets[0] >> 24) as usize
    }

    pub fn crc_length(&self) -> usize {
        ((self.quadlets[0] >> 16) & 0xFF) as usize
    }

    pub fn crc(&self) -> u16 {
        (self.quadlets[0] & 0xFFFF) as u16
    }

    pub fn is_ieee1394(&self) -> bool {
        self.quadlets[1] == BUS_NAME_1394
    }

    pub fn capabilities(&self) -> BusCapabilities {
        BusCapabilities::from_quadlet(self.quadlets[2])
    }

    pub fn guid(&self) -> u64 {
        (u64::from(self.quadlets[3]) << 32) | u64::from(self.quadlets[4])
    }

    /// Check the CRC over the bus information block (and beyond, per crc_length).
    pub fn verify_bus_info_crc(&self) -> bool {
        let end = 1 + self.crc_length();
        if end > self.quadlets.len() {
            return false;
        }
        crc16(&self.quadlets[1..end]) == self.crc()
    }

    /// Entries of the root directory, if the image contains one.
    pub fn root_directory(&self) -> Option<Vec<RomEntry>> {
        let start = 1 + self.bus_info_length();
        let header = *self.quadlets.get(start)?;
        let length = (header >> 16) as usize;
        let body = self.quadlets.get(start + 1..start + 1 + length)?;
        Some(body.iter().map(|&q| RomEntry::from_quadlet(q)).collect())
    }

    /// Check the CRC of the root directory block.
    pub fn verify_root_directory_crc(&self) -> bool {
        let start = 1 + self.bus_info_length();
        let Some(&header) = self.quadlets.get(start) else {
            return false;
        };
        let length = (header >> 16) as usize;
        match self.quadlets.get(start + 1..start + 1 + length) {
            Some(body) => crc16(body) == (header & 0xFFFF) as u16,
            None => false,
        }
    }

    pub fn vendor_id(&self) -> Option<u32> {
        self.immediate(ROM_KEY_VENDOR_ID)
    }

    pub fn model_id(&self) -> Option<u32> {
        self.immediate(ROM_KEY_MODEL_ID)
    }

    fn immediate(&self, key: u8) -> Option<u32> {
        self.root_directory()?
            .into_iter()
            .find(|e| e.key == key)
            .map(|e| e.value)
    }
}

/// CRC-16 of IEEE 1212 over a block of quadlets.
pub fn crc16(quadlets: &[u32]) -> u16 {
    let mut crc: u32 = 0;
    for &q in quadlets {
        for shift in (0..=28u32).rev().step_by(4) {
            let sum = ((crc >> 12) ^ (q >> shift)) & 0xF;
            crc = (crc << 4) ^ (sum << 12) ^ (sum << 5) ^ sum;
        }
        crc &= 0xFFFF;
    }
    crc as u16
}
