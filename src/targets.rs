//! Chip identity reported by the ROM loader

use strum::Display;

use crate::error::ConnectionError;

/// Chip families identified by the GET_SECURITY_INFO chip id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[non_exhaustive]
pub enum Chip {
    #[strum(serialize = "ESP32")]
    Esp32 = 0x00,
    #[strum(serialize = "ESP32-S2")]
    Esp32s2 = 0x02,
    #[strum(serialize = "ESP32-C3")]
    Esp32c3 = 0x05,
    #[strum(serialize = "ESP32-S3")]
    Esp32s3 = 0x09,
    #[strum(serialize = "ESP32-C2")]
    Esp32c2 = 0x0C,
    #[strum(serialize = "ESP32-C6")]
    Esp32c6 = 0x0D,
    #[strum(serialize = "ESP32-H2")]
    Esp32h2 = 0x10,
}

impl Chip {
    /// Look up a chip family from its security-info chip id.
    pub fn from_chip_id(chip_id: u32) -> Option<Chip> {
        match chip_id {
            0x00 => Some(Chip::Esp32),
            0x02 => Some(Chip::Esp32s2),
            0x05 => Some(Chip::Esp32c3),
            0x09 => Some(Chip::Esp32s3),
            0x0C => Some(Chip::Esp32c2),
            0x0D => Some(Chip::Esp32c6),
            0x10 => Some(Chip::Esp32h2),
            _ => None,
        }
    }
}

/// Parsed GET_SECURITY_INFO response payload.
#[derive(Debug, Clone, Copy)]
pub struct SecurityInfo {
    pub chip_id: u32,
}

impl SecurityInfo {
    /// Parse the response payload; the chip id occupies the first four
    /// little-endian bytes.
    pub fn parse(data: &[u8]) -> Result<Self, ConnectionError> {
        if data.len() < 4 {
            return Err(ConnectionError::MalformedPayload);
        }

        let chip_id = u32::from_le_bytes(data[0..4].try_into().unwrap());

        Ok(SecurityInfo { chip_id })
    }

    /// The chip family, if the id is a known one.
    pub fn chip(&self) -> Option<Chip> {
        Chip::from_chip_id(self.chip_id)
    }
}
