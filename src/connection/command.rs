//! Commands understood by the ROM bootloader
//!
//! Every request shares the same layout: a direction byte, the command
//! opcode, the payload length, an XOR checksum of the payload, and the
//! payload itself. All multi-byte fields are little-endian.

use std::{io::Write, mem::size_of, time::Duration};

use bytemuck::{bytes_of, Pod, Zeroable};
use strum::Display;

use crate::{
    constants::{CHECKSUM_INIT, DIR_REQUEST, FLASH_BLOCK_SIZE},
    flasher::{SpiAttachParams, SpiSetParams},
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const SYNC_TIMEOUT: Duration = Duration::from_millis(500);
const FLASH_MD5_TIMEOUT: Duration = Duration::from_secs(10);
const FLASH_DEFL_END_TIMEOUT: Duration = Duration::from_secs(2);
const ERASE_SECS_PER_MB: u64 = 3;
const ERASE_BASE_SECS: u64 = 5;

/// Input data for the SYNC command (36 bytes: 0x07 0x07 0x12 0x20, followed
/// by 32 x 0x55)
const SYNC_FRAME: [u8; 36] = [
    0x07, 0x07, 0x12, 0x20, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
    0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
    0x55, 0x55, 0x55, 0x55,
];

/// Types of commands that can be sent to a target device
///
/// https://docs.espressif.com/projects/esptool/en/latest/esp32c3/advanced-topics/serial-protocol.html#supported-by-stub-loader-and-rom-loader
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
#[non_exhaustive]
#[repr(u8)]
pub enum CommandType {
    FlashBegin = 0x02,
    FlashData = 0x03,
    FlashEnd = 0x04,
    Sync = 0x08,
    SpiSetParams = 0x0B,
    SpiAttach = 0x0D,
    FlashDeflBegin = 0x10,
    FlashDeflData = 0x11,
    FlashDeflEnd = 0x12,
    FlashMd5 = 0x13,
    GetSecurityInfo = 0x14,
}

impl CommandType {
    /// Return a timeout based on the command type
    pub fn timeout(&self) -> Duration {
        match self {
            CommandType::Sync => SYNC_TIMEOUT,
            CommandType::FlashMd5 => FLASH_MD5_TIMEOUT,
            CommandType::FlashDeflEnd => FLASH_DEFL_END_TIMEOUT,
            _ => DEFAULT_TIMEOUT,
        }
    }

    /// Return a timeout proportional to the amount of flash the command
    /// erases; the ROM is unresponsive for the duration of the erase.
    pub fn timeout_for_size(&self, size: u32) -> Duration {
        match self {
            CommandType::FlashBegin | CommandType::FlashDeflBegin => {
                let mb = u64::from(size) / (1024 * 1024);
                Duration::from_secs(mb * ERASE_SECS_PER_MB + ERASE_BASE_SECS)
            }
            _ => self.timeout(),
        }
    }
}

/// Available commands
#[derive(Copy, Clone, Debug)]
#[non_exhaustive]
pub enum Command<'a> {
    FlashBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
    },
    FlashData {
        data: &'a [u8],
        sequence: u32,
    },
    FlashEnd {
        reboot: bool,
    },
    Sync,
    SpiSetParams {
        spi_params: SpiSetParams,
    },
    SpiAttach {
        spi_params: SpiAttachParams,
    },
    FlashDeflBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
    },
    FlashDeflData {
        data: &'a [u8],
        sequence: u32,
    },
    FlashDeflEnd {
        reboot: bool,
    },
    FlashMd5 {
        offset: u32,
        size: u32,
    },
    GetSecurityInfo,
}

impl Command<'_> {
    /// Return the command type
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::FlashBegin { .. } => CommandType::FlashBegin,
            Command::FlashData { .. } => CommandType::FlashData,
            Command::FlashEnd { .. } => CommandType::FlashEnd,
            Command::Sync => CommandType::Sync,
            Command::SpiSetParams { .. } => CommandType::SpiSetParams,
            Command::SpiAttach { .. } => CommandType::SpiAttach,
            Command::FlashDeflBegin { .. } => CommandType::FlashDeflBegin,
            Command::FlashDeflData { .. } => CommandType::FlashDeflData,
            Command::FlashDeflEnd { .. } => CommandType::FlashDeflEnd,
            Command::FlashMd5 { .. } => CommandType::FlashMd5,
            Command::GetSecurityInfo => CommandType::GetSecurityInfo,
        }
    }

    /// Return the response timeout for this command. The begin commands
    /// scale with the erase size they carry.
    pub fn timeout(&self) -> Duration {
        match self {
            Command::FlashBegin { size, .. } | Command::FlashDeflBegin { size, .. } => {
                self.command_type().timeout_for_size(*size)
            }
            _ => self.command_type().timeout(),
        }
    }

    /// Write the command as a request packet
    pub fn write<W: Write>(&self, writer: W) -> std::io::Result<()> {
        match *self {
            Command::FlashBegin {
                size,
                blocks,
                block_size,
                offset,
            } => {
                write_begin_command(writer, self.command_type(), size, blocks, block_size, offset)
            }
            Command::FlashData { data, sequence } => {
                // The legacy data path pads every block to the full block
                // size with 0xFF.
                write_data_command(writer, self.command_type(), data, sequence, FLASH_BLOCK_SIZE)
            }
            Command::FlashEnd { reboot } => {
                write_packet(writer, self.command_type(), &end_payload(reboot))
            }
            Command::Sync => write_packet(writer, self.command_type(), &SYNC_FRAME),
            Command::SpiSetParams { spi_params } => {
                write_packet(writer, self.command_type(), &spi_params.encode())
            }
            Command::SpiAttach { spi_params } => {
                write_packet(writer, self.command_type(), &spi_params.encode())
            }
            Command::FlashDeflBegin {
                size,
                blocks,
                block_size,
                offset,
            } => {
                write_begin_command(writer, self.command_type(), size, blocks, block_size, offset)
            }
            Command::FlashDeflData { data, sequence } => {
                // The compressed path never pads; the ROM uses the declared
                // length.
                write_data_command(writer, self.command_type(), data, sequence, 0)
            }
            Command::FlashDeflEnd { reboot } => {
                write_packet(writer, self.command_type(), &end_payload(reboot))
            }
            Command::FlashMd5 { offset, size } => {
                #[derive(Zeroable, Pod, Copy, Clone)]
                #[repr(C)]
                struct Md5Params {
                    offset: u32,
                    size: u32,
                    reserved0: u32,
                    reserved1: u32,
                }
                let params = Md5Params {
                    offset,
                    size,
                    reserved0: 0,
                    reserved1: 0,
                };
                write_packet(writer, self.command_type(), bytes_of(&params))
            }
            Command::GetSecurityInfo => write_packet(writer, self.command_type(), &[]),
        }
    }
}

/// Write a request packet: direction, opcode, payload length, payload
/// checksum, payload.
fn write_packet<W: Write>(mut writer: W, ty: CommandType, payload: &[u8]) -> std::io::Result<()> {
    writer.write_all(&[DIR_REQUEST, ty as u8])?;
    writer.write_all(&(payload.len() as u16).to_le_bytes())?;
    writer.write_all(&u32::from(checksum(payload, CHECKSUM_INIT)).to_le_bytes())?;
    writer.write_all(payload)?;
    Ok(())
}

/// Write a Begin command
fn write_begin_command<W: Write>(
    writer: W,
    ty: CommandType,
    size: u32,
    blocks: u32,
    block_size: u32,
    offset: u32,
) -> std::io::Result<()> {
    #[derive(Zeroable, Pod, Copy, Clone, Debug)]
    #[repr(C)]
    struct BeginParams {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
    }
    let params = BeginParams {
        size,
        blocks,
        block_size,
        offset,
    };

    write_packet(writer, ty, bytes_of(&params))
}

/// Write a Data command, padding the block up to `pad_to` bytes with 0xFF
fn write_data_command<W: Write>(
    writer: W,
    ty: CommandType,
    data: &[u8],
    sequence: u32,
    pad_to: usize,
) -> std::io::Result<()> {
    #[derive(Zeroable, Pod, Copy, Clone, Debug)]
    #[repr(C)]
    struct BlockParams {
        size: u32,
        sequence: u32,
        dummy1: u32,
        dummy2: u32,
    }

    let pad_length = pad_to.saturating_sub(data.len());
    let params = BlockParams {
        size: (data.len() + pad_length) as u32,
        sequence,
        dummy1: 0,
        dummy2: 0,
    };

    let mut payload = Vec::with_capacity(size_of::<BlockParams>() + data.len() + pad_length);
    payload.extend_from_slice(bytes_of(&params));
    payload.extend_from_slice(data);
    payload.resize(payload.len() + pad_length, 0xFF);

    write_packet(writer, ty, &payload)
}

fn end_payload(reboot: bool) -> [u8; 4] {
    // 0 requests a reboot, 1 stays in the bootloader
    u32::from(!reboot).to_le_bytes()
}

pub(crate) fn checksum(data: &[u8], mut checksum: u8) -> u8 {
    for byte in data {
        checksum ^= *byte;
    }

    checksum
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(command: Command<'_>) -> Vec<u8> {
        let mut packet = Vec::new();
        command.write(&mut packet).unwrap();
        packet
    }

    #[test]
    fn checksum_vectors() {
        assert_eq!(checksum(&[], CHECKSUM_INIT), 0xEF);
        assert_eq!(checksum(&[0x01], CHECKSUM_INIT), 0xEE);
        assert_eq!(checksum(&[0x01, 0x02, 0x03], CHECKSUM_INIT), 0xEF);
    }

    #[test]
    fn packet_layout() {
        let mut packet = Vec::new();
        write_packet(&mut packet, CommandType::Sync, &[0xAA, 0xBB]).unwrap();

        assert_eq!(packet[0], DIR_REQUEST);
        assert_eq!(packet[1], CommandType::Sync as u8);
        assert_eq!(u16::from_le_bytes(packet[2..4].try_into().unwrap()), 2);
        assert_eq!(
            u32::from_le_bytes(packet[4..8].try_into().unwrap()),
            u32::from(checksum(&[0xAA, 0xBB], CHECKSUM_INIT))
        );
        assert_eq!(&packet[8..], [0xAA, 0xBB]);
    }

    #[test]
    fn empty_payload_packet() {
        let packet = encoded(Command::GetSecurityInfo);

        assert_eq!(packet.len(), 8);
        assert_eq!(packet[1], 0x14);
        assert_eq!(u16::from_le_bytes(packet[2..4].try_into().unwrap()), 0);
        assert_eq!(u32::from_le_bytes(packet[4..8].try_into().unwrap()), 0xEF);
    }

    #[test]
    fn sync_payload() {
        let packet = encoded(Command::Sync);

        assert_eq!(packet[1], 0x08);
        assert_eq!(packet.len(), 8 + 36);
        assert_eq!(&packet[8..12], [0x07, 0x07, 0x12, 0x20]);
        assert!(packet[12..].iter().all(|b| *b == 0x55));
    }

    #[test]
    fn defl_begin_payload() {
        let packet = encoded(Command::FlashDeflBegin {
            size: 8192,
            blocks: 3,
            block_size: 1024,
            offset: 0x10000,
        });

        assert_eq!(packet[1], 0x10);
        let payload = &packet[8..];
        assert_eq!(payload.len(), 16);
        assert_eq!(u32::from_le_bytes(payload[0..4].try_into().unwrap()), 8192);
        assert_eq!(u32::from_le_bytes(payload[4..8].try_into().unwrap()), 3);
        assert_eq!(u32::from_le_bytes(payload[8..12].try_into().unwrap()), 1024);
        assert_eq!(
            u32::from_le_bytes(payload[12..16].try_into().unwrap()),
            0x10000
        );
    }

    #[test]
    fn defl_data_is_not_padded() {
        let block = [0x42u8; 100];
        let packet = encoded(Command::FlashDeflData {
            data: &block,
            sequence: 7,
        });

        let payload = &packet[8..];
        assert_eq!(payload.len(), 16 + block.len());
        assert_eq!(u32::from_le_bytes(payload[0..4].try_into().unwrap()), 100);
        assert_eq!(u32::from_le_bytes(payload[4..8].try_into().unwrap()), 7);
        assert_eq!(&payload[16..], block);
    }

    #[test]
    fn flash_data_pads_with_ff() {
        let block = [0x42u8; 100];
        let packet = encoded(Command::FlashData {
            data: &block,
            sequence: 0,
        });

        let payload = &packet[8..];
        assert_eq!(payload.len(), 16 + FLASH_BLOCK_SIZE);
        assert_eq!(
            u32::from_le_bytes(payload[0..4].try_into().unwrap()),
            FLASH_BLOCK_SIZE as u32
        );
        assert_eq!(&payload[16..116], block);
        assert!(payload[116..].iter().all(|b| *b == 0xFF));
    }

    #[test]
    fn end_command_values() {
        let stay = encoded(Command::FlashDeflEnd { reboot: false });
        assert_eq!(&stay[8..], 1u32.to_le_bytes());

        let reboot = encoded(Command::FlashEnd { reboot: true });
        assert_eq!(reboot[1], 0x04);
        assert_eq!(&reboot[8..], 0u32.to_le_bytes());
    }

    #[test]
    fn md5_payload() {
        let packet = encoded(Command::FlashMd5 {
            offset: 0x10000,
            size: 0x2000,
        });

        let payload = &packet[8..];
        assert_eq!(payload.len(), 16);
        assert_eq!(
            u32::from_le_bytes(payload[0..4].try_into().unwrap()),
            0x10000
        );
        assert_eq!(u32::from_le_bytes(payload[4..8].try_into().unwrap()), 0x2000);
        assert_eq!(&payload[8..16], [0u8; 8]);
    }

    #[test]
    fn erase_scaled_timeouts() {
        assert_eq!(
            CommandType::FlashDeflBegin.timeout_for_size(0),
            Duration::from_secs(5)
        );
        assert_eq!(
            CommandType::FlashDeflBegin.timeout_for_size(2 * 1024 * 1024),
            Duration::from_secs(11)
        );
        assert_eq!(
            CommandType::FlashMd5.timeout_for_size(2 * 1024 * 1024),
            FLASH_MD5_TIMEOUT
        );
    }
}
