//! Protocol-level constants shared across the crate.

/// Direction byte identifying a host-to-device request packet.
pub const DIR_REQUEST: u8 = 0x00;
/// Direction byte identifying a device-to-host response packet.
pub const DIR_RESPONSE: u8 = 0x01;

/// Seed value for the 8-bit XOR payload checksum.
pub const CHECKSUM_INIT: u8 = 0xEF;

/// Size of a single data block on the wire.
pub const FLASH_BLOCK_SIZE: usize = 0x400;
/// Size of an erasable flash sector.
pub const FLASH_SECTOR_SIZE: usize = 0x1000;
/// Size of a flash page.
pub const FLASH_PAGE_SIZE: usize = 0x100;
/// Block size reported to the ROM in SPI_SET_PARAMS.
pub const SPI_FLASH_BLOCK_SIZE: usize = 0x1_0000;
/// Total flash size of the target device.
pub const FLASH_TOTAL_SIZE: u32 = 16 * 1024 * 1024;

/// Flash offset of the second-stage bootloader image.
pub const BOOTLOADER_ADDRESS: u32 = 0x0;
/// Flash offset of the partition table.
pub const PARTITION_TABLE_ADDRESS: u32 = 0x8000;
/// Flash offset of the application firmware.
pub const FIRMWARE_ADDRESS: u32 = 0x1_0000;

/// Default serial baud rate.
pub const DEFAULT_BAUD_RATE: u32 = 921_600;
