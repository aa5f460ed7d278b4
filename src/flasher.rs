//! Write a firmware image to a target device
//!
//! The [Flasher] struct drives a full session against the ROM loader: reset
//! into download mode, sync, SPI configuration, compressed streaming of the
//! image, optional verification, and the final reboot.

use std::{io::Write, thread::sleep, time::Duration};

use bytemuck::{bytes_of, Pod, Zeroable};
use flate2::{write::ZlibEncoder, Compression};
use log::{debug, info, warn};
use md5::{Digest, Md5};

use crate::{
    connection::{
        command::{Command, CommandType},
        Connection,
    },
    constants::{
        FLASH_BLOCK_SIZE, FLASH_PAGE_SIZE, FLASH_SECTOR_SIZE, FLASH_TOTAL_SIZE,
        SPI_FLASH_BLOCK_SIZE,
    },
    error::{ConnectionError, Error, ResultExt},
    interface::Interface,
    targets::SecurityInfo,
};

/// Attempts made to deliver a single data block before giving up.
const BLOCK_ATTEMPTS: usize = 3;
const BLOCK_RETRY_DELAY: Duration = Duration::from_millis(100);
const REBOOT_DELAY: Duration = Duration::from_millis(100);

/// Progress update callbacks
pub trait ProgressCallbacks {
    /// Initialize some progress report
    fn init(&mut self, addr: u32, total: usize);
    /// Update some progress report
    fn update(&mut self, current: usize);
    /// Finish some progress report
    fn finish(&mut self);
}

/// A contiguous image to be written at a fixed flash offset.
#[derive(Debug, Clone, Copy)]
pub struct FlashRegion<'a> {
    pub addr: u32,
    pub data: &'a [u8],
    pub name: &'a str,
}

/// Parameters for attaching to a target device's SPI flash
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct SpiAttachParams {
    clk: u8,
    q: u8,
    d: u8,
    hd: u8,
    cs: u8,
}

impl SpiAttachParams {
    /// All zeros selects the chip's default SPI pin assignment.
    pub const fn default() -> Self {
        SpiAttachParams {
            clk: 0,
            q: 0,
            d: 0,
            hd: 0,
            cs: 0,
        }
    }

    pub fn encode(self) -> Vec<u8> {
        let packed = ((self.hd as u32) << 24)
            | ((self.cs as u32) << 18)
            | ((self.d as u32) << 12)
            | ((self.q as u32) << 6)
            | (self.clk as u32);

        let mut encoded = packed.to_le_bytes().to_vec();

        // The ROM loader expects four additional zero bytes after the pin
        // assignment.
        encoded.extend_from_slice(&[0u8; 4]);

        encoded
    }
}

/// Parameters of the attached SPI flash, reported with SPI_SET_PARAMS
#[derive(Copy, Clone, Debug)]
pub struct SpiSetParams {
    size: u32,
}

impl SpiSetParams {
    pub const fn new(size: u32) -> Self {
        SpiSetParams { size }
    }

    pub fn encode(self) -> Vec<u8> {
        #[derive(Zeroable, Pod, Copy, Clone)]
        #[repr(C)]
        struct SetParams {
            id: u32,
            total_size: u32,
            block_size: u32,
            sector_size: u32,
            page_size: u32,
            status_mask: u32,
        }
        let params = SetParams {
            id: 0,
            total_size: self.size,
            block_size: SPI_FLASH_BLOCK_SIZE as u32,
            sector_size: FLASH_SECTOR_SIZE as u32,
            page_size: FLASH_PAGE_SIZE as u32,
            status_mask: 0xFFFF,
        };

        bytes_of(&params).to_vec()
    }
}

/// Connect to and flash a target device
pub struct Flasher {
    connection: Connection,
}

impl Flasher {
    pub fn new(port: Box<dyn Interface>) -> Self {
        Flasher {
            connection: Connection::new(port),
        }
    }

    /// The active connection being used by the flasher
    pub fn connection(&mut self) -> &mut Connection {
        &mut self.connection
    }

    /// Bring the device into a flashable state: reset into the ROM loader,
    /// sync, and configure the SPI flash.
    pub fn connect(&mut self) -> Result<(), Error> {
        self.connection.reset_to_bootloader()?;
        self.connection.sync()?;

        // The ROM must be told how to reach the external flash before any
        // flash command is accepted.
        self.connection.command(Command::SpiAttach {
            spi_params: SpiAttachParams::default(),
        })?;
        self.connection.command(Command::SpiSetParams {
            spi_params: SpiSetParams::new(FLASH_TOTAL_SIZE),
        })?;

        Ok(())
    }

    /// Query the loader for the chip's security info.
    pub fn security_info(&mut self) -> Result<SecurityInfo, Error> {
        let response = self.connection.command(Command::GetSecurityInfo)?;
        let info = SecurityInfo::parse(&response.data)?;

        Ok(info)
    }

    /// Write `data` to flash at `addr`, streaming it deflate-compressed.
    pub fn flash_image_compressed(
        &mut self,
        data: &[u8],
        addr: u32,
        mut progress: Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(data).map_err(Error::from).flashing()?;
        let compressed = encoder.finish().map_err(Error::from).flashing()?;

        info!(
            "Compressed {} bytes to {} ({:.1}x)",
            data.len(),
            compressed.len(),
            data.len() as f64 / compressed.len() as f64
        );

        let erase_size = erase_size(data.len());
        let blocks = block_count(compressed.len(), FLASH_BLOCK_SIZE);

        // The erase happens during FLASH_DEFL_BEGIN, which is why it gets an
        // erase-size-scaled timeout.
        self.connection
            .command(Command::FlashDeflBegin {
                size: erase_size,
                blocks,
                block_size: FLASH_BLOCK_SIZE as u32,
                offset: addr,
            })
            .flashing()?;

        if let Some(progress) = progress.as_mut() {
            progress.init(addr, blocks as usize);
        }

        for (sequence, block) in compressed.chunks(FLASH_BLOCK_SIZE).enumerate() {
            self.write_block(Command::FlashDeflData {
                data: block,
                sequence: sequence as u32,
            })?;

            if let Some(progress) = progress.as_mut() {
                progress.update(sequence + 1);
            }
        }

        self.finish_deflate_stream()?;

        if let Some(progress) = progress.as_mut() {
            progress.finish();
        }

        Ok(())
    }

    /// Write `data` to flash at `addr` uncompressed, one padded block at a
    /// time. Slower than the compressed path; kept for loaders without
    /// deflate support.
    pub fn flash_image(
        &mut self,
        data: &[u8],
        addr: u32,
        mut progress: Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        let erase_size = erase_size(data.len());
        let blocks = block_count(data.len(), FLASH_BLOCK_SIZE);

        self.connection
            .command(Command::FlashBegin {
                size: erase_size,
                blocks,
                block_size: FLASH_BLOCK_SIZE as u32,
                offset: addr,
            })
            .flashing()?;

        if let Some(progress) = progress.as_mut() {
            progress.init(addr, blocks as usize);
        }

        for (sequence, block) in data.chunks(FLASH_BLOCK_SIZE).enumerate() {
            self.write_block(Command::FlashData {
                data: block,
                sequence: sequence as u32,
            })?;

            if let Some(progress) = progress.as_mut() {
                progress.update(sequence + 1);
            }
        }

        if let Some(progress) = progress.as_mut() {
            progress.finish();
        }

        Ok(())
    }

    /// Deliver a single data block, retrying on transport errors. A failure
    /// response from the loader is final; a timeout may just mean the
    /// acknowledgement got lost.
    fn write_block(&mut self, command: Command<'_>) -> Result<(), Error> {
        let mut attempt = 1;

        loop {
            match self.connection.command(command) {
                Ok(_) => return Ok(()),
                Err(err @ (Error::Connection(_) | Error::Flashing(_)))
                    if attempt < BLOCK_ATTEMPTS =>
                {
                    debug!("Data block write failed ({err}), retrying");
                    self.connection.flush_input()?;
                    sleep(BLOCK_RETRY_DELAY);
                    attempt += 1;
                }
                Err(err) => return Err(err).flashing(),
            }
        }
    }

    /// Close the deflate stream, staying in the bootloader so that further
    /// regions (or the reboot command) can follow. The device occasionally
    /// resets before acknowledging, so a missing response is tolerated.
    fn finish_deflate_stream(&mut self) -> Result<(), Error> {
        self.connection
            .write_command(&Command::FlashDeflEnd { reboot: false })?;

        match self
            .connection
            .read_response_for(CommandType::FlashDeflEnd, CommandType::FlashDeflEnd.timeout())
        {
            Ok(response) if response.is_success() => {}
            Ok(response) => warn!(
                "Deflate end reported status=0x{:02X} error=0x{:02X}",
                response.status, response.error
            ),
            Err(err) => warn!("No response to deflate end: {err}"),
        }

        Ok(())
    }

    /// Compare the MD5 of `data` against the device's own digest of the
    /// flash range starting at `addr`.
    pub fn verify_flash(&mut self, addr: u32, data: &[u8]) -> Result<(), Error> {
        let mut hasher = Md5::new();
        hasher.update(data);
        let expected: String = hasher
            .finalize()
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect();

        let response = self
            .connection
            .command(Command::FlashMd5 {
                offset: addr,
                size: data.len() as u32,
            })
            .flashing()?;

        // The digest arrives as 32 ASCII hex characters; some loader
        // versions append further bytes, which are ignored.
        if response.data.len() < 32 {
            return Err(Error::Flashing(ConnectionError::MalformedPayload));
        }
        let actual = std::str::from_utf8(&response.data[..32])
            .map_err(|_| Error::Flashing(ConnectionError::MalformedPayload))?
            .to_ascii_lowercase();

        if actual != expected {
            return Err(Error::VerifyFailed { expected, actual });
        }

        debug!("Flash content at {addr:#x} verified");
        Ok(())
    }

    /// Leave the ROM loader and boot the flashed firmware. The flash end
    /// command is written without waiting for an acknowledgement; the hard
    /// reset that follows guarantees the exit either way.
    pub fn reboot(&mut self) -> Result<(), Error> {
        self.connection
            .write_command(&Command::FlashEnd { reboot: true })?;

        sleep(REBOOT_DELAY);
        self.connection.hard_reset()
    }
}

/// Number of bytes the ROM must pre-erase for an image of `len` bytes,
/// rounded up to whole sectors. Always derived from the uncompressed
/// length, also on the compressed path.
pub(crate) fn erase_size(len: usize) -> u32 {
    (len.div_ceil(FLASH_SECTOR_SIZE) * FLASH_SECTOR_SIZE) as u32
}

/// Number of data blocks needed for a stream of `len` bytes.
pub(crate) fn block_count(len: usize, block_size: usize) -> u32 {
    len.div_ceil(block_size) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn erase_size_rounds_to_sectors() {
        assert_eq!(erase_size(0), 0);
        assert_eq!(erase_size(1), 4096);
        assert_eq!(erase_size(4095), 4096);
        assert_eq!(erase_size(4096), 4096);
        assert_eq!(erase_size(4097), 8192);
    }

    #[test]
    fn block_count_rounds_up() {
        assert_eq!(block_count(0, 1024), 0);
        assert_eq!(block_count(1, 1024), 1);
        assert_eq!(block_count(1024, 1024), 1);
        assert_eq!(block_count(1025, 1024), 2);
    }

    #[test]
    fn spi_attach_encodes_default_pins() {
        assert_eq!(SpiAttachParams::default().encode(), [0u8; 8]);
    }

    #[test]
    fn spi_set_params_layout() {
        let encoded = SpiSetParams::new(FLASH_TOTAL_SIZE).encode();

        assert_eq!(encoded.len(), 24);
        assert_eq!(u32::from_le_bytes(encoded[0..4].try_into().unwrap()), 0);
        assert_eq!(
            u32::from_le_bytes(encoded[4..8].try_into().unwrap()),
            FLASH_TOTAL_SIZE
        );
        assert_eq!(
            u32::from_le_bytes(encoded[8..12].try_into().unwrap()),
            0x10000
        );
        assert_eq!(
            u32::from_le_bytes(encoded[12..16].try_into().unwrap()),
            0x1000
        );
        assert_eq!(
            u32::from_le_bytes(encoded[16..20].try_into().unwrap()),
            0x100
        );
        assert_eq!(
            u32::from_le_bytes(encoded[20..24].try_into().unwrap()),
            0xFFFF
        );
    }
}
