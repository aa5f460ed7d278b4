//! Establish a connection with a target device
//!
//! The [Connection] struct abstracts over the serial interface and the
//! framing/encoding of commands, and provides the request/response
//! primitives that the flasher builds sessions out of.

use std::time::{Duration, Instant};

use log::debug;

use self::{
    command::{Command, CommandType},
    reset::{BootloaderReset, HardReset, ResetStrategy},
};
use crate::{
    constants::DIR_RESPONSE,
    error::{ConnectionError, Error, ResultExt, RomError},
    interface::Interface,
    slip,
};

pub mod command;
pub mod reset;

/// How often the sync request is retried before giving up.
const SYNC_ATTEMPTS: usize = 10;
/// The ROM answers a successful sync with a burst of echo responses; this
/// many extra reads are made to clear them. Empirically enough.
const SYNC_DRAIN_READS: usize = 7;
const SYNC_DRAIN_TIMEOUT: Duration = Duration::from_millis(100);
/// Granularity of the blocking reads that make up a response wait.
const READ_CHUNK_TIMEOUT: Duration = Duration::from_millis(100);

/// The smallest well-formed response: an eight byte header followed by the
/// status and error bytes.
const MIN_RESPONSE_SIZE: usize = 10;

/// A response from a target device following a command
#[derive(Debug, Clone)]
pub struct CommandResponse {
    /// Echo of the request opcode
    pub command: u8,
    /// Command-specific return value
    pub value: u32,
    /// Payload with the trailing status bytes split off
    pub data: Vec<u8>,
    pub status: u8,
    pub error: u8,
}

impl CommandResponse {
    /// Parse a response packet (after unstuffing).
    ///
    /// When the declared payload carries at least two bytes, the final two
    /// are the status and error; shorter payloads leave both at zero and
    /// pass any data through.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ConnectionError> {
        if data.len() < MIN_RESPONSE_SIZE {
            return Err(ConnectionError::ResponseTooShort(data.len()));
        }
        if data[0] != DIR_RESPONSE {
            return Err(ConnectionError::InvalidDirection(data[0]));
        }

        let command = data[1];
        let declared = u16::from_le_bytes(data[2..4].try_into().unwrap()) as usize;
        let value = u32::from_le_bytes(data[4..8].try_into().unwrap());

        let available = data.len() - 8;
        if declared > available {
            return Err(ConnectionError::PayloadMismatch {
                declared,
                available,
            });
        }

        let (data, status, error) = if declared >= 2 {
            (
                data[8..8 + declared - 2].to_vec(),
                data[8 + declared - 2],
                data[8 + declared - 1],
            )
        } else {
            (data[8..8 + declared].to_vec(), 0, 0)
        };

        Ok(CommandResponse {
            command,
            value,
            data,
            status,
            error,
        })
    }

    /// Whether the device reported success.
    pub fn is_success(&self) -> bool {
        self.status == 0 && self.error == 0
    }
}

/// An established connection with a target device
pub struct Connection {
    port: Box<dyn Interface>,
    buffer: Vec<u8>,
}

impl Connection {
    pub fn new(port: Box<dyn Interface>) -> Self {
        Connection {
            port,
            buffer: Vec::new(),
        }
    }

    /// Reset the chip into the ROM download mode.
    pub fn reset_to_bootloader(&mut self) -> Result<(), Error> {
        self.buffer.clear();
        BootloaderReset.reset(self.port.as_mut())
    }

    /// Reset the chip so that it boots from flash.
    pub fn hard_reset(&mut self) -> Result<(), Error> {
        HardReset.reset(self.port.as_mut())
    }

    /// Try to sync with the ROM loader.
    ///
    /// Repeats the sync request until the loader answers with a successful
    /// echo, then clears the remainder of the echo burst.
    pub fn sync(&mut self) -> Result<(), Error> {
        for attempt in 1..=SYNC_ATTEMPTS {
            debug!("Sync attempt {attempt}/{SYNC_ATTEMPTS}");

            if self.flush_input().is_err() {
                continue;
            }
            if self.write_command(&Command::Sync).is_err() {
                continue;
            }

            match self.read_response_for(CommandType::Sync, CommandType::Sync.timeout()) {
                Ok(response) if response.is_success() => {
                    self.drain_sync_echoes();
                    return Ok(());
                }
                _ => continue,
            }
        }

        Err(Error::SyncFailed(SYNC_ATTEMPTS))
    }

    fn drain_sync_echoes(&mut self) {
        for _ in 0..SYNC_DRAIN_READS {
            let _ = self.read_response(SYNC_DRAIN_TIMEOUT);
        }
    }

    /// Write a command without waiting for a response.
    pub fn write_command(&mut self, command: &Command<'_>) -> Result<(), Error> {
        debug!("Writing command: {:?}", command.command_type());

        let mut packet = Vec::new();
        command.write(&mut packet).map_err(ConnectionError::from)?;

        self.port.write_all(&slip::encode(&packet))?;
        Ok(())
    }

    /// Write a command and wait for a successful response.
    pub fn command(&mut self, command: Command<'_>) -> Result<CommandResponse, Error> {
        let ty = command.command_type();
        let timeout = command.timeout();

        self.write_command(&command).for_command(ty)?;

        let response = self.read_response_for(ty, timeout)?;
        if !response.is_success() {
            let _ = self.port.flush_input();
            return Err(RomError::new(ty, response.status, response.error).into());
        }

        Ok(response)
    }

    /// Wait for the response matching `ty`, skipping unrelated responses
    /// (stale sync echoes, mostly).
    pub(crate) fn read_response_for(
        &mut self,
        ty: CommandType,
        timeout: Duration,
    ) -> Result<CommandResponse, Error> {
        let deadline = Instant::now() + timeout;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Connection(ConnectionError::Timeout(ty.into())));
            }

            match self.read_response(deadline - now)? {
                Some(response) if response.command == ty as u8 => return Ok(response),
                Some(response) => {
                    debug!("Ignoring response for command {:#04x}", response.command)
                }
                None => {}
            }
        }
    }

    /// Read and parse the next response frame, or `None` if the timeout
    /// elapses first.
    pub fn read_response(&mut self, timeout: Duration) -> Result<Option<CommandResponse>, Error> {
        let deadline = Instant::now() + timeout;

        loop {
            // Drain every complete frame already buffered before touching
            // the port again.
            while let Some((data, consumed)) = self.next_frame() {
                self.buffer.drain(..consumed);

                if data.len() >= MIN_RESPONSE_SIZE {
                    let response = CommandResponse::from_bytes(&data)?;
                    return Ok(Some(response));
                }
                debug!("Discarding runt frame of {} bytes", data.len());
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let mut chunk = [0u8; 256];
            let read = self
                .port
                .read_timeout(&mut chunk, READ_CHUNK_TIMEOUT.min(deadline - now))?;
            if read > 0 {
                self.buffer.extend_from_slice(&chunk[..read]);
            }
        }
    }

    fn next_frame(&self) -> Option<(Vec<u8>, usize)> {
        slip::extract_frame(&self.buffer)
            .map(|(frame, rest)| (slip::decode(frame), self.buffer.len() - rest.len()))
    }

    /// Discard buffered input on both sides of the port.
    pub fn flush_input(&mut self) -> Result<(), Error> {
        self.buffer.clear();
        self.port.flush_input()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn well_formed(status: u8, error: u8) -> Vec<u8> {
        let mut response = vec![0x01, 0x08, 0x02, 0x00];
        response.extend_from_slice(&0x1234_5678u32.to_le_bytes());
        response.push(status);
        response.push(error);
        response
    }

    #[test]
    fn parse_success_response() {
        let response = CommandResponse::from_bytes(&well_formed(0, 0)).unwrap();

        assert_eq!(response.command, 0x08);
        assert_eq!(response.value, 0x1234_5678);
        assert!(response.data.is_empty());
        assert!(response.is_success());
    }

    #[test]
    fn status_or_error_fails_the_response() {
        assert!(!CommandResponse::from_bytes(&well_formed(1, 0))
            .unwrap()
            .is_success());
        assert!(!CommandResponse::from_bytes(&well_formed(0, 1))
            .unwrap()
            .is_success());
    }

    #[test]
    fn parse_response_with_data() {
        let mut response = vec![0x01, 0x14, 0x05, 0x00];
        response.extend_from_slice(&[0; 4]);
        response.extend_from_slice(&[0xAA, 0xBB, 0xCC]);
        response.extend_from_slice(&[0x00, 0x00]);

        let response = CommandResponse::from_bytes(&response).unwrap();
        assert_eq!(response.data, [0xAA, 0xBB, 0xCC]);
        assert!(response.is_success());
    }

    #[test]
    fn parse_zero_length_payload() {
        let mut response = vec![0x01, 0x08, 0x00, 0x00];
        response.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        response.extend_from_slice(&[0x55, 0x55]);

        let response = CommandResponse::from_bytes(&response).unwrap();
        assert!(response.data.is_empty());
        assert!(response.is_success());
    }

    #[test]
    fn reject_short_response() {
        assert!(matches!(
            CommandResponse::from_bytes(&[0x01; 9]),
            Err(ConnectionError::ResponseTooShort(9))
        ));
        assert!(CommandResponse::from_bytes(&[]).is_err());
    }

    #[test]
    fn reject_wrong_direction() {
        let mut response = well_formed(0, 0);
        response[0] = 0x00;

        assert!(matches!(
            CommandResponse::from_bytes(&response),
            Err(ConnectionError::InvalidDirection(0x00))
        ));
    }

    #[test]
    fn reject_declared_length_overrun() {
        let mut response = well_formed(0, 0);
        response[2] = 100;

        assert!(matches!(
            CommandResponse::from_bytes(&response),
            Err(ConnectionError::PayloadMismatch {
                declared: 100,
                available: 2
            })
        ));
    }
}
