//! Library and application errors

use std::{
    fmt::{Display, Formatter},
    io,
};

use miette::Diagnostic;
use thiserror::Error;

use crate::connection::command::CommandType;

#[derive(Error, Debug, Diagnostic)]
#[non_exhaustive]
pub enum Error {
    #[error("Error while connecting to device")]
    #[diagnostic(transparent)]
    Connection(#[source] ConnectionError),
    #[error("Communication error while flashing device")]
    #[diagnostic(transparent)]
    Flashing(#[source] ConnectionError),
    #[error("The bootloader returned an error")]
    #[diagnostic(transparent)]
    RomError(#[from] RomError),
    #[error("Failed to sync with the bootloader after {0} attempts")]
    #[diagnostic(
        code(papyrix_flasher::sync_failed),
        help("Ensure that the device is connected and the reset and boot pins are not being held down")
    )]
    SyncFailed(usize),
    #[error("Flash content verification failed: expected MD5 {expected}, device reported {actual}")]
    #[diagnostic(code(papyrix_flasher::verify_failed))]
    VerifyFailed { expected: String, actual: String },
    #[error("No serial ports could be detected")]
    #[diagnostic(
        code(papyrix_flasher::no_serial),
        help("Make sure you have connected a device to the host system")
    )]
    NoSerial,
    #[error("No ESP32-C3 device could be detected on any serial port")]
    #[diagnostic(
        code(papyrix_flasher::no_device),
        help("Specify the serial port explicitly if the device does not auto-reset into download mode")
    )]
    DeviceNotDetected,
}

#[derive(Error, Debug, Diagnostic)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("IO error while using serial port: {0}")]
    #[diagnostic(code(papyrix_flasher::serial_error))]
    Serial(#[source] serialport::Error),
    #[error("Serial port not found")]
    #[diagnostic(
        code(papyrix_flasher::device_not_found),
        help("Ensure that the device is connected and your host recognizes the serial adapter")
    )]
    DeviceNotFound,
    #[error("Timeout while running {0}command")]
    #[diagnostic(code(papyrix_flasher::timeout))]
    Timeout(TimedOutCommand),
    #[error("Received response is too short: {0} bytes")]
    #[diagnostic(code(papyrix_flasher::short_response))]
    ResponseTooShort(usize),
    #[error("Received response has invalid direction byte {0:#04x}")]
    #[diagnostic(code(papyrix_flasher::invalid_direction))]
    InvalidDirection(u8),
    #[error("Received response declares {declared} payload bytes but carries {available}")]
    #[diagnostic(code(papyrix_flasher::payload_mismatch))]
    PayloadMismatch { declared: usize, available: usize },
    #[error("Received response payload is malformed")]
    #[diagnostic(code(papyrix_flasher::malformed_payload))]
    MalformedPayload,
}

#[derive(Debug, Default, Clone)]
pub struct TimedOutCommand {
    command: Option<CommandType>,
}

impl From<CommandType> for TimedOutCommand {
    fn from(c: CommandType) -> Self {
        TimedOutCommand { command: Some(c) }
    }
}

impl Display for TimedOutCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.command {
            Some(command) => write!(f, "{} ", command),
            None => Ok(()),
        }
    }
}

impl From<serialport::Error> for ConnectionError {
    fn from(err: serialport::Error) -> Self {
        match err.kind() {
            serialport::ErrorKind::Io(kind) => from_error_kind(kind, err),
            serialport::ErrorKind::NoDevice => ConnectionError::DeviceNotFound,
            _ => ConnectionError::Serial(err),
        }
    }
}

impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        Self::Connection(err.into())
    }
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        from_error_kind(err.kind(), err)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Connection(err.into())
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Self::Connection(err)
    }
}

fn from_error_kind<E: Into<serialport::Error>>(kind: io::ErrorKind, err: E) -> ConnectionError {
    match kind {
        io::ErrorKind::TimedOut => ConnectionError::Timeout(TimedOutCommand::default()),
        io::ErrorKind::NotFound => ConnectionError::DeviceNotFound,
        _ => ConnectionError::Serial(err.into()),
    }
}

/// One-byte error codes reported by the ROM loader.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error, Diagnostic)]
#[repr(u8)]
#[non_exhaustive]
pub enum RomErrorKind {
    #[error("invalid message")]
    #[diagnostic(code(papyrix_flasher::rom::invalid_message))]
    InvalidMessage = 0x05,
    #[error("failed to act")]
    #[diagnostic(code(papyrix_flasher::rom::failed))]
    FailedToAct = 0x06,
    #[error("invalid CRC")]
    #[diagnostic(code(papyrix_flasher::rom::crc))]
    InvalidCrc = 0x07,
    #[error("flash write error")]
    #[diagnostic(code(papyrix_flasher::rom::flash_write))]
    FlashWriteError = 0x08,
    #[error("flash read error")]
    #[diagnostic(code(papyrix_flasher::rom::flash_read))]
    FlashReadError = 0x09,
    #[error("flash read length error")]
    #[diagnostic(code(papyrix_flasher::rom::flash_read_length))]
    FlashReadLengthError = 0x0A,
    #[error("deflate error")]
    #[diagnostic(code(papyrix_flasher::rom::deflate))]
    DeflateError = 0x0B,
    #[error("unknown error")]
    #[diagnostic(code(papyrix_flasher::rom::other))]
    Unknown = 0xFF,
}

impl From<u8> for RomErrorKind {
    fn from(raw: u8) -> Self {
        match raw {
            0x05 => RomErrorKind::InvalidMessage,
            0x06 => RomErrorKind::FailedToAct,
            0x07 => RomErrorKind::InvalidCrc,
            0x08 => RomErrorKind::FlashWriteError,
            0x09 => RomErrorKind::FlashReadError,
            0x0A => RomErrorKind::FlashReadLengthError,
            0x0B => RomErrorKind::DeflateError,
            _ => RomErrorKind::Unknown,
        }
    }
}

/// A command that the ROM loader answered with a failure response.
#[derive(Copy, Clone, Debug, Error, Diagnostic)]
#[non_exhaustive]
#[error("Command {command} failed: status=0x{status:02X} error=0x{error:02X} ({kind})")]
pub struct RomError {
    command: CommandType,
    status: u8,
    error: u8,
    #[source]
    kind: RomErrorKind,
}

impl RomError {
    pub fn new(command: CommandType, status: u8, error: u8) -> RomError {
        RomError {
            command,
            status,
            error,
            kind: RomErrorKind::from(error),
        }
    }
}

pub(crate) trait ResultExt {
    /// mark an error as having occurred during the flashing stage
    fn flashing(self) -> Self;
    /// mark the command from which this error originates
    fn for_command(self, command: CommandType) -> Self;
}

impl<T> ResultExt for Result<T, Error> {
    fn flashing(self) -> Self {
        match self {
            Err(Error::Connection(err)) => Err(Error::Flashing(err)),
            res => res,
        }
    }

    fn for_command(self, command: CommandType) -> Self {
        match self {
            Err(Error::Connection(ConnectionError::Timeout(_))) => {
                Err(Error::Connection(ConnectionError::Timeout(command.into())))
            }
            Err(Error::Flashing(ConnectionError::Timeout(_))) => {
                Err(Error::Flashing(ConnectionError::Timeout(command.into())))
            }
            res => res,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rom_error_kind_from_raw() {
        assert_eq!(RomErrorKind::from(0x05), RomErrorKind::InvalidMessage);
        assert_eq!(RomErrorKind::from(0x07), RomErrorKind::InvalidCrc);
        assert_eq!(RomErrorKind::from(0x0B), RomErrorKind::DeflateError);
        assert_eq!(RomErrorKind::from(0x99), RomErrorKind::Unknown);
    }

    #[test]
    fn rom_error_display_names_the_failure() {
        let err = RomError::new(CommandType::SpiAttach, 0x01, 0x07);
        let message = err.to_string();

        assert!(message.contains("0x01"));
        assert!(message.contains("0x07"));
        assert!(message.contains("invalid CRC"));
    }

    #[test]
    fn rom_error_display_for_every_code() {
        for code in [0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x42] {
            let err = RomError::new(CommandType::FlashDeflData, 0x01, code);
            assert!(!err.to_string().is_empty());
        }
    }
}
