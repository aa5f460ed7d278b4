//! A library and application for flashing Papyrix firmware to ESP32-C3
//! devices over serial
//!
//! The ROM bootloader of the chip speaks a SLIP-framed request/response
//! protocol; this crate implements the framing ([slip]), the command set
//! ([connection]), and a session driver ([flasher]) that resets the chip
//! into download mode, syncs, streams the image deflate-compressed, and
//! reboots into the new firmware.
//!
//! ## As an application
//!
//! ```bash
//! $ papyrix-flasher flash firmware.bin
//! ```
//!
//! ## As a library
//!
//! ```no_run
//! use papyrix_flasher::{
//!     constants::{DEFAULT_BAUD_RATE, FIRMWARE_ADDRESS},
//!     flasher::Flasher,
//!     interface::SerialInterface,
//! };
//!
//! # fn main() -> Result<(), papyrix_flasher::error::Error> {
//! let port = SerialInterface::open("/dev/ttyACM0", DEFAULT_BAUD_RATE)?;
//! let mut flasher = Flasher::new(Box::new(port));
//!
//! flasher.connect()?;
//! flasher.flash_image_compressed(&[0xE9, 0x04], FIRMWARE_ADDRESS, None)?;
//! flasher.reboot()?;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod constants;
pub mod detect;
pub mod error;
pub mod flasher;
pub mod interface;
pub mod slip;
pub mod targets;

pub use self::{
    error::Error,
    flasher::{Flasher, ProgressCallbacks},
    targets::Chip,
};

/// Logging utilities
pub mod logging {
    use env_logger::Env;
    use log::LevelFilter;

    /// Initialize the logger with the given [LevelFilter]
    pub fn initialize_logger(filter: LevelFilter) {
        env_logger::Builder::from_env(Env::default().default_filter_or(filter.as_str()))
            .format_target(false)
            .init();
    }
}
