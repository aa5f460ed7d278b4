//! DTR/RTS reset sequences for the auto-reset circuit
//!
//! Dev boards wire DTR and RTS through a pair of transistors to the chip's
//! EN (reset) and IO0 (boot select) pins, which inverts the polarity of
//! both lines as seen from the host.

use std::{thread::sleep, time::Duration};

use log::debug;

use crate::{error::Error, interface::Interface};

/// How long EN is held low at the start of a reset
const RESET_HOLD_DELAY: Duration = Duration::from_millis(100);
/// How long the boot-select line is held after releasing reset
const BOOT_SELECT_DELAY: Duration = Duration::from_millis(50);
/// How long to let the ROM settle after the sequence completes
const SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Some strategy for resetting a target device
pub trait ResetStrategy {
    fn reset(&self, interface: &mut dyn Interface) -> Result<(), Error>;

    fn set_dtr(&self, interface: &mut dyn Interface, level: bool) -> Result<(), Error> {
        interface.set_dtr(level)?;
        Ok(())
    }

    fn set_rts(&self, interface: &mut dyn Interface, level: bool) -> Result<(), Error> {
        interface.set_rts(level)?;
        Ok(())
    }
}

/// Reset the chip into the ROM download mode.
///
/// Asserts reset while boot-select is released, then releases reset with
/// boot-select asserted, then releases boot-select, leaving the chip
/// executing the ROM loader in download mode.
#[derive(Debug, Clone, Copy)]
pub struct BootloaderReset;

impl ResetStrategy for BootloaderReset {
    fn reset(&self, interface: &mut dyn Interface) -> Result<(), Error> {
        debug!("Resetting into download mode");

        self.set_rts(interface, true)?; // EN = LOW, chip in reset
        self.set_dtr(interface, false)?; // IO0 = HIGH
        sleep(RESET_HOLD_DELAY);

        self.set_rts(interface, false)?; // EN = HIGH, chip out of reset
        self.set_dtr(interface, true)?; // IO0 = LOW, select download boot
        sleep(BOOT_SELECT_DELAY);

        self.set_rts(interface, true)?; // IO0 released
        self.set_dtr(interface, false)?;
        sleep(BOOT_SELECT_DELAY);

        self.set_rts(interface, false)?;
        self.set_dtr(interface, false)?;

        // Drop whatever the boot ROM printed while the lines were toggling.
        interface.flush_input()?;
        sleep(SETTLE_DELAY);

        Ok(())
    }
}

/// Reset the chip without touching boot-select, so it boots from flash.
#[derive(Debug, Clone, Copy)]
pub struct HardReset;

impl ResetStrategy for HardReset {
    fn reset(&self, interface: &mut dyn Interface) -> Result<(), Error> {
        debug!("Hard resetting the device");

        self.set_rts(interface, true)?; // EN = LOW
        sleep(RESET_HOLD_DELAY);
        self.set_rts(interface, false)?; // EN = HIGH, boot from flash

        Ok(())
    }
}
