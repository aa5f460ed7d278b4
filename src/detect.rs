//! Auto-detection of connected devices
//!
//! Walks the host's serial ports and probes each one by resetting it into
//! the ROM loader and syncing, then asking for the chip identity.

use log::debug;

use crate::{
    error::Error,
    flasher::Flasher,
    interface::{list_ports, SerialInterface},
    targets::Chip,
};

/// A device that answered the bootloader probe.
#[derive(Debug, Clone)]
pub struct DetectedDevice {
    /// Serial port the device is attached to
    pub port: String,
    /// Raw chip id from the security info, when available
    pub chip_id: Option<u32>,
    /// Decoded chip family, when the id is a known one
    pub chip: Option<Chip>,
}

impl DetectedDevice {
    /// Human-readable chip name.
    pub fn chip_name(&self) -> String {
        match (self.chip, self.chip_id) {
            (Some(chip), _) => chip.to_string(),
            (None, Some(id)) => format!("unknown chip (id {id:#04x})"),
            (None, None) => "ESP32 (unknown variant)".to_string(),
        }
    }
}

/// Probe all candidate ports and return the first responding device.
pub fn detect_device(baud: u32) -> Result<DetectedDevice, Error> {
    let ports = list_ports()?;
    if ports.is_empty() {
        return Err(Error::NoSerial);
    }

    for port in ports {
        match try_port(&port, baud) {
            Ok(device) => return Ok(device),
            Err(err) => debug!("No device on {port}: {err}"),
        }
    }

    Err(Error::DeviceNotDetected)
}

/// Probe a specific port.
pub fn detect_on_port(port: &str, baud: u32) -> Result<DetectedDevice, Error> {
    try_port(port, baud)
}

/// Probe every candidate port and collect all responding devices.
pub fn list_devices(baud: u32) -> Result<Vec<DetectedDevice>, Error> {
    let mut devices = Vec::new();

    for port in list_ports()? {
        match try_port(&port, baud) {
            Ok(device) => devices.push(device),
            Err(err) => debug!("No device on {port}: {err}"),
        }
    }

    Ok(devices)
}

fn try_port(port_name: &str, baud: u32) -> Result<DetectedDevice, Error> {
    let port = SerialInterface::open(port_name, baud)?;
    let mut flasher = Flasher::new(Box::new(port));

    flasher.connection().reset_to_bootloader()?;
    flasher.connection().sync()?;

    // A device that syncs but refuses the security-info command is still an
    // ESP32-family loader, just one we cannot name.
    match flasher.security_info() {
        Ok(info) => Ok(DetectedDevice {
            port: port_name.to_string(),
            chip_id: Some(info.chip_id),
            chip: info.chip(),
        }),
        Err(err) => {
            debug!("Security info not available on {port_name}: {err}");
            Ok(DetectedDevice {
                port: port_name.to_string(),
                chip_id: None,
                chip: None,
            })
        }
    }
}
