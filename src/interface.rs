//! Serial port abstraction
//!
//! The flasher drives the port exclusively through the [Interface] trait so
//! that the protocol and session layers stay independent of the underlying
//! serial implementation; tests substitute a scripted mock for the device
//! side. [SerialInterface] is the production implementation on top of the
//! `serialport` crate.

use std::{
    io::{Read, Write},
    time::Duration,
};

use serialport::{ClearBuffer, FlowControl, SerialPort};

use crate::error::{ConnectionError, Error};

/// Contract the flasher requires from a serial port.
pub trait Interface {
    /// Send raw bytes to the device.
    fn write_all(&mut self, data: &[u8]) -> Result<(), ConnectionError>;

    /// Read up to `buf.len()` bytes, waiting at most `timeout`. Returns the
    /// number of bytes read; zero indicates the timeout elapsed.
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ConnectionError>;

    /// Discard any buffered input.
    fn flush_input(&mut self) -> Result<(), ConnectionError>;

    /// Drive the DTR modem-control line.
    fn set_dtr(&mut self, level: bool) -> Result<(), ConnectionError>;

    /// Drive the RTS modem-control line.
    fn set_rts(&mut self, level: bool) -> Result<(), ConnectionError>;
}

/// [Interface] implementation backed by a system serial port.
pub struct SerialInterface {
    serial_port: Box<dyn SerialPort>,
}

impl SerialInterface {
    /// Open `port` at `baud`, configured as 8N1 without flow control.
    pub fn open(port: &str, baud: u32) -> Result<Self, Error> {
        let serial_port = serialport::new(port, baud)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(100))
            .open()?;

        Ok(SerialInterface { serial_port })
    }
}

impl Interface for SerialInterface {
    fn write_all(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        self.serial_port.write_all(data)?;
        self.serial_port.flush()?;
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ConnectionError> {
        self.serial_port.set_timeout(timeout)?;

        match self.serial_port.read(buf) {
            Ok(n) => Ok(n),
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    fn flush_input(&mut self) -> Result<(), ConnectionError> {
        self.serial_port.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), ConnectionError> {
        self.serial_port.write_data_terminal_ready(level)?;
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<(), ConnectionError> {
        self.serial_port.write_request_to_send(level)?;
        Ok(())
    }
}

/// Enumerate candidate serial device paths on the host.
pub fn list_ports() -> Result<Vec<String>, Error> {
    let ports = serialport::available_ports().map_err(ConnectionError::from)?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}
