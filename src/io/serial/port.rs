// src/io/serial/port.rs
//
// Real serial transport built on the serialport crate. The port is opened
// once and cloned so the read loop and the writer each own a handle.

use serialport::{DataBits, Parity as SpParity, SerialPort, SerialPortType, StopBits};
use std::io::{self, Read, Write};
use std::time::Duration;

use super::line::{Parity, SerialLineConfig};
use crate::io::{BridgeError, LinkHandles, PortInfo, Transport};

/// One handle onto an open port
struct PortHandle(Box<dyn SerialPort>);

impl Read for PortHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for PortHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl SerialLineConfig {
    /// Out-of-range data bits fall back to 8
    fn serialport_data_bits(&self) -> DataBits {
        match self.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        }
    }

    /// Anything but 2 means one stop bit
    fn serialport_stop_bits(&self) -> StopBits {
        match self.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        }
    }

    fn serialport_parity(&self) -> SpParity {
        match self.parity {
            Parity::None => SpParity::None,
            Parity::Odd => SpParity::Odd,
            Parity::Even => SpParity::Even,
        }
    }
}

/// Transport for physical (USB/UART) serial ports
#[derive(Clone, Debug, Default)]
pub struct SerialTransport {
    line: SerialLineConfig,
}

impl SerialTransport {
    pub fn new(line: SerialLineConfig) -> Self {
        Self { line }
    }
}

impl Transport for SerialTransport {
    fn kind(&self) -> &'static str {
        "serial"
    }

    /// On macOS, /dev/tty.* devices are hidden in favour of their /dev/cu.*
    /// twins. The tty (terminal) devices block on open waiting for carrier
    /// detect.
    fn list_ports(&self) -> Result<Vec<PortInfo>, BridgeError> {
        let ports =
            serialport::available_ports().map_err(|e| BridgeError::Enumeration(e.to_string()))?;

        Ok(ports
            .into_iter()
            .filter(|_p| {
                #[cfg(target_os = "macos")]
                {
                    !_p.port_name.starts_with("/dev/tty.")
                }
                #[cfg(not(target_os = "macos"))]
                {
                    true
                }
            })
            .map(|p| match p.port_type {
                SerialPortType::UsbPort(info) => PortInfo {
                    port_name: p.port_name,
                    port_type: "USB".to_string(),
                    manufacturer: info.manufacturer,
                    product: info.product,
                    serial_number: info.serial_number,
                    vid: Some(info.vid),
                    pid: Some(info.pid),
                },
                SerialPortType::BluetoothPort => PortInfo::named(p.port_name, "Bluetooth"),
                SerialPortType::PciPort => PortInfo::named(p.port_name, "PCI"),
                SerialPortType::Unknown => PortInfo::named(p.port_name, "Unknown"),
            })
            .collect())
    }

    fn open(
        &self,
        port: &str,
        baud_rate: u32,
        poll_interval: Duration,
    ) -> Result<LinkHandles, BridgeError> {
        // The read timeout doubles as the loop's poll interval
        let reader = serialport::new(port, baud_rate)
            .data_bits(self.line.serialport_data_bits())
            .stop_bits(self.line.serialport_stop_bits())
            .parity(self.line.serialport_parity())
            .timeout(poll_interval)
            .open()
            .map_err(|e| BridgeError::connection(port, e.to_string()))?;

        let writer = reader
            .try_clone()
            .map_err(|e| BridgeError::connection(port, format!("clone handle: {}", e)))?;

        tlog!(
            "[serial] Opened {} at {} baud ({})",
            port,
            baud_rate,
            self.line
        );

        Ok(LinkHandles {
            reader: Box::new(PortHandle(reader)),
            writer: Box::new(PortHandle(writer)),
        })
    }
}
