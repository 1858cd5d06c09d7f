//! Serial port communication implementation
//!
//! Provides low-level serial port operations for direct connection to motion
//! controllers via USB or RS-232.
//!
//! Supports:
//! - Port enumeration and discovery
//! - Opening a port from the connection settings
//! - Line-oriented reads with deadlines

use stagekit_core::{Error, MotionError, Result};
use stagekit_settings::ConnectionSettings;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct SerialPortInfo {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    pub port_name: String,

    /// Port description (e.g., "USB Serial Port")
    pub description: String,

    /// Manufacturer name if available
    pub manufacturer: Option<String>,

    /// USB vendor ID if applicable
    pub vid: Option<u16>,

    /// USB product ID if applicable
    pub pid: Option<u16>,
}

impl SerialPortInfo {
    /// Create a new port info
    pub fn new(port_name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            description: description.into(),
            manufacturer: None,
            vid: None,
            pid: None,
        }
    }
}

/// List serial ports that look like motion controllers
///
/// Filters to the usual controller patterns:
/// - Windows: COM* (e.g., COM1, COM3)
/// - Linux: /dev/ttyUSB*, /dev/ttyACM*
/// - macOS: /dev/cu.usbserial-*, /dev/cu.usbmodem*
pub fn list_ports() -> Result<Vec<SerialPortInfo>> {
    let ports = serialport::available_ports().map_err(|e| {
        tracing::error!("Failed to enumerate serial ports: {}", e);
        Error::other(format!("Failed to enumerate ports: {}", e))
    })?;

    Ok(ports
        .iter()
        .filter(|port| is_controller_port(&port.port_name))
        .map(|port| match &port.port_type {
            serialport::SerialPortType::UsbPort(usb) => SerialPortInfo {
                port_name: port.port_name.clone(),
                description: format!(
                    "USB {} {}",
                    usb.manufacturer.as_deref().unwrap_or("Device"),
                    usb.product.as_deref().unwrap_or("Serial Port")
                ),
                manufacturer: usb.manufacturer.clone(),
                vid: Some(usb.vid),
                pid: Some(usb.pid),
            },
            _ => SerialPortInfo::new(&port.port_name, "Serial Port"),
        })
        .collect())
}

fn is_controller_port(port_name: &str) -> bool {
    if let Some(number) = port_name.strip_prefix("COM") {
        return !number.is_empty() && number.chars().all(|c| c.is_ascii_digit());
    }
    port_name.starts_with("/dev/ttyUSB")
        || port_name.starts_with("/dev/ttyACM")
        || port_name.starts_with("/dev/cu.usbserial-")
        || port_name.starts_with("/dev/cu.usbmodem")
}

/// Low-level serial port interface
pub trait SerialPort: Send {
    /// Write data to the port
    fn write(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Read available data; a read that times out returns `ErrorKind::TimedOut`
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Get the port name
    fn name(&self) -> String;

    /// Close the port
    fn close(&mut self) -> io::Result<()>;
}

/// Real serial port implementation using the serialport crate
pub struct RealSerialPort {
    name: String,
    port: Option<Box<dyn serialport::SerialPort>>,
}

impl RealSerialPort {
    /// Open the port named in the connection settings (8N1, no flow control)
    pub fn open(settings: &ConnectionSettings) -> Result<Self> {
        let port = serialport::new(&settings.port, settings.baud_rate)
            // Short timeout so reads can poll against a deadline
            .timeout(Duration::from_millis(10))
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(|e| {
                tracing::warn!("Failed to open serial port {}: {}", settings.port, e);
                MotionError::critical(format!("Failed to open port {}: {}", settings.port, e))
            })?;

        tracing::info!(
            "Opened serial port {} at {} baud",
            settings.port,
            settings.baud_rate
        );
        Ok(Self {
            name: settings.port.clone(),
            port: Some(port),
        })
    }
}

impl SerialPort for RealSerialPort {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match self.port.as_mut() {
            Some(port) => {
                port.write_all(data)?;
                port.flush()?;
                Ok(data.len())
            }
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "port closed")),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.as_mut() {
            Some(port) => port.read(buf),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "port closed")),
        }
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn close(&mut self) -> io::Result<()> {
        self.port = None;
        Ok(())
    }
}

/// Splits serial input into trimmed, non-empty lines
#[derive(Debug, Default)]
pub struct LineReader {
    buffer: Vec<u8>,
}

impl LineReader {
    /// Create an empty reader
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop any partial input
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Read the next line, or `None` if `deadline` passes first
    pub fn read_line(
        &mut self,
        port: &mut dyn SerialPort,
        deadline: Instant,
    ) -> io::Result<Option<String>> {
        loop {
            if let Some(line) = self.take_line() {
                return Ok(Some(line));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }

            let mut chunk = [0u8; 256];
            match port.read(&mut chunk) {
                Ok(0) => std::thread::sleep(Duration::from_millis(1)),
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(1))
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn take_line(&mut self) -> Option<String> {
        while let Some(end) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=end).collect();
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            if !line.is_empty() {
                return Some(line);
            }
        }
        None
    }
}
