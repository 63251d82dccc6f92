//! Serial port enumeration
//!
//! Used to offer every local serial port as a potential correction source.

use serialport::{available_ports, SerialPortType};
use tracing::info;

use crate::error::ConnectError;

/// Information about a serial port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialPortInfo {
    /// Device path (e.g., /dev/ttyUSB0, COM3)
    pub device: String,
    /// USB Vendor ID (if USB)
    pub vid: Option<u16>,
    /// USB Product ID (if USB)
    pub pid: Option<u16>,
    /// USB serial number (if available)
    pub serial_number: Option<String>,
    /// USB manufacturer string
    pub manufacturer: Option<String>,
    /// USB product string
    pub product: Option<String>,
}

impl SerialPortInfo {
    /// Port without any USB details
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            vid: None,
            pid: None,
            serial_number: None,
            manufacturer: None,
            product: None,
        }
    }

    fn from_serialport(device: String, port_type: &SerialPortType) -> Self {
        match port_type {
            SerialPortType::UsbPort(usb) => Self {
                device,
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                serial_number: usb.serial_number.clone(),
                manufacturer: usb.manufacturer.clone(),
                product: usb.product.clone(),
            },
            _ => Self::new(device),
        }
    }

    /// Human-readable label, e.g. `u-blox GNSS receiver (/dev/ttyACM0)`
    pub fn label(&self) -> String {
        let description = match (&self.manufacturer, &self.product) {
            (Some(m), Some(p)) if p.starts_with(m.as_str()) => Some(p.clone()),
            (Some(m), Some(p)) => Some(format!("{} {}", m, p)),
            (None, Some(p)) => Some(p.clone()),
            (Some(m), None) => Some(m.clone()),
            (None, None) => None,
        };
        match description {
            Some(d) => format!("{} ({})", d, self.device),
            None => self.device.clone(),
        }
    }
}

/// Ports whose device path contains one of these are never offered
const SKIP_PATTERNS: &[&str] = &[
    // Bluetooth ports on macOS
    "Bluetooth",
    // Debug consoles
    "debug",
];

/// Serial port scanner
#[derive(Debug, Default)]
pub struct PortScanner;

impl PortScanner {
    pub fn new() -> Self {
        Self
    }

    /// Enumerate all available serial ports
    pub fn enumerate_ports(&self) -> Result<Vec<SerialPortInfo>, ConnectError> {
        let ports = available_ports()?;

        let result: Vec<_> = ports
            .into_iter()
            .map(|p| SerialPortInfo::from_serialport(p.port_name, &p.port_type))
            .filter(|p| !self.should_skip_port(p))
            .collect();

        info!("Found {} serial port(s)", result.len());
        for port in &result {
            info!("  {}", port.label());
        }

        Ok(result)
    }

    fn should_skip_port(&self, port: &SerialPortInfo) -> bool {
        SKIP_PATTERNS
            .iter()
            .any(|pattern| port.device.contains(pattern))
    }
}
