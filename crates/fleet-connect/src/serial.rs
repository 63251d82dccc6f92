//! Serial port connections
//!
//! `serial:<path>?baud=<n>&stopbits=<1|2>&bytesize=<5..8>&parity=<none|odd|even>`

use std::time::Duration;

use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, StopBits};
use tracing::{debug, info};

use crate::error::ConnectError;
use crate::spec::ConnectionSpec;
use crate::{BoxFuture, Connection, ConnectionIo};

/// Default baud rate when none is given
pub const DEFAULT_BAUD_RATE: u32 = 57_600;

/// Line settings of a serial connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialSettings {
    pub baud_rate: u32,
    pub stop_bits: StopBits,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub timeout: Duration,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            stop_bits: StopBits::One,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            timeout: Duration::from_millis(100),
        }
    }
}

impl SerialSettings {
    /// Read settings from the query parameters of a spec
    pub fn from_spec(spec: &ConnectionSpec) -> Result<Self, ConnectError> {
        let mut settings = Self::default();
        let invalid = |name: &str, value: &str| ConnectError::InvalidParameter {
            name: name.to_string(),
            value: value.to_string(),
        };

        if let Some(baud) = spec.parse_param::<u32>("baud")? {
            settings.baud_rate = baud;
        }
        if let Some(value) = spec.param("stopbits") {
            settings.stop_bits = match value {
                "1" => StopBits::One,
                "2" => StopBits::Two,
                _ => return Err(invalid("stopbits", value)),
            };
        }
        if let Some(value) = spec.param("bytesize") {
            settings.data_bits = match value {
                "5" => DataBits::Five,
                "6" => DataBits::Six,
                "7" => DataBits::Seven,
                "8" => DataBits::Eight,
                _ => return Err(invalid("bytesize", value)),
            };
        }
        if let Some(value) = spec.param("parity") {
            settings.parity = match value.to_ascii_lowercase().as_str() {
                "n" | "none" => Parity::None,
                "o" | "odd" => Parity::Odd,
                "e" | "even" => Parity::Even,
                _ => return Err(invalid("parity", value)),
            };
        }
        if let Some(ms) = spec.parse_param::<u64>("timeout_ms")? {
            settings.timeout = Duration::from_millis(ms);
        }

        Ok(settings)
    }
}

/// Connection to a local serial port
#[derive(Debug)]
pub struct SerialConnection {
    spec: String,
    path: String,
    settings: SerialSettings,
}

impl SerialConnection {
    /// Create a serial connection from a parsed `serial:` spec
    pub fn from_spec(spec: &ConnectionSpec) -> Result<Self, ConnectError> {
        Ok(Self {
            spec: spec.as_str().to_string(),
            path: spec.target().to_string(),
            settings: SerialSettings::from_spec(spec)?,
        })
    }

    /// Device path of the port
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Line settings
    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }
}

impl Connection for SerialConnection {
    fn spec(&self) -> &str {
        &self.spec
    }

    fn open(&self) -> BoxFuture<'_, Result<ConnectionIo, ConnectError>> {
        Box::pin(async move {
            debug!(
                "Opening serial port {} at {} baud",
                self.path, self.settings.baud_rate
            );
            let stream = tokio_serial::new(self.path.as_str(), self.settings.baud_rate)
                .stop_bits(self.settings.stop_bits)
                .data_bits(self.settings.data_bits)
                .parity(self.settings.parity)
                .timeout(self.settings.timeout)
                .open_native_async()?;
            info!("Opened serial port {}", self.path);

            let (reader, writer) = tokio::io::split(stream);
            Ok(ConnectionIo::new(reader, writer))
        })
    }
}
