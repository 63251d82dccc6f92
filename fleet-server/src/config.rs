//! Server settings

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use fleet_connect::PortScanner;
use fleet_link::RestartWithBackoff;
use fleet_protocol::mavlink::MavlinkVersion;
use fleet_rtk::PresetRegistry;
use serde::Deserialize;
use tracing::{debug, info, warn};

/// One MAVLink network: a group of links to the same fleet
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct NetworkSettings {
    /// Connection specs; the first one is the primary link
    pub connections: Vec<String>,
    /// System ID of the ground station on this network
    #[serde(default = "default_system_id")]
    pub system_id: u8,
    /// Wire version of outbound frames
    #[serde(default = "default_version")]
    pub version: MavlinkVersion,
    /// Interval of the ground station heartbeat
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
}

fn default_system_id() -> u8 {
    255
}

fn default_version() -> MavlinkVersion {
    MavlinkVersion::V2
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

impl NetworkSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }
}

/// RTK correction settings
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RtkSettings {
    /// Preset configurations keyed by preset id
    pub presets: BTreeMap<String, serde_json::Value>,
    /// Create a dynamic preset for every serial port found at startup
    pub add_serial_ports: bool,
    /// Parameters for serial port presets, e.g. `{"baud": 57600}`
    pub serial_port_configuration: BTreeMap<String, serde_json::Value>,
    /// Show baud rate and stop bits in serial preset titles
    pub use_configuration_in_title: bool,
}

impl Default for RtkSettings {
    fn default() -> Self {
        Self {
            presets: BTreeMap::new(),
            add_serial_ports: false,
            serial_port_configuration: BTreeMap::new(),
            use_configuration_in_title: true,
        }
    }
}

impl RtkSettings {
    /// Serial port configuration as connection spec parameters
    pub fn serial_port_parameters(&self) -> BTreeMap<String, String> {
        self.serial_port_configuration
            .iter()
            .map(|(key, value)| {
                let value = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (key.clone(), value)
            })
            .collect()
    }

    /// Registry with the configured presets and, if enabled, serial ports
    pub fn build_registry(&self) -> PresetRegistry {
        let mut registry = PresetRegistry::new();
        let loaded = registry.load_configuration(&self.presets);
        debug!("Loaded {} configured RTK preset(s)", loaded);

        if self.add_serial_ports {
            let result = registry.scan_serial_ports(
                &PortScanner::new(),
                &self.serial_port_parameters(),
                self.use_configuration_in_title,
            );
            if let Err(e) = result {
                warn!("Serial port scan failed: {}", e);
            }
        }
        registry
    }
}

/// Restart policy for links and correction sources
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorSettings {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl SupervisorSettings {
    pub fn policy(&self) -> RestartWithBackoff {
        RestartWithBackoff::new(
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

/// Server settings
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub networks: BTreeMap<String, NetworkSettings>,
    pub rtk: RtkSettings,
    pub supervisor: SupervisorSettings,
}

impl Settings {
    /// Get the XDG config directory for fleetd
    /// Uses $XDG_CONFIG_HOME/fleetd, falls back to ~/.config/fleetd
    fn config_dir() -> Option<PathBuf> {
        if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
            let path = PathBuf::from(xdg_config);
            if path.is_absolute() {
                return Some(path.join("fleetd"));
            }
        }
        dirs::home_dir().map(|h| h.join(".config").join("fleetd"))
    }

    /// Default location of the settings file
    pub fn default_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("settings.json"))
    }

    /// Parse settings from JSON text
    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        serde_json::from_str(text).context("Invalid settings")
    }

    /// Load settings from `path`, or from the default location
    ///
    /// An explicit path must exist. A missing file at the default location
    /// yields the default settings.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match Self::default_path() {
                Some(path) => (path, false),
                None => {
                    info!("No configuration directory, using default settings");
                    return Ok(Self::default());
                }
            },
        };

        match std::fs::read_to_string(&path) {
            Ok(text) => {
                info!("Loading settings from {}", path.display());
                Self::from_json(&text).with_context(|| format!("in {}", path.display()))
            }
            Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
                info!("{} not found, using default settings", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }
}
