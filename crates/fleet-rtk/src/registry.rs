//! Registry of RTK presets by id

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;

use fleet_connect::{PortScanner, SerialPortInfo};
use tracing::{debug, info, warn};

use crate::error::RtkError;
use crate::preset::{PresetSummary, RtkConfigurationPreset};

/// Presets known to the server, ordered by id
///
/// Presets are shared immutably once registered; to change one, remove it
/// and register a new version.
#[derive(Debug, Default)]
pub struct PresetRegistry {
    presets: BTreeMap<String, Arc<RtkConfigurationPreset>>,
}

impl PresetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a preset under its id
    pub fn add(
        &mut self,
        preset: RtkConfigurationPreset,
    ) -> Result<Arc<RtkConfigurationPreset>, RtkError> {
        match self.presets.entry(preset.id().to_string()) {
            Entry::Occupied(entry) => Err(RtkError::DuplicatePreset(entry.key().clone())),
            Entry::Vacant(entry) => {
                debug!(preset = %entry.key(), "Registered RTK preset");
                Ok(entry.insert(Arc::new(preset)).clone())
            }
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Arc<RtkConfigurationPreset>> {
        self.presets.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<RtkConfigurationPreset>> {
        self.presets.get(id).cloned()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.presets.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<RtkConfigurationPreset>> {
        self.presets.values()
    }

    pub fn len(&self) -> usize {
        self.presets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.presets.is_empty()
    }

    /// Summaries of all presets keyed by id
    pub fn summaries(&self) -> BTreeMap<String, PresetSummary> {
        self.presets
            .iter()
            .map(|(id, preset)| (id.clone(), preset.summary()))
            .collect()
    }

    /// Load presets from configuration entries keyed by id
    ///
    /// Invalid entries are logged and skipped. Returns the number of presets
    /// that were registered.
    pub fn load_configuration<'a, I>(&mut self, entries: I) -> usize
    where
        I: IntoIterator<Item = (&'a String, &'a serde_json::Value)>,
    {
        let mut loaded = 0;
        for (id, spec) in entries {
            let result = RtkConfigurationPreset::from_configuration(spec, id)
                .and_then(|preset| self.add(preset));
            match result {
                Ok(_) => loaded += 1,
                Err(e) => warn!(preset = %id, "Ignoring RTK preset: {}", e),
            }
        }
        loaded
    }

    /// Register a dynamic preset for every port not covered yet
    ///
    /// Preset ids are `serial:<device>`. Returns the ids that were added.
    pub fn add_serial_ports(
        &mut self,
        ports: &[SerialPortInfo],
        configuration: &BTreeMap<String, String>,
        use_configuration_in_title: bool,
    ) -> Vec<String> {
        let mut added = Vec::new();
        for port in ports {
            let id = format!("serial:{}", port.device);
            if self.presets.contains_key(&id) {
                continue;
            }
            let preset = RtkConfigurationPreset::from_serial_port(
                port,
                configuration,
                &id,
                use_configuration_in_title,
            );
            self.presets.insert(id.clone(), Arc::new(preset));
            added.push(id);
        }
        if !added.is_empty() {
            info!("Added {} serial port RTK preset(s)", added.len());
        }
        added
    }

    /// Enumerate serial ports and register a dynamic preset for each
    pub fn scan_serial_ports(
        &mut self,
        scanner: &PortScanner,
        configuration: &BTreeMap<String, String>,
        use_configuration_in_title: bool,
    ) -> Result<Vec<String>, RtkError> {
        let ports = scanner.enumerate_ports()?;
        Ok(self.add_serial_ports(&ports, configuration, use_configuration_in_title))
    }

    /// Drop every preset synthesized at runtime
    ///
    /// Returns the ids that were removed.
    pub fn remove_dynamic(&mut self) -> Vec<String> {
        let dynamic: Vec<String> = self
            .presets
            .iter()
            .filter(|(_, preset)| preset.is_dynamic())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &dynamic {
            self.presets.remove(id);
        }
        dynamic
    }
}
