//! RTK configuration presets
//!
//! A preset describes where corrections come from (one or more connection
//! specs), which RTCM format they use, what to send to a source before
//! reading from it and which packets to forward.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use fleet_connect::{format_spec, SerialPortInfo};
use fleet_protocol::rtcm::{RtcmEncoder, RtcmPacket, RtcmParser, RtcmVersion};
use serde::{Deserialize, Serialize};

use crate::error::RtkError;
use crate::filter::{FilterConfig, PacketFilter};

/// Packet format of a correction stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PresetFormat {
    /// Detected from the stream; re-encoded as RTCM v3
    #[default]
    Auto,
    Rtcm2,
    Rtcm3,
}

impl PresetFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresetFormat::Auto => "auto",
            PresetFormat::Rtcm2 => "rtcm2",
            PresetFormat::Rtcm3 => "rtcm3",
        }
    }

    /// Version used when re-encoding packets
    pub fn encoder_version(&self) -> RtcmVersion {
        match self {
            PresetFormat::Rtcm2 => RtcmVersion::V2,
            PresetFormat::Auto | PresetFormat::Rtcm3 => RtcmVersion::V3,
        }
    }
}

impl fmt::Display for PresetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PresetFormat {
    type Err = RtkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(PresetFormat::Auto),
            "rtcm2" => Ok(PresetFormat::Rtcm2),
            "rtcm3" => Ok(PresetFormat::Rtcm3),
            other => Err(RtkError::InvalidFormat(other.to_string())),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(source) => vec![source],
            OneOrMany::Many(sources) => sources,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InitData {
    Text(String),
    Bytes(Vec<u8>),
}

/// Shape of a preset in the configuration file
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PresetRecord {
    /// Non-string values are used in their JSON text form
    title: Option<serde_json::Value>,
    format: Option<serde_json::Value>,
    sources: Option<OneOrMany>,
    /// Deprecated alias of `sources`
    source: Option<OneOrMany>,
    init: Option<InitData>,
    filter: Option<FilterConfig>,
}

fn value_text(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text,
        other => other.to_string(),
    }
}

/// Subset of a preset published to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresetSummary {
    pub title: String,
    pub format: PresetFormat,
    pub sources: Vec<String>,
}

/// One or more RTK correction sources with a common format and filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtkConfigurationPreset {
    id: String,
    title: String,
    format: PresetFormat,
    sources: Vec<String>,
    init: Option<Vec<u8>>,
    filter: Option<PacketFilter>,
    dynamic: bool,
}

impl RtkConfigurationPreset {
    /// Create an empty preset whose title is its id
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            title: id.clone(),
            id,
            format: PresetFormat::Auto,
            sources: Vec::new(),
            init: None,
            filter: None,
            dynamic: false,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_format(mut self, format: PresetFormat) -> Self {
        self.format = format;
        self
    }

    /// Bytes written to every source right after it is opened
    pub fn with_init(mut self, init: impl Into<Vec<u8>>) -> Self {
        self.init = Some(init.into());
        self
    }

    pub fn with_filter(mut self, filter: PacketFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Build a preset from its configuration file entry
    ///
    /// ```
    /// use fleet_rtk::RtkConfigurationPreset;
    /// use serde_json::json;
    ///
    /// let spec = json!({"format": "rtcm3", "source": "tcp:10.0.0.5:2101"});
    /// let preset = RtkConfigurationPreset::from_configuration(&spec, "base").unwrap();
    /// assert_eq!(preset.title(), "base");
    /// assert_eq!(preset.sources(), ["tcp:10.0.0.5:2101"]);
    /// ```
    pub fn from_configuration(spec: &serde_json::Value, id: &str) -> Result<Self, RtkError> {
        let record = PresetRecord::deserialize(spec)?;

        let mut preset = Self::new(id);
        if let Some(title) = record.title {
            preset.title = value_text(title);
        }
        if let Some(format) = record.format {
            preset.format = value_text(format).parse()?;
        }

        let sources = record.sources.or(record.source);
        for source in sources.map(OneOrMany::into_vec).unwrap_or_default() {
            preset.add_source(source);
        }

        preset.init = record.init.map(|init| match init {
            InitData::Text(text) => text.into_bytes(),
            InitData::Bytes(bytes) => bytes,
        });
        if let Some(filter) = record.filter {
            preset.filter = Some(filter.build()?);
        }
        Ok(preset)
    }

    /// Build a dynamic preset reading from a discovered serial port
    ///
    /// `configuration` is passed to the serial connection as query
    /// parameters. With `use_configuration_in_title`, the baud rate and
    /// stop bits are appended to the port label.
    pub fn from_serial_port(
        port: &SerialPortInfo,
        configuration: &BTreeMap<String, String>,
        id: &str,
        use_configuration_in_title: bool,
    ) -> Self {
        let label = port.label();
        let title = match use_configuration_in_title
            .then(|| describe_serial_configuration(configuration))
            .flatten()
        {
            Some(details) => format!("{} ({})", label, details),
            None => label,
        };

        let source = format_spec(
            "serial",
            &port.device,
            configuration.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        );

        let mut preset = Self::new(id).with_title(title);
        preset.dynamic = true;
        preset.add_source(source);
        preset
    }

    /// Append a correction source
    pub fn add_source(&mut self, source: impl Into<String>) {
        self.sources.push(source.into());
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn format(&self) -> PresetFormat {
        self.format
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    pub fn init(&self) -> Option<&[u8]> {
        self.init.as_deref()
    }

    pub fn filter(&self) -> Option<&PacketFilter> {
        self.filter.as_ref()
    }

    /// Whether the preset was synthesized at runtime
    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    /// Whether `packet` passes the preset's filter
    pub fn accepts(&self, packet: &RtcmPacket) -> bool {
        self.filter.as_ref().map_or(true, |f| f.accepts(packet))
    }

    pub fn create_encoder(&self) -> RtcmEncoder {
        RtcmEncoder::new(self.format.encoder_version())
    }

    pub fn create_parser(&self) -> RtcmParser {
        match self.format {
            PresetFormat::Auto => RtcmParser::auto(),
            PresetFormat::Rtcm2 => RtcmParser::new(RtcmVersion::V2),
            PresetFormat::Rtcm3 => RtcmParser::new(RtcmVersion::V3),
        }
    }

    /// Title, format and sources, as published in preset listings
    pub fn summary(&self) -> PresetSummary {
        PresetSummary {
            title: self.title.clone(),
            format: self.format,
            sources: self.sources.clone(),
        }
    }
}

/// `57600 baud, 1 stop bit` style description of a serial configuration
fn describe_serial_configuration(configuration: &BTreeMap<String, String>) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(baud) = configuration.get("baud") {
        parts.push(format!("{} baud", baud));
    }
    if let Some(stop_bits) = configuration.get("stopbits") {
        let unit = if stop_bits == "1" { "stop bit" } else { "stop bits" };
        parts.push(format!("{} {}", stop_bits, unit));
    }
    (!parts.is_empty()).then(|| parts.join(", "))
}
