//! Fleet RTK Library
//!
//! Differential GPS corrections for the fleet:
//!
//! - [`RtkConfigurationPreset`]: sources, format and filter of one
//!   correction stream, built from configuration or a discovered serial port
//! - [`PacketFilter`]: accept/reject lists over `rtcm2/<type>` and
//!   `rtcm3/<type>` packet identities
//! - [`PresetRegistry`]: presets by id, including dynamic serial presets
//! - [`run_preset`]: reads all sources of a preset and publishes accepted
//!   packets as [`CorrectionPacket`]s

pub mod error;
pub mod filter;
pub mod pipeline;
pub mod preset;
pub mod registry;

pub use error::RtkError;
pub use filter::{FilterConfig, PacketFilter, PacketIdSet};
pub use pipeline::{run_preset, CorrectionPacket};
pub use preset::{PresetFormat, PresetSummary, RtkConfigurationPreset};
pub use registry::PresetRegistry;
