//! Error types for RTK presets and correction pipelines

use fleet_connect::ConnectError;
use fleet_link::LinkFailure;
use thiserror::Error;

/// Errors that can occur while configuring or running RTK presets
#[derive(Debug, Error)]
pub enum RtkError {
    /// The preset names a packet format other than auto, rtcm2 or rtcm3
    #[error("invalid RTK packet format: {0:?}")]
    InvalidFormat(String),

    /// A filter entry has a known prefix but no integer packet id
    #[error("invalid RTCM packet id: {0:?}")]
    InvalidPacketId(String),

    /// The preset configuration does not have the expected shape
    #[error("invalid preset configuration: {0}")]
    InvalidSpec(#[from] serde_json::Error),

    /// A preset with this id is already registered
    #[error("preset already registered: {0}")]
    DuplicatePreset(String),

    /// Serial port discovery or connection setup failed
    #[error("connection error: {0}")]
    Connect(#[from] ConnectError),

    /// A correction source failed and its supervisor did not absorb it
    #[error("correction source {spec} failed: {failure}")]
    Source {
        spec: String,
        #[source]
        failure: LinkFailure,
    },
}
