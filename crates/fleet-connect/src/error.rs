//! Error types for connections

use thiserror::Error;

/// Errors that can occur while creating or opening a connection
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The connection spec could not be parsed
    #[error("invalid connection spec {spec:?}: {reason}")]
    InvalidSpec { spec: String, reason: String },

    /// The connection spec names a scheme without a connection type
    #[error("unsupported connection scheme: {0}")]
    UnsupportedScheme(String),

    /// A query parameter has an invalid value
    #[error("invalid value {value:?} for parameter {name}")]
    InvalidParameter { name: String, value: String },

    /// Serial port error
    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// I/O error while opening the connection
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection cannot be opened (again)
    #[error("connection {0} is not available")]
    Unavailable(String),
}
