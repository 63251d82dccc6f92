//! Error types for telemetry and correction codecs

use thiserror::Error;

/// Errors that can occur while parsing framed data
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Invalid frame structure
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Bytes that precede any recognizable start-of-frame marker
    #[error("{0} unexpected byte(s) before start of frame")]
    UnexpectedBytes(usize),

    /// Checksum mismatch
    #[error("checksum mismatch: expected 0x{expected:06X}, got 0x{actual:06X}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Frame header names a message whose checksum seed is unknown
    #[error("unknown message ID {0}")]
    UnknownMessage(u32),

    /// Parity failure in a word-oriented protocol
    #[error("parity error in word {0}")]
    Parity(usize),
}

/// Errors that can occur while encoding an outbound item
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Payload does not fit into a single frame
    #[error("payload too long: {len} bytes (max {max})")]
    PayloadTooLong { len: usize, max: usize },

    /// Message ID has no known checksum seed
    #[error("unknown message ID: {0}")]
    UnknownMessage(u32),

    /// Message ID cannot be represented in the selected wire version
    #[error("message ID {0} does not fit the selected protocol version")]
    MessageIdOutOfRange(u32),

    /// A header field is out of range for its wire width
    #[error("field {field} out of range: {value}")]
    FieldOutOfRange { field: &'static str, value: u32 },
}
