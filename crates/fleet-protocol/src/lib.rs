//! Fleet Protocol Library
//!
//! This crate provides the framing codecs spoken on fleet links:
//!
//! - **MAVLink**: v1 (`0xFE`) and v2 (`0xFD`) frames with X.25 checksums,
//!   used for telemetry and commands
//! - **RTCM v3**: `0xD3` framed differential-GPS corrections with CRC-24Q
//! - **RTCM v2**: 30-bit parity-protected words in 6-of-8 byte packing
//!
//! # Architecture
//!
//! Every wire protocol provides:
//! - A streaming [`Parser`] that buffers partial frames until complete
//! - An [`Encoder`] that turns an outbound item into wire bytes
//! - A decoded item type implementing [`DecodedMessage`], which exposes the
//!   [`MessageTypeKey`] used for dispatching
//!
//! # Example
//!
//! ```rust
//! use fleet_protocol::{DecodedMessage, Encoder, Parser};
//! use fleet_protocol::mavlink::{heartbeat, MavlinkEncoder, MavlinkParser, MavlinkVersion};
//!
//! let mut encoder = MavlinkEncoder::new(MavlinkVersion::V2, 255, 190);
//! let bytes = encoder.encode(&heartbeat()).unwrap();
//!
//! let mut parser = MavlinkParser::new();
//! let packets: Vec<_> = parser.parse(&bytes).collect();
//! assert_eq!(packets.len(), 1);
//! assert_eq!(packets[0].type_key().as_str(), "HEARTBEAT");
//! ```

use std::borrow::Cow;
use std::fmt;

pub mod crc;
pub mod error;
pub mod mavlink;
pub mod rtcm;

pub use error::{EncodeError, ParseError};

/// Stable identifier of a decoded message type, used as a dispatch key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageTypeKey(Cow<'static, str>);

impl MessageTypeKey {
    /// Pseudo-type produced by parsers for bytes that could not be framed
    pub const BAD_DATA: MessageTypeKey = MessageTypeKey(Cow::Borrowed("BAD_DATA"));

    /// Create a key from a static type name
    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    /// Create a key from an owned type name
    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    /// The type name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageTypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for MessageTypeKey {
    fn from(name: &'static str) -> Self {
        Self::from_static(name)
    }
}

/// A decoded item that can be routed by type
pub trait DecodedMessage {
    /// The dispatch key of this item
    fn type_key(&self) -> MessageTypeKey;

    /// Identifier of the remote party that produced this item, if any
    fn correlation_id(&self) -> Option<String> {
        None
    }
}

/// Streaming parser that turns raw bytes into decoded items
///
/// A partial frame at the end of the buffer is retained until more bytes
/// complete it.
pub trait Parser {
    /// The decoded item type
    type Item;

    /// Push raw bytes into the parser's buffer
    fn push_bytes(&mut self, data: &[u8]);

    /// Try to extract the next complete item from the buffer
    fn next_item(&mut self) -> Option<Self::Item>;

    /// Clear the internal buffer
    fn clear(&mut self);

    /// Push bytes and lazily iterate over every item that became available
    fn parse(&mut self, data: &[u8]) -> Parsed<'_, Self>
    where
        Self: Sized,
    {
        self.push_bytes(data);
        Parsed { parser: self }
    }
}

/// Lazy iterator over the items produced by [`Parser::parse`]
pub struct Parsed<'a, P> {
    parser: &'a mut P,
}

impl<P: Parser> Iterator for Parsed<'_, P> {
    type Item = P::Item;

    fn next(&mut self) -> Option<Self::Item> {
        self.parser.next_item()
    }
}

/// Stateful encoder that turns outbound items into wire bytes
pub trait Encoder {
    /// The outbound item type
    type Item;

    /// Encode an item to its wire format
    fn encode(&mut self, item: &Self::Item) -> Result<Vec<u8>, EncodeError>;
}

/// Factory for the parser/encoder pair of one wire protocol
///
/// Links create a fresh parser for every connection attempt, so that a
/// partial frame from a dropped connection never leaks into the next one.
pub trait CodecFactory: Send + Sync + 'static {
    /// Items produced by the parser
    type Inbound: DecodedMessage + Send + 'static;
    /// Items accepted by the encoder
    type Outbound: Send + 'static;
    /// Parser type
    type Parser: Parser<Item = Self::Inbound> + Send + 'static;
    /// Encoder type
    type Encoder: Encoder<Item = Self::Outbound> + Send + 'static;

    /// Create a new parser
    fn create_parser(&self) -> Self::Parser;

    /// Create a new encoder
    fn create_encoder(&self) -> Self::Encoder;
}
