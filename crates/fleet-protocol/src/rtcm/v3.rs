//! RTCM 3.x Framing
//!
//! ```text
//! D3 [000000 LLLLLLLLLL] [payload x L] [crc24q x 3]
//! ```
//!
//! The message number is the first 12 bits of the payload.

use crate::crc::crc24q;
use crate::error::{EncodeError, ParseError};
use crate::{Encoder, Parser};

/// RTCM v3 preamble byte
pub const PREAMBLE: u8 = 0xD3;
/// Maximum payload length (10-bit length field)
pub const MAX_PAYLOAD_LEN: usize = 1023;

const HEADER_LEN: usize = 3;
const CRC_LEN: usize = 3;

/// A CRC-verified RTCM v3 frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rtcm3Packet {
    payload: Vec<u8>,
}

impl Rtcm3Packet {
    /// Wrap a payload
    pub fn new(payload: Vec<u8>) -> Self {
        Self { payload }
    }

    /// Message number, or 0 if the payload is too short to carry one
    pub fn packet_type(&self) -> u16 {
        match self.payload.as_slice() {
            [hi, lo, ..] => (u16::from(*hi) << 4) | (u16::from(*lo) >> 4),
            _ => 0,
        }
    }

    /// Message payload without framing
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Streaming RTCM v3 parser
///
/// Bytes outside of a valid frame are skipped one at a time until the next
/// frame lines up.
pub struct Rtcm3Parser {
    buffer: Vec<u8>,
}

impl Rtcm3Parser {
    /// Create a new RTCM v3 parser
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(1024),
        }
    }

    fn try_frame(&self) -> Result<Option<(Rtcm3Packet, usize)>, ParseError> {
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }
        if self.buffer[1] & 0xFC != 0 {
            return Err(ParseError::InvalidFrame(
                "reserved bits set in RTCM3 header".to_string(),
            ));
        }
        let len = (usize::from(self.buffer[1] & 0x03) << 8) | usize::from(self.buffer[2]);
        let total = HEADER_LEN + len + CRC_LEN;
        if self.buffer.len() < total {
            return Ok(None);
        }

        let crc_at = HEADER_LEN + len;
        let expected = crc24q(&self.buffer[..crc_at]);
        let actual = (u32::from(self.buffer[crc_at]) << 16)
            | (u32::from(self.buffer[crc_at + 1]) << 8)
            | u32::from(self.buffer[crc_at + 2]);
        if expected != actual {
            return Err(ParseError::ChecksumMismatch { expected, actual });
        }

        let packet = Rtcm3Packet::new(self.buffer[HEADER_LEN..crc_at].to_vec());
        Ok(Some((packet, total)))
    }
}

impl Default for Rtcm3Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser for Rtcm3Parser {
    type Item = Rtcm3Packet;

    fn push_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    fn next_item(&mut self) -> Option<Rtcm3Packet> {
        loop {
            match self.buffer.iter().position(|&b| b == PREAMBLE) {
                Some(0) => {}
                Some(start) => {
                    self.buffer.drain(..start);
                }
                None => {
                    self.buffer.clear();
                    return None;
                }
            }

            match self.try_frame() {
                Ok(Some((packet, consumed))) => {
                    self.buffer.drain(..consumed);
                    return Some(packet);
                }
                Ok(None) => return None,
                Err(e) => {
                    tracing::trace!("RTCM3 resync: {}", e);
                    self.buffer.remove(0);
                }
            }
        }
    }

    fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// RTCM v3 encoder
#[derive(Debug, Default)]
pub struct Rtcm3Encoder;

impl Encoder for Rtcm3Encoder {
    type Item = Rtcm3Packet;

    fn encode(&mut self, packet: &Rtcm3Packet) -> Result<Vec<u8>, EncodeError> {
        let len = packet.payload.len();
        if len > MAX_PAYLOAD_LEN {
            return Err(EncodeError::PayloadTooLong {
                len,
                max: MAX_PAYLOAD_LEN,
            });
        }
        let mut frame = Vec::with_capacity(HEADER_LEN + len + CRC_LEN);
        frame.push(PREAMBLE);
        frame.push((len >> 8) as u8);
        frame.push((len & 0xFF) as u8);
        frame.extend_from_slice(&packet.payload);
        let crc = crc24q(&frame);
        frame.extend_from_slice(&crc.to_be_bytes()[1..]);
        Ok(frame)
    }
}
