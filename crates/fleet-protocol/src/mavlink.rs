//! MAVLink Framing Implementation
//!
//! MAVLink frames carry a message ID and an opaque payload. This module only
//! deals with framing; payload fields are interpreted by the consumers that
//! care about them.
//!
//! # Frame Format
//! ```text
//! v1: FE [len] [seq] [sys] [comp] [msgid]                       [payload] [crc_lo crc_hi]
//! v2: FD [len] [incompat] [compat] [seq] [sys] [comp] [msgid x3] [payload] [crc_lo crc_hi] [signature x13]?
//! ```
//!
//! The checksum is X.25 over everything after the start marker, seeded at
//! the end with a per-message `CRC_EXTRA` byte. Frames whose message ID has
//! no known `CRC_EXTRA` cannot be verified and are passed through as-is.

use crate::crc::X25;
use crate::error::{EncodeError, ParseError};
use crate::{CodecFactory, DecodedMessage, Encoder, MessageTypeKey, Parser};

/// MAVLink v1 start-of-frame marker
pub const STX_V1: u8 = 0xFE;
/// MAVLink v2 start-of-frame marker
pub const STX_V2: u8 = 0xFD;

/// Maximum payload length of a single frame
pub const MAX_PAYLOAD_LEN: usize = 255;

const V1_HEADER_LEN: usize = 6;
const V2_HEADER_LEN: usize = 10;
const CHECKSUM_LEN: usize = 2;
const SIGNATURE_LEN: usize = 13;
const INCOMPAT_FLAG_SIGNED: u8 = 0x01;

/// Well-known MAVLink message IDs
pub mod ids {
    pub const HEARTBEAT: u32 = 0;
    pub const SYS_STATUS: u32 = 1;
    pub const PARAM_VALUE: u32 = 22;
    pub const GPS_RAW_INT: u32 = 24;
    pub const GLOBAL_POSITION_INT: u32 = 33;
    pub const COMMAND_LONG: u32 = 76;
    pub const COMMAND_ACK: u32 = 77;
    pub const TIMESYNC: u32 = 111;
    pub const AUTOPILOT_VERSION: u32 = 148;
    pub const GPS_RTCM_DATA: u32 = 233;
    pub const STATUSTEXT: u32 = 253;
}

/// Static description of a known message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageInfo {
    /// Numeric message ID
    pub id: u32,
    /// Message name as used in the MAVLink XML definitions
    pub name: &'static str,
    /// Checksum seed
    pub crc_extra: u8,
}

const fn info(id: u32, name: &'static str, crc_extra: u8) -> MessageInfo {
    MessageInfo {
        id,
        name,
        crc_extra,
    }
}

/// Messages of the common dialect that the server knows how to verify
const MESSAGES: &[MessageInfo] = &[
    info(0, "HEARTBEAT", 50),
    info(1, "SYS_STATUS", 124),
    info(2, "SYSTEM_TIME", 137),
    info(4, "PING", 237),
    info(11, "SET_MODE", 89),
    info(20, "PARAM_REQUEST_READ", 214),
    info(21, "PARAM_REQUEST_LIST", 159),
    info(22, "PARAM_VALUE", 220),
    info(23, "PARAM_SET", 168),
    info(24, "GPS_RAW_INT", 24),
    info(30, "ATTITUDE", 39),
    info(32, "LOCAL_POSITION_NED", 185),
    info(33, "GLOBAL_POSITION_INT", 104),
    info(40, "MISSION_REQUEST", 230),
    info(42, "MISSION_CURRENT", 28),
    info(44, "MISSION_COUNT", 221),
    info(47, "MISSION_ACK", 153),
    info(49, "GPS_GLOBAL_ORIGIN", 39),
    info(62, "NAV_CONTROLLER_OUTPUT", 183),
    info(73, "MISSION_ITEM_INT", 38),
    info(74, "VFR_HUD", 20),
    info(76, "COMMAND_LONG", 152),
    info(77, "COMMAND_ACK", 143),
    info(87, "POSITION_TARGET_GLOBAL_INT", 150),
    info(110, "FILE_TRANSFER_PROTOCOL", 84),
    info(111, "TIMESYNC", 34),
    info(125, "POWER_STATUS", 203),
    info(148, "AUTOPILOT_VERSION", 178),
    info(152, "MEMINFO", 208),
    info(165, "HWSTATUS", 21),
    info(169, "DATA16", 234),
    info(191, "MAG_CAL_PROGRESS", 92),
    info(192, "MAG_CAL_REPORT", 36),
    info(233, "GPS_RTCM_DATA", 35),
    info(242, "HOME_POSITION", 104),
    info(248, "V2_EXTENSION", 8),
    info(253, "STATUSTEXT", 83),
];

/// Look up a known message by ID
pub fn message_info(id: u32) -> Option<&'static MessageInfo> {
    MESSAGES.iter().find(|m| m.id == id)
}

/// Look up a known message by name
pub fn message_info_by_name(name: &str) -> Option<&'static MessageInfo> {
    MESSAGES.iter().find(|m| m.name == name)
}

/// MAVLink wire version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MavlinkVersion {
    /// MAVLink 1.0 (`0xFE`)
    V1,
    /// MAVLink 2.0 (`0xFD`)
    V2,
}

/// A complete, checksum-verified MAVLink frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MavlinkFrame {
    /// Wire version the frame arrived in
    pub version: MavlinkVersion,
    /// Sequence number
    pub sequence: u8,
    /// Sender system ID
    pub system_id: u8,
    /// Sender component ID
    pub component_id: u8,
    /// Message ID
    pub message_id: u32,
    /// Raw payload (MAVLink 2 payloads may be zero-truncated)
    pub payload: Vec<u8>,
}

impl MavlinkFrame {
    /// Name of the message, if it is known
    pub fn name(&self) -> Option<&'static str> {
        message_info(self.message_id).map(|m| m.name)
    }

    /// Payload byte at `index`, treating truncated bytes as zero
    pub fn payload_byte(&self, index: usize) -> u8 {
        self.payload.get(index).copied().unwrap_or(0)
    }
}

/// Item produced by [`MavlinkParser`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MavlinkPacket {
    /// A valid frame
    Frame(MavlinkFrame),
    /// Bytes that could not be framed
    BadData {
        /// The discarded bytes
        data: Vec<u8>,
        /// Why they were discarded
        reason: ParseError,
    },
}

impl DecodedMessage for MavlinkPacket {
    fn type_key(&self) -> MessageTypeKey {
        match self {
            MavlinkPacket::Frame(frame) => match frame.name() {
                Some(name) => MessageTypeKey::from_static(name),
                None => MessageTypeKey::new(format!("UNKNOWN_{}", frame.message_id)),
            },
            MavlinkPacket::BadData { .. } => MessageTypeKey::BAD_DATA,
        }
    }

    fn correlation_id(&self) -> Option<String> {
        match self {
            MavlinkPacket::Frame(frame) => Some(frame.system_id.to_string()),
            MavlinkPacket::BadData { .. } => None,
        }
    }
}

/// Streaming MAVLink parser
///
/// Bytes that cannot belong to a frame are reported as
/// [`MavlinkPacket::BadData`] in stream order, so they never get mixed into
/// the following frame.
pub struct MavlinkParser {
    buffer: Vec<u8>,
    junk: Vec<u8>,
    junk_reason: Option<ParseError>,
}

impl MavlinkParser {
    /// Create a new MAVLink parser
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(512),
            junk: Vec::new(),
            junk_reason: None,
        }
    }

    fn find_start(&self) -> Option<usize> {
        self.buffer
            .iter()
            .position(|&b| b == STX_V1 || b == STX_V2)
    }

    fn take_junk(&mut self) -> Option<MavlinkPacket> {
        if self.junk.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.junk);
        let reason = self
            .junk_reason
            .take()
            .unwrap_or(ParseError::UnexpectedBytes(data.len()));
        Some(MavlinkPacket::BadData { data, reason })
    }

    /// Discard the start marker at the head of the buffer so that the
    /// search resumes at the next byte
    fn skip_start_marker(&mut self, reason: ParseError) {
        self.junk.push(self.buffer.remove(0));
        self.junk_reason = Some(reason);
    }

    /// Try to decode a frame at the head of the buffer
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    fn try_frame(&self) -> Result<Option<(MavlinkFrame, usize)>, ParseError> {
        let version = match self.buffer[0] {
            STX_V1 => MavlinkVersion::V1,
            _ => MavlinkVersion::V2,
        };
        let header_len = match version {
            MavlinkVersion::V1 => V1_HEADER_LEN,
            MavlinkVersion::V2 => V2_HEADER_LEN,
        };
        if self.buffer.len() < header_len {
            return Ok(None);
        }

        let payload_len = usize::from(self.buffer[1]);
        let (signed, sequence, system_id, component_id, message_id) = match version {
            MavlinkVersion::V1 => (
                false,
                self.buffer[2],
                self.buffer[3],
                self.buffer[4],
                u32::from(self.buffer[5]),
            ),
            MavlinkVersion::V2 => {
                let incompat = self.buffer[2];
                if incompat & !INCOMPAT_FLAG_SIGNED != 0 {
                    return Err(ParseError::InvalidFrame(format!(
                        "unsupported incompatibility flags 0x{:02X}",
                        incompat
                    )));
                }
                (
                    incompat & INCOMPAT_FLAG_SIGNED != 0,
                    self.buffer[4],
                    self.buffer[5],
                    self.buffer[6],
                    u32::from_le_bytes([self.buffer[7], self.buffer[8], self.buffer[9], 0]),
                )
            }
        };

        // Without a checksum seed the frame cannot be told apart from noise
        let known = message_info(message_id).ok_or(ParseError::UnknownMessage(message_id))?;

        let checksum_at = header_len + payload_len;
        let total = checksum_at + CHECKSUM_LEN + if signed { SIGNATURE_LEN } else { 0 };
        if self.buffer.len() < total {
            return Ok(None);
        }

        let mut crc = X25::new();
        crc.update(&self.buffer[1..checksum_at]);
        crc.accumulate(known.crc_extra);
        let actual = u16::from_le_bytes([self.buffer[checksum_at], self.buffer[checksum_at + 1]]);
        if crc.value() != actual {
            return Err(ParseError::ChecksumMismatch {
                expected: u32::from(crc.value()),
                actual: u32::from(actual),
            });
        }

        let frame = MavlinkFrame {
            version,
            sequence,
            system_id,
            component_id,
            message_id,
            payload: self.buffer[header_len..checksum_at].to_vec(),
        };
        Ok(Some((frame, total)))
    }
}

impl Default for MavlinkParser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser for MavlinkParser {
    type Item = MavlinkPacket;

    fn push_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    fn next_item(&mut self) -> Option<MavlinkPacket> {
        loop {
            let Some(start) = self.find_start() else {
                self.junk.append(&mut self.buffer);
                return self.take_junk();
            };

            if start > 0 {
                self.junk.extend(self.buffer.drain(..start));
                return self.take_junk();
            }

            match self.try_frame() {
                Ok(None) => return self.take_junk(),
                Ok(Some((frame, consumed))) => {
                    if let Some(junk) = self.take_junk() {
                        // Report the junk first; the frame stays buffered
                        return Some(junk);
                    }
                    self.buffer.drain(..consumed);
                    return Some(MavlinkPacket::Frame(frame));
                }
                Err(reason) => {
                    tracing::debug!("Discarding MAVLink start marker: {}", reason);
                    self.skip_start_marker(reason);
                }
            }
        }
    }

    fn clear(&mut self) {
        self.buffer.clear();
        self.junk.clear();
        self.junk_reason = None;
    }
}

/// Outbound MAVLink message: a message ID plus its serialized payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MavlinkMessage {
    /// Message ID
    pub message_id: u32,
    /// Serialized payload in wire field order
    pub payload: Vec<u8>,
}

impl MavlinkMessage {
    /// Create a new outbound message
    pub fn new(message_id: u32, payload: Vec<u8>) -> Self {
        Self {
            message_id,
            payload,
        }
    }
}

/// Stateful MAVLink encoder that stamps sender IDs and sequence numbers
pub struct MavlinkEncoder {
    version: MavlinkVersion,
    system_id: u8,
    component_id: u8,
    sequence: u8,
}

impl MavlinkEncoder {
    /// Create a new encoder sending as the given system and component
    pub fn new(version: MavlinkVersion, system_id: u8, component_id: u8) -> Self {
        Self {
            version,
            system_id,
            component_id,
            sequence: 0,
        }
    }

    fn next_sequence(&mut self) -> u8 {
        let seq = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        seq
    }
}

impl Encoder for MavlinkEncoder {
    type Item = MavlinkMessage;

    fn encode(&mut self, message: &MavlinkMessage) -> Result<Vec<u8>, EncodeError> {
        let known = message_info(message.message_id)
            .ok_or(EncodeError::UnknownMessage(message.message_id))?;

        let mut payload: &[u8] = &message.payload;
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(EncodeError::PayloadTooLong {
                len: payload.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }

        let mut frame = Vec::with_capacity(V2_HEADER_LEN + payload.len() + CHECKSUM_LEN);
        match self.version {
            MavlinkVersion::V1 => {
                let id = u8::try_from(message.message_id)
                    .map_err(|_| EncodeError::MessageIdOutOfRange(message.message_id))?;
                let seq = self.next_sequence();
                frame.extend_from_slice(&[
                    STX_V1,
                    payload.len() as u8,
                    seq,
                    self.system_id,
                    self.component_id,
                    id,
                ]);
            }
            MavlinkVersion::V2 => {
                // Trailing zero bytes are truncated; at least one byte stays
                while payload.len() > 1 && payload[payload.len() - 1] == 0 {
                    payload = &payload[..payload.len() - 1];
                }
                let id = message.message_id.to_le_bytes();
                let seq = self.next_sequence();
                frame.extend_from_slice(&[
                    STX_V2,
                    payload.len() as u8,
                    0,
                    0,
                    seq,
                    self.system_id,
                    self.component_id,
                    id[0],
                    id[1],
                    id[2],
                ]);
            }
        }
        frame.extend_from_slice(payload);

        let mut crc = X25::new();
        crc.update(&frame[1..]);
        crc.accumulate(known.crc_extra);
        frame.extend_from_slice(&crc.value().to_le_bytes());

        Ok(frame)
    }
}

/// Codec factory for MAVLink links
#[derive(Debug, Clone, Copy)]
pub struct MavlinkCodec {
    /// Wire version used for outbound frames
    pub version: MavlinkVersion,
    /// System ID of this ground station
    pub system_id: u8,
    /// Component ID of this ground station
    pub component_id: u8,
}

/// Component ID conventionally used by ground control stations
pub const GCS_COMPONENT_ID: u8 = 190;

impl Default for MavlinkCodec {
    fn default() -> Self {
        Self {
            version: MavlinkVersion::V2,
            system_id: 255,
            component_id: GCS_COMPONENT_ID,
        }
    }
}

impl CodecFactory for MavlinkCodec {
    type Inbound = MavlinkPacket;
    type Outbound = MavlinkMessage;
    type Parser = MavlinkParser;
    type Encoder = MavlinkEncoder;

    fn create_parser(&self) -> MavlinkParser {
        MavlinkParser::new()
    }

    fn create_encoder(&self) -> MavlinkEncoder {
        MavlinkEncoder::new(self.version, self.system_id, self.component_id)
    }
}

// ============================================================================
// Payload helpers
// ============================================================================

const MAV_TYPE_GCS: u8 = 6;
const MAV_AUTOPILOT_INVALID: u8 = 8;
const MAV_STATE_STANDBY: u8 = 3;
const MAVLINK_PROTOCOL_VERSION: u8 = 3;

/// Heartbeat announcing a ground control station
pub fn heartbeat() -> MavlinkMessage {
    // custom_mode (u32), type, autopilot, base_mode, system_status, mavlink_version
    let mut payload = Vec::with_capacity(9);
    payload.extend_from_slice(&0u32.to_le_bytes());
    payload.extend_from_slice(&[
        MAV_TYPE_GCS,
        MAV_AUTOPILOT_INVALID,
        0,
        MAV_STATE_STANDBY,
        MAVLINK_PROTOCOL_VERSION,
    ]);
    MavlinkMessage::new(ids::HEARTBEAT, payload)
}

/// Decoded `STATUSTEXT` contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusText {
    /// MAV_SEVERITY value (0 = emergency ... 7 = debug)
    pub severity: u8,
    /// Message text
    pub text: String,
}

const STATUSTEXT_TEXT_LEN: usize = 50;

/// Extract the severity and text of a `STATUSTEXT` frame
pub fn decode_statustext(frame: &MavlinkFrame) -> Option<StatusText> {
    if frame.message_id != ids::STATUSTEXT {
        return None;
    }
    let end = frame.payload.len().min(1 + STATUSTEXT_TEXT_LEN);
    let raw = frame.payload.get(1..end).unwrap_or(&[]);
    let raw = raw.split(|&b| b == 0).next().unwrap_or(&[]);
    Some(StatusText {
        severity: frame.payload_byte(0),
        text: String::from_utf8_lossy(raw).into_owned(),
    })
}

/// Maximum number of correction bytes in one `GPS_RTCM_DATA` message
pub const RTCM_FRAGMENT_LEN: usize = 180;
/// Maximum number of fragments a single correction packet may be split into
pub const RTCM_MAX_FRAGMENTS: usize = 4;

/// Splits correction packets into `GPS_RTCM_DATA` messages
///
/// Packets longer than one message are sent as up to four fragments that
/// share a 5-bit sequence ID.
#[derive(Debug, Default)]
pub struct RtcmDataFragmenter {
    sequence: u8,
}

impl RtcmDataFragmenter {
    /// Create a new fragmenter
    pub fn new() -> Self {
        Self::default()
    }

    /// Fragment a correction packet
    pub fn fragment(&mut self, packet: &[u8]) -> Result<Vec<MavlinkMessage>, EncodeError> {
        let max = RTCM_FRAGMENT_LEN * RTCM_MAX_FRAGMENTS;
        if packet.len() > max {
            return Err(EncodeError::PayloadTooLong {
                len: packet.len(),
                max,
            });
        }

        let sequence = self.sequence & 0x1F;
        self.sequence = (self.sequence + 1) & 0x1F;

        let fragmented = packet.len() > RTCM_FRAGMENT_LEN;
        let mut chunks: Vec<&[u8]> = packet.chunks(RTCM_FRAGMENT_LEN).collect();
        if chunks.is_empty() {
            chunks.push(&[]);
        }
        // A full last fragment needs an empty terminator so the receiver
        // knows the packet is complete
        if fragmented
            && packet.len() % RTCM_FRAGMENT_LEN == 0
            && chunks.len() < RTCM_MAX_FRAGMENTS
        {
            chunks.push(&[]);
        }

        Ok(chunks
            .into_iter()
            .enumerate()
            .map(|(index, chunk)| {
                let mut flags = sequence << 3;
                if fragmented {
                    flags |= 0x01 | ((index as u8 & 0x03) << 1);
                }
                let mut payload = Vec::with_capacity(2 + RTCM_FRAGMENT_LEN);
                payload.push(flags);
                payload.push(chunk.len() as u8);
                payload.extend_from_slice(chunk);
                payload.resize(2 + RTCM_FRAGMENT_LEN, 0);
                MavlinkMessage::new(ids::GPS_RTCM_DATA, payload)
            })
            .collect())
    }
}
