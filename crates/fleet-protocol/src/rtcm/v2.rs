//! RTCM 2.x Word Stream
//!
//! RTCM v2 is not byte framed. Messages are sequences of 30-bit words
//! (24 data bits plus 6 Hamming parity bits) sent six bits per byte:
//!
//! ```text
//! byte = 0b01xxxxxx, where xxxxxx are the next six word bits, least significant bit first
//! ```
//!
//! Every word's data bits are complemented when the last parity bit (D30*)
//! of the previous word is set. A message starts with two header words:
//!
//! ```text
//! word 1: [preamble 0x66 : 8] [message type : 6] [station id : 10]
//! word 2: [modified Z-count : 13] [sequence : 3] [length : 5] [health : 3]
//! ```
//!
//! followed by `length` data words.

use crate::error::{EncodeError, ParseError};
use crate::{Encoder, Parser};

/// Preamble found in the first data byte of every message
pub const PREAMBLE: u8 = 0x66;

/// Maximum number of data words following the header
pub const MAX_DATA_WORDS: usize = 31;

const WORD_BITS: u32 = 30;
const DATA_MASK: u32 = 0x00FF_FFFF;
const COMPLEMENT_MASK: u32 = 0x3FFF_FFC0;
const D30_STAR: u32 = 0x4000_0000;

/// Hamming parity masks over the register `[D29* D30* d1..d24 D25..D30]`
const PARITY_MASKS: [u32; 6] = [
    0xBB1F_3480,
    0x5D8F_9A40,
    0xAEC7_CD00,
    0x5763_E680,
    0x6BB1_F340,
    0x8B7A_89C0,
];

fn parity(register: u32) -> u32 {
    PARITY_MASKS.iter().fold(0, |acc, mask| {
        (acc << 1) | (((register & mask) >> 6).count_ones() & 1)
    })
}

/// Check a received word, returning its 24 data bits
///
/// `register` holds the last two bits of the previous word in its top two
/// bits, followed by the 30 bits of the word itself.
fn decode_word(register: u32) -> Option<u32> {
    let register = if register & D30_STAR != 0 {
        register ^ COMPLEMENT_MASK
    } else {
        register
    };
    if parity(register) != register & 0x3F {
        return None;
    }
    Some((register >> 6) & DATA_MASK)
}

fn reverse6(bits: u8) -> u8 {
    (bits.reverse_bits() >> 2) & 0x3F
}

/// A parity-checked RTCM v2 message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rtcm2Packet {
    /// Message type (1..=63)
    pub packet_type: u8,
    /// Reference station ID (10 bits)
    pub station_id: u16,
    /// Modified Z-count in units of 0.6 s (13 bits)
    pub modified_z_count: u16,
    /// Sequence number (3 bits)
    pub sequence: u8,
    /// Station health (3 bits)
    pub station_health: u8,
    /// Data words, 24 bits each
    pub data_words: Vec<u32>,
}

impl Rtcm2Packet {
    /// Create a packet without any data words
    pub fn new(packet_type: u8, station_id: u16) -> Self {
        Self {
            packet_type,
            station_id,
            modified_z_count: 0,
            sequence: 0,
            station_health: 0,
            data_words: Vec::new(),
        }
    }

    fn from_words(words: &[u32]) -> Self {
        let (h1, h2) = (words[0], words[1]);
        Self {
            packet_type: ((h1 >> 10) & 0x3F) as u8,
            station_id: (h1 & 0x3FF) as u16,
            modified_z_count: (h2 >> 11) as u16,
            sequence: ((h2 >> 8) & 0x07) as u8,
            station_health: (h2 & 0x07) as u8,
            data_words: words[2..].to_vec(),
        }
    }

    fn header_words(&self) -> Result<[u32; 2], EncodeError> {
        check_range("packet_type", u32::from(self.packet_type), 64)?;
        check_range("station_id", u32::from(self.station_id), 1024)?;
        check_range("modified_z_count", u32::from(self.modified_z_count), 8192)?;
        check_range("sequence", u32::from(self.sequence), 8)?;
        check_range("station_health", u32::from(self.station_health), 8)?;
        check_range("length", self.data_words.len() as u32, MAX_DATA_WORDS as u32 + 1)?;
        for &word in &self.data_words {
            check_range("data_word", word, DATA_MASK + 1)?;
        }

        Ok([
            (u32::from(PREAMBLE) << 16)
                | (u32::from(self.packet_type) << 10)
                | u32::from(self.station_id),
            (u32::from(self.modified_z_count) << 11)
                | (u32::from(self.sequence) << 8)
                | ((self.data_words.len() as u32) << 3)
                | u32::from(self.station_health),
        ])
    }
}

fn check_range(field: &'static str, value: u32, limit: u32) -> Result<(), EncodeError> {
    if value >= limit {
        return Err(EncodeError::FieldOutOfRange { field, value });
    }
    Ok(())
}

/// Streaming RTCM v2 parser
///
/// Until the first message is found, the preamble is searched for at every
/// bit position, so the parser locks on regardless of how the stream was
/// cut. After a complete message the next one is expected on the following
/// word boundary. A parity error drops the current message and resumes the
/// bitwise search.
pub struct Rtcm2Parser {
    buffer: Vec<u8>,
    /// Bits of `buffer[0]` already shifted into the register
    consumed_bits: u32,
    register: u32,
    bits_in_word: u32,
    word_aligned: bool,
    words: Vec<u32>,
    expected_words: usize,
}

impl Rtcm2Parser {
    /// Create a new RTCM v2 parser
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(256),
            consumed_bits: 0,
            register: 0,
            bits_in_word: 0,
            word_aligned: false,
            words: Vec::with_capacity(MAX_DATA_WORDS + 2),
            expected_words: 0,
        }
    }

    fn reset_frame(&mut self, word_aligned: bool) {
        self.words.clear();
        self.expected_words = 0;
        self.bits_in_word = 0;
        self.word_aligned = word_aligned;
    }

    fn try_preamble(&mut self) {
        if let Some(data) = decode_word(self.register) {
            if (data >> 16) as u8 == PREAMBLE {
                self.words.push(data);
                self.bits_in_word = 0;
            }
        }
    }

    /// Shift one bit into the register, returning a packet if it completed one
    fn push_bit(&mut self, bit: u32) -> Option<Rtcm2Packet> {
        self.register = (self.register << 1) | bit;

        if self.words.is_empty() {
            if self.word_aligned {
                self.bits_in_word += 1;
                if self.bits_in_word == WORD_BITS {
                    self.word_aligned = false;
                    self.try_preamble();
                }
            } else {
                self.try_preamble();
            }
            return None;
        }

        self.bits_in_word += 1;
        if self.bits_in_word < WORD_BITS {
            return None;
        }
        self.bits_in_word = 0;

        let Some(data) = decode_word(self.register) else {
            tracing::trace!(
                "RTCM2 {}, dropping message",
                ParseError::Parity(self.words.len())
            );
            self.reset_frame(false);
            return None;
        };
        self.words.push(data);

        if self.words.len() == 2 {
            self.expected_words = 2 + ((data >> 3) & 0x1F) as usize;
        }
        if self.words.len() < self.expected_words {
            return None;
        }

        let packet = Rtcm2Packet::from_words(&self.words);
        self.reset_frame(true);
        Some(packet)
    }
}

impl Default for Rtcm2Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser for Rtcm2Parser {
    type Item = Rtcm2Packet;

    fn push_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    fn next_item(&mut self) -> Option<Rtcm2Packet> {
        let mut index = 0;
        while index < self.buffer.len() {
            let byte = self.buffer[index];
            if byte & 0xC0 != 0x40 {
                index += 1;
                self.consumed_bits = 0;
                continue;
            }
            while self.consumed_bits < 6 {
                let bit = u32::from((byte >> self.consumed_bits) & 1);
                self.consumed_bits += 1;
                if let Some(packet) = self.push_bit(bit) {
                    if self.consumed_bits == 6 {
                        index += 1;
                        self.consumed_bits = 0;
                    }
                    self.buffer.drain(..index);
                    return Some(packet);
                }
            }
            index += 1;
            self.consumed_bits = 0;
        }
        self.buffer.clear();
        None
    }

    fn clear(&mut self) {
        self.buffer.clear();
        self.consumed_bits = 0;
        self.register = 0;
        self.bits_in_word = 0;
        self.word_aligned = false;
        self.words.clear();
        self.expected_words = 0;
    }
}

/// Stateful RTCM v2 encoder
///
/// Parity of each word depends on the last two bits of the previous word,
/// so one encoder must be used per output stream.
#[derive(Debug, Default)]
pub struct Rtcm2Encoder {
    last_word: u32,
}

impl Rtcm2Encoder {
    /// Create a new RTCM v2 encoder
    pub fn new() -> Self {
        Self::default()
    }

    fn encode_word(&mut self, data: u32, out: &mut Vec<u8>) {
        let register = ((self.last_word & 0x3) << 30) | (data << 6);
        let parity = parity(register);
        let data = if self.last_word & 0x1 != 0 {
            !data & DATA_MASK
        } else {
            data
        };
        let word = (data << 6) | parity;
        self.last_word = word;

        for shift in (0..WORD_BITS).step_by(6).rev() {
            out.push(0x40 | reverse6(((word >> shift) & 0x3F) as u8));
        }
    }
}

impl Encoder for Rtcm2Encoder {
    type Item = Rtcm2Packet;

    fn encode(&mut self, packet: &Rtcm2Packet) -> Result<Vec<u8>, EncodeError> {
        let header = packet.header_words()?;
        let mut out = Vec::with_capacity((2 + packet.data_words.len()) * 5);
        for word in header.into_iter().chain(packet.data_words.iter().copied()) {
            self.encode_word(word, &mut out);
        }
        Ok(out)
    }
}
