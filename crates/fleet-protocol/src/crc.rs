//! Checksums used by the supported framings
//!
//! - X.25 / MCRF4XX (16 bit) for MAVLink
//! - CRC-24Q for RTCM v3

/// Running X.25 checksum as used by MAVLink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct X25 {
    crc: u16,
}

impl X25 {
    /// Start a new checksum
    pub fn new() -> Self {
        Self { crc: 0xFFFF }
    }

    /// Accumulate a single byte
    pub fn accumulate(&mut self, byte: u8) {
        let mut tmp = byte ^ (self.crc & 0xFF) as u8;
        tmp ^= tmp << 4;
        let tmp = u16::from(tmp);
        self.crc = (self.crc >> 8) ^ (tmp << 8) ^ (tmp << 3) ^ (tmp >> 4);
    }

    /// Accumulate a byte slice
    pub fn update(&mut self, data: &[u8]) {
        for &b in data {
            self.accumulate(b);
        }
    }

    /// Current checksum value
    pub fn value(&self) -> u16 {
        self.crc
    }
}

impl Default for X25 {
    fn default() -> Self {
        Self::new()
    }
}

const CRC24Q_POLY: u32 = 0x0186_4CFB;

/// Compute the CRC-24Q checksum of a byte slice
pub fn crc24q(data: &[u8]) -> u32 {
    let mut crc: u32 = 0;
    for &b in data {
        crc ^= u32::from(b) << 16;
        for _ in 0..8 {
            crc <<= 1;
            if crc & 0x0100_0000 != 0 {
                crc ^= CRC24Q_POLY;
            }
        }
    }
    crc & 0x00FF_FFFF
}
