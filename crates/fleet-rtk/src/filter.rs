//! Accept/reject filter over RTCM packet identities
//!
//! Packet identities are written as `<prefix>/<type>`, e.g. `rtcm3/1020`
//! for RTCM v3 messages of type 1020 or `rtcm2/18` for RTCM v2 type 18.

use std::collections::BTreeSet;

use fleet_protocol::rtcm::{RtcmPacket, RtcmVersion};
use serde::Deserialize;

use crate::error::RtkError;

/// Packet types grouped by RTCM version
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketIdSet {
    v2: BTreeSet<u16>,
    v3: BTreeSet<u16>,
}

impl PacketIdSet {
    /// Parse a list of packet identities
    ///
    /// Entries with an unknown prefix are ignored. An entry with a known
    /// prefix must carry an integer packet type.
    pub fn parse<I, S>(entries: I) -> Result<Self, RtkError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::default();
        for entry in entries {
            let entry = entry.as_ref();
            let Some((prefix, id)) = entry.split_once('/') else {
                continue;
            };
            let Some(version) = RtcmVersion::from_prefix(prefix) else {
                continue;
            };
            let id: u16 = id
                .trim()
                .parse()
                .map_err(|_| RtkError::InvalidPacketId(entry.to_string()))?;
            set.ids_mut(version).insert(id);
        }
        Ok(set)
    }

    fn ids_mut(&mut self, version: RtcmVersion) -> &mut BTreeSet<u16> {
        match version {
            RtcmVersion::V2 => &mut self.v2,
            RtcmVersion::V3 => &mut self.v3,
        }
    }

    /// Packet types listed for one version
    pub fn ids(&self, version: RtcmVersion) -> &BTreeSet<u16> {
        match version {
            RtcmVersion::V2 => &self.v2,
            RtcmVersion::V3 => &self.v3,
        }
    }

    /// Whether the set lists `packet_type` for `version`
    pub fn contains(&self, version: RtcmVersion, packet_type: u16) -> bool {
        self.ids(version).contains(&packet_type)
    }
}

/// Decides which correction packets a preset forwards
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PacketFilter {
    /// Every packet passes
    #[default]
    Unrestricted,
    /// Rejections are checked first, then the accept list if present
    Restricted {
        accept: Option<PacketIdSet>,
        reject: Option<PacketIdSet>,
    },
}

impl PacketFilter {
    /// Build a filter from optional accept and reject lists
    pub fn new<S: AsRef<str>>(
        accept: Option<&[S]>,
        reject: Option<&[S]>,
    ) -> Result<Self, RtkError> {
        if accept.is_none() && reject.is_none() {
            return Ok(PacketFilter::Unrestricted);
        }
        Ok(PacketFilter::Restricted {
            accept: accept.map(PacketIdSet::parse).transpose()?,
            reject: reject.map(PacketIdSet::parse).transpose()?,
        })
    }

    /// Whether `packet` passes the filter
    pub fn accepts(&self, packet: &RtcmPacket) -> bool {
        let (accept, reject) = match self {
            PacketFilter::Unrestricted => return true,
            PacketFilter::Restricted { accept, reject } => (accept, reject),
        };

        let version = packet.version();
        let packet_type = packet.packet_type();

        if reject
            .as_ref()
            .is_some_and(|set| set.contains(version, packet_type))
        {
            return false;
        }
        if accept
            .as_ref()
            .is_some_and(|set| !set.contains(version, packet_type))
        {
            return false;
        }
        true
    }
}

/// `filter` section of a preset configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterConfig {
    #[serde(default)]
    pub accept: Option<Vec<String>>,
    #[serde(default)]
    pub reject: Option<Vec<String>>,
}

impl FilterConfig {
    pub fn build(&self) -> Result<PacketFilter, RtkError> {
        PacketFilter::new(self.accept.as_deref(), self.reject.as_deref())
    }
}
