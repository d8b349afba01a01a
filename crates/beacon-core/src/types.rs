//! Routing types shared across Beacon crates.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from parsing a routing value out of its text form.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid address in prefix: {0}")]
    InvalidAddress(String),
    #[error("invalid prefix length in {0}")]
    InvalidLength(String),
    #[error("prefix {0} has host bits set")]
    HostBitsSet(String),
    #[error("invalid community: {0}")]
    InvalidCommunity(String),
}

/// Network-layer protocol a peering carries routes for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    /// IANA address family identifier.
    pub fn afi(self) -> u16 {
        match self {
            AddressFamily::Ipv4 => 1,
            AddressFamily::Ipv6 => 2,
        }
    }

    /// Family of a concrete address.
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => AddressFamily::Ipv4,
            IpAddr::V6(_) => AddressFamily::Ipv6,
        }
    }

    fn max_len(self) -> u8 {
        match self {
            AddressFamily::Ipv4 => 32,
            AddressFamily::Ipv6 => 128,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::Ipv4 => write!(f, "ipv4"),
            AddressFamily::Ipv6 => write!(f, "ipv6"),
        }
    }
}

/// Subsequent address family identifier for unicast routes.
pub const SAFI_UNICAST: u8 = 1;

/// An IP prefix, e.g. `192.0.2.0/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Prefix {
    addr: IpAddr,
    len: u8,
}

impl Prefix {
    /// Build a prefix, rejecting lengths past the family width and set host bits.
    pub fn new(addr: IpAddr, len: u8) -> Result<Self, ParseError> {
        let family = AddressFamily::of(&addr);
        if len > family.max_len() {
            return Err(ParseError::InvalidLength(format!("{addr}/{len}")));
        }
        let host_bits_clear = match addr {
            IpAddr::V4(v4) => {
                let bits = u32::from(v4);
                len == 32 || bits & (u32::MAX >> len) == 0
            }
            IpAddr::V6(v6) => {
                let bits = u128::from(v6);
                len == 128 || bits & (u128::MAX >> len) == 0
            }
        };
        if !host_bits_clear {
            return Err(ParseError::HostBitsSet(format!("{addr}/{len}")));
        }
        Ok(Self { addr, len })
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix_len(&self) -> u8 {
        self.len
    }

    pub fn family(&self) -> AddressFamily {
        AddressFamily::of(&self.addr)
    }

    /// Significant address octets, as carried in NLRI encoding.
    pub fn significant_octets(&self) -> Vec<u8> {
        let count = usize::from(self.len).div_ceil(8);
        match self.addr {
            IpAddr::V4(v4) => v4.octets()[..count].to_vec(),
            IpAddr::V6(v6) => v6.octets()[..count].to_vec(),
        }
    }
}

impl FromStr for Prefix {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (addr_part, len_part) = match s.split_once('/') {
            Some((a, l)) => (a, Some(l)),
            None => (s, None),
        };
        let addr: IpAddr = addr_part
            .parse()
            .map_err(|_| ParseError::InvalidAddress(s.to_string()))?;
        let len = match len_part {
            Some(l) => l
                .parse::<u8>()
                .map_err(|_| ParseError::InvalidLength(s.to_string()))?,
            None => AddressFamily::of(&addr).max_len(),
        };
        Prefix::new(addr, len)
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.len)
    }
}

/// A standard BGP community value (RFC 1997).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Community(pub u32);

impl Community {
    pub const NO_EXPORT: Community = Community(0xFFFF_FF01);
    pub const NO_ADVERTISE: Community = Community(0xFFFF_FF02);
    pub const NO_EXPORT_SUBCONFED: Community = Community(0xFFFF_FF03);

    pub fn from_parts(asn: u16, value: u16) -> Self {
        Community((u32::from(asn) << 16) | u32::from(value))
    }
}

impl FromStr for Community {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.to_lowercase().as_str() {
            "no-export" => return Ok(Community::NO_EXPORT),
            "no-advertise" => return Ok(Community::NO_ADVERTISE),
            "no-export-subconfed" => return Ok(Community::NO_EXPORT_SUBCONFED),
            _ => {}
        }
        let invalid = || ParseError::InvalidCommunity(s.to_string());
        match s.split_once(':') {
            Some((asn, value)) => {
                let asn = asn.parse::<u16>().map_err(|_| invalid())?;
                let value = value.parse::<u16>().map_err(|_| invalid())?;
                Ok(Community::from_parts(asn, value))
            }
            None => s.parse::<u32>().map(Community).map_err(|_| invalid()),
        }
    }
}

impl fmt::Display for Community {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.0 >> 16, self.0 & 0xFFFF)
    }
}

/// ORIGIN path attribute value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    #[default]
    Igp,
    Egp,
    Incomplete,
}

impl Origin {
    pub fn code(self) -> u8 {
        match self {
            Origin::Igp => 0,
            Origin::Egp => 1,
            Origin::Incomplete => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Origin::Igp),
            1 => Some(Origin::Egp),
            2 => Some(Origin::Incomplete),
            _ => None,
        }
    }
}
