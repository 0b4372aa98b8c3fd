//! Network identity value types.
//!
//! Every MAC address in the system flows through [`MacAddr`], which enforces
//! the canonical lowercase colon-separated form at construction. Case
//! normalization happens exactly once, here, instead of being scattered
//! across lookup paths.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from parsing network identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum NetParseError {
    /// The MAC address string is not six hex octets.
    #[error("invalid MAC address: {input:?}")]
    InvalidMac {
        /// The rejected input.
        input: String,
    },
}

/// A MAC address in canonical form: lowercase, colon-separated.
///
/// Accepts `:` or `-` separators and any case on parse; stores the six raw
/// octets so equality and hashing are independent of the input spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    /// Creates a MAC address from raw octets.
    #[must_use]
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Returns the raw octets.
    #[must_use]
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Parses a MAC address, accepting `aa:bb:cc:dd:ee:ff`,
    /// `AA-BB-CC-DD-EE-FF`, and mixed-case variants.
    ///
    /// # Errors
    ///
    /// Returns [`NetParseError::InvalidMac`] if the input is not six hex
    /// octets.
    pub fn parse(input: &str) -> Result<Self, NetParseError> {
        let mut octets = [0u8; 6];
        let mut count = 0;
        for part in input.split(|c| c == ':' || c == '-') {
            if count == 6 || part.len() != 2 {
                return Err(NetParseError::InvalidMac {
                    input: input.to_string(),
                });
            }
            octets[count] =
                u8::from_str_radix(part, 16).map_err(|_| NetParseError::InvalidMac {
                    input: input.to_string(),
                })?;
            count += 1;
        }
        if count != 6 {
            return Err(NetParseError::InvalidMac {
                input: input.to_string(),
            });
        }
        Ok(Self(octets))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = NetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for MacAddr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Derives the traffic-shaping class id for a client IP.
///
/// The class id is the last octet of the IPv4 address, valid in `1..=254`.
/// Network and broadcast octets have no class.
#[must_use]
pub fn class_id_for_ip(ip: Ipv4Addr) -> Option<u16> {
    let last = ip.octets()[3];
    if (1..=254).contains(&last) {
        Some(u16::from(last))
    } else {
        None
    }
}
