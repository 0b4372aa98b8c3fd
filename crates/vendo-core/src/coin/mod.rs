//! Coin handling: pulse sources, the insert-window state machine, and the
//! source registry.

pub mod aggregator;
pub mod registry;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::OpError;

/// Identifier prefix for remote sub-devices in the canonical string form.
const REMOTE_PREFIX: &str = "remote:";

/// The canonical name of the on-appliance slot.
const HARDWARE_NAME: &str = "hardware";

/// A coin origin: the on-appliance slot or a remote sub-device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceId {
    /// The local coin/bill slot wired to the appliance.
    Hardware,
    /// A sub-device on the LAN, keyed by its self-reported identifier.
    Remote(String),
}

impl SourceId {
    /// Builds a remote source id.
    #[must_use]
    pub fn remote(id: impl Into<String>) -> Self {
        Self::Remote(id.into())
    }

    /// Returns `true` for the local slot.
    #[must_use]
    pub const fn is_hardware(&self) -> bool {
        matches!(self, Self::Hardware)
    }

    /// Parses the canonical string form: `hardware` or `remote:<id>`.
    ///
    /// # Errors
    ///
    /// Returns [`OpError::Invalid`] for unknown forms or empty remote ids.
    pub fn parse(input: &str) -> Result<Self, OpError> {
        if input == HARDWARE_NAME {
            return Ok(Self::Hardware);
        }
        if let Some(id) = input.strip_prefix(REMOTE_PREFIX) {
            if id.is_empty() {
                return Err(OpError::Invalid("empty remote source id".to_string()));
            }
            return Ok(Self::Remote(id.to_string()));
        }
        Err(OpError::Invalid(format!("unknown source {input:?}")))
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hardware => f.write_str(HARDWARE_NAME),
            Self::Remote(id) => write!(f, "{REMOTE_PREFIX}{id}"),
        }
    }
}

impl FromStr for SourceId {
    type Err = OpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for SourceId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SourceId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// How an insert window accepts pulses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertMode {
    /// Pulses from every online source are accepted.
    Auto,
    /// Only the targeted source contributes; the rest are dropped.
    Manual,
}
