//! Gateway configuration.
//!
//! Loaded once from a TOML file at startup and passed to components by
//! value as frozen sections. Components that react to runtime changes
//! expose an explicit `reconfigure` method instead of reading a live
//! config handle.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from loading configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config {path:?}: {source}")]
    Read {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The config file could not be parsed.
    #[error("failed to parse config {path:?}: {source}")]
    Parse {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying TOML error.
        source: toml::de::Error,
    },
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    /// Path to the SQLite session store.
    pub db_path: PathBuf,
    /// LAN interface the enforcement plane shapes and samples.
    pub lan_iface: String,
    /// Coin insert-window settings.
    pub coin: CoinConfig,
    /// Fail-attempt gate settings.
    pub gate: GateConfig,
    /// Ticker settings.
    pub ticker: TickerConfig,
    /// Idle monitor settings.
    pub idle: IdleConfig,
    /// Remote source settings.
    pub sources: SourcesConfig,
    /// Free-time grant settings.
    pub free_time: FreeTimeConfig,
    /// Reporting settings.
    pub report: ReportConfig,
    /// External subprocess deadlines.
    pub policy: PolicyConfig,
}

impl GatewayConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Coin insert-window settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoinConfig {
    /// Seconds the window stays open after the last pulse.
    pub pulse_idle_secs: u64,
    /// Hard ceiling on a window's lifetime from open, regardless of pulses.
    pub absolute_secs: u64,
    /// Pulses within `ban_window_secs` that trip the spurious-pulse ban.
    pub ban_limit_pulses_per_window: u32,
    /// Width of the spurious-pulse window.
    pub ban_window_secs: u64,
    /// How long the aggregator stays banned after a pulse flood.
    pub ban_duration_secs: u64,
}

impl Default for CoinConfig {
    fn default() -> Self {
        Self {
            pulse_idle_secs: 30,
            absolute_secs: 60,
            // A mechanical slot yields at most a few pulses per second;
            // anything past this inside one window is a stuck or shorted line.
            ban_limit_pulses_per_window: 50,
            ban_window_secs: 10,
            ban_duration_secs: 300,
        }
    }
}

/// Fail-attempt gate settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GateConfig {
    /// Consecutive failures that trigger the per-MAC ban.
    pub ban_limit: u32,
    /// Ban length in seconds.
    pub ban_duration_secs: i64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            ban_limit: 5,
            ban_duration_secs: 300,
        }
    }
}

/// Ticker settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TickerConfig {
    /// Seconds between byte-counter samples.
    pub traffic_sample_secs: u64,
    /// Seconds between full MAC-set reconciliations.
    pub mac_reconcile_secs: u64,
}

impl Default for TickerConfig {
    fn default() -> Self {
        Self {
            traffic_sample_secs: 5,
            mac_reconcile_secs: 60,
        }
    }
}

/// Idle monitor settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IdleConfig {
    /// Seconds between idle checks.
    pub check_interval_secs: u64,
    /// Seconds of counter stall before a user is eligible for pause.
    pub idle_timeout_secs: i64,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 5,
            idle_timeout_secs: 120,
        }
    }
}

/// Remote source settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourcesConfig {
    /// Shared secret remote sub-devices present on heartbeat and pulse.
    pub sub_vendo_key: String,
    /// Seconds of heartbeat silence before a source reads as offline.
    pub offline_after_secs: i64,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            sub_vendo_key: String::new(),
            offline_after_secs: 70,
        }
    }
}

/// Free-time grant settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FreeTimeConfig {
    /// Whether the periodic free grant is offered at all.
    pub enabled: bool,
    /// Minutes granted per claim.
    pub minutes: u32,
    /// Seconds a MAC must wait between claims.
    pub cooldown_secs: i64,
}

impl Default for FreeTimeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            minutes: 10,
            cooldown_secs: 3600,
        }
    }
}

/// Reporting settings.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReportConfig {
    /// UTC offset applied when bucketing sales into local days.
    /// Storage stays UTC; only report boundaries shift.
    pub tz_offset_minutes: i32,
}

/// External subprocess deadlines.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyConfig {
    /// Deadline for neighbor/conntrack/counter probes, in seconds.
    pub probe_timeout_secs: u64,
    /// Deadline for iptables/tc table rewrites, in seconds.
    pub rewrite_timeout_secs: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            probe_timeout_secs: 2,
            rewrite_timeout_secs: 5,
        }
    }
}

impl PolicyConfig {
    /// Probe deadline as a [`Duration`].
    #[must_use]
    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Rewrite deadline as a [`Duration`].
    #[must_use]
    pub const fn rewrite_timeout(&self) -> Duration {
        Duration::from_secs(self.rewrite_timeout_secs)
    }
}
