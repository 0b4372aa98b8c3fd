//! The `PacketPolicy` capability: the only door to the packet-forwarding
//! plane.
//!
//! The core never touches iptables/tc/conntrack directly; it speaks this
//! trait. All mutating operations are idempotent so the ticker can retry
//! them blindly after transient failures. Adapters live in the daemon
//! crate (netfilter subprocesses in production, an in-memory fake in
//! tests).
//!
//! Post-commit enforcement work is expressed as [`EnforcementOp`] values.
//! The store writer path never blocks on the packet plane: it commits the
//! record mutation, emits ops into the outbox, and lets the ticker's
//! reconciliation pass heal anything the outbox drops.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::net::Ipv4Addr;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::net::MacAddr;

/// Boxed future type used by the capability trait.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors from packet-policy adapters. All of these are transient from the
/// core's point of view: the session record stays authoritative and the
/// ticker re-drives the plane until it matches.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum PolicyError {
    /// The external tool exited nonzero.
    #[error("{tool} failed (exit {code}): {stderr}")]
    CommandFailed {
        /// Tool name (`iptables`, `tc`, ...).
        tool: &'static str,
        /// Exit code, -1 when killed by signal.
        code: i32,
        /// Captured stderr, truncated.
        stderr: String,
    },

    /// The external tool exceeded its deadline.
    #[error("{tool} timed out after {timeout_ms}ms")]
    Timeout {
        /// Tool name.
        tool: &'static str,
        /// The deadline that elapsed.
        timeout_ms: u64,
    },

    /// The tool ran but produced output the adapter could not parse.
    #[error("failed to parse {tool} output: {detail}")]
    Parse {
        /// Tool name.
        tool: &'static str,
        /// What went wrong.
        detail: String,
    },

    /// The tool could not be spawned at all.
    #[error("failed to spawn {tool}: {detail}")]
    Spawn {
        /// Tool name.
        tool: &'static str,
        /// OS error text.
        detail: String,
    },
}

/// One byte counter read from the plane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    /// Cumulative bytes since the counter was created or last reset.
    pub bytes: u64,
    /// Seconds since the counter last moved, if the plane reports it.
    pub idle_secs: Option<u64>,
}

/// A snapshot of both traffic directions.
///
/// Uploads are keyed by client IP; downloads by the shaping class id
/// derived from the IP's last octet.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CounterSample {
    /// Per-client upload counters.
    pub uploads: HashMap<Ipv4Addr, Counter>,
    /// Per-class download counters.
    pub downloads: HashMap<u16, Counter>,
}

/// Neighbor-table liveness of a client IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NeighborState {
    /// The kernel recently confirmed the neighbor.
    Reachable,
    /// The entry exists but has gone stale.
    Stale,
    /// No entry, or the entry failed.
    Unreachable,
}

impl NeighborState {
    /// Returns `true` when the neighbor table vouches for the client.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(self, Self::Reachable)
    }
}

/// The packet-forwarding capability consumed by the core.
///
/// Implementations must make every mutating call idempotent: authorizing
/// an already-authorized MAC, removing an absent limit, and so on are
/// successful no-ops.
pub trait PacketPolicy: Send + Sync {
    /// Flags the MAC for forwarding. Returns `true` if the authorization
    /// was newly created.
    fn authorize<'a>(&'a self, mac: &'a MacAddr) -> BoxFuture<'a, Result<bool, PolicyError>>;

    /// Removes the MAC's authorization and evicts existing flows for its
    /// bound IP.
    fn deauthorize<'a>(&'a self, mac: &'a MacAddr) -> BoxFuture<'a, Result<(), PolicyError>>;

    /// Installs (or replaces) the per-IP shaping policy.
    fn set_limit(
        &self,
        ip: Ipv4Addr,
        down_kbps: u32,
        up_kbps: u32,
    ) -> BoxFuture<'_, Result<(), PolicyError>>;

    /// Removes the per-IP shaping policy.
    fn remove_limit(&self, ip: Ipv4Addr) -> BoxFuture<'_, Result<(), PolicyError>>;

    /// Reads the byte counters for both directions.
    fn sample_counters(&self) -> BoxFuture<'_, Result<CounterSample, PolicyError>>;

    /// Lists every MAC currently authorized in the plane.
    fn list_authorized_macs(&self) -> BoxFuture<'_, Result<HashSet<MacAddr>, PolicyError>>;

    /// Returns `true` if established flows reference the IP.
    fn has_live_flows(&self, ip: Ipv4Addr) -> BoxFuture<'_, Result<bool, PolicyError>>;

    /// Probes the kernel neighbor table for the IP.
    fn neighbor_state(&self, ip: Ipv4Addr) -> BoxFuture<'_, Result<NeighborState, PolicyError>>;
}

/// A post-commit unit of enforcement work.
///
/// Emitted by the identity resolver, credit applier, and session paths
/// after their store mutation commits; drained by the daemon's outbox
/// worker. Loss is tolerable: the ticker's reconciliation pass converges
/// the plane onto the store within one interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnforcementOp {
    /// Authorize a MAC for forwarding.
    Authorize(MacAddr),
    /// Deauthorize a MAC and evict its flows.
    Deauthorize(MacAddr),
    /// Install a per-IP shaping policy.
    SetLimit {
        /// Client IP.
        ip: Ipv4Addr,
        /// Download cap in kbit/s.
        down_kbps: u32,
        /// Upload cap in kbit/s.
        up_kbps: u32,
    },
    /// Remove a per-IP shaping policy.
    RemoveLimit(Ipv4Addr),
}

impl fmt::Display for EnforcementOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authorize(mac) => write!(f, "authorize {mac}"),
            Self::Deauthorize(mac) => write!(f, "deauthorize {mac}"),
            Self::SetLimit {
                ip,
                down_kbps,
                up_kbps,
            } => write!(f, "limit {ip} down={down_kbps} up={up_kbps}"),
            Self::RemoveLimit(ip) => write!(f, "unlimit {ip}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_neighbor_liveness() {
        assert!(NeighborState::Reachable.is_live());
        assert!(!NeighborState::Stale.is_live());
        assert!(!NeighborState::Unreachable.is_live());
    }

    #[test]
    fn test_enforcement_op_display() {
        let mac = MacAddr::parse("aa:bb:cc:dd:ee:01").unwrap();
        assert_eq!(
            EnforcementOp::Authorize(mac).to_string(),
            "authorize aa:bb:cc:dd:ee:01"
        );
        let op = EnforcementOp::SetLimit {
            ip: Ipv4Addr::new(10, 0, 0, 7),
            down_kbps: 2048,
            up_kbps: 1024,
        };
        assert_eq!(op.to_string(), "limit 10.0.0.7 down=2048 up=1024");
    }
}
