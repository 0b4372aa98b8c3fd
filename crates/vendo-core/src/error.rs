//! The uniform result envelope for core operations.
//!
//! Every portal-facing operation resolves to `Ok` or one of these kinds.
//! The external HTTP/WebSocket layer maps them onto its own wire envelope;
//! the core never leaks storage or subprocess error types across this
//! boundary.

use thiserror::Error;

/// Errors surfaced by core operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum OpError {
    /// The coin slot is held by another owner for the duration of its
    /// insert window.
    #[error("coin slot busy")]
    Busy,

    /// The caller's MAC is locked out by the fail-attempt gate.
    #[error("banned for {remaining_secs}s")]
    Banned {
        /// Seconds until the ban lifts.
        remaining_secs: i64,
    },

    /// The rate planner could not fit the committed amount. Sale rows are
    /// already written; an operator must resolve the credit.
    #[error("no rate combination fits amount {amount}")]
    NoRateForAmount {
        /// The peso amount that could not be planned.
        amount: u32,
    },

    /// An identifier (MAC, IP, code) is owned by another active user.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A packet-policy call failed or timed out; the ticker will retry.
    #[error("transient: {0}")]
    Transient(String),

    /// Malformed input, bad shared secret, or unknown source.
    #[error("invalid: {0}")]
    Invalid(String),

    /// No such user, source, or code.
    #[error("not found")]
    NotFound,

    /// The record exists but carries no remaining credit.
    #[error("session expired")]
    Expired,

    /// The client MAC could not be resolved from its IP. Status queries
    /// still succeed with a null user.
    #[error("missing mac")]
    MissingMac,
}

impl OpError {
    /// Returns `true` if the operation may succeed on retry without any
    /// caller-side change.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Short machine-readable kind for logs and the portal envelope.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Busy => "busy",
            Self::Banned { .. } => "banned",
            Self::NoRateForAmount { .. } => "no_rate_for_amount",
            Self::Conflict(_) => "conflict",
            Self::Transient(_) => "transient",
            Self::Invalid(_) => "invalid",
            Self::NotFound => "not_found",
            Self::Expired => "expired",
            Self::MissingMac => "missing_mac",
        }
    }
}

impl From<rusqlite::Error> for OpError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Transient(format!("storage: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings() {
        assert_eq!(OpError::Busy.kind(), "busy");
        assert_eq!(OpError::Banned { remaining_secs: 9 }.kind(), "banned");
        assert_eq!(OpError::NoRateForAmount { amount: 7 }.kind(), "no_rate_for_amount");
        assert_eq!(OpError::MissingMac.kind(), "missing_mac");
    }

    #[test]
    fn test_transient_classification() {
        assert!(OpError::Transient("tc timed out".into()).is_transient());
        assert!(!OpError::Busy.is_transient());
        assert!(!OpError::NotFound.is_transient());
    }
}
