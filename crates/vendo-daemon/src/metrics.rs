//! Prometheus metrics for gateway observability.
//!
//! Exported at `/metrics` in the Prometheus text format.
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `vendo_active_users` | Gauge | Users with credit, not paused |
//! | `vendo_credited_pesos_total` | Counter | Pesos committed |
//! | `vendo_credited_seconds_total` | Counter | Seconds credited |
//! | `vendo_coin_sessions_opened_total` | Counter | Insert windows opened |
//! | `vendo_coin_commits_total` | Counter | Commits applied |
//! | `vendo_sessions_expired_total` | Counter | Sessions expired by the ticker |
//! | `vendo_idle_pauses_total` | Counter | Users paused by the idle monitor |
//! | `vendo_policy_failures_total` | CounterVec | Packet-plane call failures, by op |
//! | `vendo_ticker_delta_seconds` | Counter | Seconds processed by the ticker |

use std::sync::Arc;

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use thiserror::Error;

/// Errors from metrics registration or encoding.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Registration with the Prometheus registry failed.
    #[error("failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),

    /// Encoding the exposition text failed.
    #[error("failed to encode metrics: {0}")]
    Encoding(String),
}

/// Shared handle to the gateway metrics.
pub type SharedMetrics = Arc<GatewayMetrics>;

/// The gateway's metric families.
#[derive(Clone)]
pub struct GatewayMetrics {
    registry: Registry,
    /// Users with credit and not paused.
    pub active_users: IntGauge,
    /// Pesos committed through the credit applier.
    pub credited_pesos_total: IntCounter,
    /// Seconds credited through the credit applier.
    pub credited_seconds_total: IntCounter,
    /// Insert windows opened.
    pub coin_sessions_opened_total: IntCounter,
    /// Commits applied (including zero-amount no-ops).
    pub coin_commits_total: IntCounter,
    /// Sessions expired by the ticker.
    pub sessions_expired_total: IntCounter,
    /// Users paused by the idle monitor.
    pub idle_pauses_total: IntCounter,
    /// Packet-plane call failures, labeled by operation.
    pub policy_failures_total: IntCounterVec,
    /// Seconds of credit decrement processed by the ticker.
    pub ticker_delta_seconds: IntCounter,
}

impl GatewayMetrics {
    /// Creates and registers all metric families.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Registration`] on duplicate registration.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();
        let active_users = IntGauge::new("vendo_active_users", "Users with credit, not paused")?;
        let credited_pesos_total =
            IntCounter::new("vendo_credited_pesos_total", "Pesos committed")?;
        let credited_seconds_total =
            IntCounter::new("vendo_credited_seconds_total", "Seconds credited")?;
        let coin_sessions_opened_total =
            IntCounter::new("vendo_coin_sessions_opened_total", "Insert windows opened")?;
        let coin_commits_total =
            IntCounter::new("vendo_coin_commits_total", "Coin commits applied")?;
        let sessions_expired_total = IntCounter::new(
            "vendo_sessions_expired_total",
            "Sessions expired by the ticker",
        )?;
        let idle_pauses_total = IntCounter::new(
            "vendo_idle_pauses_total",
            "Users paused by the idle monitor",
        )?;
        let policy_failures_total = IntCounterVec::new(
            Opts::new(
                "vendo_policy_failures_total",
                "Packet-plane call failures by operation",
            ),
            &["op"],
        )?;
        let ticker_delta_seconds = IntCounter::new(
            "vendo_ticker_delta_seconds",
            "Seconds of credit decrement processed",
        )?;

        registry.register(Box::new(active_users.clone()))?;
        registry.register(Box::new(credited_pesos_total.clone()))?;
        registry.register(Box::new(credited_seconds_total.clone()))?;
        registry.register(Box::new(coin_sessions_opened_total.clone()))?;
        registry.register(Box::new(coin_commits_total.clone()))?;
        registry.register(Box::new(sessions_expired_total.clone()))?;
        registry.register(Box::new(idle_pauses_total.clone()))?;
        registry.register(Box::new(policy_failures_total.clone()))?;
        registry.register(Box::new(ticker_delta_seconds.clone()))?;

        Ok(Self {
            registry,
            active_users,
            credited_pesos_total,
            credited_seconds_total,
            coin_sessions_opened_total,
            coin_commits_total,
            sessions_expired_total,
            idle_pauses_total,
            policy_failures_total,
            ticker_delta_seconds,
        })
    }

    /// Creates a shared handle.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Registration`] on duplicate registration.
    pub fn new_shared() -> Result<SharedMetrics, MetricsError> {
        Ok(Arc::new(Self::new()?))
    }

    /// Records a packet-plane failure under the given operation label.
    pub fn policy_failure(&self, op: &str) {
        self.policy_failures_total.with_label_values(&[op]).inc();
    }

    /// Encodes the exposition text.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Encoding`] if the encoder fails.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buf)
            .map_err(|e| MetricsError::Encoding(e.to_string()))?;
        String::from_utf8(buf).map_err(|e| MetricsError::Encoding(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_and_encode() {
        let metrics = GatewayMetrics::new().unwrap();
        metrics.active_users.set(3);
        metrics.credited_pesos_total.inc_by(15);
        metrics.policy_failure("authorize");
        metrics.policy_failure("authorize");

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("vendo_active_users 3"));
        assert!(text.contains("vendo_credited_pesos_total 15"));
        assert!(text.contains("vendo_policy_failures_total{op=\"authorize\"} 2"));
    }
}
