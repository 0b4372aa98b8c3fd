//! The enforcement outbox.
//!
//! Store mutations never block on the packet plane. Components commit
//! their record change, push [`EnforcementOp`] values into this channel,
//! and move on; the worker drains the channel and drives the adapter.
//! Failures are logged and counted, not retried here: every op the
//! outbox drops is re-derived by the ticker's reconciliation pass from
//! store state, so loss costs at most one reconcile interval.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};
use vendo_core::policy::{EnforcementOp, PacketPolicy, PolicyError};

use crate::metrics::SharedMetrics;

/// Sending half handed to every component that produces enforcement work.
pub type EnforcementTx = mpsc::UnboundedSender<EnforcementOp>;

/// Receiving half consumed by [`run_outbox`].
pub type EnforcementRx = mpsc::UnboundedReceiver<EnforcementOp>;

/// Creates the outbox channel.
#[must_use]
pub fn channel() -> (EnforcementTx, EnforcementRx) {
    mpsc::unbounded_channel()
}

/// Applies one op against the adapter.
///
/// # Errors
///
/// Propagates the adapter's [`PolicyError`].
pub async fn apply_op(policy: &dyn PacketPolicy, op: &EnforcementOp) -> Result<(), PolicyError> {
    match op {
        EnforcementOp::Authorize(mac) => policy.authorize(mac).await.map(|_| ()),
        EnforcementOp::Deauthorize(mac) => policy.deauthorize(mac).await,
        EnforcementOp::SetLimit {
            ip,
            down_kbps,
            up_kbps,
        } => policy.set_limit(*ip, *down_kbps, *up_kbps).await,
        EnforcementOp::RemoveLimit(ip) => policy.remove_limit(*ip).await,
    }
}

/// Label used for failure metrics.
fn op_label(op: &EnforcementOp) -> &'static str {
    match op {
        EnforcementOp::Authorize(_) => "authorize",
        EnforcementOp::Deauthorize(_) => "deauthorize",
        EnforcementOp::SetLimit { .. } => "set_limit",
        EnforcementOp::RemoveLimit(_) => "remove_limit",
    }
}

/// Drains the outbox until every sender is gone.
pub async fn run_outbox(
    mut rx: EnforcementRx,
    policy: Arc<dyn PacketPolicy>,
    metrics: SharedMetrics,
) {
    while let Some(op) = rx.recv().await {
        match apply_op(policy.as_ref(), &op).await {
            Ok(()) => debug!(%op, "enforcement op applied"),
            Err(err) => {
                // The ticker reconcile pass will converge the plane; this
                // op is not retried.
                warn!(%op, %err, "enforcement op failed; deferring to reconciliation");
                metrics.policy_failure(op_label(&op));
            },
        }
    }
    debug!("enforcement outbox drained and closed");
}

/// Applies a batch synchronously, logging failures. Used by the startup
/// recovery sweep before portal traffic is accepted.
pub async fn apply_batch(
    policy: &dyn PacketPolicy,
    metrics: &SharedMetrics,
    ops: Vec<EnforcementOp>,
) {
    for op in ops {
        if let Err(err) = apply_op(policy, &op).await {
            warn!(%op, %err, "startup enforcement op failed");
            metrics.policy_failure(op_label(&op));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use vendo_core::MacAddr;

    use super::*;
    use crate::metrics::GatewayMetrics;
    use crate::policy::InMemoryPolicy;

    fn mac(n: u8) -> MacAddr {
        MacAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, n])
    }

    #[tokio::test]
    async fn test_outbox_applies_in_order() {
        let policy = Arc::new(InMemoryPolicy::new());
        let metrics = GatewayMetrics::new_shared().unwrap();
        let (tx, rx) = channel();

        let ip = Ipv4Addr::new(10, 0, 0, 7);
        tx.send(EnforcementOp::Authorize(mac(1))).unwrap();
        tx.send(EnforcementOp::SetLimit {
            ip,
            down_kbps: 2048,
            up_kbps: 1024,
        })
        .unwrap();
        tx.send(EnforcementOp::Deauthorize(mac(1))).unwrap();
        drop(tx);

        run_outbox(rx, policy.clone(), metrics).await;

        assert_eq!(
            policy.calls(),
            vec![
                "authorize aa:bb:cc:dd:ee:01",
                "set_limit 10.0.0.7 2048 1024",
                "deauthorize aa:bb:cc:dd:ee:01",
            ]
        );
        assert!(policy.authorized().is_empty());
        assert_eq!(policy.limit(ip), Some((2048, 1024)));
    }

    #[tokio::test]
    async fn test_failures_counted_not_fatal() {
        let policy = Arc::new(InMemoryPolicy::new());
        policy.fail_mutations(Some("plane down"));
        let metrics = GatewayMetrics::new_shared().unwrap();
        let (tx, rx) = channel();
        tx.send(EnforcementOp::Authorize(mac(1))).unwrap();
        tx.send(EnforcementOp::Authorize(mac(2))).unwrap();
        drop(tx);

        run_outbox(rx, policy.clone(), metrics.clone()).await;

        assert!(policy.authorized().is_empty());
        let text = metrics.encode_text().unwrap();
        assert!(text.contains("vendo_policy_failures_total{op=\"authorize\"} 2"));
    }
}
