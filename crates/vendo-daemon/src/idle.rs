//! The idle monitor.
//!
//! Every few seconds it inspects connected, unpaused users and pauses
//! the ones that are demonstrably gone. Pausing requires all three
//! signals to agree — byte counters stalled past the timeout, neighbor
//! table stale or unreachable, no established flows — so a quiet but
//! present client is never kicked. Errors are logged and deferred, never
//! propagated: a flaky probe just postpones the verdict one interval.
//!
//! The ticker expires; this monitor pauses. The two never race on the
//! same transition because pausing removes the user from the ticker's
//! active set only via the serialized store write.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::state::{now_unix, SharedGateway};

/// The idle monitor loop.
pub struct IdleMonitor {
    gw: SharedGateway,
}

impl IdleMonitor {
    /// Creates the monitor.
    #[must_use]
    pub const fn new(gw: SharedGateway) -> Self {
        Self { gw }
    }

    /// Runs until the shutdown flag flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_secs(
            self.gw.cfg.idle.check_interval_secs.max(1),
        ));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {},
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("idle monitor stopping");
                        return;
                    }
                },
            }
            self.check_once().await;
        }
    }

    /// One inspection pass.
    pub async fn check_once(&self) {
        let now = now_unix();
        let idle_after = self.gw.cfg.idle.idle_timeout_secs;
        let users = match self.gw.store.iterate_connected() {
            Ok(users) => users,
            Err(err) => {
                debug!(%err, "idle check skipped: store unavailable");
                return;
            },
        };

        for user in users {
            let Some(ip) = user.ip else {
                // Without an IP there are no counters to judge by.
                continue;
            };
            if now - user.last_traffic_at < idle_after {
                continue;
            }
            // Counters stalled. The neighbor table must also have given
            // up on the client...
            match self.gw.policy.neighbor_state(ip).await {
                Ok(state) if state.is_live() => continue,
                Ok(_) => {},
                Err(err) => {
                    debug!(%ip, %err, "neighbor probe failed; deferring");
                    continue;
                },
            }
            // ...and no established flow may still reference it.
            match self.gw.policy.has_live_flows(ip).await {
                Ok(false) => {},
                Ok(true) => continue,
                Err(err) => {
                    debug!(%ip, %err, "flow probe failed; deferring");
                    continue;
                },
            }

            if let Err(err) = self.gw.store.pause(&user.user_id) {
                debug!(user_id = %user.user_id, %err, "idle pause write failed; deferring");
                continue;
            }
            info!(
                user_id = %user.user_id,
                mac = %user.mac,
                %ip,
                stalled_secs = now - user.last_traffic_at,
                "user idle; session paused"
            );
            self.gw.metrics.idle_pauses_total.inc();
            if let Err(err) = self.gw.policy.deauthorize(&user.mac).await {
                debug!(mac = %user.mac, %err, "idle deauthorize failed; reconciliation will retry");
                self.gw.metrics.policy_failure("deauthorize");
            }
            if let Err(err) = self.gw.policy.remove_limit(ip).await {
                debug!(%ip, %err, "idle remove_limit failed; reconciliation will retry");
                self.gw.metrics.policy_failure("remove_limit");
            }
        }
    }
}
