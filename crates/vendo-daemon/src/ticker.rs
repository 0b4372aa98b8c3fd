//! The 1 Hz reconciliation loop.
//!
//! Each pass the ticker:
//!
//! 1. Fires coin deadlines and retries any parked commit.
//! 2. Decrements every active user by the elapsed whole seconds and
//!    expires the ones that hit zero, deauthorizing them in the plane.
//! 3. Every `traffic_sample_secs`, reads the byte counters and applies
//!    reset-safe delta math to refresh `last_traffic_at`.
//! 4. Every `mac_reconcile_secs`, diffs the plane's authorized-MAC set
//!    against the store and converges it both ways.
//!
//! The delta is computed from a monotonic instant, so a stalled process
//! or clock jump decrements exactly the seconds that actually elapsed,
//! once.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info, warn};
use vendo_core::net::class_id_for_ip;
use vendo_core::MacAddr;

use crate::state::{now_unix, SharedGateway};

/// The ticker and its counter caches.
pub struct Ticker {
    gw: SharedGateway,
    up_cache: HashMap<Ipv4Addr, u64>,
    down_cache: HashMap<u16, u64>,
}

impl Ticker {
    /// Creates the ticker.
    #[must_use]
    pub fn new(gw: SharedGateway) -> Self {
        Self {
            gw,
            up_cache: HashMap::new(),
            down_cache: HashMap::new(),
        }
    }

    /// Runs until the shutdown flag flips.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let sample_every = Duration::from_secs(self.gw.cfg.ticker.traffic_sample_secs.max(1));
        let reconcile_every = Duration::from_secs(self.gw.cfg.ticker.mac_reconcile_secs.max(1));
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut last_tick = Instant::now();
        let mut last_sample = Instant::now();
        let mut last_reconcile = Instant::now();

        loop {
            tokio::select! {
                _ = interval.tick() => {},
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("ticker stopping");
                        return;
                    }
                },
            }

            let now_mono = Instant::now();
            let delta = i64::try_from(now_mono.duration_since(last_tick).as_secs()).unwrap_or(0);
            if delta >= 1 {
                // Advance by exactly the processed delta so fractional
                // seconds carry into the next pass instead of being lost.
                last_tick += Duration::from_secs(delta.unsigned_abs());
                self.tick(delta).await;
            }
            if now_mono.duration_since(last_sample) >= sample_every {
                last_sample = now_mono;
                self.sample_traffic().await;
            }
            if now_mono.duration_since(last_reconcile) >= reconcile_every {
                last_reconcile = now_mono;
                self.reconcile_macs().await;
            }
        }
    }

    /// One decrement pass over the active set, plus coin-session upkeep.
    pub async fn tick(&mut self, delta: i64) {
        let now = now_unix();
        self.gw.poll_coin_deadline(Instant::now(), now);
        self.gw.retry_pending_commit(now);

        let users = match self.gw.store.iterate_active() {
            Ok(users) => users,
            Err(err) => {
                warn!(%err, "ticker could not enumerate active users");
                return;
            },
        };

        let mut still_active: i64 = 0;
        for user in users {
            if user.credit_seconds <= delta {
                if let Err(err) = self.gw.store.expire(&user.user_id, now) {
                    warn!(user_id = %user.user_id, %err, "expire failed");
                    continue;
                }
                info!(user_id = %user.user_id, mac = %user.mac, "session expired");
                self.gw.metrics.sessions_expired_total.inc();
                if let Err(err) = self.gw.policy.deauthorize(&user.mac).await {
                    warn!(mac = %user.mac, %err, "deauthorize failed; reconciliation will retry");
                    self.gw.metrics.policy_failure("deauthorize");
                }
                if let Some(ip) = user.ip {
                    if let Err(err) = self.gw.policy.remove_limit(ip).await {
                        warn!(%ip, %err, "remove_limit failed; reconciliation will retry");
                        self.gw.metrics.policy_failure("remove_limit");
                    }
                }
            } else {
                match self.gw.store.decrement(&user.user_id, delta) {
                    Ok(_) => still_active += 1,
                    Err(err) => warn!(user_id = %user.user_id, %err, "decrement failed"),
                }
            }
        }
        self.gw.metrics.active_users.set(still_active);
        self.gw
            .metrics
            .ticker_delta_seconds
            .inc_by(delta.unsigned_abs());
    }

    /// Samples byte counters and refreshes `last_traffic_at` for users
    /// whose counters moved. A counter that shrank is treated as reset:
    /// the whole current value counts as the delta.
    pub async fn sample_traffic(&mut self) {
        let sample = match self.gw.policy.sample_counters().await {
            Ok(sample) => sample,
            Err(err) => {
                debug!(%err, "counter sample failed; skipping this round");
                self.gw.metrics.policy_failure("sample_counters");
                return;
            },
        };
        let users = match self.gw.store.iterate_active() {
            Ok(users) => users,
            Err(err) => {
                warn!(%err, "traffic attribution skipped: store unavailable");
                return;
            },
        };

        let mut by_ip: HashMap<Ipv4Addr, &str> = HashMap::new();
        let mut by_class: HashMap<u16, &str> = HashMap::new();
        for user in &users {
            if let Some(ip) = user.ip {
                by_ip.insert(ip, user.user_id.as_str());
                if let Some(class_id) = class_id_for_ip(ip) {
                    by_class.insert(class_id, user.user_id.as_str());
                }
            }
        }

        let mut touched: HashSet<&str> = HashSet::new();
        for (ip, counter) in &sample.uploads {
            let delta = delta_with_reset(self.up_cache.insert(*ip, counter.bytes), counter.bytes);
            if delta > 0 {
                if let Some(user_id) = by_ip.get(ip).copied() {
                    touched.insert(user_id);
                }
            }
        }
        for (class_id, counter) in &sample.downloads {
            let delta = delta_with_reset(
                self.down_cache.insert(*class_id, counter.bytes),
                counter.bytes,
            );
            if delta > 0 {
                if let Some(user_id) = by_class.get(class_id).copied() {
                    touched.insert(user_id);
                }
            }
        }

        let now = now_unix();
        for user_id in touched {
            if let Err(err) = self.gw.store.touch_traffic(user_id, now) {
                warn!(user_id, %err, "traffic touch failed");
            }
        }
    }

    /// Converges the plane's authorized-MAC set onto the store: active
    /// users missing from the plane are re-authorized, strays are
    /// deauthorized.
    pub async fn reconcile_macs(&self) {
        let authorized = match self.gw.policy.list_authorized_macs().await {
            Ok(set) => set,
            Err(err) => {
                debug!(%err, "mac reconcile skipped: listing failed");
                self.gw.metrics.policy_failure("list_authorized_macs");
                return;
            },
        };
        let users = match self.gw.store.iterate_active() {
            Ok(users) => users,
            Err(err) => {
                warn!(%err, "mac reconcile skipped: store unavailable");
                return;
            },
        };

        let active_macs: HashSet<MacAddr> = users.iter().map(|u| u.mac).collect();
        for user in &users {
            if authorized.contains(&user.mac) {
                continue;
            }
            info!(mac = %user.mac, user_id = %user.user_id, "reconcile: re-authorizing");
            if let Err(err) = self.gw.policy.authorize(&user.mac).await {
                warn!(mac = %user.mac, %err, "reconcile authorize failed");
                self.gw.metrics.policy_failure("authorize");
                continue;
            }
            if let Some(ip) = user.ip {
                if user.rate_down_kbps > 0 || user.rate_up_kbps > 0 {
                    if let Err(err) = self
                        .gw
                        .policy
                        .set_limit(ip, user.rate_down_kbps, user.rate_up_kbps)
                        .await
                    {
                        warn!(%ip, %err, "reconcile set_limit failed");
                        self.gw.metrics.policy_failure("set_limit");
                    }
                }
            }
        }
        for mac in authorized.difference(&active_macs) {
            info!(%mac, "reconcile: deauthorizing stray mac");
            if let Err(err) = self.gw.policy.deauthorize(mac).await {
                warn!(%mac, %err, "reconcile deauthorize failed");
                self.gw.metrics.policy_failure("deauthorize");
            }
        }
    }
}

/// Reset-safe counter delta: a shrinking counter was reset, so the whole
/// current reading is new traffic.
fn delta_with_reset(cached: Option<u64>, current: u64) -> u64 {
    match cached {
        Some(cached) if current >= cached => current - cached,
        _ => current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_with_reset() {
        assert_eq!(delta_with_reset(Some(100), 150), 50);
        assert_eq!(delta_with_reset(Some(100), 100), 0);
        // Counter reset: current=5, cached=100 -> delta is 5, not -95.
        assert_eq!(delta_with_reset(Some(100), 5), 5);
        assert_eq!(delta_with_reset(None, 42), 42);
    }
}
