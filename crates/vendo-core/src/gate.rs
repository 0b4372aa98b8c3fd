//! Per-MAC lockout after repeated failed credit attempts.
//!
//! Every failed voucher redeem or coin-insert start bumps a durable
//! counter; reaching the limit stamps a ban the portal surfaces as
//! `banned(remaining)`. Any success wipes the record. Counters live in
//! the store's `failures` table so a reboot does not reset an in-progress
//! lockout.

use std::sync::RwLock;

use tracing::warn;

use crate::config::GateConfig;
use crate::error::OpError;
use crate::net::MacAddr;
use crate::store::SessionStore;

/// The fail-attempt gate.
#[derive(Debug)]
pub struct FailAttemptGate {
    store: SessionStore,
    cfg: RwLock<GateConfig>,
}

impl FailAttemptGate {
    /// Creates the gate over the store.
    #[must_use]
    pub fn new(store: SessionStore, cfg: GateConfig) -> Self {
        Self {
            store,
            cfg: RwLock::new(cfg),
        }
    }

    /// Replaces the gate's limits at runtime.
    pub fn reconfigure(&self, cfg: GateConfig) {
        *self.cfg.write().unwrap_or_else(std::sync::PoisonError::into_inner) = cfg;
    }

    /// Rejects the MAC while a ban is live.
    ///
    /// # Errors
    ///
    /// Returns [`OpError::Banned`] during a live ban, or
    /// [`OpError::Transient`] on store failure.
    pub fn check(&self, mac: &MacAddr, now: i64) -> Result<(), OpError> {
        let state = self
            .store
            .failure_state(mac)
            .map_err(|e| OpError::Transient(e.to_string()))?;
        if let Some((_, Some(banned_until))) = state {
            if banned_until > now {
                return Err(OpError::Banned {
                    remaining_secs: banned_until - now,
                });
            }
        }
        Ok(())
    }

    /// Records one failure. Returns the ban error if this attempt tripped
    /// the limit, so the caller can surface it immediately.
    ///
    /// # Errors
    ///
    /// Returns [`OpError::Transient`] on store failure.
    pub fn record_failure(&self, mac: &MacAddr, now: i64) -> Result<Option<OpError>, OpError> {
        let cfg = *self
            .cfg
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let banned_until = self
            .store
            .failure_record(mac, now, cfg.ban_limit, cfg.ban_duration_secs)
            .map_err(|e| OpError::Transient(e.to_string()))?;
        if let Some(until) = banned_until {
            warn!(%mac, until, "MAC banned after repeated failures");
            return Ok(Some(OpError::Banned {
                remaining_secs: until - now,
            }));
        }
        Ok(None)
    }

    /// Clears the MAC's failure record. Called on every success.
    ///
    /// # Errors
    ///
    /// Returns [`OpError::Transient`] on store failure.
    pub fn record_success(&self, mac: &MacAddr) -> Result<(), OpError> {
        self.store
            .failure_clear(mac)
            .map_err(|e| OpError::Transient(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(n: u8) -> MacAddr {
        MacAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, n])
    }

    fn gate(limit: u32, duration: i64) -> FailAttemptGate {
        FailAttemptGate::new(
            SessionStore::open_in_memory().unwrap(),
            GateConfig {
                ban_limit: limit,
                ban_duration_secs: duration,
            },
        )
    }

    #[test]
    fn test_ban_after_limit() {
        let gate = gate(3, 60);
        let m = mac(1);
        assert!(gate.check(&m, 100).is_ok());
        assert!(gate.record_failure(&m, 100).unwrap().is_none());
        assert!(gate.record_failure(&m, 101).unwrap().is_none());
        let tripped = gate.record_failure(&m, 102).unwrap().unwrap();
        assert_eq!(tripped, OpError::Banned { remaining_secs: 60 });

        // Subsequent attempts are rejected until expiry.
        assert_eq!(
            gate.check(&m, 130),
            Err(OpError::Banned { remaining_secs: 32 })
        );
        assert!(gate.check(&m, 162).is_ok());
    }

    #[test]
    fn test_success_resets_counter_and_ban() {
        let gate = gate(2, 60);
        let m = mac(1);
        gate.record_failure(&m, 100).unwrap();
        gate.record_failure(&m, 101).unwrap();
        assert!(gate.check(&m, 110).is_err());

        gate.record_success(&m).unwrap();
        assert!(gate.check(&m, 110).is_ok());
        // The counter restarts from zero.
        assert!(gate.record_failure(&m, 111).unwrap().is_none());
    }

    #[test]
    fn test_macs_are_independent() {
        let gate = gate(1, 60);
        gate.record_failure(&mac(1), 100).unwrap();
        assert!(gate.check(&mac(1), 110).is_err());
        assert!(gate.check(&mac(2), 110).is_ok());
    }

    #[test]
    fn test_reconfigure_takes_effect() {
        let gate = gate(10, 60);
        let m = mac(1);
        gate.record_failure(&m, 100).unwrap();
        gate.reconfigure(GateConfig {
            ban_limit: 2,
            ban_duration_secs: 30,
        });
        let tripped = gate.record_failure(&m, 101).unwrap().unwrap();
        assert_eq!(tripped, OpError::Banned { remaining_secs: 30 });
    }
}
