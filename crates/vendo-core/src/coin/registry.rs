//! The source registry: the local slot plus remote sub-devices.
//!
//! Remote ESP-class devices self-register on authenticated heartbeat and
//! are never deleted automatically; a source reads as offline once its
//! heartbeat goes stale (70 s by default). The registry also answers the
//! per-source tuning questions the rest of the engine asks: pesos per
//! pulse, bandwidth overrides, visible rate subsets.

use tracing::info;

use super::SourceId;
use crate::config::SourcesConfig;
use crate::error::OpError;
use crate::store::{SessionStore, SourceRow, StoreError};

/// A source with its computed online flag, for status replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceStatus {
    /// The underlying row.
    pub row: SourceRow,
    /// Heartbeat freshness verdict.
    pub online: bool,
}

/// Registry over the store's `sources` table.
#[derive(Debug, Clone)]
pub struct SourceRegistry {
    store: SessionStore,
    sub_vendo_key: String,
    offline_after_secs: i64,
}

impl SourceRegistry {
    /// Creates the registry and guarantees the local slot row exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the local source cannot be ensured.
    pub fn new(store: SessionStore, cfg: &SourcesConfig, now: i64) -> Result<Self, StoreError> {
        // The local slot is always registered and always "online".
        if store.get_source(&SourceId::Hardware)?.is_none() {
            store.upsert_source(&SourceId::Hardware, "Coin slot", now)?;
        }
        Ok(Self {
            store,
            sub_vendo_key: cfg.sub_vendo_key.clone(),
            offline_after_secs: cfg.offline_after_secs,
        })
    }

    /// Verifies the shared secret a remote device presented.
    ///
    /// The comparison runs over every byte regardless of where the first
    /// mismatch sits.
    ///
    /// # Errors
    ///
    /// Returns [`OpError::Invalid`] on mismatch or when no key is
    /// provisioned.
    pub fn authenticate(&self, presented: &str) -> Result<(), OpError> {
        let expected = self.sub_vendo_key.as_bytes();
        if expected.is_empty() {
            return Err(OpError::Invalid("no sub-vendo key provisioned".to_string()));
        }
        let presented = presented.as_bytes();
        let mut diff = presented.len() ^ expected.len();
        for (a, b) in presented.iter().zip(expected.iter()) {
            diff |= usize::from(a ^ b);
        }
        if diff != 0 {
            return Err(OpError::Invalid("bad sub-vendo key".to_string()));
        }
        Ok(())
    }

    /// Authenticated heartbeat: upserts the remote source and refreshes
    /// its freshness stamp.
    ///
    /// # Errors
    ///
    /// Returns [`OpError::Invalid`] on a bad secret, [`OpError::Transient`]
    /// on store failure.
    pub fn heartbeat(
        &self,
        device_id: &str,
        display_name: &str,
        presented_key: &str,
        now: i64,
    ) -> Result<SourceRow, OpError> {
        self.authenticate(presented_key)?;
        if device_id.is_empty() {
            return Err(OpError::Invalid("empty device id".to_string()));
        }
        let source = SourceId::remote(device_id);
        let known = self.store.get_source(&source).map_err(store_err)?.is_some();
        self.store
            .upsert_source(&source, display_name, now)
            .map_err(store_err)?;
        if !known {
            info!(%source, %display_name, "remote source registered");
        }
        self.store
            .get_source(&source)
            .map_err(store_err)?
            .ok_or(OpError::NotFound)
    }

    /// Refreshes a source's activity stamp (called on every pulse).
    ///
    /// # Errors
    ///
    /// Returns [`OpError::Transient`] on store failure.
    pub fn touch(&self, source: &SourceId, now: i64) -> Result<(), OpError> {
        self.store.touch_source(source, now).map_err(store_err)
    }

    /// Pesos contributed per pulse from this source. Unknown sources
    /// count one peso per pulse.
    #[must_use]
    pub fn pulse_value(&self, source: &SourceId) -> u32 {
        self.store
            .get_source(source)
            .ok()
            .flatten()
            .map_or(1, |row| row.pulse_value_pesos.clamp(1, 100))
    }

    /// The source's bandwidth override, if it defines one.
    #[must_use]
    pub fn bandwidth_override(&self, source: &SourceId) -> Option<(Option<u32>, Option<u32>)> {
        let row = self.store.get_source(source).ok().flatten()?;
        if row.rate_down_kbps.is_none() && row.rate_up_kbps.is_none() {
            return None;
        }
        Some((row.rate_down_kbps, row.rate_up_kbps))
    }

    /// All sources with their online verdicts. The local slot is always
    /// reported online.
    ///
    /// # Errors
    ///
    /// Returns [`OpError::Transient`] on store failure.
    pub fn list(&self, now: i64) -> Result<Vec<SourceStatus>, OpError> {
        let rows = self.store.list_sources().map_err(store_err)?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let online =
                    row.source.is_hardware() || row.online(now, self.offline_after_secs);
                SourceStatus { row, online }
            })
            .collect())
    }

    /// Looks up whether a source exists at all.
    ///
    /// # Errors
    ///
    /// Returns [`OpError::Transient`] on store failure.
    pub fn exists(&self, source: &SourceId) -> Result<bool, OpError> {
        Ok(self.store.get_source(source).map_err(store_err)?.is_some())
    }
}

fn store_err(err: StoreError) -> OpError {
    OpError::Transient(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(key: &str) -> SourceRegistry {
        let store = SessionStore::open_in_memory().unwrap();
        let cfg = SourcesConfig {
            sub_vendo_key: key.to_string(),
            offline_after_secs: 70,
        };
        SourceRegistry::new(store, &cfg, 0).unwrap()
    }

    #[test]
    fn test_local_slot_always_registered() {
        let reg = registry("k");
        let list = reg.list(1_000_000).unwrap();
        assert_eq!(list.len(), 1);
        assert!(list[0].row.source.is_hardware());
        // Even with a stale stamp the local slot reads online.
        assert!(list[0].online);
    }

    #[test]
    fn test_heartbeat_requires_secret() {
        let reg = registry("topsecret");
        assert!(matches!(
            reg.heartbeat("booth-a", "Booth A", "wrong", 10),
            Err(OpError::Invalid(_))
        ));
        let row = reg.heartbeat("booth-a", "Booth A", "topsecret", 10).unwrap();
        assert_eq!(row.source, SourceId::remote("booth-a"));
        assert_eq!(row.last_active_at, 10);
    }

    #[test]
    fn test_empty_key_rejects_everything() {
        let reg = registry("");
        assert!(reg.heartbeat("booth-a", "Booth A", "", 10).is_err());
    }

    #[test]
    fn test_online_tracks_heartbeat_staleness() {
        let reg = registry("k");
        reg.heartbeat("booth-a", "Booth A", "k", 100).unwrap();

        let find = |list: &[SourceStatus]| {
            list.iter()
                .find(|s| s.row.source == SourceId::remote("booth-a"))
                .unwrap()
                .online
        };
        assert!(find(&reg.list(150).unwrap()));
        assert!(!find(&reg.list(171).unwrap()));

        // A pulse touch brings it back without a full heartbeat.
        reg.touch(&SourceId::remote("booth-a"), 180).unwrap();
        assert!(find(&reg.list(200).unwrap()));
    }

    #[test]
    fn test_pulse_value_defaults_to_one() {
        let reg = registry("k");
        assert_eq!(reg.pulse_value(&SourceId::remote("ghost")), 1);
        assert_eq!(reg.pulse_value(&SourceId::Hardware), 1);
    }

    #[test]
    fn test_bandwidth_override_shape() {
        let reg = registry("k");
        reg.heartbeat("booth-a", "Booth A", "k", 10).unwrap();
        let src = SourceId::remote("booth-a");
        assert_eq!(reg.bandwidth_override(&src), None);
    }
}
