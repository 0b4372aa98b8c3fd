//! Client identity reconciliation.
//!
//! A portal request observes up to three identifiers: the persistent
//! client cookie, the MAC, and the IP. DHCP churn, MAC randomization, and
//! device switching make the three drift apart; this module is the single
//! place where they are reconciled onto one user record.
//!
//! The resolver decides and mutates the store, but it never touches the
//! packet plane directly. Enforcement consequences of a decision (the MAC
//! moved, so deauthorize the old one) come back as [`EnforcementOp`]
//! values for the caller to enqueue — the same effects-out shape the rest
//! of the engine uses.

use std::net::Ipv4Addr;

use tracing::{debug, info};

use crate::error::OpError;
use crate::net::MacAddr;
use crate::policy::EnforcementOp;
use crate::store::{SessionStore, StoreError, UserRecord};

/// The identifiers observed on one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    /// Persistent portal cookie, if the client presented one.
    pub client_id: Option<String>,
    /// MAC resolved from the neighbor table, if resolvable.
    pub mac: Option<MacAddr>,
    /// Source IP of the request.
    pub ip: Option<Ipv4Addr>,
}

impl Identity {
    /// Identity carrying only a MAC.
    #[must_use]
    pub fn from_mac(mac: MacAddr) -> Self {
        Self {
            client_id: None,
            mac: Some(mac),
            ip: None,
        }
    }
}

/// A resolution outcome: the user (if any) plus the enforcement ops the
/// decision produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    /// The resolved user. `None` when the identity matches nothing and the
    /// request was not a crediting action.
    pub user: Option<UserRecord>,
    /// Enforcement work the caller must enqueue.
    pub ops: Vec<EnforcementOp>,
}

/// Maps observed `(cookie, mac, ip)` triples to canonical users.
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    store: SessionStore,
}

impl IdentityResolver {
    /// Creates a resolver over the store.
    #[must_use]
    pub const fn new(store: SessionStore) -> Self {
        Self { store }
    }

    /// Resolves an identity, creating a user only when `create_for_credit`
    /// is set (the request is about to credit time).
    ///
    /// Resolution order: cookie first, with the MAC-conflict policy; then
    /// MAC; then creation. A matched user with no cookie gets the current
    /// one bound. A known IP is claimed for the resolved user.
    ///
    /// # Errors
    ///
    /// Returns [`OpError::MissingMac`] when a crediting action arrives
    /// without a resolvable MAC, or [`OpError::Transient`] on store
    /// failure.
    pub fn resolve(
        &self,
        identity: &Identity,
        create_for_credit: bool,
        now: i64,
    ) -> Result<Resolution, OpError> {
        let mut ops = Vec::new();

        let mut user = self.resolve_by_cookie(identity, &mut ops)?;
        if user.is_none() {
            if let Some(mac) = &identity.mac {
                user = self.store.find_by_mac(mac).map_err(store_err)?;
            }
        }

        if user.is_none() && create_for_credit {
            let Some(mac) = &identity.mac else {
                return Err(OpError::MissingMac);
            };
            let created = self
                .store
                .create_user(mac, identity.client_id.as_deref(), identity.ip, now)
                .map_err(store_err)?;
            info!(user_id = %created.user_id, mac = %mac, "user created for credit");
            return Ok(Resolution {
                user: Some(created),
                ops,
            });
        }

        let Some(mut found) = user else {
            return Ok(Resolution { user: None, ops });
        };

        // Bind the cookie to a cookie-less record.
        if found.client_id.is_none() {
            if let Some(cookie) = &identity.client_id {
                self.store
                    .bind_cookie(&found.user_id, cookie)
                    .map_err(store_err)?;
                found.client_id = Some(cookie.clone());
            }
        }

        // Claim the observed IP.
        if let Some(ip) = identity.ip {
            if found.ip != Some(ip) {
                self.store.assign_ip(&found.user_id, ip).map_err(store_err)?;
                found.ip = Some(ip);
            }
        }

        self.store
            .touch_seen(&found.user_id, now)
            .map_err(store_err)?;
        found.last_seen_at = now;

        Ok(Resolution {
            user: Some(found),
            ops,
        })
    }

    /// Cookie-first resolution with the MAC conflict policy.
    fn resolve_by_cookie(
        &self,
        identity: &Identity,
        ops: &mut Vec<EnforcementOp>,
    ) -> Result<Option<UserRecord>, OpError> {
        let Some(cookie) = &identity.client_id else {
            return Ok(None);
        };
        let Some(candidate) = self.store.find_by_cookie(cookie).map_err(store_err)? else {
            return Ok(None);
        };
        let Some(observed) = &identity.mac else {
            return Ok(Some(candidate));
        };
        if candidate.mac == *observed {
            return Ok(Some(candidate));
        }

        // The cookie and the radio disagree. An active user already on the
        // observed MAC outranks the cookie: the device in front of us is
        // theirs.
        if let Some(owner) = self.store.find_by_mac(observed).map_err(store_err)? {
            if owner.user_id != candidate.user_id && owner.is_active() {
                debug!(
                    cookie_user = %candidate.user_id,
                    mac_owner = %owner.user_id,
                    mac = %observed,
                    "cookie binding abandoned: MAC owned by active user"
                );
                return Ok(Some(owner));
            }
        }

        // Otherwise the cookie's user roamed: move it onto the new MAC.
        let old_mac = candidate.mac;
        self.store
            .claim_mac(&candidate.user_id, observed)
            .map_err(store_err)?;
        ops.push(EnforcementOp::Deauthorize(old_mac));
        if candidate.is_active() {
            ops.push(EnforcementOp::Authorize(*observed));
        }
        info!(
            user_id = %candidate.user_id,
            old_mac = %old_mac,
            new_mac = %observed,
            "MAC claimed for roaming user"
        );
        let refreshed = self
            .store
            .get_user(&candidate.user_id)
            .map_err(store_err)?;
        Ok(refreshed)
    }
}

fn store_err(err: StoreError) -> OpError {
    OpError::Transient(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(n: u8) -> MacAddr {
        MacAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, n])
    }

    fn setup() -> (SessionStore, IdentityResolver) {
        let store = SessionStore::open_in_memory().unwrap();
        let resolver = IdentityResolver::new(store.clone());
        (store, resolver)
    }

    fn credit(store: &SessionStore, user_id: &str, seconds: i64) {
        store
            .apply_credit(user_id, seconds, 0, 0, None, None, 0)
            .unwrap();
    }

    #[test]
    fn test_unknown_identity_resolves_to_none() {
        let (_, resolver) = setup();
        let res = resolver
            .resolve(&Identity::from_mac(mac(1)), false, 10)
            .unwrap();
        assert!(res.user.is_none());
        assert!(res.ops.is_empty());
    }

    #[test]
    fn test_crediting_action_creates_user() {
        let (_, resolver) = setup();
        let identity = Identity {
            client_id: Some("C1".into()),
            mac: Some(mac(1)),
            ip: Some(Ipv4Addr::new(10, 0, 0, 5)),
        };
        let res = resolver.resolve(&identity, true, 10).unwrap();
        let user = res.user.unwrap();
        assert_eq!(user.mac, mac(1));
        assert_eq!(user.client_id.as_deref(), Some("C1"));
        assert_eq!(user.ip, Some(Ipv4Addr::new(10, 0, 0, 5)));
    }

    #[test]
    fn test_crediting_without_mac_is_missing_mac() {
        let (_, resolver) = setup();
        let identity = Identity {
            client_id: Some("C1".into()),
            mac: None,
            ip: None,
        };
        assert_eq!(
            resolver.resolve(&identity, true, 10),
            Err(OpError::MissingMac)
        );
    }

    #[test]
    fn test_cookie_bound_on_mac_match() {
        let (store, resolver) = setup();
        let user = store.create_user(&mac(1), None, None, 0).unwrap();
        let identity = Identity {
            client_id: Some("C1".into()),
            mac: Some(mac(1)),
            ip: None,
        };
        let res = resolver.resolve(&identity, false, 10).unwrap();
        assert_eq!(res.user.unwrap().user_id, user.user_id);
        let stored = store.get_user(&user.user_id).unwrap().unwrap();
        assert_eq!(stored.client_id.as_deref(), Some("C1"));
    }

    #[test]
    fn test_roaming_reclaim_moves_mac() {
        // S4: cookie user roams to a free MAC; the cookie wins.
        let (store, resolver) = setup();
        let u1 = store.create_user(&mac(1), Some("C1"), None, 0).unwrap();
        credit(&store, &u1.user_id, 300);

        let identity = Identity {
            client_id: Some("C1".into()),
            mac: Some(mac(2)),
            ip: None,
        };
        let res = resolver.resolve(&identity, false, 10).unwrap();
        let resolved = res.user.unwrap();
        assert_eq!(resolved.user_id, u1.user_id);
        assert_eq!(resolved.mac, mac(2));
        assert_eq!(resolved.credit_seconds, 300);
        assert_eq!(
            res.ops,
            vec![
                EnforcementOp::Deauthorize(mac(1)),
                EnforcementOp::Authorize(mac(2)),
            ]
        );
    }

    #[test]
    fn test_roaming_conflict_mac_wins() {
        // S5: the observed MAC belongs to an active user; serve that user
        // and leave the cookie's record alone.
        let (store, resolver) = setup();
        let u1 = store.create_user(&mac(1), Some("C1"), None, 0).unwrap();
        credit(&store, &u1.user_id, 300);
        let u2 = store.create_user(&mac(2), Some("C2"), None, 0).unwrap();
        credit(&store, &u2.user_id, 120);

        let identity = Identity {
            client_id: Some("C1".into()),
            mac: Some(mac(2)),
            ip: None,
        };
        let res = resolver.resolve(&identity, false, 10).unwrap();
        assert_eq!(res.user.unwrap().user_id, u2.user_id);
        assert!(res.ops.is_empty());

        let untouched = store.get_user(&u1.user_id).unwrap().unwrap();
        assert_eq!(untouched.mac, mac(1));
        assert_eq!(untouched.credit_seconds, 300);
        assert_eq!(untouched.client_id.as_deref(), Some("C1"));
    }

    #[test]
    fn test_claim_deletes_stale_record_on_new_mac() {
        // A zero-credit leftover on the target MAC is evicted.
        let (store, resolver) = setup();
        let u1 = store.create_user(&mac(1), Some("C1"), None, 0).unwrap();
        credit(&store, &u1.user_id, 300);
        let stale = store.create_user(&mac(2), None, None, 0).unwrap();

        let identity = Identity {
            client_id: Some("C1".into()),
            mac: Some(mac(2)),
            ip: None,
        };
        let res = resolver.resolve(&identity, false, 10).unwrap();
        assert_eq!(res.user.unwrap().user_id, u1.user_id);
        assert!(store.get_user(&stale.user_id).unwrap().is_none());
    }

    #[test]
    fn test_ip_claim_is_exclusive() {
        let (store, resolver) = setup();
        let ip = Ipv4Addr::new(10, 0, 0, 40);
        let u1 = store.create_user(&mac(1), None, Some(ip), 0).unwrap();
        let _u2 = store.create_user(&mac(2), None, None, 0).unwrap();

        let identity = Identity {
            client_id: None,
            mac: Some(mac(2)),
            ip: Some(ip),
        };
        let res = resolver.resolve(&identity, false, 10).unwrap();
        assert_eq!(res.user.unwrap().ip, Some(ip));
        assert_eq!(store.get_user(&u1.user_id).unwrap().unwrap().ip, None);
    }
}
