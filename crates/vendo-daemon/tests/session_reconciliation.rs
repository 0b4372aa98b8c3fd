//! Session lifecycle end-to-end: roaming, expiry, reconciliation, idle
//! pause, voucher redeem, restore, and free time.

mod common;

use common::{harness, harness_with, identity, identity_with_ip, ip, mac};
use vendo_core::policy::NeighborState;
use vendo_core::{GatewayConfig, Identity, InsertMode, OpError, PacketPolicy};
use vendo_daemon::idle::IdleMonitor;
use vendo_daemon::state::now_unix;
use vendo_daemon::ticker::Ticker;

fn credit(h: &common::Harness, n: u8, seconds: i64) -> String {
    let user = h
        .store
        .create_user(&mac(n), Some(&format!("C{n}")), None, now_unix())
        .unwrap();
    h.store
        .apply_credit(&user.user_id, seconds, 1024, 2048, None, None, now_unix())
        .unwrap();
    user.user_id
}

/// S4: the cookie's user roams to a free MAC; the binding follows the
/// device and the old MAC is deauthorized.
#[tokio::test]
async fn roaming_reclaim() {
    let mut h = harness();
    let u1 = credit(&h, 1, 300);
    // The plane currently knows the old MAC.
    h.policy.authorize(&mac(1)).await.unwrap();
    h.policy.clear_calls();

    let roamed = Identity {
        client_id: Some("C1".into()),
        mac: Some(mac(2)),
        ip: None,
    };
    let status = h.portal.status(&roamed).unwrap();
    assert_eq!(status.user_id.as_deref(), Some(u1.as_str()));
    assert_eq!(status.credit_seconds, 300);

    h.drain_outbox().await;
    let calls = h.policy.calls();
    assert!(calls.contains(&"deauthorize aa:bb:cc:dd:ee:01".to_string()));
    assert!(calls.contains(&"authorize aa:bb:cc:dd:ee:02".to_string()));

    let user = h.store.get_user(&u1).unwrap().unwrap();
    assert_eq!(user.mac, mac(2));
    assert_eq!(user.credit_seconds, 300);
}

/// S5: the observed MAC belongs to another active user; the MAC wins
/// over the cookie and nothing churns.
#[tokio::test]
async fn roaming_conflict_mac_wins() {
    let mut h = harness();
    let u1 = credit(&h, 1, 300);
    let u2 = credit(&h, 2, 120);

    let request = Identity {
        client_id: Some("C1".into()),
        mac: Some(mac(2)),
        ip: None,
    };
    let status = h.portal.status(&request).unwrap();
    assert_eq!(status.user_id.as_deref(), Some(u2.as_str()));
    assert_eq!(status.credit_seconds, 120);

    h.drain_outbox().await;
    assert!(h.policy.calls().is_empty());

    let untouched = h.store.get_user(&u1).unwrap().unwrap();
    assert_eq!(untouched.mac, mac(1));
    assert_eq!(untouched.credit_seconds, 300);
}

/// S6: a user with three seconds left, ticked five seconds later, is
/// expired and scrubbed from the plane within one reconcile pass.
#[tokio::test]
async fn expiry_reconciliation() {
    let mut h = harness();
    let who = identity_with_ip(1);
    // Credit through the real path so the IP binding exists.
    h.portal
        .start_coin_insert(&who, InsertMode::Auto, None)
        .unwrap();
    h.portal.coin_pulse(1);
    h.portal.finalize_coin_insert(&who).unwrap();
    h.drain_outbox().await;
    assert!(h.policy.authorized().contains(&mac(1)));

    let user = h.store.find_by_mac(&mac(1)).unwrap().unwrap();
    // Shrink the balance to three seconds.
    h.store
        .decrement(&user.user_id, user.credit_seconds - 3)
        .unwrap();

    // One tick processing a five-second delta.
    let mut ticker = Ticker::new(h.gw.clone());
    ticker.tick(5).await;

    let after = h.store.get_user(&user.user_id).unwrap().unwrap();
    assert_eq!(after.credit_seconds, 0);
    assert!(!after.connected);

    let calls = h.policy.calls();
    assert!(calls.contains(&"deauthorize aa:bb:cc:dd:ee:01".to_string()));
    assert!(calls.contains(&"remove_limit 10.0.0.1".to_string()));

    // And the authorized set no longer carries the MAC.
    ticker.reconcile_macs().await;
    assert!(!h.policy.authorized().contains(&mac(1)));
}

/// A long stall decrements by exactly the elapsed seconds, once.
#[tokio::test]
async fn catchup_tick_decrements_exactly_once() {
    let h = harness();
    let u1 = credit(&h, 1, 100);
    let mut ticker = Ticker::new(h.gw.clone());
    ticker.tick(10).await;
    assert_eq!(
        h.store.get_user(&u1).unwrap().unwrap().credit_seconds,
        90
    );
}

/// Reconcile re-authorizes active users the plane lost and deauthorizes
/// strays it never should have had.
#[tokio::test]
async fn mac_set_reconciliation_converges_both_ways() {
    let h = harness();
    let _u1 = credit(&h, 1, 300);
    // A stray MAC in the plane with no active user behind it.
    h.policy.authorize(&mac(9)).await.unwrap();

    let ticker = Ticker::new(h.gw.clone());
    ticker.reconcile_macs().await;

    let authorized = h.policy.authorized();
    assert!(authorized.contains(&mac(1)));
    assert!(!authorized.contains(&mac(9)));
}

/// Idle pause requires all three signals: stalled counters, dead
/// neighbor entry, no live flows.
#[tokio::test]
async fn idle_pause_requires_all_signals() {
    let h = harness();
    let stale = now_unix() - 600;
    let user = h.store.create_user(&mac(1), None, Some(ip(1)), stale).unwrap();
    h.store
        .apply_credit(&user.user_id, 300, 0, 0, None, None, stale)
        .unwrap();

    let monitor = IdleMonitor::new(h.gw.clone());

    // Neighbor reachable: no pause even with stalled counters.
    h.policy.set_neighbor(ip(1), NeighborState::Reachable);
    monitor.check_once().await;
    assert!(!h.store.get_user(&user.user_id).unwrap().unwrap().paused);

    // Neighbor stale but flows still alive: no pause.
    h.policy.set_neighbor(ip(1), NeighborState::Stale);
    h.policy.set_live_flows(ip(1), true);
    monitor.check_once().await;
    assert!(!h.store.get_user(&user.user_id).unwrap().unwrap().paused);

    // All three idle signals agree: paused and scrubbed.
    h.policy.set_live_flows(ip(1), false);
    monitor.check_once().await;
    let after = h.store.get_user(&user.user_id).unwrap().unwrap();
    assert!(after.paused);
    assert!(!after.connected);
    assert!(!h.policy.authorized().contains(&mac(1)));
}

/// Fresh traffic shields a user from the idle monitor.
#[tokio::test]
async fn idle_pause_spares_recent_traffic() {
    let h = harness();
    let now = now_unix();
    let user = h.store.create_user(&mac(1), None, Some(ip(1)), now).unwrap();
    h.store
        .apply_credit(&user.user_id, 300, 0, 0, None, None, now)
        .unwrap();
    h.policy.set_neighbor(ip(1), NeighborState::Unreachable);

    IdleMonitor::new(h.gw.clone()).check_once().await;
    assert!(!h.store.get_user(&user.user_id).unwrap().unwrap().paused);
}

/// Pause then resume returns the user to the same state, minus nothing.
#[tokio::test]
async fn pause_resume_round_trip() {
    let mut h = harness();
    let u1 = credit(&h, 1, 300);
    let who = identity(1);

    h.portal.pause_session(&who).unwrap();
    let paused = h.store.get_user(&u1).unwrap().unwrap();
    assert!(paused.paused);
    assert!(!paused.connected);
    assert_eq!(paused.credit_seconds, 300);
    h.drain_outbox().await;
    assert!(!h.policy.authorized().contains(&mac(1)));

    h.portal.resume_session(&who).unwrap();
    let resumed = h.store.get_user(&u1).unwrap().unwrap();
    assert!(!resumed.paused);
    assert!(resumed.connected);
    assert_eq!(resumed.credit_seconds, 300);
    assert_eq!(resumed.rate_up_kbps, 1024);
    assert_eq!(resumed.rate_down_kbps, 2048);
    h.drain_outbox().await;
    assert!(h.policy.authorized().contains(&mac(1)));
}

/// Resuming an exhausted session is expired, not ok.
#[tokio::test]
async fn resume_without_credit_is_expired() {
    let mut h = harness();
    let u1 = credit(&h, 1, 10);
    h.store.expire(&u1, now_unix()).unwrap();
    assert_eq!(h.portal.resume_session(&identity(1)), Err(OpError::Expired));
    h.discard_outbox();
}

/// Voucher redeem onto a fresh device claims the donor record.
#[tokio::test]
async fn voucher_claim_onto_new_device() {
    let mut h = harness();
    let donor_id = credit(&h, 1, 500);
    let donor = h.store.get_user(&donor_id).unwrap().unwrap();

    let claimer = Identity {
        client_id: Some("C9".into()),
        mac: Some(mac(9)),
        ip: Some(ip(9)),
    };
    let reply = h.portal.redeem_voucher(&claimer, &donor.user_code).unwrap();
    assert_eq!(reply.seconds_added, 500);

    let claimed = h.store.get_user(&donor_id).unwrap().unwrap();
    assert_eq!(claimed.mac, mac(9));
    assert_eq!(claimed.ip, Some(ip(9)));
    assert_eq!(claimed.credit_seconds, 500);
    h.drain_outbox().await;
    assert!(h.policy.authorized().contains(&mac(9)));
}

/// Voucher redeem by an existing user merges the donor's credit.
#[tokio::test]
async fn voucher_merge_into_existing_user() {
    let mut h = harness();
    let caller_id = credit(&h, 1, 100);
    let donor_id = credit(&h, 2, 250);
    let donor = h.store.get_user(&donor_id).unwrap().unwrap();

    let reply = h
        .portal
        .redeem_voucher(&identity(1), &donor.user_code)
        .unwrap();
    assert_eq!(reply.seconds_added, 250);

    let merged = h.store.get_user(&caller_id).unwrap().unwrap();
    assert_eq!(merged.credit_seconds, 350);
    // The donor record is retired; its code cannot be redeemed twice.
    assert!(h.store.get_user(&donor_id).unwrap().is_none());
    assert_eq!(
        h.portal.redeem_voucher(&identity(1), &donor.user_code),
        Err(OpError::Invalid("unknown code".to_string()))
    );
    h.discard_outbox();
}

/// Unknown codes count toward the gate and eventually ban the MAC.
#[tokio::test]
async fn voucher_guessing_gets_banned() {
    let mut cfg = GatewayConfig::default();
    cfg.gate.ban_limit = 3;
    let mut h = harness_with(cfg);
    let who = identity(5);

    for _ in 0..2 {
        assert_eq!(
            h.portal.redeem_voucher(&who, "CJ-ZZZZZZ"),
            Err(OpError::Invalid("unknown code".to_string()))
        );
    }
    assert!(matches!(
        h.portal.redeem_voucher(&who, "CJ-ZZZZZZ"),
        Err(OpError::Banned { .. })
    ));
    // A coin start from the same MAC is rejected too.
    assert!(matches!(
        h.portal.start_coin_insert(&who, InsertMode::Auto, None),
        Err(OpError::Banned { .. })
    ));
    h.discard_outbox();
}

/// Restore moves the session onto the observed device unless the MAC is
/// actively owned.
#[tokio::test]
async fn restore_session_claims_and_conflicts() {
    let mut h = harness();
    let u1 = credit(&h, 1, 300);
    let user = h.store.get_user(&u1).unwrap().unwrap();

    // Restore onto a fresh device by code.
    let fresh = Identity {
        client_id: Some("C9".into()),
        mac: Some(mac(9)),
        ip: None,
    };
    let reply = h
        .portal
        .restore_session(&fresh, Some(&user.user_code))
        .unwrap();
    assert_eq!(reply.user_id, u1);
    assert_eq!(reply.credit_seconds, 300);
    assert_eq!(h.store.get_user(&u1).unwrap().unwrap().mac, mac(9));

    // Restoring onto a MAC owned by another active user conflicts.
    let _u2 = credit(&h, 2, 100);
    let onto_owned = Identity {
        client_id: None,
        mac: Some(mac(2)),
        ip: None,
    };
    assert!(matches!(
        h.portal.restore_session(&onto_owned, Some(&user.user_code)),
        Err(OpError::Conflict(_))
    ));

    // An exhausted record restores as expired.
    h.store.expire(&u1, now_unix()).unwrap();
    assert_eq!(
        h.portal.restore_session(&fresh, Some(&user.user_code)),
        Err(OpError::Expired)
    );
    h.discard_outbox();
}

/// Free time grants the configured minutes and enforces the cooldown.
#[tokio::test]
async fn free_time_grant_and_cooldown() {
    let mut cfg = GatewayConfig::default();
    cfg.free_time.enabled = true;
    cfg.free_time.minutes = 10;
    cfg.free_time.cooldown_secs = 3600;
    let mut h = harness_with(cfg);
    let who = identity_with_ip(1);

    let status = h.portal.status(&who).unwrap();
    let free = status.free_time.unwrap();
    assert!(free.available);

    let reply = h.portal.claim_free_time(&who).unwrap();
    assert_eq!(reply.seconds_added, 600);
    let user = h.store.find_by_mac(&mac(1)).unwrap().unwrap();
    assert_eq!(user.credit_seconds, 600);

    // Second claim sits out the cooldown, and status says so.
    assert_eq!(h.portal.claim_free_time(&who), Err(OpError::Busy));
    let status = h.portal.status(&who).unwrap();
    let free = status.free_time.unwrap();
    assert!(!free.available);
    assert!(free.cooldown_remaining_secs > 0);
    h.drain_outbox().await;
}

/// Status without a resolvable MAC still answers, with a null user.
#[tokio::test]
async fn status_without_mac_returns_null_user() {
    let mut h = harness();
    let anonymous = Identity {
        client_id: None,
        mac: None,
        ip: None,
    };
    let status = h.portal.status(&anonymous).unwrap();
    assert!(status.user_id.is_none());
    assert_eq!(status.credit_seconds, 0);
    assert!(!status.sources.is_empty());
    h.discard_outbox();
}

/// The startup sweep re-authorizes every active user before traffic.
#[tokio::test]
async fn startup_recovery_reauthorizes_active_users() {
    let h = harness();
    let _u1 = credit(&h, 1, 300);
    let _u2 = credit(&h, 2, 200);
    // A paused user stays off the plane.
    let u3 = credit(&h, 3, 100);
    h.store.pause(&u3).unwrap();

    h.gw.startup_recovery().await.unwrap();

    let authorized = h.policy.authorized();
    assert!(authorized.contains(&mac(1)));
    assert!(authorized.contains(&mac(2)));
    assert!(!authorized.contains(&mac(3)));
}
