//! Shared fixture: a composed gateway over an in-memory store and the
//! in-memory packet policy, with the standard three-line rate table.

// Each test binary uses a different slice of the fixture.
#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::sync::Arc;

use vendo_core::policy::PacketPolicy;
use vendo_core::{GatewayConfig, Identity, MacAddr, SessionStore};
use vendo_daemon::enforce::{self, EnforcementRx};
use vendo_daemon::metrics::GatewayMetrics;
use vendo_daemon::policy::InMemoryPolicy;
use vendo_daemon::portal::PortalService;
use vendo_daemon::state::SharedGateway;

pub struct Harness {
    pub gw: SharedGateway,
    pub portal: PortalService,
    pub policy: Arc<InMemoryPolicy>,
    pub store: SessionStore,
    rx: EnforcementRx,
}

impl Harness {
    /// Applies everything currently queued in the enforcement outbox.
    pub async fn drain_outbox(&mut self) {
        while let Ok(op) = self.rx.try_recv() {
            enforce::apply_op(self.policy.as_ref(), &op)
                .await
                .expect("enforcement op failed");
        }
    }

    /// Discards queued enforcement ops without applying them.
    pub fn discard_outbox(&mut self) {
        while self.rx.try_recv().is_ok() {}
    }
}

pub fn harness() -> Harness {
    harness_with(GatewayConfig::default())
}

pub fn harness_with(cfg: GatewayConfig) -> Harness {
    let store = SessionStore::open_in_memory().expect("store");
    store.insert_rate(1, 1, 128, 256).expect("rate");
    store.insert_rate(5, 7, 1024, 2048).expect("rate");
    store.insert_rate(10, 15, 2048, 4096).expect("rate");

    let policy = Arc::new(InMemoryPolicy::new());
    let metrics = GatewayMetrics::new_shared().expect("metrics");
    let (tx, rx) = enforce::channel();
    let gw = vendo_daemon::state::Gateway::new(
        cfg,
        store.clone(),
        policy.clone() as Arc<dyn PacketPolicy>,
        tx,
        metrics,
    )
    .expect("gateway");
    let portal = PortalService::new(gw.clone());
    Harness {
        gw,
        portal,
        policy,
        store,
        rx,
    }
}

pub fn mac(n: u8) -> MacAddr {
    MacAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, n])
}

pub fn ip(n: u8) -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, n)
}

pub fn identity(n: u8) -> Identity {
    Identity {
        client_id: Some(format!("C{n}")),
        mac: Some(mac(n)),
        ip: None,
    }
}

pub fn identity_with_ip(n: u8) -> Identity {
    Identity {
        client_id: Some(format!("C{n}")),
        mac: Some(mac(n)),
        ip: Some(ip(n)),
    }
}
