//! In-memory packet policy for tests and dry-run mode.
//!
//! Mirrors the netfilter adapter's observable behavior — idempotent
//! mutations, counter samples, neighbor and flow probes — against plain
//! maps, and keeps a call log so tests can assert on the exact sequence
//! of plane operations.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Mutex, PoisonError};

use vendo_core::policy::{
    BoxFuture, Counter, CounterSample, NeighborState, PacketPolicy, PolicyError,
};
use vendo_core::MacAddr;

#[derive(Debug, Default)]
struct Inner {
    authorized: HashSet<MacAddr>,
    limits: HashMap<Ipv4Addr, (u32, u32)>,
    sample: CounterSample,
    neighbors: HashMap<Ipv4Addr, NeighborState>,
    live_flows: HashSet<Ipv4Addr>,
    calls: Vec<String>,
    /// When set, every mutating call fails with this message.
    fail_mutations: Option<String>,
}

/// The in-memory plane.
#[derive(Debug, Default)]
pub struct InMemoryPolicy {
    inner: Mutex<Inner>,
}

impl InMemoryPolicy {
    /// Creates an empty plane.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Currently authorized MACs.
    #[must_use]
    pub fn authorized(&self) -> HashSet<MacAddr> {
        self.lock().authorized.clone()
    }

    /// The installed limit for an IP, `(down_kbps, up_kbps)`.
    #[must_use]
    pub fn limit(&self, ip: Ipv4Addr) -> Option<(u32, u32)> {
        self.lock().limits.get(&ip).copied()
    }

    /// The recorded call sequence.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Clears the recorded call sequence.
    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Replaces the counter sample returned by `sample_counters`.
    pub fn set_sample(&self, sample: CounterSample) {
        self.lock().sample = sample;
    }

    /// Sets one upload counter.
    pub fn set_upload(&self, ip: Ipv4Addr, bytes: u64) {
        self.lock().sample.uploads.insert(
            ip,
            Counter {
                bytes,
                idle_secs: None,
            },
        );
    }

    /// Sets one download counter.
    pub fn set_download(&self, class_id: u16, bytes: u64) {
        self.lock().sample.downloads.insert(
            class_id,
            Counter {
                bytes,
                idle_secs: None,
            },
        );
    }

    /// Sets the neighbor verdict for an IP.
    pub fn set_neighbor(&self, ip: Ipv4Addr, state: NeighborState) {
        self.lock().neighbors.insert(ip, state);
    }

    /// Marks whether established flows reference the IP.
    pub fn set_live_flows(&self, ip: Ipv4Addr, live: bool) {
        let mut inner = self.lock();
        if live {
            inner.live_flows.insert(ip);
        } else {
            inner.live_flows.remove(&ip);
        }
    }

    /// Makes every mutating call fail, to exercise transient-error paths.
    pub fn fail_mutations(&self, message: Option<&str>) {
        self.lock().fail_mutations = message.map(str::to_string);
    }

    fn mutation_gate(inner: &Inner) -> Result<(), PolicyError> {
        match &inner.fail_mutations {
            Some(message) => Err(PolicyError::CommandFailed {
                tool: "memory",
                code: 1,
                stderr: message.clone(),
            }),
            None => Ok(()),
        }
    }
}

impl PacketPolicy for InMemoryPolicy {
    fn authorize<'a>(&'a self, mac: &'a MacAddr) -> BoxFuture<'a, Result<bool, PolicyError>> {
        Box::pin(async move {
            let mut inner = self.lock();
            Self::mutation_gate(&inner)?;
            inner.calls.push(format!("authorize {mac}"));
            Ok(inner.authorized.insert(*mac))
        })
    }

    fn deauthorize<'a>(&'a self, mac: &'a MacAddr) -> BoxFuture<'a, Result<(), PolicyError>> {
        Box::pin(async move {
            let mut inner = self.lock();
            Self::mutation_gate(&inner)?;
            inner.calls.push(format!("deauthorize {mac}"));
            inner.authorized.remove(mac);
            Ok(())
        })
    }

    fn set_limit(
        &self,
        ip: Ipv4Addr,
        down_kbps: u32,
        up_kbps: u32,
    ) -> BoxFuture<'_, Result<(), PolicyError>> {
        Box::pin(async move {
            let mut inner = self.lock();
            Self::mutation_gate(&inner)?;
            inner
                .calls
                .push(format!("set_limit {ip} {down_kbps} {up_kbps}"));
            inner.limits.insert(ip, (down_kbps, up_kbps));
            Ok(())
        })
    }

    fn remove_limit(&self, ip: Ipv4Addr) -> BoxFuture<'_, Result<(), PolicyError>> {
        Box::pin(async move {
            let mut inner = self.lock();
            Self::mutation_gate(&inner)?;
            inner.calls.push(format!("remove_limit {ip}"));
            inner.limits.remove(&ip);
            Ok(())
        })
    }

    fn sample_counters(&self) -> BoxFuture<'_, Result<CounterSample, PolicyError>> {
        Box::pin(async move { Ok(self.lock().sample.clone()) })
    }

    fn list_authorized_macs(&self) -> BoxFuture<'_, Result<HashSet<MacAddr>, PolicyError>> {
        Box::pin(async move { Ok(self.lock().authorized.clone()) })
    }

    fn has_live_flows(&self, ip: Ipv4Addr) -> BoxFuture<'_, Result<bool, PolicyError>> {
        Box::pin(async move { Ok(self.lock().live_flows.contains(&ip)) })
    }

    fn neighbor_state(&self, ip: Ipv4Addr) -> BoxFuture<'_, Result<NeighborState, PolicyError>> {
        Box::pin(async move {
            Ok(self
                .lock()
                .neighbors
                .get(&ip)
                .copied()
                .unwrap_or(NeighborState::Unreachable))
        })
    }
}
