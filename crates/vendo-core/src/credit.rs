//! The credit transaction: pesos in, authorized time out.
//!
//! `apply` is the one path that turns money into credit, for coin commits
//! and voucher-style grants alike. Its ordering is load-bearing:
//!
//! 1. Sale rows are appended first. The ledger records what the machine
//!    took even if everything after fails.
//! 2. The plan is computed; an unplannable amount fails with
//!    `no_rate_for_amount` and the sales stay for the operator.
//! 3. The user mutation commits as one serialized store write.
//! 4. Packet-plane work (authorize, set limit) is returned as enforcement
//!    ops for the caller's outbox — never executed inline, so the ticker
//!    can observe either the old state or the new one, nothing partial.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use tracing::{debug, info};

use crate::coin::registry::SourceRegistry;
use crate::coin::SourceId;
use crate::error::OpError;
use crate::net::MacAddr;
use crate::policy::EnforcementOp;
use crate::store::{SessionStore, StoreError, UserRecord};

/// A credit request: the identity receiving it plus the per-source money.
#[derive(Debug, Clone)]
pub struct CreditRequest {
    /// MAC the credit commits to.
    pub mac: MacAddr,
    /// Cookie to coalesce into the record.
    pub client_id: Option<String>,
    /// IP to bind and shape, when known.
    pub ip: Option<Ipv4Addr>,
    /// Pesos per contributing source.
    pub per_source_amount: BTreeMap<SourceId, u32>,
    /// Which source's rate visibility and overrides govern the plan.
    /// `None` falls back to the source that contributed the most.
    pub commit_source_hint: Option<SourceId>,
}

/// What a committed credit produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditOutcome {
    /// The credited user.
    pub user_id: String,
    /// The user's restore code.
    pub user_code: String,
    /// Seconds added by this transaction.
    pub seconds_added: u64,
    /// Pesos committed.
    pub amount: u32,
    /// Enforcement work for the caller's outbox.
    pub ops: Vec<EnforcementOp>,
}

/// Applies credit transactions against the store.
#[derive(Debug, Clone)]
pub struct CreditApplier {
    store: SessionStore,
    registry: SourceRegistry,
}

impl CreditApplier {
    /// Creates the applier.
    #[must_use]
    pub const fn new(store: SessionStore, registry: SourceRegistry) -> Self {
        Self { store, registry }
    }

    /// Runs the credit transaction. A zero total succeeds as a no-op.
    ///
    /// # Errors
    ///
    /// - [`OpError::NoRateForAmount`] when the planner fails; sale rows
    ///   are already written and are deliberately not rolled back.
    /// - [`OpError::Transient`] on store failure.
    pub fn apply(&self, req: &CreditRequest, now: i64) -> Result<CreditOutcome, OpError> {
        self.apply_inner(req, now, true)
    }

    /// Retries a commit whose sale rows already sit on the ledger. The
    /// plan and user mutation rerun; the ledger is left alone so a retry
    /// can never double-count revenue.
    ///
    /// # Errors
    ///
    /// Same as [`apply`](Self::apply).
    pub fn apply_recorded(&self, req: &CreditRequest, now: i64) -> Result<CreditOutcome, OpError> {
        self.apply_inner(req, now, false)
    }

    fn apply_inner(
        &self,
        req: &CreditRequest,
        now: i64,
        record_sales: bool,
    ) -> Result<CreditOutcome, OpError> {
        let amount: u32 = req.per_source_amount.values().sum();
        if amount == 0 {
            let existing = self.store.find_by_mac(&req.mac).map_err(store_err)?;
            return Ok(CreditOutcome {
                user_id: existing.as_ref().map(|u| u.user_id.clone()).unwrap_or_default(),
                user_code: existing.map(|u| u.user_code).unwrap_or_default(),
                seconds_added: 0,
                amount: 0,
                ops: Vec::new(),
            });
        }

        // Ledger first. One row per contributing source.
        if record_sales {
            for (source, pesos) in &req.per_source_amount {
                if *pesos == 0 {
                    continue;
                }
                self.store
                    .record_sale(now, *pesos, &req.mac, source)
                    .map_err(store_err)?;
            }
        }

        let dominant = req
            .commit_source_hint
            .clone()
            .unwrap_or_else(|| dominant_source(&req.per_source_amount));

        let table = self.store.load_rate_table().map_err(store_err)?;
        let plan = table.plan(amount, Some(&dominant));
        let seconds = plan.seconds();
        if seconds == 0 {
            info!(amount, source = %dominant, "no rate fits amount; sales retained for operator");
            return Err(OpError::NoRateForAmount { amount });
        }

        let user = self.upsert_user(req, now)?;

        // Claim the IP before the balance goes positive, so the
        // one-active-owner-per-IP index never sees two holders.
        if let Some(ip) = req.ip {
            self.store.assign_ip(&user.user_id, ip).map_err(store_err)?;
        }

        let override_rates = self
            .registry
            .bandwidth_override(&dominant)
            .map(|(down, up)| {
                (
                    up.unwrap_or(plan.up_kbps),
                    down.unwrap_or(plan.down_kbps),
                )
            });
        self.store
            .apply_credit(
                &user.user_id,
                i64::try_from(seconds).unwrap_or(i64::MAX),
                plan.up_kbps,
                plan.down_kbps,
                override_rates,
                req.client_id.as_deref(),
                now,
            )
            .map_err(store_err)?;

        let after = self
            .store
            .get_user(&user.user_id)
            .map_err(store_err)?
            .ok_or(OpError::NotFound)?;

        let mut ops = vec![EnforcementOp::Authorize(after.mac)];
        if let Some(ip) = after.ip {
            if after.rate_down_kbps > 0 || after.rate_up_kbps > 0 {
                ops.push(EnforcementOp::SetLimit {
                    ip,
                    down_kbps: after.rate_down_kbps,
                    up_kbps: after.rate_up_kbps,
                });
            }
        }

        info!(
            user_id = %after.user_id,
            mac = %after.mac,
            amount,
            seconds_added = seconds,
            source = %dominant,
            "credit committed"
        );
        Ok(CreditOutcome {
            user_id: after.user_id,
            user_code: after.user_code,
            seconds_added: seconds,
            amount,
            ops,
        })
    }

    /// The degenerate credit: no money, explicit seconds. Used by the
    /// free-time grant and administrative top-ups.
    ///
    /// # Errors
    ///
    /// Returns [`OpError::Transient`] on store failure.
    pub fn apply_grant(
        &self,
        mac: &MacAddr,
        client_id: Option<&str>,
        ip: Option<Ipv4Addr>,
        seconds: u64,
        now: i64,
    ) -> Result<CreditOutcome, OpError> {
        let req = CreditRequest {
            mac: *mac,
            client_id: client_id.map(str::to_string),
            ip,
            per_source_amount: BTreeMap::new(),
            commit_source_hint: None,
        };
        let user = self.upsert_user(&req, now)?;
        if let Some(ip) = ip {
            self.store.assign_ip(&user.user_id, ip).map_err(store_err)?;
        }
        self.store
            .apply_credit(
                &user.user_id,
                i64::try_from(seconds).unwrap_or(i64::MAX),
                0,
                0,
                None,
                client_id,
                now,
            )
            .map_err(store_err)?;
        let after = self
            .store
            .get_user(&user.user_id)
            .map_err(store_err)?
            .ok_or(OpError::NotFound)?;
        let mut ops = vec![EnforcementOp::Authorize(after.mac)];
        if let Some(ip) = after.ip {
            if after.rate_down_kbps > 0 || after.rate_up_kbps > 0 {
                ops.push(EnforcementOp::SetLimit {
                    ip,
                    down_kbps: after.rate_down_kbps,
                    up_kbps: after.rate_up_kbps,
                });
            }
        }
        debug!(user_id = %after.user_id, seconds, "grant applied");
        Ok(CreditOutcome {
            user_id: after.user_id,
            user_code: after.user_code,
            seconds_added: seconds,
            amount: 0,
            ops,
        })
    }

    fn upsert_user(&self, req: &CreditRequest, now: i64) -> Result<UserRecord, OpError> {
        if let Some(existing) = self.store.find_by_mac(&req.mac).map_err(store_err)? {
            return Ok(existing);
        }
        self.store
            .create_user(&req.mac, req.client_id.as_deref(), req.ip, now)
            .map_err(store_err)
    }
}

/// The source that contributed the most pesos; name order breaks ties so
/// the choice is deterministic.
fn dominant_source(per_source: &BTreeMap<SourceId, u32>) -> SourceId {
    per_source
        .iter()
        .max_by(|(sa, a), (sb, b)| a.cmp(b).then(sb.cmp(sa)))
        .map_or(SourceId::Hardware, |(source, _)| source.clone())
}

fn store_err(err: StoreError) -> OpError {
    OpError::Transient(err.to_string())
}
