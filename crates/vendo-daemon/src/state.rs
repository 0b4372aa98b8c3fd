//! Shared gateway state.
//!
//! The composition root builds one [`Gateway`] and every loop and facade
//! holds an `Arc` to it. The coin aggregator sits behind a mutex with
//! short critical sections; the store serializes itself; everything else
//! is immutable after construction.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use vendo_core::config::{CoinConfig, GateConfig};
use vendo_core::credit::CreditOutcome;
use vendo_core::policy::{EnforcementOp, PacketPolicy};
use vendo_core::{
    CoinAggregator, CommitTicket, CreditApplier, CreditRequest, FailAttemptGate, GatewayConfig,
    IdentityResolver, OpError, SessionStore, SourceRegistry, StoreError,
};

use crate::enforce::EnforcementTx;
use crate::metrics::SharedMetrics;

/// Shared handle to the composed gateway.
pub type SharedGateway = Arc<Gateway>;

/// The composed gateway: store, engine components, and the plane.
pub struct Gateway {
    /// Frozen configuration.
    pub cfg: GatewayConfig,
    /// The durable record set.
    pub store: SessionStore,
    /// Cookie/MAC/IP reconciliation.
    pub resolver: IdentityResolver,
    /// Coin sources.
    pub registry: SourceRegistry,
    /// The insert-window state machine.
    pub aggregator: Mutex<CoinAggregator>,
    /// Per-MAC failure lockout.
    pub gate: FailAttemptGate,
    /// The credit transaction.
    pub applier: CreditApplier,
    /// The packet plane.
    pub policy: Arc<dyn PacketPolicy>,
    /// Enforcement outbox sender.
    pub enforce_tx: EnforcementTx,
    /// Metric families.
    pub metrics: SharedMetrics,
    /// Set once the in-flight commit's sale rows are on the ledger, so
    /// retries go through the sales-skipping path.
    commit_sales_recorded: AtomicBool,
    started_at: DateTime<Utc>,
}

impl Gateway {
    /// Wires the engine together.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the source registry cannot ensure the
    /// local slot row.
    pub fn new(
        cfg: GatewayConfig,
        store: SessionStore,
        policy: Arc<dyn PacketPolicy>,
        enforce_tx: EnforcementTx,
        metrics: SharedMetrics,
    ) -> Result<SharedGateway, StoreError> {
        let registry = SourceRegistry::new(store.clone(), &cfg.sources, now_unix())?;
        let gateway = Arc::new(Self {
            resolver: IdentityResolver::new(store.clone()),
            aggregator: Mutex::new(CoinAggregator::new(cfg.coin)),
            gate: FailAttemptGate::new(store.clone(), cfg.gate),
            applier: CreditApplier::new(store.clone(), registry.clone()),
            registry,
            store,
            policy,
            enforce_tx,
            metrics,
            commit_sales_recorded: AtomicBool::new(false),
            started_at: Utc::now(),
            cfg,
        });
        Ok(gateway)
    }

    /// When the daemon started.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Locks the aggregator, recovering from poisoning.
    pub fn aggregator(&self) -> std::sync::MutexGuard<'_, CoinAggregator> {
        self.aggregator.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pushes enforcement ops into the outbox. Send failures only happen
    /// during shutdown and are logged, not surfaced.
    pub fn enqueue(&self, ops: Vec<EnforcementOp>) {
        for op in ops {
            if self.enforce_tx.send(op).is_err() {
                debug!("enforcement outbox closed; op dropped");
                return;
            }
        }
    }

    /// Drives a commit ticket through the credit applier.
    ///
    /// On success the aggregator frees the slot and the owner's failure
    /// record clears. On failure the aggregator stays in `Committing`
    /// with the ticket retained; the ticker retries through
    /// [`Self::retry_pending_commit`]. The sales-recorded flag biases
    /// retries toward never double-appending the ledger.
    ///
    /// # Errors
    ///
    /// Propagates applier errors (`no_rate_for_amount`, `transient`).
    pub fn drive_commit(
        &self,
        ticket: &CommitTicket,
        now: i64,
    ) -> Result<CreditOutcome, OpError> {
        if ticket.amount == 0 {
            let relays = self.aggregator().commit_done();
            debug!(?relays, "zero-amount window closed");
            self.commit_sales_recorded.store(false, Ordering::SeqCst);
            self.metrics.coin_commits_total.inc();
            return Ok(CreditOutcome {
                user_id: String::new(),
                user_code: String::new(),
                seconds_added: 0,
                amount: 0,
                ops: Vec::new(),
            });
        }

        let req = CreditRequest {
            mac: ticket.owner.mac,
            client_id: ticket.owner.client_id.clone(),
            ip: ticket.owner.ip,
            per_source_amount: ticket.per_source_amount.clone(),
            commit_source_hint: None,
        };
        let first_attempt = !self.commit_sales_recorded.swap(true, Ordering::SeqCst);
        let result = if first_attempt {
            self.applier.apply(&req, now)
        } else {
            self.applier.apply_recorded(&req, now)
        };
        match result {
            Ok(outcome) => {
                let relays = self.aggregator().commit_done();
                debug!(?relays, "commit complete; slot released");
                self.commit_sales_recorded.store(false, Ordering::SeqCst);
                if let Err(err) = self.gate.record_success(&ticket.owner.mac) {
                    warn!(%err, "failed to clear failure record after commit");
                }
                self.enqueue(outcome.ops.clone());
                self.metrics.coin_commits_total.inc();
                self.metrics
                    .credited_pesos_total
                    .inc_by(u64::from(outcome.amount));
                self.metrics
                    .credited_seconds_total
                    .inc_by(outcome.seconds_added);
                Ok(outcome)
            },
            Err(err) => {
                warn!(
                    mac = %ticket.owner.mac,
                    amount = ticket.amount,
                    %err,
                    "commit failed; ticket retained for retry"
                );
                Err(err)
            },
        }
    }

    /// Retries an in-flight commit, if one is parked. Called by the
    /// ticker every pass.
    pub fn retry_pending_commit(&self, now: i64) {
        let pending = self.aggregator().pending_commit();
        if let Some(ticket) = pending {
            debug!(mac = %ticket.owner.mac, amount = ticket.amount, "retrying parked commit");
            let _ = self.drive_commit(&ticket, now);
        }
    }

    /// Fires coin deadlines. Called by the ticker every pass.
    pub fn poll_coin_deadline(&self, now_mono: Instant, now: i64) {
        let ticket = self.aggregator().poll_deadline(now_mono);
        if let Some(ticket) = ticket {
            let _ = self.drive_commit(&ticket, now);
        }
    }

    /// Applies runtime-changeable limits to the components that react
    /// to them. Everything else in the config stays frozen for the
    /// process lifetime.
    pub fn reconfigure(&self, coin: CoinConfig, gate: GateConfig) {
        self.aggregator().reconfigure(coin);
        self.gate.reconfigure(gate);
        info!("runtime limits reconfigured");
    }

    /// Administrative teardown of the coin session, discarding any
    /// pending or parked amount.
    pub fn abort_coin_session(&self) {
        let relays = self.aggregator().abort();
        self.commit_sales_recorded.store(false, Ordering::SeqCst);
        debug!(?relays, "coin session aborted");
    }

    /// Re-authorizes every active user after a restart, before portal
    /// traffic is accepted.
    ///
    /// # Errors
    ///
    /// Returns [`OpError::Transient`] if the store cannot enumerate
    /// active users; individual plane failures are logged and left to
    /// reconciliation.
    pub async fn startup_recovery(&self) -> Result<(), OpError> {
        let active = self
            .store
            .iterate_active()
            .map_err(|e| OpError::Transient(e.to_string()))?;
        let mut ops = Vec::with_capacity(active.len() * 2);
        for user in &active {
            ops.push(EnforcementOp::Authorize(user.mac));
            if let Some(ip) = user.ip {
                if user.rate_down_kbps > 0 || user.rate_up_kbps > 0 {
                    ops.push(EnforcementOp::SetLimit {
                        ip,
                        down_kbps: user.rate_down_kbps,
                        up_kbps: user.rate_up_kbps,
                    });
                }
            }
        }
        let count = active.len();
        self.metrics
            .active_users
            .set(i64::try_from(count).unwrap_or(i64::MAX));
        crate::enforce::apply_batch(self.policy.as_ref(), &self.metrics, ops).await;
        info!(users = count, "startup recovery sweep complete");
        Ok(())
    }
}

/// Current UTC unix seconds.
#[must_use]
pub fn now_unix() -> i64 {
    Utc::now().timestamp()
}
