//! The portal service facade.
//!
//! The external HTTP/WebSocket layer terminates requests and calls these
//! operations; everything returns plain data or an [`OpError`] kind for
//! the wire envelope. The facade owns the glue between the resolver, the
//! gate, the aggregator, and the credit applier — no business rule lives
//! in the transport layer.

use std::net::Ipv4Addr;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};
use vendo_core::policy::EnforcementOp;
use vendo_core::{
    Identity, InsertMode, InsertOwner, OpError, PulseOutcome, SourceId, UserRecord,
};

use crate::state::{now_unix, SharedGateway};

/// Key prefix for per-MAC free-time claim stamps in the config table.
const FREE_CLAIM_PREFIX: &str = "free_claimed:";

/// Config key for the appliance's advertised coin mode.
const VENDO_MODE_KEY: &str = "vendo_mode";

/// One source in a status reply.
#[derive(Debug, Clone, Serialize)]
pub struct SourceInfo {
    /// Canonical source name (`hardware`, `remote:<id>`).
    pub id: String,
    /// Operator-facing name.
    pub name: String,
    /// Heartbeat freshness verdict.
    pub online: bool,
    /// Pesos per pulse.
    pub pulse_value_pesos: u32,
}

/// The caller's open insert window, if any.
#[derive(Debug, Clone, Serialize)]
pub struct CoinSessionInfo {
    /// `open` or `committing`.
    pub state: String,
    /// Accumulated pesos.
    pub pending_amount: u32,
    /// Minutes the pending amount currently buys.
    pub pending_minutes: u32,
    /// Insert mode.
    pub mode: Option<InsertMode>,
    /// Manual-mode target.
    pub target: Option<String>,
    /// Seconds until the window closes on its own.
    pub deadline_secs: Option<u64>,
}

/// Free-time availability in a status reply.
#[derive(Debug, Clone, Serialize)]
pub struct FreeTimeStatus {
    /// Minutes per claim.
    pub minutes: u32,
    /// Whether this MAC may claim now.
    pub available: bool,
    /// Seconds until the next claim, when on cooldown.
    pub cooldown_remaining_secs: i64,
}

/// The status reply.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReply {
    /// Resolved user id, null when the identity matches nothing.
    pub user_id: Option<String>,
    /// Remaining credit.
    pub credit_seconds: i64,
    /// Paused flag.
    pub paused: bool,
    /// Connected flag.
    pub connected: bool,
    /// Restore code.
    pub user_code: Option<String>,
    /// Pending pesos in the caller's insert window.
    pub pending_amount: u32,
    /// Minutes the pending amount currently buys.
    pub pending_minutes: u32,
    /// The appliance's advertised coin mode.
    pub vendo_mode: String,
    /// Known sources.
    pub sources: Vec<SourceInfo>,
    /// The caller's insert window, when one is open.
    pub coin_session: Option<CoinSessionInfo>,
    /// Free-time availability, when the feature is on.
    pub free_time: Option<FreeTimeStatus>,
}

/// Reply to a finalize or redeem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreditReply {
    /// Seconds this operation added.
    pub seconds_added: u64,
    /// Pesos committed (zero for vouchers and grants).
    pub amount: u32,
}

/// Reply to a restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreReply {
    /// The restored user.
    pub user_id: String,
    /// Remaining credit.
    pub credit_seconds: i64,
}

/// The portal-facing operation surface.
#[derive(Clone)]
pub struct PortalService {
    gw: SharedGateway,
}

impl PortalService {
    /// Creates the facade.
    #[must_use]
    pub const fn new(gw: SharedGateway) -> Self {
        Self { gw }
    }

    /// Full client status. Never fails on an unknown identity; the reply
    /// simply carries a null user.
    ///
    /// # Errors
    ///
    /// Returns [`OpError::Transient`] on store failure.
    pub fn status(&self, identity: &Identity) -> Result<StatusReply, OpError> {
        let now = now_unix();
        let resolution = self.gw.resolver.resolve(identity, false, now)?;
        self.gw.enqueue(resolution.ops.clone());
        let user = resolution.user;

        let snapshot = self.gw.aggregator().snapshot(Instant::now());
        let caller_owns_session = match (&snapshot.owner_mac, &identity.mac) {
            (Some(owner), Some(mac)) => owner == mac,
            _ => false,
        };
        let (pending_amount, pending_minutes, coin_session) = if caller_owns_session {
            let table = self
                .gw
                .store
                .load_rate_table()
                .map_err(|e| OpError::Transient(e.to_string()))?;
            let minutes = table.plan(snapshot.pending_amount, None).minutes;
            let info = CoinSessionInfo {
                state: snapshot.state.to_string(),
                pending_amount: snapshot.pending_amount,
                pending_minutes: minutes,
                mode: snapshot.mode,
                target: snapshot.target.as_ref().map(ToString::to_string),
                deadline_secs: snapshot.deadline_secs,
            };
            (snapshot.pending_amount, minutes, Some(info))
        } else {
            (0, 0, None)
        };

        let sources = self
            .gw
            .registry
            .list(now)?
            .into_iter()
            .map(|status| SourceInfo {
                id: status.row.source.to_string(),
                name: status.row.display_name,
                online: status.online,
                pulse_value_pesos: status.row.pulse_value_pesos,
            })
            .collect();

        let vendo_mode = self
            .gw
            .store
            .get_config(VENDO_MODE_KEY)
            .map_err(|e| OpError::Transient(e.to_string()))?
            .unwrap_or_else(|| "auto".to_string());

        let free_time = self.free_time_status(identity.mac.as_ref().map(|m| m.to_string()), now)?;

        Ok(StatusReply {
            user_id: user.as_ref().map(|u| u.user_id.clone()),
            credit_seconds: user.as_ref().map_or(0, |u| u.credit_seconds),
            paused: user.as_ref().is_some_and(|u| u.paused),
            connected: user.as_ref().is_some_and(|u| u.connected),
            user_code: user.as_ref().map(|u| u.user_code.clone()),
            pending_amount,
            pending_minutes,
            vendo_mode,
            sources,
            coin_session,
            free_time,
        })
    }

    /// Opens (or re-opens) a coin insert window for the caller.
    ///
    /// # Errors
    ///
    /// - [`OpError::MissingMac`] without a resolvable MAC.
    /// - [`OpError::Banned`] while the gate or a pulse-flood ban holds.
    /// - [`OpError::Busy`] while another owner holds the slot; this also
    ///   counts as a failed attempt.
    /// - [`OpError::Invalid`] for a manual start without a known target.
    pub fn start_coin_insert(
        &self,
        identity: &Identity,
        mode: InsertMode,
        target: Option<SourceId>,
    ) -> Result<(), OpError> {
        let now = now_unix();
        let mac = identity.mac.ok_or(OpError::MissingMac)?;
        self.gw.gate.check(&mac, now)?;

        if mode == InsertMode::Manual {
            let Some(target) = &target else {
                return Err(OpError::Invalid("manual mode requires a target".to_string()));
            };
            if !target.is_hardware() && !self.gw.registry.exists(target)? {
                return Err(OpError::Invalid(format!("unknown source {target}")));
            }
        }

        let resolution = self.gw.resolver.resolve(identity, false, now)?;
        self.gw.enqueue(resolution.ops.clone());
        let owner = InsertOwner {
            mac,
            client_id: identity
                .client_id
                .clone()
                .or_else(|| resolution.user.as_ref().and_then(|u| u.client_id.clone())),
            ip: identity.ip.or(resolution.user.as_ref().and_then(|u| u.ip)),
        };

        match self
            .gw
            .aggregator()
            .start_insert(owner, mode, target, Instant::now())
        {
            Ok(relays) => {
                info!(%mac, ?mode, ?relays, "coin insert started");
                self.gw.metrics.coin_sessions_opened_total.inc();
                self.gw.gate.record_success(&mac)?;
                Ok(())
            },
            Err(OpError::Busy) => {
                if let Some(banned) = self.gw.gate.record_failure(&mac, now)? {
                    return Err(banned);
                }
                Err(OpError::Busy)
            },
            Err(other) => Err(other),
        }
    }

    /// Ingests a pulse from the local slot adapter. Trusted path; no
    /// secret involved.
    pub fn coin_pulse(&self, count: u32) -> PulseOutcome {
        self.pulse_from(&SourceId::Hardware, count)
    }

    /// Authenticated heartbeat from a remote sub-device.
    ///
    /// # Errors
    ///
    /// Returns [`OpError::Invalid`] on a bad secret.
    pub fn remote_heartbeat(
        &self,
        device_id: &str,
        display_name: &str,
        key: &str,
    ) -> Result<(), OpError> {
        self.gw
            .registry
            .heartbeat(device_id, display_name, key, now_unix())?;
        Ok(())
    }

    /// Authenticated pulse from a remote sub-device.
    ///
    /// # Errors
    ///
    /// Returns [`OpError::Invalid`] on a bad secret or unknown device.
    pub fn remote_pulse(
        &self,
        device_id: &str,
        count: u32,
        key: &str,
    ) -> Result<PulseOutcome, OpError> {
        self.gw.registry.authenticate(key)?;
        let source = SourceId::remote(device_id);
        if !self.gw.registry.exists(&source)? {
            return Err(OpError::Invalid(format!("unknown source {source}")));
        }
        Ok(self.pulse_from(&source, count))
    }

    fn pulse_from(&self, source: &SourceId, count: u32) -> PulseOutcome {
        let now = now_unix();
        if let Err(err) = self.gw.registry.touch(source, now) {
            debug!(%source, %err, "source touch failed");
        }
        let value = self.gw.registry.pulse_value(source);
        let outcome = self
            .gw
            .aggregator()
            .pulse(source, count, value, Instant::now());
        if let PulseOutcome::Accepted { pending_amount } = &outcome {
            debug!(%source, count, pending_amount, "pulse accepted");
        }
        outcome
    }

    /// Closes the caller's insert window and commits the accumulated
    /// amount.
    ///
    /// # Errors
    ///
    /// - [`OpError::NotFound`] with no open window.
    /// - [`OpError::Busy`] when the window belongs to someone else.
    /// - Applier errors; the ticket stays parked for ticker retries.
    pub fn finalize_coin_insert(&self, identity: &Identity) -> Result<CreditReply, OpError> {
        let mac = identity.mac.ok_or(OpError::MissingMac)?;
        let ticket = self.gw.aggregator().finish(Some(&mac))?;
        let outcome = self.gw.drive_commit(&ticket, now_unix())?;
        Ok(CreditReply {
            seconds_added: outcome.seconds_added,
            amount: outcome.amount,
        })
    }

    /// Pauses the caller's session and takes it off the network.
    ///
    /// # Errors
    ///
    /// Returns [`OpError::NotFound`] for an unknown identity.
    pub fn pause_session(&self, identity: &Identity) -> Result<(), OpError> {
        let now = now_unix();
        let user = self.resolve_existing(identity, now)?;
        self.gw
            .store
            .pause(&user.user_id)
            .map_err(|e| OpError::Transient(e.to_string()))?;
        let mut ops = vec![EnforcementOp::Deauthorize(user.mac)];
        if let Some(ip) = user.ip {
            ops.push(EnforcementOp::RemoveLimit(ip));
        }
        self.gw.enqueue(ops);
        info!(user_id = %user.user_id, "session paused");
        Ok(())
    }

    /// Resumes a paused session.
    ///
    /// # Errors
    ///
    /// - [`OpError::NotFound`] for an unknown identity.
    /// - [`OpError::Expired`] when no credit remains.
    pub fn resume_session(&self, identity: &Identity) -> Result<(), OpError> {
        let now = now_unix();
        let user = self.resolve_existing(identity, now)?;
        if user.credit_seconds == 0 {
            return Err(OpError::Expired);
        }
        self.gw
            .store
            .resume(&user.user_id, now)
            .map_err(|e| OpError::Transient(e.to_string()))?;
        self.gw.enqueue(authorize_ops(&user));
        info!(user_id = %user.user_id, "session resumed");
        Ok(())
    }

    /// Redeems a voucher code onto the caller's identity. Voucher codes
    /// are user codes: the donor record's remaining credit moves to the
    /// caller and the donor is retired.
    ///
    /// # Errors
    ///
    /// - [`OpError::Banned`] while the gate holds.
    /// - [`OpError::Invalid`] for an unknown code (counts as a failure).
    /// - [`OpError::Expired`] for an exhausted code (counts as a failure).
    pub fn redeem_voucher(&self, identity: &Identity, code: &str) -> Result<CreditReply, OpError> {
        let now = now_unix();
        let mac = identity.mac.ok_or(OpError::MissingMac)?;
        self.gw.gate.check(&mac, now)?;

        let donor = self
            .gw
            .store
            .find_by_code(code)
            .map_err(|e| OpError::Transient(e.to_string()))?;
        let Some(donor) = donor else {
            warn!(%mac, code, "voucher redeem failed: unknown code");
            if let Some(banned) = self.gw.gate.record_failure(&mac, now)? {
                return Err(banned);
            }
            return Err(OpError::Invalid("unknown code".to_string()));
        };
        if donor.credit_seconds == 0 {
            if let Some(banned) = self.gw.gate.record_failure(&mac, now)? {
                return Err(banned);
            }
            return Err(OpError::Expired);
        }

        let resolution = self.gw.resolver.resolve(identity, false, now)?;
        self.gw.enqueue(resolution.ops.clone());

        let reply = match resolution.user {
            // Redeeming your own code is a reconnect, not a transfer.
            Some(caller) if caller.user_id == donor.user_id => {
                self.gw.enqueue(authorize_ops(&caller));
                CreditReply {
                    seconds_added: 0,
                    amount: 0,
                }
            },
            Some(caller) => {
                let transferred = donor.credit_seconds;
                self.gw
                    .store
                    .apply_credit(
                        &caller.user_id,
                        transferred,
                        donor.rate_up_kbps,
                        donor.rate_down_kbps,
                        None,
                        identity.client_id.as_deref(),
                        now,
                    )
                    .map_err(|e| OpError::Transient(e.to_string()))?;
                self.gw
                    .store
                    .delete_user(&donor.user_id)
                    .map_err(|e| OpError::Transient(e.to_string()))?;
                let merged = self
                    .gw
                    .store
                    .get_user(&caller.user_id)
                    .map_err(|e| OpError::Transient(e.to_string()))?
                    .ok_or(OpError::NotFound)?;
                let mut ops = vec![EnforcementOp::Deauthorize(donor.mac)];
                ops.extend(authorize_ops(&merged));
                self.gw.enqueue(ops);
                info!(
                    from = %donor.user_id,
                    to = %caller.user_id,
                    seconds = transferred,
                    "voucher credit merged"
                );
                CreditReply {
                    seconds_added: u64::try_from(transferred).unwrap_or(0),
                    amount: 0,
                }
            },
            None => {
                // The caller has no record: the donor record becomes theirs.
                let old_mac = donor.mac;
                let mut ops = Vec::new();
                if old_mac != mac {
                    self.gw
                        .store
                        .claim_mac(&donor.user_id, &mac)
                        .map_err(|e| OpError::Transient(e.to_string()))?;
                    ops.push(EnforcementOp::Deauthorize(old_mac));
                }
                if let Some(cookie) = &identity.client_id {
                    self.gw
                        .store
                        .bind_cookie(&donor.user_id, cookie)
                        .map_err(|e| OpError::Transient(e.to_string()))?;
                }
                if let Some(ip) = identity.ip {
                    self.gw
                        .store
                        .assign_ip(&donor.user_id, ip)
                        .map_err(|e| OpError::Transient(e.to_string()))?;
                }
                self.gw
                    .store
                    .resume(&donor.user_id, now)
                    .map_err(|e| OpError::Transient(e.to_string()))?;
                let claimed = self
                    .gw
                    .store
                    .get_user(&donor.user_id)
                    .map_err(|e| OpError::Transient(e.to_string()))?
                    .ok_or(OpError::NotFound)?;
                ops.extend(authorize_ops(&claimed));
                self.gw.enqueue(ops);
                info!(user_id = %claimed.user_id, %mac, "voucher claimed onto new device");
                CreditReply {
                    seconds_added: u64::try_from(claimed.credit_seconds).unwrap_or(0),
                    amount: 0,
                }
            },
        };

        self.gw.gate.record_success(&mac)?;
        Ok(reply)
    }

    /// Restores a session by code or cookie onto the observed device.
    ///
    /// # Errors
    ///
    /// - [`OpError::NotFound`] for an unknown code/cookie.
    /// - [`OpError::Expired`] when the record has no credit left.
    /// - [`OpError::Conflict`] when the observed MAC belongs to another
    ///   active user.
    pub fn restore_session(
        &self,
        identity: &Identity,
        code: Option<&str>,
    ) -> Result<RestoreReply, OpError> {
        let now = now_unix();
        let user = match code {
            Some(code) => self
                .gw
                .store
                .find_by_code(code)
                .map_err(|e| OpError::Transient(e.to_string()))?,
            None => match &identity.client_id {
                Some(cookie) => self
                    .gw
                    .store
                    .find_by_cookie(cookie)
                    .map_err(|e| OpError::Transient(e.to_string()))?,
                None => None,
            },
        };
        let Some(user) = user else {
            return Err(OpError::NotFound);
        };
        if user.credit_seconds == 0 {
            return Err(OpError::Expired);
        }

        let mut ops = Vec::new();
        if let Some(mac) = identity.mac {
            if mac != user.mac {
                if let Some(owner) = self
                    .gw
                    .store
                    .find_by_mac(&mac)
                    .map_err(|e| OpError::Transient(e.to_string()))?
                {
                    if owner.user_id != user.user_id && owner.is_active() {
                        return Err(OpError::Conflict(format!(
                            "mac {mac} is owned by an active user"
                        )));
                    }
                }
                self.gw
                    .store
                    .claim_mac(&user.user_id, &mac)
                    .map_err(|e| OpError::Transient(e.to_string()))?;
                ops.push(EnforcementOp::Deauthorize(user.mac));
            }
        }
        if let Some(cookie) = &identity.client_id {
            self.gw
                .store
                .bind_cookie(&user.user_id, cookie)
                .map_err(|e| OpError::Transient(e.to_string()))?;
        }
        if let Some(ip) = identity.ip {
            self.gw
                .store
                .assign_ip(&user.user_id, ip)
                .map_err(|e| OpError::Transient(e.to_string()))?;
        }
        self.gw
            .store
            .resume(&user.user_id, now)
            .map_err(|e| OpError::Transient(e.to_string()))?;
        let restored = self
            .gw
            .store
            .get_user(&user.user_id)
            .map_err(|e| OpError::Transient(e.to_string()))?
            .ok_or(OpError::NotFound)?;
        ops.extend(authorize_ops(&restored));
        self.gw.enqueue(ops);
        info!(user_id = %restored.user_id, "session restored");
        Ok(RestoreReply {
            user_id: restored.user_id,
            credit_seconds: restored.credit_seconds,
        })
    }

    /// Claims the periodic free-time grant for the caller's MAC.
    ///
    /// # Errors
    ///
    /// - [`OpError::Invalid`] when the feature is off.
    /// - [`OpError::Busy`] during the per-MAC cooldown (does not count
    ///   toward the fail gate).
    pub fn claim_free_time(&self, identity: &Identity) -> Result<CreditReply, OpError> {
        let cfg = self.gw.cfg.free_time;
        if !cfg.enabled {
            return Err(OpError::Invalid("free time is not offered".to_string()));
        }
        let now = now_unix();
        let mac = identity.mac.ok_or(OpError::MissingMac)?;
        let key = format!("{FREE_CLAIM_PREFIX}{mac}");
        let last = self
            .gw
            .store
            .get_config(&key)
            .map_err(|e| OpError::Transient(e.to_string()))?
            .and_then(|v| v.parse::<i64>().ok());
        if let Some(last) = last {
            if now - last < cfg.cooldown_secs {
                return Err(OpError::Busy);
            }
        }
        let outcome = self.gw.applier.apply_grant(
            &mac,
            identity.client_id.as_deref(),
            identity.ip,
            u64::from(cfg.minutes) * 60,
            now,
        )?;
        self.gw
            .store
            .set_config(&key, &now.to_string())
            .map_err(|e| OpError::Transient(e.to_string()))?;
        self.gw.enqueue(outcome.ops.clone());
        self.gw
            .metrics
            .credited_seconds_total
            .inc_by(outcome.seconds_added);
        info!(%mac, seconds = outcome.seconds_added, "free time granted");
        Ok(CreditReply {
            seconds_added: outcome.seconds_added,
            amount: 0,
        })
    }

    /// Sales totals over `[from, to)` for operator reporting, bucketed
    /// by source and by local day in the configured tenant offset.
    ///
    /// # Errors
    ///
    /// Returns [`OpError::Transient`] on store failure.
    pub fn sales_summary(
        &self,
        from: i64,
        to: i64,
    ) -> Result<vendo_core::store::SalesSummary, OpError> {
        self.gw
            .store
            .sales_summary(from, to, self.gw.cfg.report.tz_offset_minutes)
            .map_err(|e| OpError::Transient(e.to_string()))
    }

    fn resolve_existing(&self, identity: &Identity, now: i64) -> Result<UserRecord, OpError> {
        let resolution = self.gw.resolver.resolve(identity, false, now)?;
        self.gw.enqueue(resolution.ops.clone());
        resolution.user.ok_or(OpError::NotFound)
    }

    fn free_time_status(
        &self,
        mac: Option<String>,
        now: i64,
    ) -> Result<Option<FreeTimeStatus>, OpError> {
        let cfg = self.gw.cfg.free_time;
        if !cfg.enabled {
            return Ok(None);
        }
        let Some(mac) = mac else {
            return Ok(Some(FreeTimeStatus {
                minutes: cfg.minutes,
                available: false,
                cooldown_remaining_secs: 0,
            }));
        };
        let key = format!("{FREE_CLAIM_PREFIX}{mac}");
        let last = self
            .gw
            .store
            .get_config(&key)
            .map_err(|e| OpError::Transient(e.to_string()))?
            .and_then(|v| v.parse::<i64>().ok());
        let remaining = last.map_or(0, |l| (l + cfg.cooldown_secs - now).max(0));
        Ok(Some(FreeTimeStatus {
            minutes: cfg.minutes,
            available: remaining == 0,
            cooldown_remaining_secs: remaining,
        }))
    }
}

/// Ops that put an active user back on the network.
fn authorize_ops(user: &UserRecord) -> Vec<EnforcementOp> {
    let mut ops = vec![EnforcementOp::Authorize(user.mac)];
    if let Some(ip) = user.ip {
        if user.rate_down_kbps > 0 || user.rate_up_kbps > 0 {
            ops.push(EnforcementOp::SetLimit {
                ip,
                down_kbps: user.rate_down_kbps,
                up_kbps: user.rate_up_kbps,
            });
        }
    }
    ops
}

/// Parses an observed IP string from the transport layer.
///
/// # Errors
///
/// Returns [`OpError::Invalid`] for anything but an IPv4 literal.
pub fn parse_client_ip(raw: &str) -> Result<Ipv4Addr, OpError> {
    raw.parse()
        .map_err(|_| OpError::Invalid(format!("bad client ip {raw:?}")))
}
