//! The coin-insert state machine.
//!
//! One aggregator guards the appliance's single physical slot. A session
//! walks `Idle -> Open -> Committing -> Idle`; a pulse flood detours to a
//! temporary `Banned` state that drops the session uncommitted.
//!
//! ```text
//!            start_insert                 done / deadline
//!   Idle ───────────────────▶ Open ─────────────────────▶ Committing
//!    ▲                        │  ▲                             │
//!    │        flood ban       │  │ pulse (refreshes 30 s       │ commit_done /
//!    │  ◀─────────────────────┘  │ window, bounded by the      │ abort
//!    │        Banned(until)      │ 60 s absolute deadline)     │
//!    └───────────────────────────┴─────────────────────────────┘
//! ```
//!
//! # Invariants
//!
//! - At most one session exists; a second owner gets `busy`.
//! - In manual mode only the targeted source contributes; everything else
//!   is dropped and logged.
//! - The per-source pulse multiplier is applied here, so
//!   `pending_amount` always equals the sum over `per_source_amount`.
//! - A commit ticket survives applier failure: the aggregator leaves
//!   `Committing` only on terminal success or explicit abort.
//!
//! Timing uses [`Instant`] passed in by the caller, which keeps every
//! transition deterministic under test.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::{InsertMode, SourceId};
use crate::config::CoinConfig;
use crate::error::OpError;
use crate::net::MacAddr;

/// The identity that opened the window and will receive the credit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertOwner {
    /// MAC the credit commits to.
    pub mac: MacAddr,
    /// Cookie forwarded into the credit transaction.
    pub client_id: Option<String>,
    /// Last known IP, forwarded for shaping.
    pub ip: Option<std::net::Ipv4Addr>,
}

/// Command for the slot relay adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayCommand {
    /// Power the coin slot so it accepts coins.
    Energize,
    /// Cut slot power.
    Deenergize,
}

/// What ended an insert window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitTrigger {
    /// The owner pressed done.
    Done,
    /// The pulse-idle or absolute deadline fired.
    Deadline,
    /// An operator tore the session down.
    Teardown,
}

/// The accumulated amount handed to the credit applier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitTicket {
    /// Who gets the credit.
    pub owner: InsertOwner,
    /// Pesos per contributing source.
    pub per_source_amount: BTreeMap<SourceId, u32>,
    /// Total pesos; always the sum of `per_source_amount`.
    pub amount: u32,
    /// Why the window closed.
    pub trigger: CommitTrigger,
}

/// Outcome of feeding one pulse event in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PulseOutcome {
    /// The pulse counted.
    Accepted {
        /// New pending total in pesos.
        pending_amount: u32,
    },
    /// The pulse was dropped (no session, wrong source, commit in flight).
    Dropped {
        /// Log-friendly reason.
        reason: &'static str,
    },
    /// The pulse tripped the flood ban; the session is gone.
    Banned {
        /// When the aggregator accepts sessions again.
        until: Instant,
    },
}

/// A read-only view of the aggregator for status replies.
#[derive(Debug, Clone, Default)]
pub struct AggregatorSnapshot {
    /// `idle`, `open`, `committing`, or `banned`.
    pub state: &'static str,
    /// Owner MAC of the open or committing session.
    pub owner_mac: Option<MacAddr>,
    /// Pending pesos.
    pub pending_amount: u32,
    /// Pending pesos per source.
    pub per_source_amount: BTreeMap<SourceId, u32>,
    /// Insert mode of the open session.
    pub mode: Option<InsertMode>,
    /// Manual-mode target.
    pub target: Option<SourceId>,
    /// Seconds until the window closes on its own.
    pub deadline_secs: Option<u64>,
}

#[derive(Debug)]
struct OpenSession {
    owner: InsertOwner,
    mode: InsertMode,
    target: Option<SourceId>,
    per_source: BTreeMap<SourceId, u32>,
    pending_amount: u32,
    opened_at: Instant,
    deadline: Instant,
    absolute_deadline: Instant,
    /// Recent pulse events for flood detection: (arrival, count).
    pulse_window: VecDeque<(Instant, u32)>,
}

#[derive(Debug)]
enum State {
    Idle,
    Open(OpenSession),
    Committing(CommitTicket),
    Banned { until: Instant },
}

/// The per-appliance coin aggregator.
#[derive(Debug)]
pub struct CoinAggregator {
    cfg: CoinConfig,
    state: State,
}

impl CoinAggregator {
    /// Creates an idle aggregator.
    #[must_use]
    pub const fn new(cfg: CoinConfig) -> Self {
        Self {
            cfg,
            state: State::Idle,
        }
    }

    /// Replaces timing and flood limits. Applies to the next session; an
    /// open window keeps its current deadlines.
    pub fn reconfigure(&mut self, cfg: CoinConfig) {
        self.cfg = cfg;
    }

    /// Opens an insert window, or re-opens the current one for the same
    /// owner (pending amount preserved, deadlines restarted).
    ///
    /// Returns the relay commands the slot adapter must apply.
    ///
    /// # Errors
    ///
    /// - [`OpError::Busy`] while another owner holds the window or a
    ///   commit is in flight.
    /// - [`OpError::Banned`] during a flood ban.
    pub fn start_insert(
        &mut self,
        owner: InsertOwner,
        mode: InsertMode,
        target: Option<SourceId>,
        now: Instant,
    ) -> Result<Vec<RelayCommand>, OpError> {
        self.expire_ban(now);
        match &mut self.state {
            State::Banned { until } => Err(OpError::Banned {
                remaining_secs: remaining_secs(*until, now),
            }),
            State::Committing(_) => Err(OpError::Busy),
            State::Open(session) if session.owner.mac != owner.mac => Err(OpError::Busy),
            State::Open(session) => {
                // Same owner re-opens: keep the money, restart the clocks.
                session.owner = owner;
                session.mode = mode;
                session.target = target;
                session.opened_at = now;
                session.deadline = now + Duration::from_secs(self.cfg.pulse_idle_secs);
                session.absolute_deadline = now + Duration::from_secs(self.cfg.absolute_secs);
                debug!(mac = %session.owner.mac, pending = session.pending_amount, "insert window re-opened");
                Ok(vec![relay_for(mode, session.target.as_ref())])
            },
            State::Idle => {
                let relay = relay_for(mode, target.as_ref());
                info!(mac = %owner.mac, ?mode, "insert window opened");
                self.state = State::Open(OpenSession {
                    owner,
                    mode,
                    target,
                    per_source: BTreeMap::new(),
                    pending_amount: 0,
                    opened_at: now,
                    deadline: now + Duration::from_secs(self.cfg.pulse_idle_secs),
                    absolute_deadline: now + Duration::from_secs(self.cfg.absolute_secs),
                    pulse_window: VecDeque::new(),
                });
                Ok(vec![relay])
            },
        }
    }

    /// Feeds one pulse event in. The multiplier is applied here:
    /// `count * pulse_value_pesos` lands in the pending amount.
    pub fn pulse(
        &mut self,
        source: &SourceId,
        count: u32,
        pulse_value_pesos: u32,
        now: Instant,
    ) -> PulseOutcome {
        self.expire_ban(now);
        let State::Open(session) = &mut self.state else {
            warn!(%source, count, "pulse dropped: no open insert window");
            return PulseOutcome::Dropped {
                reason: "no open session",
            };
        };

        if session.mode == InsertMode::Manual && session.target.as_ref() != Some(source) {
            warn!(%source, count, target = ?session.target, "pulse dropped: not the manual target");
            return PulseOutcome::Dropped {
                reason: "not the manual target",
            };
        }

        // Flood detection over a sliding window.
        let window = Duration::from_secs(self.cfg.ban_window_secs);
        while let Some((t, _)) = session.pulse_window.front() {
            if now.duration_since(*t) > window {
                session.pulse_window.pop_front();
            } else {
                break;
            }
        }
        session.pulse_window.push_back((now, count));
        let in_window: u32 = session.pulse_window.iter().map(|(_, c)| *c).sum();
        if in_window > self.cfg.ban_limit_pulses_per_window {
            let until = now + Duration::from_secs(self.cfg.ban_duration_secs);
            warn!(
                %source,
                pulses = in_window,
                limit = self.cfg.ban_limit_pulses_per_window,
                "pulse flood: session dropped, aggregator banned"
            );
            self.state = State::Banned { until };
            return PulseOutcome::Banned { until };
        }

        let pesos = count.saturating_mul(pulse_value_pesos.max(1));
        *session.per_source.entry(source.clone()).or_insert(0) += pesos;
        session.pending_amount = session.pending_amount.saturating_add(pesos);
        session.deadline =
            (now + Duration::from_secs(self.cfg.pulse_idle_secs)).min(session.absolute_deadline);
        debug!(%source, pesos, pending = session.pending_amount, "pulse accepted");
        PulseOutcome::Accepted {
            pending_amount: session.pending_amount,
        }
    }

    /// Closes the window on the owner's explicit done.
    ///
    /// `caller_mac = None` is an administrative close.
    ///
    /// # Errors
    ///
    /// - [`OpError::NotFound`] with no open session.
    /// - [`OpError::Busy`] when a different owner tries to close it.
    pub fn finish(&mut self, caller_mac: Option<&MacAddr>) -> Result<CommitTicket, OpError> {
        match &self.state {
            State::Open(session) => {
                if let Some(mac) = caller_mac {
                    if *mac != session.owner.mac {
                        return Err(OpError::Busy);
                    }
                }
                let trigger = if caller_mac.is_some() {
                    CommitTrigger::Done
                } else {
                    CommitTrigger::Teardown
                };
                Ok(self.begin_commit(trigger))
            },
            _ => Err(OpError::NotFound),
        }
    }

    /// Fires expired deadlines. Returns the commit ticket when the open
    /// window just closed; the caller must drive the applier and then
    /// call [`commit_done`](Self::commit_done) or retry via
    /// [`pending_commit`](Self::pending_commit).
    pub fn poll_deadline(&mut self, now: Instant) -> Option<CommitTicket> {
        self.expire_ban(now);
        let State::Open(session) = &self.state else {
            return None;
        };
        if now >= session.deadline || now >= session.absolute_deadline {
            info!(
                mac = %session.owner.mac,
                pending = session.pending_amount,
                open_secs = now.duration_since(session.opened_at).as_secs(),
                "insert window deadline fired"
            );
            return Some(self.begin_commit(CommitTrigger::Deadline));
        }
        None
    }

    /// The ticket of an in-flight commit, for applier retries.
    #[must_use]
    pub fn pending_commit(&self) -> Option<CommitTicket> {
        match &self.state {
            State::Committing(ticket) => Some(ticket.clone()),
            _ => None,
        }
    }

    /// Terminal success of the applier: the slot is free again.
    pub fn commit_done(&mut self) -> Vec<RelayCommand> {
        if matches!(self.state, State::Committing(_)) {
            self.state = State::Idle;
        }
        vec![RelayCommand::Deenergize]
    }

    /// Administrative teardown from any state. The pending amount, if
    /// any, is discarded and logged.
    pub fn abort(&mut self) -> Vec<RelayCommand> {
        match &self.state {
            State::Open(session) if session.pending_amount > 0 => {
                warn!(
                    mac = %session.owner.mac,
                    discarded = session.pending_amount,
                    "insert session aborted with pending amount"
                );
            },
            State::Committing(ticket) if ticket.amount > 0 => {
                warn!(
                    mac = %ticket.owner.mac,
                    discarded = ticket.amount,
                    "in-flight commit aborted"
                );
            },
            _ => {},
        }
        self.state = State::Idle;
        vec![RelayCommand::Deenergize]
    }

    /// Point-in-time view for status replies.
    #[must_use]
    pub fn snapshot(&self, now: Instant) -> AggregatorSnapshot {
        match &self.state {
            State::Idle => AggregatorSnapshot {
                state: "idle",
                ..AggregatorSnapshot::default()
            },
            State::Banned { until } => AggregatorSnapshot {
                state: "banned",
                deadline_secs: Some(remaining_secs(*until, now).unsigned_abs()),
                ..AggregatorSnapshot::default()
            },
            State::Committing(ticket) => AggregatorSnapshot {
                state: "committing",
                owner_mac: Some(ticket.owner.mac),
                pending_amount: ticket.amount,
                per_source_amount: ticket.per_source_amount.clone(),
                ..AggregatorSnapshot::default()
            },
            State::Open(session) => AggregatorSnapshot {
                state: "open",
                owner_mac: Some(session.owner.mac),
                pending_amount: session.pending_amount,
                per_source_amount: session.per_source.clone(),
                mode: Some(session.mode),
                target: session.target.clone(),
                deadline_secs: Some(
                    session
                        .deadline
                        .min(session.absolute_deadline)
                        .saturating_duration_since(now)
                        .as_secs(),
                ),
            },
        }
    }

    fn begin_commit(&mut self, trigger: CommitTrigger) -> CommitTicket {
        let State::Open(session) = std::mem::replace(&mut self.state, State::Idle) else {
            unreachable!("begin_commit called outside Open");
        };
        let ticket = CommitTicket {
            owner: session.owner,
            amount: session.per_source.values().sum(),
            per_source_amount: session.per_source,
            trigger,
        };
        self.state = State::Committing(ticket.clone());
        ticket
    }

    fn expire_ban(&mut self, now: Instant) {
        if let State::Banned { until } = &self.state {
            if now >= *until {
                info!("pulse-flood ban expired");
                self.state = State::Idle;
            }
        }
    }
}

fn relay_for(mode: InsertMode, target: Option<&SourceId>) -> RelayCommand {
    // The local slot is powered whenever it may legitimately take coins:
    // auto mode, or manual mode targeting the hardware slot itself.
    match mode {
        InsertMode::Auto => RelayCommand::Energize,
        InsertMode::Manual => {
            if target.is_some_and(SourceId::is_hardware) {
                RelayCommand::Energize
            } else {
                RelayCommand::Deenergize
            }
        },
    }
}

fn remaining_secs(until: Instant, now: Instant) -> i64 {
    i64::try_from(until.saturating_duration_since(now).as_secs()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(n: u8) -> MacAddr {
        MacAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, n])
    }

    fn owner(n: u8) -> InsertOwner {
        InsertOwner {
            mac: mac(n),
            client_id: Some(format!("C{n}")),
            ip: None,
        }
    }

    fn cfg() -> CoinConfig {
        CoinConfig::default()
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_open_accumulates_and_commits_on_done() {
        let mut agg = CoinAggregator::new(cfg());
        let t0 = Instant::now();
        let relay = agg
            .start_insert(owner(1), InsertMode::Auto, None, t0)
            .unwrap();
        assert_eq!(relay, vec![RelayCommand::Energize]);

        assert_eq!(
            agg.pulse(&SourceId::Hardware, 3, 1, t0 + secs(1)),
            PulseOutcome::Accepted { pending_amount: 3 }
        );
        let ticket = agg.finish(Some(&mac(1))).unwrap();
        assert_eq!(ticket.amount, 3);
        assert_eq!(ticket.trigger, CommitTrigger::Done);
        assert_eq!(
            ticket.per_source_amount.get(&SourceId::Hardware),
            Some(&3)
        );

        // Commit in flight: pulses are dropped, the slot stays busy.
        assert!(matches!(
            agg.pulse(&SourceId::Hardware, 1, 1, t0 + secs(3)),
            PulseOutcome::Dropped { .. }
        ));
        assert_eq!(
            agg.start_insert(owner(1), InsertMode::Auto, None, t0 + secs(3)),
            Err(OpError::Busy)
        );

        assert_eq!(agg.commit_done(), vec![RelayCommand::Deenergize]);
        assert!(agg.pending_commit().is_none());
        assert_eq!(agg.snapshot(t0 + secs(4)).state, "idle");
    }

    #[test]
    fn test_busy_for_other_owner() {
        let mut agg = CoinAggregator::new(cfg());
        let t0 = Instant::now();
        agg.start_insert(owner(1), InsertMode::Auto, None, t0).unwrap();
        assert_eq!(
            agg.start_insert(owner(2), InsertMode::Auto, None, t0 + secs(1)),
            Err(OpError::Busy)
        );
        // Only the owner (or an admin) may close it.
        assert_eq!(agg.finish(Some(&mac(2))), Err(OpError::Busy));
    }

    #[test]
    fn test_same_owner_reopen_preserves_pending() {
        let mut agg = CoinAggregator::new(cfg());
        let t0 = Instant::now();
        agg.start_insert(owner(1), InsertMode::Auto, None, t0).unwrap();
        agg.pulse(&SourceId::Hardware, 5, 1, t0 + secs(1));
        agg.start_insert(owner(1), InsertMode::Auto, None, t0 + secs(2))
            .unwrap();
        let snap = agg.snapshot(t0 + secs(2));
        assert_eq!(snap.state, "open");
        assert_eq!(snap.pending_amount, 5);
    }

    #[test]
    fn test_pulse_idle_deadline_commits() {
        // S2: one pulse of 5 then silence; the 30 s window fires.
        let mut agg = CoinAggregator::new(cfg());
        let t0 = Instant::now();
        agg.start_insert(owner(1), InsertMode::Auto, None, t0).unwrap();
        agg.pulse(&SourceId::Hardware, 5, 1, t0 + secs(1));

        assert!(agg.poll_deadline(t0 + secs(30)).is_none());
        let ticket = agg.poll_deadline(t0 + secs(32)).unwrap();
        assert_eq!(ticket.amount, 5);
        assert_eq!(ticket.trigger, CommitTrigger::Deadline);
        assert_eq!(agg.commit_done(), vec![RelayCommand::Deenergize]);
    }

    #[test]
    fn test_pulse_refreshes_deadline() {
        let mut agg = CoinAggregator::new(cfg());
        let t0 = Instant::now();
        agg.start_insert(owner(1), InsertMode::Auto, None, t0).unwrap();
        agg.pulse(&SourceId::Hardware, 1, 1, t0 + secs(20));
        // Without the refresh this would have fired at t0+30.
        assert!(agg.poll_deadline(t0 + secs(35)).is_none());
        assert!(agg.poll_deadline(t0 + secs(51)).is_some());
    }

    #[test]
    fn test_absolute_deadline_caps_the_window() {
        let mut agg = CoinAggregator::new(cfg());
        let t0 = Instant::now();
        agg.start_insert(owner(1), InsertMode::Auto, None, t0).unwrap();
        // Keep pulsing every 20 s; the 60 s absolute deadline still closes it.
        agg.pulse(&SourceId::Hardware, 1, 1, t0 + secs(20));
        agg.pulse(&SourceId::Hardware, 1, 1, t0 + secs(40));
        agg.pulse(&SourceId::Hardware, 1, 1, t0 + secs(55));
        let ticket = agg.poll_deadline(t0 + secs(60)).unwrap();
        assert_eq!(ticket.amount, 3);
    }

    #[test]
    fn test_deadline_with_zero_amount_yields_noop_ticket() {
        let mut agg = CoinAggregator::new(cfg());
        let t0 = Instant::now();
        agg.start_insert(owner(1), InsertMode::Auto, None, t0).unwrap();
        let ticket = agg.poll_deadline(t0 + secs(31)).unwrap();
        assert_eq!(ticket.amount, 0);
        assert!(ticket.per_source_amount.is_empty());
    }

    #[test]
    fn test_manual_mode_filters_sources() {
        // S3: manual targeting remote:A; hardware pulses are dropped.
        let mut agg = CoinAggregator::new(cfg());
        let t0 = Instant::now();
        let remote = SourceId::remote("A");
        let relay = agg
            .start_insert(owner(1), InsertMode::Manual, Some(remote.clone()), t0)
            .unwrap();
        // Remote target keeps the local slot dark.
        assert_eq!(relay, vec![RelayCommand::Deenergize]);

        assert!(matches!(
            agg.pulse(&SourceId::Hardware, 2, 1, t0 + secs(1)),
            PulseOutcome::Dropped { .. }
        ));
        assert_eq!(
            agg.pulse(&remote, 3, 1, t0 + secs(2)),
            PulseOutcome::Accepted { pending_amount: 3 }
        );

        let ticket = agg.finish(Some(&mac(1))).unwrap();
        assert_eq!(ticket.amount, 3);
        assert_eq!(ticket.per_source_amount.len(), 1);
        assert_eq!(ticket.per_source_amount.get(&remote), Some(&3));
    }

    #[test]
    fn test_manual_targeting_hardware_energizes() {
        let mut agg = CoinAggregator::new(cfg());
        let t0 = Instant::now();
        let relay = agg
            .start_insert(owner(1), InsertMode::Manual, Some(SourceId::Hardware), t0)
            .unwrap();
        assert_eq!(relay, vec![RelayCommand::Energize]);
    }

    #[test]
    fn test_multiplier_applied_per_source() {
        let mut agg = CoinAggregator::new(cfg());
        let t0 = Instant::now();
        let remote = SourceId::remote("booth-a");
        agg.start_insert(owner(1), InsertMode::Auto, None, t0).unwrap();
        // A 5-peso-per-pulse remote device sends 2 pulses.
        assert_eq!(
            agg.pulse(&remote, 2, 5, t0 + secs(1)),
            PulseOutcome::Accepted { pending_amount: 10 }
        );
        agg.pulse(&SourceId::Hardware, 1, 1, t0 + secs(2));
        let ticket = agg.finish(Some(&mac(1))).unwrap();
        assert_eq!(ticket.amount, 11);
        assert_eq!(ticket.per_source_amount.get(&remote), Some(&10));
    }

    #[test]
    fn test_pulse_in_idle_dropped() {
        let mut agg = CoinAggregator::new(cfg());
        assert!(matches!(
            agg.pulse(&SourceId::Hardware, 1, 1, Instant::now()),
            PulseOutcome::Dropped { .. }
        ));
    }

    #[test]
    fn test_flood_ban_drops_session() {
        let mut agg = CoinAggregator::new(CoinConfig {
            ban_limit_pulses_per_window: 5,
            ..cfg()
        });
        let t0 = Instant::now();
        agg.start_insert(owner(1), InsertMode::Auto, None, t0).unwrap();
        for i in 0..5 {
            assert!(matches!(
                agg.pulse(&SourceId::Hardware, 1, 1, t0 + Duration::from_millis(i * 100)),
                PulseOutcome::Accepted { .. }
            ));
        }
        let outcome = agg.pulse(&SourceId::Hardware, 1, 1, t0 + secs(1));
        assert!(matches!(outcome, PulseOutcome::Banned { .. }));

        // Nothing commits; new sessions are rejected until the ban lifts.
        assert!(agg.pending_commit().is_none());
        assert!(matches!(
            agg.start_insert(owner(2), InsertMode::Auto, None, t0 + secs(2)),
            Err(OpError::Banned { .. })
        ));
        assert!(agg
            .start_insert(owner(2), InsertMode::Auto, None, t0 + secs(302))
            .is_ok());
    }

    #[test]
    fn test_commit_retained_until_terminal_success() {
        let mut agg = CoinAggregator::new(cfg());
        let t0 = Instant::now();
        agg.start_insert(owner(1), InsertMode::Auto, None, t0).unwrap();
        agg.pulse(&SourceId::Hardware, 4, 1, t0 + secs(1));
        let ticket = agg.finish(Some(&mac(1))).unwrap();

        // The applier failed: the ticket stays retrievable.
        let retry = agg.pending_commit().unwrap();
        assert_eq!(retry, ticket);
        assert_eq!(agg.snapshot(t0 + secs(3)).state, "committing");

        agg.commit_done();
        assert!(agg.pending_commit().is_none());
    }

    #[test]
    fn test_abort_discards_pending() {
        let mut agg = CoinAggregator::new(cfg());
        let t0 = Instant::now();
        agg.start_insert(owner(1), InsertMode::Auto, None, t0).unwrap();
        agg.pulse(&SourceId::Hardware, 4, 1, t0 + secs(1));
        assert_eq!(agg.abort(), vec![RelayCommand::Deenergize]);
        assert_eq!(agg.snapshot(t0 + secs(2)).state, "idle");
        // The discarded pesos never become a ticket.
        assert!(agg.pending_commit().is_none());
    }
}
