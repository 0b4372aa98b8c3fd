//! The rate planner: exact-amount maximization of minutes.
//!
//! Three passes:
//!
//! 1. **Greedy**: lines sorted by amount descending (minutes descending on
//!    ties), taking as many copies of each as fit. This is the floor the
//!    refinement must match or beat, and the only answer for amounts past
//!    the DP bound.
//! 2. **DP refinement**: an unbounded-knapsack pass over `0..=amount`
//!    finds the exact-fit plan with maximum minutes (fewest lines on
//!    ties). It replaces the greedy answer whenever it spends the full
//!    amount and buys at least as much — greedy alone overpays on tables
//!    where a mid-sized line is the better deal.
//! 3. **Base fallback**: when no exact combination exists and greedy made
//!    no progress, the `amount=1` line scales linearly. Without a base
//!    line the planner fails closed to zero.
//!
//! The result carries the max upload/download caps across the lines the
//! winning plan actually used.

use super::Rate;

/// Upper bound on the DP table size. Amounts past this are planned by the
/// greedy pass alone; a single credit of this size does not occur on a
/// coin-operated appliance.
const MAX_DP_AMOUNT: u32 = 100_000;

/// The planner's answer for one amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RatePlan {
    /// Minutes purchased. Zero means the planner failed closed.
    pub minutes: u32,
    /// Upload cap: max across the lines used.
    pub up_kbps: u32,
    /// Download cap: max across the lines used.
    pub down_kbps: u32,
    /// Number of line copies in the plan. Used for tie-breaking and audit.
    pub lines_used: u32,
}

impl RatePlan {
    /// The failed-closed plan.
    #[must_use]
    pub const fn zero() -> Self {
        Self {
            minutes: 0,
            up_kbps: 0,
            down_kbps: 0,
            lines_used: 0,
        }
    }

    /// Seconds of credit this plan grants.
    #[must_use]
    pub const fn seconds(&self) -> u64 {
        self.minutes as u64 * 60
    }
}

/// Plans `amount` pesos against the visible lines. Pure; see module docs.
#[must_use]
pub fn plan(lines: &[Rate], amount: u32) -> RatePlan {
    if amount == 0 || lines.is_empty() {
        return RatePlan::zero();
    }

    let mut sorted: Vec<Rate> = lines.to_vec();
    sorted.sort_by(|a, b| {
        b.amount_pesos
            .cmp(&a.amount_pesos)
            .then(b.minutes.cmp(&a.minutes))
    });

    let (greedy, remainder) = greedy_pass(&sorted, amount);

    if amount <= MAX_DP_AMOUNT {
        if let Some(exact) = dp_pass(&sorted, amount) {
            let wins = exact.minutes > greedy.minutes
                || (exact.minutes == greedy.minutes
                    && (remainder != 0 || exact.lines_used <= greedy.lines_used));
            if wins {
                return exact;
            }
            // The exact fit buys less than the greedy overshoot; keep
            // greedy and let the remainder go unspent.
            return greedy;
        }
    }

    if remainder == 0 || greedy.minutes > 0 {
        return greedy;
    }

    base_fallback(&sorted, amount)
}

fn greedy_pass(sorted: &[Rate], amount: u32) -> (RatePlan, u32) {
    let mut remaining = amount;
    let mut result = RatePlan::zero();
    for line in sorted {
        let copies = remaining / line.amount_pesos;
        if copies == 0 {
            continue;
        }
        remaining -= copies * line.amount_pesos;
        result.minutes = result.minutes.saturating_add(copies * line.minutes);
        result.lines_used = result.lines_used.saturating_add(copies);
        result.up_kbps = result.up_kbps.max(line.up_kbps);
        result.down_kbps = result.down_kbps.max(line.down_kbps);
        if remaining == 0 {
            break;
        }
    }
    (result, remaining)
}

/// Unbounded knapsack maximizing `(minutes, -lines)` at each exact value.
/// Returns `None` when `amount` is unreachable.
fn dp_pass(lines: &[Rate], amount: u32) -> Option<RatePlan> {
    let n = amount as usize;
    // best[v] = (minutes, lines) for exactly v pesos; choice[v] = line index.
    let mut best: Vec<Option<(u32, u32)>> = vec![None; n + 1];
    let mut choice: Vec<usize> = vec![usize::MAX; n + 1];
    best[0] = Some((0, 0));

    for v in 1..=n {
        for (idx, line) in lines.iter().enumerate() {
            let a = line.amount_pesos as usize;
            if a > v {
                continue;
            }
            let Some((prev_minutes, prev_lines)) = best[v - a] else {
                continue;
            };
            let cand = (
                prev_minutes.saturating_add(line.minutes),
                prev_lines.saturating_add(1),
            );
            let better = match best[v] {
                None => true,
                Some((m, l)) => cand.0 > m || (cand.0 == m && cand.1 < l),
            };
            if better {
                best[v] = Some(cand);
                choice[v] = idx;
            }
        }
    }

    let (minutes, lines_used) = best[n]?;
    // Walk the choices back to recover which lines set the speed caps.
    let mut up = 0;
    let mut down = 0;
    let mut v = n;
    while v > 0 {
        let line = &lines[choice[v]];
        up = up.max(line.up_kbps);
        down = down.max(line.down_kbps);
        v -= line.amount_pesos as usize;
    }
    Some(RatePlan {
        minutes,
        up_kbps: up,
        down_kbps: down,
        lines_used,
    })
}

fn base_fallback(lines: &[Rate], amount: u32) -> RatePlan {
    lines
        .iter()
        .find(|l| l.amount_pesos == 1)
        .map_or_else(RatePlan::zero, |base| RatePlan {
            minutes: base.minutes.saturating_mul(amount),
            up_kbps: base.up_kbps,
            down_kbps: base.down_kbps,
            lines_used: amount,
        })
}
