//! The price table: peso amounts mapped to minutes and speed caps.
//!
//! A [`RateTable`] is an immutable snapshot loaded from the store. Sources
//! may carry a visibility mask restricting which lines their coins can buy;
//! an empty mask means the full table applies.

mod planner;

pub use planner::RatePlan;

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::coin::SourceId;

/// One line of the price table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rate {
    /// Store row id.
    pub id: i64,
    /// Price in whole pesos. Always positive.
    pub amount_pesos: u32,
    /// Minutes of credit this line buys. Always positive.
    pub minutes: u32,
    /// Upload cap in kbit/s.
    pub up_kbps: u32,
    /// Download cap in kbit/s.
    pub down_kbps: u32,
}

/// An immutable snapshot of the price table with per-source visibility.
#[derive(Debug, Clone, Default)]
pub struct RateTable {
    lines: Vec<Rate>,
    /// Rate ids visible to a source, keyed by the source's canonical name.
    /// Absent or empty set means the source sees the whole table.
    visibility: HashMap<String, HashSet<i64>>,
}

impl RateTable {
    /// Builds a table from raw lines and a visibility mask.
    ///
    /// Lines with a zero amount or zero minutes are dropped; they can never
    /// participate in a plan and would stall the planner's DP pass.
    #[must_use]
    pub fn new(lines: Vec<Rate>, visibility: HashMap<String, HashSet<i64>>) -> Self {
        let lines = lines
            .into_iter()
            .filter(|r| r.amount_pesos > 0 && r.minutes > 0)
            .collect();
        Self { lines, visibility }
    }

    /// All lines, unordered.
    #[must_use]
    pub fn lines(&self) -> &[Rate] {
        &self.lines
    }

    /// Returns `true` if the table has no usable lines.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// The lines a given source may sell. `None` falls back to the full
    /// table, as does a source with no (or an empty) mask.
    #[must_use]
    pub fn visible_for(&self, source: Option<&SourceId>) -> Vec<Rate> {
        if let Some(source) = source {
            if let Some(mask) = self.visibility.get(&source.to_string()) {
                if !mask.is_empty() {
                    return self
                        .lines
                        .iter()
                        .filter(|r| mask.contains(&r.id))
                        .copied()
                        .collect();
                }
            }
        }
        self.lines.clone()
    }

    /// Computes the maximum minutes purchasable for `amount` pesos using the
    /// lines visible to `source`. See [`planner`] for the algorithm.
    #[must_use]
    pub fn plan(&self, amount: u32, source: Option<&SourceId>) -> RatePlan {
        planner::plan(&self.visible_for(source), amount)
    }
}
