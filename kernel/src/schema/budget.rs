//! Resource budgets and their consumption state.
//!
//! # Invariant
//!
//! `consumed ≤ ceiling` for every [`BudgetDimension`] at every observation
//! point. A step that would exceed a ceiling is refused before it starts
//! (the governor checks `consumed + reserved + projected`). Actual usage that
//! overshoots a reservation is clamped at the ceiling and the dimension is
//! recorded in [`BudgetState::overrun`], which the orchestrator treats as an
//! automatic STOP for that dimension.
//!
//! Ceilings are hard: a ceiling of `0` means nothing may be spent.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A consumable resource with a ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetDimension {
    Tokens,
    WallClockMs,
    Steps,
    ToolCalls,
    CostUnits,
}

impl BudgetDimension {
    /// All dimensions, in the order the governor checks them.
    pub const ALL: [Self; 5] = [
        Self::Steps,
        Self::ToolCalls,
        Self::Tokens,
        Self::CostUnits,
        Self::WallClockMs,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Tokens => "tokens",
            Self::WallClockMs => "wall_clock_ms",
            Self::Steps => "steps",
            Self::ToolCalls => "tool_calls",
            Self::CostUnits => "cost_units",
        }
    }
}

impl fmt::Display for BudgetDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const DEFAULT_MAX_TOKENS: u64 = 1_000_000;
const DEFAULT_MAX_WALL_CLOCK_MS: u64 = 3_600_000;
const DEFAULT_MAX_STEPS: u64 = 100;
const DEFAULT_MAX_TOOL_CALLS: u64 = 500;
const DEFAULT_MAX_COST_UNITS: u64 = 10_000;

/// Ceilings for a run. Omitted fields take their defaults when deserialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Budgets {
    pub max_tokens: u64,
    pub max_wall_clock_ms: u64,
    pub max_steps: u64,
    pub max_tool_calls: u64,
    pub max_cost_units: u64,
}

impl Budgets {
    /// Ceiling for one dimension.
    #[must_use]
    pub const fn ceiling(&self, dimension: BudgetDimension) -> u64 {
        match dimension {
            BudgetDimension::Tokens => self.max_tokens,
            BudgetDimension::WallClockMs => self.max_wall_clock_ms,
            BudgetDimension::Steps => self.max_steps,
            BudgetDimension::ToolCalls => self.max_tool_calls,
            BudgetDimension::CostUnits => self.max_cost_units,
        }
    }
}

impl Default for Budgets {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
            max_wall_clock_ms: DEFAULT_MAX_WALL_CLOCK_MS,
            max_steps: DEFAULT_MAX_STEPS,
            max_tool_calls: DEFAULT_MAX_TOOL_CALLS,
            max_cost_units: DEFAULT_MAX_COST_UNITS,
        }
    }
}

/// An amount of each resource: a projection, a reservation, or actual usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceCost {
    #[serde(default)]
    pub tokens: u64,
    #[serde(default)]
    pub wall_clock_ms: u64,
    #[serde(default)]
    pub steps: u64,
    #[serde(default)]
    pub tool_calls: u64,
    #[serde(default)]
    pub cost_units: u64,
}

impl ResourceCost {
    #[must_use]
    pub const fn get(&self, dimension: BudgetDimension) -> u64 {
        match dimension {
            BudgetDimension::Tokens => self.tokens,
            BudgetDimension::WallClockMs => self.wall_clock_ms,
            BudgetDimension::Steps => self.steps,
            BudgetDimension::ToolCalls => self.tool_calls,
            BudgetDimension::CostUnits => self.cost_units,
        }
    }

    fn slot(&mut self, dimension: BudgetDimension) -> &mut u64 {
        match dimension {
            BudgetDimension::Tokens => &mut self.tokens,
            BudgetDimension::WallClockMs => &mut self.wall_clock_ms,
            BudgetDimension::Steps => &mut self.steps,
            BudgetDimension::ToolCalls => &mut self.tool_calls,
            BudgetDimension::CostUnits => &mut self.cost_units,
        }
    }

    pub fn set(&mut self, dimension: BudgetDimension, value: u64) {
        *self.slot(dimension) = value;
    }

    #[must_use]
    pub fn saturating_add(mut self, other: &Self) -> Self {
        for dim in BudgetDimension::ALL {
            let v = self.get(dim).saturating_add(other.get(dim));
            self.set(dim, v);
        }
        self
    }

    #[must_use]
    pub fn saturating_sub(mut self, other: &Self) -> Self {
        for dim in BudgetDimension::ALL {
            let v = self.get(dim).saturating_sub(other.get(dim));
            self.set(dim, v);
        }
        self
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        BudgetDimension::ALL.iter().all(|d| self.get(*d) == 0)
    }
}

/// Consumption of each budget against its ceiling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetState {
    pub ceilings: Budgets,
    pub consumed: ResourceCost,
    /// Outstanding pessimistic reservations for authorized, unfinished actions.
    pub reserved: ResourceCost,
    /// Dimensions whose actual usage exceeded what remained (clamped).
    #[serde(default)]
    pub overrun: Vec<BudgetDimension>,
}

impl BudgetState {
    #[must_use]
    pub fn new(ceilings: Budgets) -> Self {
        Self {
            ceilings,
            consumed: ResourceCost::default(),
            reserved: ResourceCost::default(),
            overrun: Vec::new(),
        }
    }

    /// `consumed + reserved + extra` for one dimension.
    #[must_use]
    pub fn projected(&self, dimension: BudgetDimension, extra: &ResourceCost) -> u64 {
        self.consumed
            .get(dimension)
            .saturating_add(self.reserved.get(dimension))
            .saturating_add(extra.get(dimension))
    }

    /// Headroom left after consumption and outstanding reservations.
    #[must_use]
    pub fn remaining(&self, dimension: BudgetDimension) -> u64 {
        self.ceilings
            .ceiling(dimension)
            .saturating_sub(self.projected(dimension, &ResourceCost::default()))
    }

    /// First dimension (in [`BudgetDimension::ALL`] order) that `extra` would
    /// push above its ceiling.
    #[must_use]
    pub fn would_exceed(&self, extra: &ResourceCost) -> Option<BudgetDimension> {
        BudgetDimension::ALL
            .into_iter()
            .find(|dim| self.projected(*dim, extra) > self.ceilings.ceiling(*dim))
    }

    /// Dimension that can no longer be honoured: an overrun, or elapsed
    /// wall-clock time at its ceiling. Spendable dimensions that are merely
    /// full are not exhausted; the governor refuses the next step instead.
    #[must_use]
    pub fn exhausted(&self) -> Option<BudgetDimension> {
        if let Some(dim) = self.overrun.first() {
            return Some(*dim);
        }
        (self.consumed.wall_clock_ms >= self.ceilings.max_wall_clock_ms)
            .then_some(BudgetDimension::WallClockMs)
    }

    pub fn reserve(&mut self, amount: &ResourceCost) {
        self.reserved = self.reserved.saturating_add(amount);
    }

    pub fn release(&mut self, reservation: &ResourceCost) {
        self.reserved = self.reserved.saturating_sub(reservation);
    }

    /// Replace a reservation with actual usage.
    ///
    /// Wall-clock time is observed from event timestamps, not charged here.
    /// Returns the dimensions whose usage had to be clamped.
    pub fn commit(
        &mut self,
        reservation: &ResourceCost,
        actual: &ResourceCost,
    ) -> Vec<BudgetDimension> {
        self.release(reservation);
        let mut clamped = Vec::new();
        for dim in BudgetDimension::ALL {
            if dim == BudgetDimension::WallClockMs {
                continue;
            }
            let ceiling = self.ceilings.ceiling(dim);
            let consumed = self.consumed.get(dim);
            let allowed = ceiling.saturating_sub(consumed);
            let want = actual.get(dim);
            if want > allowed {
                clamped.push(dim);
            }
            self.consumed.set(dim, consumed + want.min(allowed));
        }
        for dim in &clamped {
            if !self.overrun.contains(dim) {
                self.overrun.push(*dim);
            }
        }
        clamped
    }

    /// Record elapsed run time. Returns `true` once the ceiling is reached.
    pub fn observe_wall_clock(&mut self, elapsed_ms: u64) -> bool {
        let ceiling = self.ceilings.max_wall_clock_ms;
        self.consumed.wall_clock_ms = elapsed_ms.min(ceiling);
        elapsed_ms >= ceiling
    }

    /// `consumed ≤ ceiling` in every dimension.
    #[must_use]
    pub fn within_ceilings(&self) -> bool {
        BudgetDimension::ALL
            .iter()
            .all(|d| self.consumed.get(*d) <= self.ceilings.ceiling(*d))
    }
}
