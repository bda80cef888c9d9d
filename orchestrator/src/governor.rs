//! Autonomy governor: decides whether a planned action may run.
//!
//! Checks run in a fixed order and the first that applies wins:
//!
//! 1. Mode is `Stopped` → deny.
//! 2. A budget is exhausted, or the pessimistic reservation would push a
//!    dimension over its ceiling → deny with that dimension.
//! 3. The action's risk rule needs an operator in the current mode →
//!    require confirmation.
//! 4. Otherwise approve, with the reservation to hold until the task settles.
//!
//! The governor is pure. The kernel records its verdicts as events.

use keel_kernel::schema::{
    AutonomyMode, BudgetState, DenialReason, PlannedAction, ResourceCost, RiskLevel, RiskPolicy,
    RiskRule,
};

/// The governor's verdict on one planned action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Approve { reservation: ResourceCost },
    Deny(DenialReason),
    RequireConfirmation { rule: RiskRule },
}

/// Amount to reserve for `action`: the planner's estimate, charged at least
/// one step, and one tool call for tool actions.
#[must_use]
pub fn reservation_for(action: &PlannedAction) -> ResourceCost {
    let mut reservation = action.estimated_cost;
    reservation.steps = reservation.steps.max(1);
    if action.kind.is_tool_call() {
        reservation.tool_calls = reservation.tool_calls.max(1);
    }
    reservation
}

/// Whether `level` needs an operator under `mode`.
#[must_use]
pub const fn requires_confirmation(mode: AutonomyMode, level: RiskLevel) -> bool {
    match mode {
        AutonomyMode::Autonomous => matches!(level, RiskLevel::Critical),
        AutonomyMode::Supervised => matches!(level, RiskLevel::Elevated | RiskLevel::Critical),
        AutonomyMode::Manual | AutonomyMode::Stopped => true,
    }
}

fn check_budget(action: &PlannedAction, budget: &BudgetState) -> Result<ResourceCost, Decision> {
    if let Some(dimension) = budget.exhausted() {
        return Err(Decision::Deny(DenialReason::BudgetExceeded { dimension }));
    }
    let reservation = reservation_for(action);
    if let Some(dimension) = budget.would_exceed(&reservation) {
        return Err(Decision::Deny(DenialReason::BudgetExceeded { dimension }));
    }
    Ok(reservation)
}

/// Decide on `action`. `budget` must reflect elapsed wall-clock time.
#[must_use]
pub fn authorize(
    action: &PlannedAction,
    budget: &BudgetState,
    mode: AutonomyMode,
    policy: &RiskPolicy,
) -> Decision {
    if mode == AutonomyMode::Stopped {
        return Decision::Deny(DenialReason::Stopped);
    }
    let reservation = match check_budget(action, budget) {
        Ok(reservation) => reservation,
        Err(denial) => return denial,
    };
    let rule = policy.rule_for(action.kind).cloned().unwrap_or(RiskRule {
        action: action.kind,
        level: RiskLevel::Low,
    });
    if requires_confirmation(mode, rule.level) {
        tracing::info!(action = %action.kind, mode = mode.as_str(), "confirmation required");
        return Decision::RequireConfirmation { rule };
    }
    Decision::Approve { reservation }
}

/// Decide on an action an operator has already approved. The stop and
/// budget checks still apply; the risk check does not.
#[must_use]
pub fn authorize_confirmed(
    action: &PlannedAction,
    budget: &BudgetState,
    mode: AutonomyMode,
) -> Decision {
    if mode == AutonomyMode::Stopped {
        return Decision::Deny(DenialReason::Stopped);
    }
    match check_budget(action, budget) {
        Ok(reservation) => Decision::Approve { reservation },
        Err(denial) => denial,
    }
}

/// Mode after a drift review: one level less autonomous, but never past
/// `floor`. A mode already at or below the floor is kept.
#[must_use]
pub fn review_drift(mode: AutonomyMode, floor: AutonomyMode) -> AutonomyMode {
    if mode >= floor {
        mode
    } else {
        mode.downgrade()
    }
}

/// `budget` with wall-clock consumption brought up to `elapsed_ms`.
#[must_use]
pub fn with_elapsed(budget: &BudgetState, elapsed_ms: u64) -> BudgetState {
    let mut budget = budget.clone();
    budget.observe_wall_clock(elapsed_ms);
    budget
}
