//! Shared vocabulary: identifiers, budgets, tasks, actions, context items,
//! run configuration, artifacts and verification outcomes.
//!
//! Everything here is plain data. Behaviour lives in the materializer and in
//! `keel-orchestrator`. All numeric fields are integers so every type can be
//! hashed through canonical JSON; scores and relevances are permille.

pub mod action;
pub mod artifact;
pub mod budget;
pub mod context;
pub mod ids;
pub mod run;
pub mod task;
pub mod verification;

use thiserror::Error;

pub use action::{ActionKind, ArtifactOutput, PlannedAction, TaskResult};
pub use artifact::{Artifact, ArtifactIndex, ArtifactKind};
pub use budget::{BudgetDimension, BudgetState, Budgets, ResourceCost};
pub use context::{ContextItem, ContextTier};
pub use ids::{RunId, TaskId};
pub use run::{
    AutonomyMode, CheckpointPolicy, PauseReason, RetryPolicy, RiskLevel, RiskPolicy, RiskRule,
    RunConfig, RunConfigOverrides, RunMetadata, RunStatus, StopReason,
};
pub use task::{
    CollaboratorStage, DenialReason, FailureReason, Task, TaskHistoryEntry, TaskKind, TaskSpec,
    TaskStatus,
};
pub use verification::{
    AcceptanceCriterion, AuditFlag, AuditResult, CriterionKind, CriterionOutcome,
    DeterministicCheck, FlagCategory, RubricMeasure, Severity, VerificationResult,
};

/// Upper bound of every permille-valued field.
pub const PERMILLE_MAX: u32 = 1000;

/// Permille of `part` in `whole`, saturating at [`PERMILLE_MAX`]. Zero when
/// `whole` is 0.
#[must_use]
pub fn permille(part: u64, whole: u64) -> u32 {
    if whole == 0 {
        return 0;
    }
    let scaled = part.saturating_mul(u64::from(PERMILLE_MAX)) / whole;
    u32::try_from(scaled.min(u64::from(PERMILLE_MAX))).unwrap_or(PERMILLE_MAX)
}

/// A payload that does not satisfy the schema for its event type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("schema violation in `{event_type}`: {detail}")]
pub struct SchemaViolation {
    pub event_type: &'static str,
    pub detail: String,
}

impl SchemaViolation {
    pub fn new(event_type: &'static str, detail: impl Into<String>) -> Self {
        Self {
            event_type,
            detail: detail.into(),
        }
    }
}

/// Check that a permille value is in range.
pub(crate) fn check_permille(
    event_type: &'static str,
    field: &str,
    value: u32,
) -> Result<(), SchemaViolation> {
    if value > PERMILLE_MAX {
        return Err(SchemaViolation::new(
            event_type,
            format!("{field} = {value} exceeds {PERMILLE_MAX}"),
        ));
    }
    Ok(())
}

pub(crate) fn check_non_empty(
    event_type: &'static str,
    field: &str,
    value: &str,
) -> Result<(), SchemaViolation> {
    if value.trim().is_empty() {
        return Err(SchemaViolation::new(
            event_type,
            format!("{field} must not be empty"),
        ));
    }
    Ok(())
}
