//! Run-level configuration, metadata and status.
//!
//! [`RunConfig`] carries every tunable with a default. Callers (the CLI, the
//! test harness) express deviations as a [`RunConfigOverrides`] and merge it
//! onto the defaults, so a run's effective configuration is always fully
//! spelled out in its `run_started` event.

use serde::{Deserialize, Serialize};

use super::action::ActionKind;
use super::budget::{BudgetDimension, Budgets};
use super::ids::{RunId, TaskId};
use super::{check_permille, SchemaViolation};

/// How much the governor lets the kernel do without an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutonomyMode {
    /// Confirmation only for critical-risk actions.
    Autonomous,
    /// Confirmation for elevated and critical actions.
    Supervised,
    /// Confirmation for every action.
    Manual,
    /// Terminal: nothing is authorized.
    Stopped,
}

impl AutonomyMode {
    /// One level less autonomous. `Manual` and `Stopped` stay put.
    #[must_use]
    pub const fn downgrade(self) -> Self {
        match self {
            Self::Autonomous => Self::Supervised,
            Self::Supervised | Self::Manual => Self::Manual,
            Self::Stopped => Self::Stopped,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Autonomous => "autonomous",
            Self::Supervised => "supervised",
            Self::Manual => "manual",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Elevated,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskRule {
    pub action: ActionKind,
    pub level: RiskLevel,
}

/// Risk classification of action kinds. Unlisted kinds are `Low`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskPolicy {
    pub rules: Vec<RiskRule>,
}

impl RiskPolicy {
    /// The most severe rule matching `kind`.
    #[must_use]
    pub fn rule_for(&self, kind: ActionKind) -> Option<&RiskRule> {
        self.rules
            .iter()
            .filter(|r| r.action == kind)
            .max_by_key(|r| r.level)
    }
}

impl Default for RiskPolicy {
    fn default() -> Self {
        let rule = |action, level| RiskRule { action, level };
        Self {
            rules: vec![
                rule(ActionKind::WriteFile, RiskLevel::Low),
                rule(ActionKind::RunCommand, RiskLevel::Elevated),
                rule(ActionKind::NetworkRequest, RiskLevel::Elevated),
                rule(ActionKind::DeleteFile, RiskLevel::Critical),
                rule(ActionKind::Spend, RiskLevel::Critical),
            ],
        }
    }
}

/// Bounded retry with exponential backoff for collaborator failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`, capped.
    #[must_use]
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let shift = attempt.saturating_sub(1).min(32);
        self.base_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 250,
            max_backoff_ms: 8_000,
        }
    }
}

/// When the kernel snapshots: every `every_steps` executed actions or every
/// `every_ms` of run time, whichever comes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointPolicy {
    pub every_steps: u64,
    pub every_ms: u64,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self {
            every_steps: 10,
            every_ms: 60_000,
        }
    }
}

const DEFAULT_WORKING_SET_BUDGET: u64 = 16_384;
const DEFAULT_DRIFT_THRESHOLD: u32 = 850;
const DEFAULT_RUBRIC_PASS_THRESHOLD: u32 = 700;
const DEFAULT_MAX_REMEDIATION_ATTEMPTS: u32 = 2;

const fn default_drift_floor() -> AutonomyMode {
    AutonomyMode::Supervised
}

/// Effective configuration of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    pub autonomy: AutonomyMode,
    pub budgets: Budgets,
    pub risk_policy: RiskPolicy,
    /// Working-set size budget in content bytes.
    pub working_set_budget: u64,
    /// Drift distance (permille) above which `drift_detected` is raised.
    pub drift_threshold: u32,
    /// Least autonomous mode a drift review may lower the run to. Runs that
    /// start below it are left where they are.
    #[serde(default = "default_drift_floor")]
    pub drift_floor: AutonomyMode,
    /// Aggregate rubric score (permille) a task must reach.
    pub rubric_pass_threshold: u32,
    pub max_remediation_attempts: u32,
    pub retry: RetryPolicy,
    pub checkpoint: CheckpointPolicy,
}

impl RunConfig {
    pub(crate) fn validate(&self, event_type: &'static str) -> Result<(), SchemaViolation> {
        if self.autonomy == AutonomyMode::Stopped {
            return Err(SchemaViolation::new(
                event_type,
                "a run cannot start in stopped mode",
            ));
        }
        if self.working_set_budget == 0 {
            return Err(SchemaViolation::new(
                event_type,
                "working_set_budget must be positive",
            ));
        }
        check_permille(event_type, "drift_threshold", self.drift_threshold)?;
        if self.drift_floor == AutonomyMode::Stopped {
            return Err(SchemaViolation::new(
                event_type,
                "drift_floor cannot be stopped",
            ));
        }
        check_permille(event_type, "rubric_pass_threshold", self.rubric_pass_threshold)?;
        if self.checkpoint.every_steps == 0 {
            return Err(SchemaViolation::new(
                event_type,
                "checkpoint.every_steps must be positive",
            ));
        }
        Ok(())
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            autonomy: AutonomyMode::Autonomous,
            budgets: Budgets::default(),
            risk_policy: RiskPolicy::default(),
            working_set_budget: DEFAULT_WORKING_SET_BUDGET,
            drift_threshold: DEFAULT_DRIFT_THRESHOLD,
            drift_floor: default_drift_floor(),
            rubric_pass_threshold: DEFAULT_RUBRIC_PASS_THRESHOLD,
            max_remediation_attempts: DEFAULT_MAX_REMEDIATION_ATTEMPTS,
            retry: RetryPolicy::default(),
            checkpoint: CheckpointPolicy::default(),
        }
    }
}

/// Partial configuration. `None` keeps the default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfigOverrides {
    pub autonomy: Option<AutonomyMode>,
    pub budgets: Option<Budgets>,
    pub risk_policy: Option<RiskPolicy>,
    pub working_set_budget: Option<u64>,
    pub drift_threshold: Option<u32>,
    pub drift_floor: Option<AutonomyMode>,
    pub rubric_pass_threshold: Option<u32>,
    pub max_remediation_attempts: Option<u32>,
    pub retry: Option<RetryPolicy>,
    pub checkpoint: Option<CheckpointPolicy>,
}

impl RunConfigOverrides {
    /// Merge onto `base`.
    #[must_use]
    pub fn apply(self, base: RunConfig) -> RunConfig {
        RunConfig {
            autonomy: self.autonomy.unwrap_or(base.autonomy),
            budgets: self.budgets.unwrap_or(base.budgets),
            risk_policy: self.risk_policy.unwrap_or(base.risk_policy),
            working_set_budget: self.working_set_budget.unwrap_or(base.working_set_budget),
            drift_threshold: self.drift_threshold.unwrap_or(base.drift_threshold),
            drift_floor: self.drift_floor.unwrap_or(base.drift_floor),
            rubric_pass_threshold: self
                .rubric_pass_threshold
                .unwrap_or(base.rubric_pass_threshold),
            max_remediation_attempts: self
                .max_remediation_attempts
                .unwrap_or(base.max_remediation_attempts),
            retry: self.retry.unwrap_or(base.retry),
            checkpoint: self.checkpoint.unwrap_or(base.checkpoint),
        }
    }
}

/// Facts fixed at run start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: RunId,
    pub goal: String,
    pub started_at_ms: u64,
    pub config: RunConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum StopReason {
    Operator { note: String },
    Budget { dimension: BudgetDimension },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "waiting_for", rename_all = "snake_case")]
pub enum PauseReason {
    /// Tasks remain but none is ready; resumed by an external unblock.
    Dependencies,
    Confirmation { task_id: TaskId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Paused { reason: PauseReason },
    Stopped { reason: StopReason },
    Completed,
    Failed { reason: String },
}

impl RunStatus {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Stopped { .. } | Self::Completed | Self::Failed { .. }
        )
    }

    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused { .. } => "paused",
            Self::Stopped { .. } => "stopped",
            Self::Completed => "completed",
            Self::Failed { .. } => "failed",
        }
    }
}
