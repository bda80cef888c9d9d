//! Tasks, their kind-keyed specs, and the status state machine.
//!
//! ```text
//! pending → ready → running → verifying → completed
//!    │        │        │           └────→ failed
//!    │        │        └─→ failed (denied / collaborator / stopped)
//!    │        └─→ failed (denied before execution) | blocked
//!    └─→ blocked
//! ```
//!
//! Failed tasks are never revived in place: a retry is a new task.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::action::{PlannedAction, TaskResult};
use super::budget::{BudgetDimension, ResourceCost};
use super::ids::TaskId;
use super::verification::AcceptanceCriterion;
use super::{check_non_empty, check_permille, SchemaViolation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Verifying,
    Completed,
    Failed,
    Blocked,
}

impl TaskStatus {
    /// Whether `self → next` is an edge of the task state machine.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Ready | Self::Blocked)
                | (Self::Ready, Self::Pending | Self::Running | Self::Failed | Self::Blocked)
                | (Self::Running, Self::Verifying | Self::Failed)
                | (Self::Verifying, Self::Completed | Self::Failed)
        )
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Blocked)
    }

    /// Running or verifying: an action has been authorized and not settled.
    #[must_use]
    pub const fn is_in_flight(self) -> bool {
        matches!(self, Self::Running | Self::Verifying)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Verifying => "verifying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-keyed task schema. Each kind carries exactly the fields it needs
/// and is validated at the event-store boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    Analysis {
        topic: String,
    },
    ToolUse {
        tool: String,
    },
    CodeChange {
        paths: Vec<String>,
    },
    Verification {
        target: String,
    },
    Remediation {
        original: TaskId,
        failed_criteria: Vec<String>,
        attempt: u32,
    },
}

impl TaskKind {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Analysis { .. } => "analysis",
            Self::ToolUse { .. } => "tool_use",
            Self::CodeChange { .. } => "code_change",
            Self::Verification { .. } => "verification",
            Self::Remediation { .. } => "remediation",
        }
    }

    fn validate(&self, event_type: &'static str) -> Result<(), SchemaViolation> {
        match self {
            Self::Analysis { topic } => check_non_empty(event_type, "analysis.topic", topic),
            Self::ToolUse { tool } => check_non_empty(event_type, "tool_use.tool", tool),
            Self::CodeChange { paths } => {
                if paths.is_empty() {
                    return Err(SchemaViolation::new(
                        event_type,
                        "code_change.paths must name at least one path",
                    ));
                }
                paths
                    .iter()
                    .try_for_each(|p| check_non_empty(event_type, "code_change.paths[]", p))
            }
            Self::Verification { target } => {
                check_non_empty(event_type, "verification.target", target)
            }
            Self::Remediation {
                failed_criteria,
                attempt,
                ..
            } => {
                if failed_criteria.is_empty() {
                    return Err(SchemaViolation::new(
                        event_type,
                        "remediation must reference at least one failed criterion",
                    ));
                }
                if *attempt == 0 {
                    return Err(SchemaViolation::new(
                        event_type,
                        "remediation.attempt is 1-based",
                    ));
                }
                Ok(())
            }
        }
    }
}

/// What a task is meant to achieve and how its result is judged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub title: String,
    pub kind: TaskKind,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub criteria: Vec<AcceptanceCriterion>,
    /// Overrides the run's rubric pass threshold for this task.
    #[serde(default)]
    pub rubric_threshold: Option<u32>,
    /// May finish after STOP if already executing.
    #[serde(default)]
    pub uninterruptible: bool,
    /// Execution may be retried after a transient collaborator failure.
    #[serde(default)]
    pub retryable: bool,
}

impl TaskSpec {
    #[must_use]
    pub fn new(title: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            title: title.into(),
            kind,
            description: String::new(),
            criteria: Vec::new(),
            rubric_threshold: None,
            uninterruptible: false,
            retryable: false,
        }
    }

    #[must_use]
    pub fn with_criterion(mut self, criterion: AcceptanceCriterion) -> Self {
        self.criteria.push(criterion);
        self
    }

    /// Validate against the schema for this spec's kind.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaViolation`] naming the first offending field.
    pub fn validate(&self, event_type: &'static str) -> Result<(), SchemaViolation> {
        check_non_empty(event_type, "title", &self.title)?;
        self.kind.validate(event_type)?;
        if let Some(threshold) = self.rubric_threshold {
            check_permille(event_type, "rubric_threshold", threshold)?;
        }
        let mut names = BTreeSet::new();
        for criterion in &self.criteria {
            criterion.validate(event_type)?;
            if !names.insert(criterion.name()) {
                return Err(SchemaViolation::new(
                    event_type,
                    format!("duplicate criterion name `{}`", criterion.name()),
                ));
            }
        }
        Ok(())
    }
}

/// Why the governor refused an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "denial", rename_all = "snake_case")]
pub enum DenialReason {
    Stopped,
    BudgetExceeded { dimension: BudgetDimension },
    OperatorRejected { operator: String },
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => f.write_str("run is stopped"),
            Self::BudgetExceeded { dimension } => write!(f, "budget exceeded: {dimension}"),
            Self::OperatorRejected { operator } => write!(f, "rejected by operator {operator}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollaboratorStage {
    Planning,
    Executing,
}

impl CollaboratorStage {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Executing => "executing",
        }
    }
}

/// Why a task ended in `failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum FailureReason {
    Denied {
        reason: DenialReason,
    },
    /// Superseded by `remediation`, which dependents now wait on.
    VerificationFailed {
        failed_criteria: Vec<String>,
        remediation: TaskId,
    },
    /// Remediation ceiling reached; permanent.
    RemediationExhausted {
        failed_criteria: Vec<String>,
    },
    Collaborator {
        stage: CollaboratorStage,
        detail: String,
    },
    Stopped,
}

impl FailureReason {
    /// The remediation task that replaces the failed one, if any.
    #[must_use]
    pub fn superseded_by(&self) -> Option<&TaskId> {
        match self {
            Self::VerificationFailed { remediation, .. } => Some(remediation),
            _ => None,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Denied { reason } => write!(f, "denied: {reason}"),
            Self::VerificationFailed {
                failed_criteria,
                remediation,
            } => write!(
                f,
                "verification failed ({}); remediation {remediation}",
                failed_criteria.join(", ")
            ),
            Self::RemediationExhausted { failed_criteria } => write!(
                f,
                "verification failed permanently ({})",
                failed_criteria.join(", ")
            ),
            Self::Collaborator { stage, detail } => {
                write!(f, "{} collaborator failed: {detail}", stage.as_str())
            }
            Self::Stopped => f.write_str("stopped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHistoryEntry {
    pub event_index: u64,
    pub timestamp_ms: u64,
    pub status: TaskStatus,
    pub note: String,
}

/// A node of the task DAG, as materialized from the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Insertion order; FIFO tie-break within equal priority.
    pub seq: u64,
    pub spec: TaskSpec,
    pub status: TaskStatus,
    pub priority: i64,
    pub depends_on: Vec<TaskId>,
    pub history: Vec<TaskHistoryEntry>,
    pub action: Option<PlannedAction>,
    pub reservation: Option<ResourceCost>,
    pub result: Option<TaskResult>,
    pub failure: Option<FailureReason>,
}

impl Task {
    /// Remediation task that replaced this one, if it failed verification.
    #[must_use]
    pub fn superseded_by(&self) -> Option<&TaskId> {
        self.failure.as_ref().and_then(FailureReason::superseded_by)
    }

    /// Remediation attempt number this task represents (0 for originals).
    #[must_use]
    pub fn remediation_attempt(&self) -> u32 {
        match &self.spec.kind {
            TaskKind::Remediation { attempt, .. } => *attempt,
            _ => 0,
        }
    }
}
