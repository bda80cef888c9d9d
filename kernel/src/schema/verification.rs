//! Acceptance criteria and the records produced by verification and audit.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::ids::TaskId;
use super::{check_non_empty, SchemaViolation};

/// Pure predicates over a task result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum DeterministicCheck {
    ExecutionSucceeded,
    OutputIsJson,
    ArtifactExists { name: String },
    OutputContains { needle: String },
    LogsExclude { needle: String },
    MaxOutputBytes { limit: u64 },
}

/// How a rubric item is scored, in permille.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "measure", rename_all = "snake_case")]
pub enum RubricMeasure {
    /// Score reported by the executor under `key`, clamped to 1000.
    ReportedScore { key: String },
    /// 1000 if the result carries an artifact called `name`, else 0.
    ArtifactPresent { name: String },
    /// 1000 if the output mentions `needle`, else 0.
    OutputMentions { needle: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AcceptanceCriterion {
    Deterministic {
        name: String,
        check: DeterministicCheck,
    },
    Rubric {
        name: String,
        weight: u32,
        measure: RubricMeasure,
    },
}

impl AcceptanceCriterion {
    #[must_use]
    pub fn deterministic(name: impl Into<String>, check: DeterministicCheck) -> Self {
        Self::Deterministic {
            name: name.into(),
            check,
        }
    }

    #[must_use]
    pub fn rubric(name: impl Into<String>, weight: u32, measure: RubricMeasure) -> Self {
        Self::Rubric {
            name: name.into(),
            weight,
            measure,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Deterministic { name, .. } | Self::Rubric { name, .. } => name,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> CriterionKind {
        match self {
            Self::Deterministic { .. } => CriterionKind::Deterministic,
            Self::Rubric { .. } => CriterionKind::Rubric,
        }
    }

    pub(crate) fn validate(&self, event_type: &'static str) -> Result<(), SchemaViolation> {
        check_non_empty(event_type, "criterion name", self.name())?;
        match self {
            Self::Rubric { weight: 0, .. } => Err(SchemaViolation::new(
                event_type,
                format!("rubric criterion `{}` has zero weight", self.name()),
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriterionKind {
    Deterministic,
    Rubric,
}

/// Outcome of one criterion. `score` is set for rubric items only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriterionOutcome {
    pub criterion: String,
    pub kind: CriterionKind,
    pub passed: bool,
    pub score: Option<u32>,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub task_id: TaskId,
    pub passed: bool,
    pub outcomes: Vec<CriterionOutcome>,
    /// Weighted aggregate in permille; `None` when the task has no rubric items.
    pub rubric_score: Option<u32>,
    pub rubric_threshold: u32,
    /// Names of failed criteria, in declaration order. A failing rubric
    /// aggregate contributes each rubric item that scored below threshold.
    pub failed_criteria: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagCategory {
    Policy,
    Safety,
    Quality,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditFlag {
    pub criterion: String,
    pub severity: Severity,
    pub category: FlagCategory,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditResult {
    pub task_id: TaskId,
    pub passed: bool,
    pub flags: Vec<AuditFlag>,
}

impl AuditResult {
    /// Most severe flag, if any.
    #[must_use]
    pub fn worst(&self) -> Option<&AuditFlag> {
        self.flags.iter().max_by_key(|f| f.severity)
    }
}
