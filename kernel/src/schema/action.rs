//! Planned actions and their execution results.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::artifact::ArtifactKind;
use super::budget::ResourceCost;
use super::{check_non_empty, check_permille, SchemaViolation};

/// What a planned action does. Risk rules are keyed by this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Analyze,
    Generate,
    ReadFile,
    WriteFile,
    DeleteFile,
    RunCommand,
    NetworkRequest,
    Spend,
}

impl ActionKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Analyze => "analyze",
            Self::Generate => "generate",
            Self::ReadFile => "read_file",
            Self::WriteFile => "write_file",
            Self::DeleteFile => "delete_file",
            Self::RunCommand => "run_command",
            Self::NetworkRequest => "network_request",
            Self::Spend => "spend",
        }
    }

    /// Whether executing this action counts against the tool-call budget.
    #[must_use]
    pub const fn is_tool_call(&self) -> bool {
        matches!(
            self,
            Self::ReadFile
                | Self::WriteFile
                | Self::DeleteFile
                | Self::RunCommand
                | Self::NetworkRequest
        )
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of the planning collaborator. Untrusted until authorized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedAction {
    pub kind: ActionKind,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    /// The planner's estimate; the governor reserves at least this much.
    #[serde(default)]
    pub estimated_cost: ResourceCost,
}

impl PlannedAction {
    #[must_use]
    pub fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            parameters: BTreeMap::new(),
            estimated_cost: ResourceCost::default(),
        }
    }

    #[must_use]
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_cost(mut self, cost: ResourceCost) -> Self {
        self.estimated_cost = cost;
        self
    }

    pub(crate) fn validate(&self, event_type: &'static str) -> Result<(), SchemaViolation> {
        for key in self.parameters.keys() {
            check_non_empty(event_type, "action parameter key", key)?;
        }
        Ok(())
    }
}

/// An artifact as produced by the execution collaborator, before indexing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactOutput {
    pub name: String,
    pub kind: ArtifactKind,
    pub content: String,
}

/// Output of the execution collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub artifacts: Vec<ArtifactOutput>,
    #[serde(default)]
    pub logs: Vec<String>,
    /// Actual resource usage as reported by the executor.
    #[serde(default)]
    pub usage: ResourceCost,
    /// Self-reported quality scores (permille) consumed by rubric checks.
    #[serde(default)]
    pub scores: BTreeMap<String, u32>,
}

impl TaskResult {
    pub(crate) fn validate(&self, event_type: &'static str) -> Result<(), SchemaViolation> {
        for artifact in &self.artifacts {
            check_non_empty(event_type, "artifact name", &artifact.name)?;
        }
        for (key, score) in &self.scores {
            check_non_empty(event_type, "score key", key)?;
            check_permille(event_type, key, *score)?;
        }
        Ok(())
    }
}
