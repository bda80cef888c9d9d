//! `TestSpecV1`: the scenario DSL.
//!
//! A spec is a JSON document describing one scripted run:
//!
//! ```json
//! {
//!   "name": "json-remediation",
//!   "goal": "produce a machine-readable incident report",
//!   "budgets": { "max_steps": 10 },
//!   "seeds": [
//!     { "label": "report",
//!       "spec": { "title": "write report", "kind": { "type": "analysis", "topic": "incident" } },
//!       "script": { "execute": [ { "outcome": "result", "result": { "success": true, "output": "oops" } } ] } }
//!   ],
//!   "must": [ { "condition": "run_status", "status": "completed" } ],
//!   "must_not": [ { "condition": "task_kind_executed", "kind": "tool_use" } ]
//! }
//! ```
//!
//! Tasks are referred to by their seed `label` everywhere in a test spec; the
//! runner maps labels to the task ids the queue assigns.
//!
//! The test-spec digest (`HashDomain::TestSpec` over canonical JSON) identifies
//! the scenario independently of file formatting.

use keel_kernel::proof::canon::{canonical_bytes, CanonError};
use keel_kernel::proof::hash::{canonical_hash, ContentHash};
use keel_kernel::proof::hash_domain::HashDomain;
use keel_kernel::schema::{
    ActionKind, Budgets, PlannedAction, RunConfig, RunConfigOverrides, Severity, TaskKind,
    TaskResult, TaskSpec, TaskStatus,
};
use serde::{Deserialize, Serialize};

const DEFAULT_MAX_STEPS_DRIVEN: usize = 500;
const DEFAULT_TICK_MS: u64 = 10;
const DEFAULT_START_MS: u64 = 1_700_000_000_000;

fn default_max_steps_driven() -> usize {
    DEFAULT_MAX_STEPS_DRIVEN
}

fn default_tick_ms() -> u64 {
    DEFAULT_TICK_MS
}

fn default_start_ms() -> u64 {
    DEFAULT_START_MS
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestSpecV1 {
    pub name: String,
    pub goal: String,
    /// Ceilings for the run. Takes precedence over `config.budgets`.
    #[serde(default)]
    pub budgets: Option<Budgets>,
    #[serde(default)]
    pub config: RunConfigOverrides,
    pub seeds: Vec<QueueInjection>,
    #[serde(default)]
    pub signals: Vec<ScheduledSignal>,
    #[serde(default)]
    pub must: Vec<Condition>,
    #[serde(default)]
    pub must_not: Vec<Condition>,
    #[serde(default)]
    pub rubric: Option<ScoringRubric>,
    /// Pump limit: the run is abandoned (not failed) after this many steps.
    #[serde(default = "default_max_steps_driven")]
    pub max_steps_driven: usize,
    /// Manual clock advance after every step.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_start_ms")]
    pub start_ms: u64,
}

impl TestSpecV1 {
    /// Parse a spec from JSON.
    ///
    /// # Errors
    ///
    /// Malformed JSON or unknown fields.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Content digest of the spec.
    ///
    /// # Errors
    ///
    /// Canonicalization errors.
    pub fn digest(&self) -> Result<ContentHash, CanonError> {
        Ok(canonical_hash(HashDomain::TestSpec, &canonical_bytes(self)?))
    }

    /// The run configuration: defaults, then `config` overrides, then
    /// `budgets`.
    #[must_use]
    pub fn run_config(&self) -> RunConfig {
        let mut config = self.config.clone().apply(RunConfig::default());
        if let Some(budgets) = self.budgets {
            config.budgets = budgets;
        }
        config
    }
}

/// A task seeded into the queue before the first step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueInjection {
    pub label: String,
    pub spec: TaskSpec,
    #[serde(default)]
    pub priority: i64,
    /// Labels of earlier seeds.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub script: ScriptedBehaviour,
}

/// How the scripted collaborators answer for one seed.
///
/// Each list is consumed one entry per call. When a list runs out its last
/// entry repeats; an empty list uses the default answer (plan the action
/// matching the task kind; execute successfully).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScriptedBehaviour {
    #[serde(default)]
    pub plan: Vec<PlanStep>,
    #[serde(default)]
    pub execute: Vec<ExecuteStep>,
    /// Execution answers for remediation tasks spawned from this seed.
    #[serde(default)]
    pub remediate: Vec<ExecuteStep>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PlanStep {
    Action { action: PlannedAction },
    Fail { transient: bool, detail: String },
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecuteStep {
    Result { result: TaskResult },
    Fail { transient: bool, detail: String },
    Pending,
    Panic { message: String },
}

/// The action a planner picks for a task kind when not told otherwise.
#[must_use]
pub fn default_action(kind: &TaskKind) -> PlannedAction {
    let action = match kind {
        TaskKind::Analysis { .. } | TaskKind::Verification { .. } => ActionKind::Analyze,
        TaskKind::ToolUse { .. } => ActionKind::RunCommand,
        TaskKind::CodeChange { .. } => ActionKind::WriteFile,
        TaskKind::Remediation { .. } => ActionKind::Generate,
    };
    PlannedAction::new(action)
}

/// An operator action injected before a given step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduledSignal {
    /// Delivered before step `at_step` (0-based).
    pub at_step: usize,
    pub signal: InjectedSignal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum InjectedSignal {
    Stop {
        #[serde(default)]
        note: String,
    },
    Confirm {
        task: String,
        approved: bool,
        #[serde(default = "default_operator")]
        operator: String,
    },
    Wake,
    AdvanceClock {
        ms: u64,
    },
}

fn default_operator() -> String {
    "harness".to_string()
}

/// A predicate over the finished run's event log and state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "condition", rename_all = "snake_case")]
pub enum Condition {
    /// Final run status label (`completed`, `stopped`, ...).
    RunStatus { status: String },
    TaskStatus { task: String, status: TaskStatus },
    /// Number of events of `event_type` lies in `min..=max`.
    EventCount {
        event_type: String,
        #[serde(default)]
        min: usize,
        #[serde(default)]
        max: Option<usize>,
    },
    /// A task of this kind (`analysis`, `tool_use`, ...) entered execution.
    TaskKindExecuted { kind: String },
    ActionExecuted { action: ActionKind },
    /// The first `first` event precedes the first `then` event.
    EventOrder { first: String, then: String },
    AuditFlagged { severity: Severity },
    RemediationSpawned { task: String },
    ArtifactRecorded { name: String },
    BudgetWithinCeilings,
    ChainIntact,
}

/// Weighted conditions scored in permille.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScoringRubric {
    pub items: Vec<RubricItem>,
    pub pass_threshold: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RubricItem {
    pub name: String,
    pub weight: u32,
    pub condition: Condition,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPEC: &str = r#"{
        "name": "two-step",
        "goal": "summarize the incident",
        "budgets": { "max_steps": 3 },
        "config": { "drift_threshold": 900 },
        "seeds": [
            { "label": "a", "spec": { "title": "read logs", "kind": { "type": "analysis", "topic": "logs" } } },
            { "label": "b", "priority": 2, "depends_on": ["a"],
              "spec": { "title": "run fix", "kind": { "type": "tool_use", "tool": "sh" } },
              "script": { "execute": [ { "outcome": "fail", "transient": false, "detail": "boom" } ] } }
        ],
        "signals": [ { "at_step": 4, "signal": { "signal": "stop", "note": "enough" } } ],
        "must_not": [ { "condition": "task_kind_executed", "kind": "code_change" } ]
    }"#;

    #[test]
    fn parses_with_defaults() {
        let spec = TestSpecV1::from_json(SPEC).unwrap();
        assert_eq!(spec.seeds.len(), 2);
        assert_eq!(spec.seeds[1].depends_on, ["a"]);
        assert_eq!(spec.max_steps_driven, DEFAULT_MAX_STEPS_DRIVEN);
        assert!(spec.seeds[0].script.execute.is_empty());

        let config = spec.run_config();
        assert_eq!(config.budgets.max_steps, 3);
        assert_eq!(config.drift_threshold, 900);
        assert_eq!(config.rubric_pass_threshold, RunConfig::default().rubric_pass_threshold);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let bad = SPEC.replacen("\"goal\"", "\"gaol\"", 1);
        assert!(TestSpecV1::from_json(&bad).is_err());
    }

    #[test]
    fn digest_ignores_formatting() {
        let spec = TestSpecV1::from_json(SPEC).unwrap();
        let compact = serde_json::to_string(&spec).unwrap();
        let reparsed = TestSpecV1::from_json(&compact).unwrap();
        assert_eq!(spec.digest().unwrap(), reparsed.digest().unwrap());

        let mut renamed = spec.clone();
        renamed.name.push('!');
        assert_ne!(spec.digest().unwrap(), renamed.digest().unwrap());
    }

    #[test]
    fn default_actions_follow_kind() {
        let tool = TaskKind::ToolUse { tool: "sh".into() };
        assert_eq!(default_action(&tool).kind, ActionKind::RunCommand);
        let code = TaskKind::CodeChange { paths: vec![] };
        assert_eq!(default_action(&code).kind, ActionKind::WriteFile);
    }
}
