//! Runs a [`TestSpecV1`] against the real kernel with scripted collaborators.
//!
//! The run is fully deterministic: a [`ManualClock`] starts at the spec's
//! `start_ms` and advances `tick_ms` after every step (or jumps to the end
//! of a backoff), the log lives in memory, and operator signals are
//! delivered before the step they are scheduled for. Once the run halts, or
//! the pump limit is reached, the spec's conditions are evaluated over the
//! event log and the final state, and the trace is persisted.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use keel_kernel::clock::{Clock, ManualClock};
use keel_kernel::event::{EventPayload, EventV1};
use keel_kernel::materialize::KernelState;
use keel_kernel::proof::canon::CanonError;
use keel_kernel::proof::hash::ContentHash;
use keel_kernel::schema::{permille, PlannedAction, RunId, RunStatus, TaskId};
use keel_kernel::store::{self, EventStore, MemoryBackend, StoreError};
use keel_orchestrator::{
    Collaborators, ControlInbox, ControlSignal, KernelError, OrchestrationKernel, StepOutcome,
    Suspension,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::log_store::{LogStoreError, TestLogStore, TraceRef};
use crate::script::ScriptBook;
use crate::spec::{Condition, InjectedSignal, ScoringRubric, TestSpecV1};

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("seed {label:?} appears twice")]
    DuplicateLabel { label: String },

    #[error("{context} refers to unknown seed {label:?}")]
    UnknownLabel { context: String, label: String },

    #[error("rubric has zero total weight")]
    EmptyRubric,

    #[error(transparent)]
    Canon(#[from] CanonError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Kernel(#[from] KernelError),

    #[error(transparent)]
    Log(#[from] LogStoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// A `must` condition did not hold.
    Must,
    /// A `must_not` condition held.
    MustNot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    pub condition: Condition,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RubricScore {
    pub score: u32,
    pub pass_threshold: u32,
    pub passed: bool,
    /// Names of the items that held.
    pub satisfied: Vec<String>,
}

/// Outcome of one test run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResultV1 {
    pub name: String,
    pub spec_digest: ContentHash,
    pub run_id: RunId,
    pub passed: bool,
    pub status: RunStatus,
    /// Whether the run reached a terminal status within the pump limit.
    pub halted: bool,
    pub steps_driven: usize,
    pub violations: Vec<Violation>,
    pub rubric: Option<RubricScore>,
    /// A kernel error that ended the drive early.
    pub kernel_error: Option<String>,
    pub trace: TraceRef,
}

impl TestResultV1 {
    /// One-paragraph human summary.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut out = format!(
            "{} {}: run {} {} after {} steps ({} events)",
            if self.passed { "PASS" } else { "FAIL" },
            self.name,
            self.run_id,
            self.status.label(),
            self.steps_driven,
            self.trace.events,
        );
        for violation in &self.violations {
            let _ = write!(out, "\n  {:?}: {}", violation.kind, violation.detail);
        }
        if let Some(rubric) = &self.rubric {
            let _ = write!(
                out,
                "\n  rubric {}/1000 (threshold {})",
                rubric.score, rubric.pass_threshold
            );
        }
        if let Some(error) = &self.kernel_error {
            let _ = write!(out, "\n  kernel error: {error}");
        }
        out
    }
}

/// File-name-safe slug of a spec name.
fn slug(name: &str) -> String {
    let slug: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "spec".to_string()
    } else {
        slug.to_string()
    }
}

/// Run `spec` to completion and persist its trace in `log`.
///
/// # Errors
///
/// Spec errors (duplicate or unknown labels), errors seeding the run, and
/// log-store errors. A kernel error during the drive is reported in the
/// result instead.
pub fn run(spec: &TestSpecV1, log: &TestLogStore) -> Result<TestResultV1, HarnessError> {
    let spec_digest = spec.digest()?;
    let run_id = RunId::new(format!(
        "{}-{}",
        slug(&spec.name),
        &spec_digest.hex_digest()[..12]
    ));
    tracing::info!(spec = %spec.name, run = %run_id, "test run starting");

    let clock = ManualClock::new(spec.start_ms);
    let store = EventStore::open(run_id.clone(), MemoryBackend::new(), Arc::new(clock.clone()))?;
    let book = ScriptBook::for_goal(&spec.goal);
    let inbox = ControlInbox::new();
    let (planner, executor) = book.collaborators();
    let collaborators = Collaborators::new(planner, executor).with_control(inbox.clone());
    let mut kernel = OrchestrationKernel::start(store, spec.run_config(), &spec.goal, collaborators)?;

    let mut labels: BTreeMap<String, TaskId> = BTreeMap::new();
    for seed in &spec.seeds {
        if labels.contains_key(&seed.label) {
            return Err(HarnessError::DuplicateLabel {
                label: seed.label.clone(),
            });
        }
        let deps = seed
            .depends_on
            .iter()
            .map(|l| resolve(&labels, l, &format!("seed {}", seed.label)))
            .collect::<Result<Vec<_>, _>>()?;
        let id = kernel.enqueue(seed.spec.clone(), seed.priority, &deps)?;
        book.insert(id.clone(), seed.script.clone());
        labels.insert(seed.label.clone(), id);
    }
    check_labels(spec, &labels)?;

    let mut steps_driven = 0;
    let mut kernel_error = None;
    for step in 0..spec.max_steps_driven {
        for scheduled in spec.signals.iter().filter(|s| s.at_step == step) {
            deliver(&scheduled.signal, &inbox, &clock, &labels)?;
        }
        let outcome = kernel.step();
        steps_driven += 1;
        match outcome {
            Ok(StepOutcome::Halted { .. }) => break,
            Ok(StepOutcome::Suspended {
                reason: Suspension::Backoff { until_ms },
                ..
            }) => clock.set(until_ms.max(clock.now_ms() + spec.tick_ms)),
            Ok(StepOutcome::Suspended {
                reason: Suspension::Dependencies | Suspension::Confirmation { .. },
                ..
            }) if !spec.signals.iter().any(|s| s.at_step > step) => {
                tracing::debug!(step, "suspended with no signals left");
                break;
            }
            Ok(_) => clock.advance(spec.tick_ms),
            Err(error) => {
                tracing::warn!(%error, step, "kernel error ended the drive");
                kernel_error = Some(error.to_string());
                break;
            }
        }
    }

    let status = kernel.status();
    let halted = kernel.is_finished();
    let journal = kernel.into_journal();
    let events = journal.store().events()?;
    let evaluation = Evaluation {
        events: &events,
        state: journal.state(),
        status: &status,
        labels: &labels,
    };

    let mut violations = Vec::new();
    for condition in &spec.must {
        let check = evaluation.check(condition)?;
        if !check.holds {
            violations.push(Violation {
                kind: ViolationKind::Must,
                condition: condition.clone(),
                detail: check.evidence,
            });
        }
    }
    for condition in &spec.must_not {
        let check = evaluation.check(condition)?;
        if check.holds {
            violations.push(Violation {
                kind: ViolationKind::MustNot,
                condition: condition.clone(),
                detail: check.evidence,
            });
        }
    }
    let rubric = spec
        .rubric
        .as_ref()
        .map(|r| evaluation.score(r))
        .transpose()?;

    let passed = violations.is_empty()
        && rubric.as_ref().is_none_or(|r| r.passed)
        && kernel_error.is_none();
    let trace = log.persist_trace(&run_id, &events)?;
    let result = TestResultV1 {
        name: spec.name.clone(),
        spec_digest,
        run_id,
        passed,
        status,
        halted,
        steps_driven,
        violations,
        rubric,
        kernel_error,
        trace,
    };
    log.write_result(&result)?;
    tracing::info!(
        spec = %result.name,
        passed = result.passed,
        status = result.status.label(),
        key = %result.trace.key,
        "test run finished"
    );
    Ok(result)
}

fn resolve(
    labels: &BTreeMap<String, TaskId>,
    label: &str,
    context: &str,
) -> Result<TaskId, HarnessError> {
    labels
        .get(label)
        .cloned()
        .ok_or_else(|| HarnessError::UnknownLabel {
            context: context.to_string(),
            label: label.to_string(),
        })
}

/// Reject specs whose conditions or signals name seeds that do not exist,
/// before anything runs.
fn check_labels(spec: &TestSpecV1, labels: &BTreeMap<String, TaskId>) -> Result<(), HarnessError> {
    let rubric = spec.rubric.iter().flat_map(|r| r.items.iter().map(|i| &i.condition));
    for condition in spec.must.iter().chain(&spec.must_not).chain(rubric) {
        if let Condition::TaskStatus { task, .. } | Condition::RemediationSpawned { task } =
            condition
        {
            resolve(labels, task, "condition")?;
        }
    }
    for scheduled in &spec.signals {
        if let InjectedSignal::Confirm { task, .. } = &scheduled.signal {
            resolve(labels, task, "signal")?;
        }
    }
    Ok(())
}

fn deliver(
    signal: &InjectedSignal,
    inbox: &ControlInbox,
    clock: &ManualClock,
    labels: &BTreeMap<String, TaskId>,
) -> Result<(), HarnessError> {
    tracing::debug!(?signal, "delivering signal");
    match signal {
        InjectedSignal::Stop { note } => inbox.stop(note.clone()),
        InjectedSignal::Confirm {
            task,
            approved,
            operator,
        } => inbox.send(ControlSignal::Confirm {
            task_id: resolve(labels, task, "signal")?,
            approved: *approved,
            operator: operator.clone(),
        }),
        InjectedSignal::Wake => inbox.send(ControlSignal::Wake),
        InjectedSignal::AdvanceClock { ms } => clock.advance(*ms),
    }
    Ok(())
}

struct Check {
    holds: bool,
    evidence: String,
}

impl Check {
    fn new(holds: bool, evidence: impl Into<String>) -> Self {
        Self {
            holds,
            evidence: evidence.into(),
        }
    }
}

struct Evaluation<'a> {
    events: &'a [EventV1],
    state: &'a KernelState,
    status: &'a RunStatus,
    labels: &'a BTreeMap<String, TaskId>,
}

impl Evaluation<'_> {
    fn first(&self, event_type: &str) -> Option<u64> {
        self.events
            .iter()
            .find(|e| e.payload.event_type() == event_type)
            .map(|e| e.index)
    }

    fn running(&self) -> impl Iterator<Item = (u64, &str, &PlannedAction)> {
        self.events.iter().filter_map(|e| match &e.payload {
            EventPayload::TaskRunning {
                task_kind, action, ..
            } => Some((e.index, task_kind.as_str(), action)),
            _ => None,
        })
    }

    fn check(&self, condition: &Condition) -> Result<Check, HarnessError> {
        let check = match condition {
            Condition::RunStatus { status } => Check::new(
                self.status.label() == status,
                format!("run status is {}", self.status.label()),
            ),
            Condition::TaskStatus { task, status } => {
                let id = resolve(self.labels, task, "condition")?;
                match self.state.task(&id) {
                    Some(t) => Check::new(t.status == *status, format!("{task} is {}", t.status)),
                    None => Check::new(false, format!("{task} is not in the queue")),
                }
            }
            Condition::EventCount {
                event_type,
                min,
                max,
            } => {
                let n = self
                    .events
                    .iter()
                    .filter(|e| e.payload.event_type() == event_type)
                    .count();
                Check::new(
                    n >= *min && max.is_none_or(|m| n <= m),
                    format!("{n} {event_type} events"),
                )
            }
            Condition::TaskKindExecuted { kind } => {
                match self.running().find(|(_, k, _)| k == kind) {
                    Some((index, ..)) => {
                        Check::new(true, format!("{kind} task entered execution at event {index}"))
                    }
                    None => Check::new(false, format!("no {kind} task entered execution")),
                }
            }
            Condition::ActionExecuted { action } => {
                match self.running().find(|(_, _, a)| a.kind == *action) {
                    Some((index, ..)) => {
                        Check::new(true, format!("{action} executed at event {index}"))
                    }
                    None => Check::new(false, format!("{action} never executed")),
                }
            }
            Condition::EventOrder { first, then } => match (self.first(first), self.first(then)) {
                (Some(a), Some(b)) => Check::new(
                    a < b,
                    format!("first {first} at event {a}, first {then} at event {b}"),
                ),
                (a, b) => Check::new(
                    false,
                    format!(
                        "{first} {}, {then} {}",
                        if a.is_some() { "present" } else { "absent" },
                        if b.is_some() { "present" } else { "absent" }
                    ),
                ),
            },
            Condition::AuditFlagged { severity } => {
                let flag = self
                    .state
                    .audits
                    .iter()
                    .flat_map(|a| a.flags.iter().map(move |f| (&a.task_id, f)))
                    .find(|(_, f)| f.severity >= *severity);
                match flag {
                    Some((task, f)) => Check::new(
                        true,
                        format!("{task} flagged {} on {}: {}", f.severity, f.criterion, f.detail),
                    ),
                    None => Check::new(false, format!("no audit flag at {severity} or above")),
                }
            }
            Condition::RemediationSpawned { task } => {
                let id = resolve(self.labels, task, "condition")?;
                match self.state.task(&id).and_then(|t| t.superseded_by()) {
                    Some(fix) => Check::new(true, format!("{task} superseded by {fix}")),
                    None => Check::new(false, format!("{task} was not remediated")),
                }
            }
            Condition::ArtifactRecorded { name } => match self.state.artifacts.latest(name) {
                Some(artifact) => Check::new(
                    true,
                    format!("{name} recorded at version {}", artifact.version),
                ),
                None => Check::new(false, format!("no artifact named {name}")),
            },
            Condition::BudgetWithinCeilings => {
                let budget = &self.state.budget;
                Check::new(
                    budget.within_ceilings(),
                    format!(
                        "consumed {:?} against ceilings {:?}",
                        budget.consumed, budget.ceilings
                    ),
                )
            }
            Condition::ChainIntact => match store::verify_chain(self.events) {
                Ok(()) => Check::new(true, format!("{} events verify", self.events.len())),
                Err(e) => Check::new(false, e.to_string()),
            },
        };
        Ok(check)
    }

    fn score(&self, rubric: &ScoringRubric) -> Result<RubricScore, HarnessError> {
        let total: u64 = rubric.items.iter().map(|i| u64::from(i.weight)).sum();
        if total == 0 {
            return Err(HarnessError::EmptyRubric);
        }
        let mut earned = 0;
        let mut satisfied = Vec::new();
        for item in &rubric.items {
            if self.check(&item.condition)?.holds {
                earned += u64::from(item.weight);
                satisfied.push(item.name.clone());
            }
        }
        let score = permille(earned, total);
        Ok(RubricScore {
            score,
            pass_threshold: rubric.pass_threshold,
            passed: score >= rubric.pass_threshold,
            satisfied,
        })
    }
}
