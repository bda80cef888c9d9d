//! State materializer: folds events into [`KernelState`].
//!
//! `apply` is a pure function of `(state, event)`. Folding the same event
//! sequence always yields the same state, byte for byte once canonicalized,
//! which is what makes snapshots interchangeable with a full replay.
//!
//! Each handler checks before it mutates, so a rejected event leaves the
//! state untouched. Rejections are integrity errors: the log disagrees with
//! the state machine it claims to record.
//!
//! Derived transitions happen inside the fold:
//! - `pending → ready` once every dependency is satisfied, and back to
//!   `pending` if a new unsatisfied dependency is added.
//! - A dependency is *satisfied* when it completed, or when it failed
//!   verification and the remediation that superseded it is satisfied.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::{EventPayload, EventV1, QueueMutation};
use crate::proof::canon::{canonical_bytes, CanonError};
use crate::proof::hash::{canonical_hash, genesis_hash, ContentHash, HashDomain};
use crate::schema::{
    ArtifactIndex, AuditResult, AutonomyMode, BudgetState, Budgets, CollaboratorStage,
    ContextItem, PlannedAction, ResourceCost, RiskRule, RunConfig, RunId,
    RunMetadata, RunStatus, StopReason, Task, TaskHistoryEntry, TaskId, TaskStatus,
};

/// An action awaiting operator confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingConfirmation {
    pub task_id: TaskId,
    pub action: PlannedAction,
    pub rule: RiskRule,
    pub decision: Option<ConfirmationDecision>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationDecision {
    pub approved: bool,
    pub operator: String,
}

/// Backoff gate left by the latest `collaborator_retry`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryGate {
    pub task_id: TaskId,
    pub stage: CollaboratorStage,
    pub attempt: u32,
    pub not_before_ms: u64,
}

/// A long-term context entry. Only the reference is held; the content is
/// recovered from the event that added it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LongTermRef {
    pub digest: ContentHash,
    pub bytes: u64,
    pub relevance: u32,
    /// Index of the `context_added` event that carries the content.
    pub source_event: u64,
    pub promoted_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContextState {
    pub pinned: Vec<ContextItem>,
    pub working: Vec<ContextItem>,
    pub long_term: BTreeMap<String, LongTermRef>,
    /// Sum of working item sizes.
    pub working_bytes: u64,
    /// Event index that added each working item.
    sources: BTreeMap<String, u64>,
}

impl ContextState {
    #[must_use]
    pub fn working_item(&self, reference: &str) -> Option<&ContextItem> {
        self.working.iter().find(|i| i.reference == reference)
    }

    #[must_use]
    pub fn pinned_item(&self, reference: &str) -> Option<&ContextItem> {
        self.pinned.iter().find(|i| i.reference == reference)
    }
}

/// The latest drift measurement that crossed the threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftSignal {
    pub distance: u32,
    pub threshold: u32,
    pub event_index: u64,
    /// Cleared once the governor has reviewed the signal.
    pub review_pending: bool,
}

/// How a dependency currently stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Satisfied,
    Waiting,
    /// Can never be satisfied; carries the task that ended the chain.
    Unsatisfiable(TaskId),
}

/// Everything the kernel knows about a run, derived from its log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelState {
    pub run_id: RunId,
    pub metadata: Option<RunMetadata>,
    pub status: RunStatus,
    pub autonomy: AutonomyMode,
    pub tasks: BTreeMap<TaskId, Task>,
    pub next_seq: u64,
    pub budget: BudgetState,
    pub context: ContextState,
    pub artifacts: ArtifactIndex,
    pub audits: Vec<AuditResult>,
    pub last_error: Option<String>,
    pub stop_requested: Option<StopReason>,
    pub drift: Option<DriftSignal>,
    pub pending_confirmation: Option<PendingConfirmation>,
    pub retry_gate: Option<RetryGate>,
    pub last_event_index: Option<u64>,
    pub last_event_hash: ContentHash,
    pub last_timestamp_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MaterializeError {
    #[error("event {found} applied out of order (expected index {expected})")]
    OutOfOrder { expected: u64, found: u64 },

    #[error("event {index} belongs to run {found}, not {expected}")]
    RunMismatch {
        index: u64,
        expected: RunId,
        found: RunId,
    },

    #[error("event {index} ({event_type}) precedes run_started")]
    NotStarted {
        index: u64,
        event_type: &'static str,
    },

    #[error("event {index}: run already started")]
    AlreadyStarted { index: u64 },

    #[error("event {index}: unknown task {task_id}")]
    UnknownTask { index: u64, task_id: TaskId },

    #[error("event {index}: task {task_id} already exists")]
    DuplicateTask { index: u64, task_id: TaskId },

    #[error("event {index}: task {task_id} cannot go from {from} to {to}")]
    InvalidTransition {
        index: u64,
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("event {index}: {detail}")]
    Inconsistent { index: u64, detail: String },
}

impl KernelState {
    /// State before any event.
    #[must_use]
    pub fn genesis(run_id: RunId) -> Self {
        Self {
            run_id,
            metadata: None,
            status: RunStatus::Running,
            autonomy: AutonomyMode::Autonomous,
            tasks: BTreeMap::new(),
            next_seq: 0,
            budget: BudgetState::new(Budgets::default()),
            context: ContextState::default(),
            artifacts: ArtifactIndex::default(),
            audits: Vec::new(),
            last_error: None,
            stop_requested: None,
            drift: None,
            pending_confirmation: None,
            retry_gate: None,
            last_event_index: None,
            last_event_hash: genesis_hash(),
            last_timestamp_ms: 0,
        }
    }

    /// Index the next event must carry.
    #[must_use]
    pub fn next_index(&self) -> u64 {
        self.last_event_index.map_or(0, |i| i + 1)
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.metadata.is_some()
    }

    #[must_use]
    pub fn config(&self) -> Option<&RunConfig> {
        self.metadata.as_ref().map(|m| &m.config)
    }

    #[must_use]
    pub fn goal(&self) -> Option<&str> {
        self.metadata.as_ref().map(|m| m.goal.as_str())
    }

    #[must_use]
    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn tasks_with_status(&self, status: TaskStatus) -> impl Iterator<Item = &Task> {
        self.tasks.values().filter(move |t| t.status == status)
    }

    /// The task holding a reservation, if any. At most one per run.
    #[must_use]
    pub fn in_flight(&self) -> Option<&Task> {
        self.tasks.values().find(|t| t.status.is_in_flight())
    }

    /// Tasks that failed or were blocked with no remediation to take over.
    pub fn permanent_failures(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values().filter(|t| {
            t.status == TaskStatus::Blocked
                || (t.status == TaskStatus::Failed && t.superseded_by().is_none())
        })
    }

    /// Follow `id` through any remediation chain to see whether it counts as
    /// done for its dependents.
    #[must_use]
    pub fn resolve(&self, id: &TaskId) -> Resolution {
        let mut current = id;
        for _ in 0..=self.tasks.len() {
            let Some(task) = self.tasks.get(current) else {
                return Resolution::Unsatisfiable(current.clone());
            };
            match task.status {
                TaskStatus::Completed => return Resolution::Satisfied,
                TaskStatus::Failed => match task.superseded_by() {
                    Some(next) => current = next,
                    None => return Resolution::Unsatisfiable(current.clone()),
                },
                TaskStatus::Blocked => return Resolution::Unsatisfiable(current.clone()),
                _ => return Resolution::Waiting,
            }
        }
        Resolution::Unsatisfiable(current.clone())
    }

    #[must_use]
    pub fn dependencies_satisfied(&self, task: &Task) -> bool {
        task.depends_on
            .iter()
            .all(|d| self.resolve(d) == Resolution::Satisfied)
    }

    /// First dependency of `task` that can never be satisfied.
    #[must_use]
    pub fn unsatisfiable_dependency(&self, task: &Task) -> Option<TaskId> {
        task.depends_on.iter().find_map(|d| match self.resolve(d) {
            Resolution::Unsatisfiable(_) => Some(d.clone()),
            _ => None,
        })
    }

    /// Whether `to` is reachable from `from` along `depends_on` edges.
    #[must_use]
    pub fn depends_transitively(&self, from: &TaskId, to: &TaskId) -> bool {
        let mut stack = vec![from];
        let mut seen = BTreeSet::new();
        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(task) = self.tasks.get(id) {
                stack.extend(task.depends_on.iter());
            }
        }
        false
    }

    /// Canonical digest of the whole state.
    ///
    /// # Errors
    ///
    /// Returns [`CanonError`] if the state cannot be canonicalized.
    pub fn digest(&self) -> Result<ContentHash, CanonError> {
        Ok(canonical_hash(
            HashDomain::StateDigest,
            &canonical_bytes(self)?,
        ))
    }
}

/// Apply one event.
///
/// # Errors
///
/// Returns [`MaterializeError`] if the event is out of order, belongs to
/// another run, or contradicts the state. The state is unchanged on error.
pub fn apply(state: &mut KernelState, event: &EventV1) -> Result<(), MaterializeError> {
    let expected = state.next_index();
    if event.index != expected {
        return Err(MaterializeError::OutOfOrder {
            expected,
            found: event.index,
        });
    }
    if event.run_id != state.run_id {
        return Err(MaterializeError::RunMismatch {
            index: event.index,
            expected: state.run_id.clone(),
            found: event.run_id.clone(),
        });
    }
    if !state.is_started() && !matches!(event.payload, EventPayload::RunStarted { .. }) {
        return Err(MaterializeError::NotStarted {
            index: event.index,
            event_type: event.event_type(),
        });
    }

    Fold {
        state: &mut *state,
        index: event.index,
        ts: event.timestamp_ms,
    }
    .payload(&event.payload)?;

    state.last_event_index = Some(event.index);
    state.last_event_hash = event.hash.clone();
    state.last_timestamp_ms = event.timestamp_ms;
    if let Some(started) = state.metadata.as_ref().map(|m| m.started_at_ms) {
        state
            .budget
            .observe_wall_clock(event.timestamp_ms.saturating_sub(started));
    }
    Ok(())
}

/// Fold `events` onto `state`.
///
/// # Errors
///
/// Returns the first [`MaterializeError`].
pub fn fold<'a>(
    mut state: KernelState,
    events: impl IntoIterator<Item = &'a EventV1>,
) -> Result<KernelState, MaterializeError> {
    for event in events {
        apply(&mut state, event)?;
    }
    Ok(state)
}

struct Fold<'s> {
    state: &'s mut KernelState,
    index: u64,
    ts: u64,
}

impl Fold<'_> {
    fn inconsistent(&self, detail: impl Into<String>) -> MaterializeError {
        MaterializeError::Inconsistent {
            index: self.index,
            detail: detail.into(),
        }
    }

    fn task(&self, id: &TaskId) -> Result<&Task, MaterializeError> {
        self.state
            .tasks
            .get(id)
            .ok_or_else(|| MaterializeError::UnknownTask {
                index: self.index,
                task_id: id.clone(),
            })
    }

    fn check_transition(&self, id: &TaskId, to: TaskStatus) -> Result<(), MaterializeError> {
        let from = self.task(id)?.status;
        if from.can_transition_to(to) {
            Ok(())
        } else {
            Err(MaterializeError::InvalidTransition {
                index: self.index,
                task_id: id.clone(),
                from,
                to,
            })
        }
    }

    /// Move a task to `to` and record history. The edge must already have
    /// been checked.
    fn transition(
        &mut self,
        id: &TaskId,
        to: TaskStatus,
        note: impl Into<String>,
    ) -> Result<&mut Task, MaterializeError> {
        let entry = TaskHistoryEntry {
            event_index: self.index,
            timestamp_ms: self.ts,
            status: to,
            note: note.into(),
        };
        let index = self.index;
        let task = self
            .state
            .tasks
            .get_mut(id)
            .ok_or_else(|| MaterializeError::UnknownTask {
                index,
                task_id: id.clone(),
            })?;
        task.status = to;
        task.history.push(entry);
        Ok(task)
    }

    fn clear_task_gates(&mut self, id: &TaskId) {
        if self
            .state
            .pending_confirmation
            .as_ref()
            .is_some_and(|p| &p.task_id == id)
        {
            self.state.pending_confirmation = None;
        }
        if self
            .state
            .retry_gate
            .as_ref()
            .is_some_and(|g| &g.task_id == id)
        {
            self.state.retry_gate = None;
        }
    }

    fn settle_budget(&mut self, id: &TaskId, usage: &ResourceCost) {
        let reservation = self
            .state
            .tasks
            .get_mut(id)
            .and_then(|t| t.reservation.take());
        if let Some(reservation) = reservation {
            let clamped = self.state.budget.commit(&reservation, usage);
            if !clamped.is_empty() {
                let dims: Vec<&str> = clamped.iter().map(|d| d.as_str()).collect();
                self.state.last_error = Some(format!(
                    "{id}: usage exceeded remaining budget ({})",
                    dims.join(", ")
                ));
            }
        }
    }

    /// Re-derive `pending ⇄ ready` for every unsettled task.
    fn refresh_readiness(&mut self) {
        let changes: Vec<(TaskId, TaskStatus)> = self
            .state
            .tasks
            .values()
            .filter_map(|task| {
                let satisfied = self.state.dependencies_satisfied(task);
                match (task.status, satisfied) {
                    (TaskStatus::Pending, true) => Some((task.id.clone(), TaskStatus::Ready)),
                    (TaskStatus::Ready, false) => Some((task.id.clone(), TaskStatus::Pending)),
                    _ => None,
                }
            })
            .collect();
        for (id, to) in changes {
            let note = if to == TaskStatus::Ready {
                "dependencies satisfied"
            } else {
                "waiting on dependencies"
            };
            // ids were just read from the map
            let _ = self.transition(&id, to, note);
        }
    }

    fn payload(&mut self, payload: &EventPayload) -> Result<(), MaterializeError> {
        match payload {
            EventPayload::RunStarted { goal, config } => {
                if self.state.is_started() {
                    return Err(MaterializeError::AlreadyStarted { index: self.index });
                }
                self.state.metadata = Some(RunMetadata {
                    run_id: self.state.run_id.clone(),
                    goal: goal.clone(),
                    started_at_ms: self.ts,
                    config: config.clone(),
                });
                self.state.budget = BudgetState::new(config.budgets);
                self.state.autonomy = config.autonomy;
                self.state.status = RunStatus::Running;
            }
            EventPayload::QueueMutation(mutation) => self.queue_mutation(mutation)?,
            EventPayload::ConfirmationRequested {
                task_id,
                action,
                rule,
            } => {
                let status = self.task(task_id)?.status;
                if status != TaskStatus::Ready {
                    return Err(self.inconsistent(format!(
                        "confirmation requested for {status} task {task_id}"
                    )));
                }
                if self.state.pending_confirmation.is_some() {
                    return Err(self.inconsistent("a confirmation is already pending"));
                }
                self.state.pending_confirmation = Some(PendingConfirmation {
                    task_id: task_id.clone(),
                    action: action.clone(),
                    rule: rule.clone(),
                    decision: None,
                });
            }
            EventPayload::ConfirmationReceived {
                task_id,
                approved,
                operator,
            } => {
                let index = self.index;
                let pending = self
                    .state
                    .pending_confirmation
                    .as_mut()
                    .filter(|p| &p.task_id == task_id && p.decision.is_none())
                    .ok_or_else(|| MaterializeError::Inconsistent {
                        index,
                        detail: format!("no confirmation pending for {task_id}"),
                    })?;
                pending.decision = Some(ConfirmationDecision {
                    approved: *approved,
                    operator: operator.clone(),
                });
            }
            EventPayload::TaskRunning {
                task_id,
                task_kind,
                action,
                reservation,
            } => {
                self.check_transition(task_id, TaskStatus::Running)?;
                let kind = self.task(task_id)?.spec.kind.name();
                if kind != task_kind.as_str() {
                    return Err(self.inconsistent(format!(
                        "{task_id} is {kind}, event says {task_kind}"
                    )));
                }
                if self.state.autonomy == AutonomyMode::Stopped {
                    return Err(self.inconsistent(format!("{task_id} started after stop")));
                }
                if let Some(pending) = &self.state.pending_confirmation {
                    let approved = pending.decision.as_ref().is_some_and(|d| d.approved);
                    if &pending.task_id == task_id && !approved {
                        return Err(self.inconsistent(format!(
                            "{task_id} started without operator approval"
                        )));
                    }
                }
                if let Some(dim) = self.state.budget.would_exceed(reservation) {
                    return Err(self.inconsistent(format!(
                        "{task_id} reservation exceeds the {dim} ceiling"
                    )));
                }
                self.state.budget.reserve(reservation);
                self.clear_task_gates(task_id);
                let task = self.transition(task_id, TaskStatus::Running, action.kind.as_str())?;
                task.action = Some(action.clone());
                task.reservation = Some(*reservation);
            }
            EventPayload::TaskVerifying { task_id, result } => {
                self.check_transition(task_id, TaskStatus::Verifying)?;
                self.clear_task_gates(task_id);
                let note = if result.success {
                    "executed"
                } else {
                    "executed with failure"
                };
                let task = self.transition(task_id, TaskStatus::Verifying, note)?;
                task.result = Some(result.clone());
            }
            EventPayload::TaskCompleted {
                task_id,
                verification,
                usage,
            } => {
                self.check_transition(task_id, TaskStatus::Completed)?;
                self.settle_budget(task_id, usage);
                let note = match verification.rubric_score {
                    Some(score) => format!("verified (rubric {score})"),
                    None => "verified".to_string(),
                };
                self.transition(task_id, TaskStatus::Completed, note)?;
                self.refresh_readiness();
            }
            EventPayload::TaskFailed {
                task_id,
                reason,
                usage,
            } => {
                self.check_transition(task_id, TaskStatus::Failed)?;
                if let Some(remediation) = reason.superseded_by() {
                    self.task(remediation)?;
                }
                self.settle_budget(task_id, &usage.unwrap_or_default());
                self.clear_task_gates(task_id);
                self.state.last_error = Some(format!("{task_id}: {reason}"));
                let task = self.transition(task_id, TaskStatus::Failed, reason.to_string())?;
                task.failure = Some(reason.clone());
                self.refresh_readiness();
            }
            EventPayload::TaskBlocked {
                task_id,
                blocked_by,
            } => {
                self.task(blocked_by)?;
                self.check_transition(task_id, TaskStatus::Blocked)?;
                self.clear_task_gates(task_id);
                self.transition(
                    task_id,
                    TaskStatus::Blocked,
                    format!("blocked by {blocked_by}"),
                )?;
            }
            EventPayload::CollaboratorRetry {
                task_id,
                stage,
                attempt,
                not_before_ms,
                detail,
            } => {
                let status = self.task(task_id)?.status;
                let expected = match stage {
                    CollaboratorStage::Planning => TaskStatus::Ready,
                    CollaboratorStage::Executing => TaskStatus::Running,
                };
                if status != expected {
                    return Err(self.inconsistent(format!(
                        "{} retry for {status} task {task_id}",
                        stage.as_str()
                    )));
                }
                self.state.retry_gate = Some(RetryGate {
                    task_id: task_id.clone(),
                    stage: *stage,
                    attempt: *attempt,
                    not_before_ms: *not_before_ms,
                });
                self.state.last_error = Some(format!("{task_id}: {detail}"));
            }
            EventPayload::AuditRecorded { audit } => {
                self.task(&audit.task_id)?;
                if let Some(flag) = audit.worst() {
                    self.state.last_error = Some(format!(
                        "{}: {} [{}] {}",
                        audit.task_id, flag.criterion, flag.severity, flag.detail
                    ));
                }
                self.state.audits.push(audit.clone());
            }
            EventPayload::ArtifactRecorded { artifact } => {
                self.task(&artifact.produced_by)?;
                let next = self.state.artifacts.next_version(&artifact.name);
                if artifact.version != next {
                    return Err(self.inconsistent(format!(
                        "artifact {} recorded out of order (next version is {next})",
                        artifact.id
                    )));
                }
                self.state.artifacts.record(artifact.clone());
            }
            EventPayload::ContextPinned { item } => {
                let mut item = item.clone();
                item.added_at_ms = self.ts;
                let pinned = &mut self.state.context.pinned;
                match pinned.iter_mut().find(|i| i.reference == item.reference) {
                    Some(slot) => *slot = item,
                    None => pinned.push(item),
                }
            }
            EventPayload::ContextAdded { item } => self.context_added(item)?,
            EventPayload::ContextEvicted {
                reference,
                relevance,
                freed_bytes,
            } => {
                let item = self
                    .state
                    .context
                    .working_item(reference)
                    .ok_or_else(|| self.inconsistent(format!("evicted unknown item {reference}")))?;
                if item.size() != *freed_bytes || item.relevance != *relevance {
                    return Err(self.inconsistent(format!(
                        "eviction of {reference} misreports the item"
                    )));
                }
                let ctx = &mut self.state.context;
                ctx.working.retain(|i| &i.reference != reference);
                ctx.sources.remove(reference);
                ctx.working_bytes = ctx.working_bytes.saturating_sub(*freed_bytes);
            }
            EventPayload::ContextPromoted { reference } => {
                let item = self
                    .state
                    .context
                    .working_item(reference)
                    .cloned()
                    .ok_or_else(|| {
                        self.inconsistent(format!("promoted unknown item {reference}"))
                    })?;
                let ctx = &mut self.state.context;
                let source_event = ctx.sources.remove(reference).unwrap_or(self.index);
                ctx.working.retain(|i| &i.reference != reference);
                ctx.working_bytes = ctx.working_bytes.saturating_sub(item.size());
                ctx.long_term.insert(
                    reference.clone(),
                    LongTermRef {
                        digest: canonical_hash(
                            HashDomain::ArtifactContent,
                            item.content.as_bytes(),
                        ),
                        bytes: item.size(),
                        relevance: item.relevance,
                        source_event,
                        promoted_at_ms: self.ts,
                    },
                );
            }
            EventPayload::DriftDetected {
                distance,
                threshold,
            } => {
                self.state.drift = Some(DriftSignal {
                    distance: *distance,
                    threshold: *threshold,
                    event_index: self.index,
                    review_pending: true,
                });
            }
            EventPayload::AutonomyChanged { from, to, .. } => {
                if *from != self.state.autonomy {
                    return Err(self.inconsistent(format!(
                        "autonomy change from {} but mode is {}",
                        from.as_str(),
                        self.state.autonomy.as_str()
                    )));
                }
                if self.state.autonomy == AutonomyMode::Stopped {
                    return Err(self.inconsistent("stopped mode is terminal"));
                }
                self.state.autonomy = *to;
                if let Some(drift) = &mut self.state.drift {
                    drift.review_pending = false;
                }
            }
            EventPayload::DriftReviewed { mode, .. } => {
                if *mode != self.state.autonomy {
                    return Err(self.inconsistent(format!(
                        "drift reviewed at {} but mode is {}",
                        mode.as_str(),
                        self.state.autonomy.as_str()
                    )));
                }
                if !self.state.drift.as_ref().is_some_and(|d| d.review_pending) {
                    return Err(self.inconsistent("no drift signal awaiting review"));
                }
                if let Some(drift) = &mut self.state.drift {
                    drift.review_pending = false;
                }
            }
            EventPayload::StopRequested { reason } => {
                if self.state.stop_requested.is_none() {
                    self.state.stop_requested = Some(reason.clone());
                }
                self.state.autonomy = AutonomyMode::Stopped;
            }
            EventPayload::RunStatusChanged { status } => {
                if self.state.status.is_terminal() {
                    return Err(self.inconsistent(format!(
                        "run is {} and cannot become {}",
                        self.state.status.label(),
                        status.label()
                    )));
                }
                if matches!(status, RunStatus::Stopped { .. }) {
                    self.state.autonomy = AutonomyMode::Stopped;
                }
                self.state.status = status.clone();
            }
        }
        Ok(())
    }

    fn queue_mutation(&mut self, mutation: &QueueMutation) -> Result<(), MaterializeError> {
        match mutation {
            QueueMutation::Enqueued {
                task_id,
                spec,
                priority,
                depends_on,
            } => {
                if self.state.tasks.contains_key(task_id) {
                    return Err(MaterializeError::DuplicateTask {
                        index: self.index,
                        task_id: task_id.clone(),
                    });
                }
                for dep in depends_on {
                    self.task(dep)?;
                }
                let seq = self.state.next_seq;
                self.state.next_seq += 1;
                self.state.tasks.insert(
                    task_id.clone(),
                    Task {
                        id: task_id.clone(),
                        seq,
                        spec: spec.clone(),
                        status: TaskStatus::Pending,
                        priority: *priority,
                        depends_on: depends_on.clone(),
                        history: vec![TaskHistoryEntry {
                            event_index: self.index,
                            timestamp_ms: self.ts,
                            status: TaskStatus::Pending,
                            note: "enqueued".to_string(),
                        }],
                        action: None,
                        reservation: None,
                        result: None,
                        failure: None,
                    },
                );
                self.refresh_readiness();
            }
            QueueMutation::DependencyAdded {
                task_id,
                depends_on,
            } => {
                self.task(depends_on)?;
                let task = self.task(task_id)?;
                if !matches!(task.status, TaskStatus::Pending | TaskStatus::Ready) {
                    return Err(self.inconsistent(format!(
                        "dependency added to {} task {task_id}",
                        task.status
                    )));
                }
                if task.depends_on.contains(depends_on) {
                    return Err(self.inconsistent(format!(
                        "{task_id} already depends on {depends_on}"
                    )));
                }
                if self.state.depends_transitively(depends_on, task_id) {
                    return Err(self.inconsistent(format!(
                        "{task_id} → {depends_on} closes a cycle"
                    )));
                }
                if let Some(task) = self.state.tasks.get_mut(task_id) {
                    task.depends_on.push(depends_on.clone());
                }
                self.refresh_readiness();
            }
            QueueMutation::Reprioritized { task_id, priority } => {
                let status = self.task(task_id)?.status;
                if status.is_terminal() {
                    return Err(self.inconsistent(format!(
                        "reprioritized {status} task {task_id}"
                    )));
                }
                if let Some(task) = self.state.tasks.get_mut(task_id) {
                    task.priority = *priority;
                }
            }
        }
        Ok(())
    }

    fn context_added(&mut self, item: &ContextItem) -> Result<(), MaterializeError> {
        let budget = self
            .state
            .config()
            .map_or(u64::MAX, |c| c.working_set_budget);
        let ctx = &self.state.context;
        if ctx.working_item(&item.reference).is_some() {
            return Err(self.inconsistent(format!(
                "{} is already in the working set",
                item.reference
            )));
        }
        if ctx.working_bytes.saturating_add(item.size()) > budget {
            return Err(self.inconsistent(format!(
                "adding {} overflows the working-set budget",
                item.reference
            )));
        }
        let mut item = item.clone();
        item.added_at_ms = self.ts;
        let ctx = &mut self.state.context;
        ctx.long_term.remove(&item.reference);
        ctx.sources.insert(item.reference.clone(), self.index);
        ctx.working_bytes += item.size();
        ctx.working.push(item);
        Ok(())
    }
}
