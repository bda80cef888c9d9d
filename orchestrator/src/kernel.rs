//! The orchestration kernel: a step-driven state machine for one run.
//!
//! ```text
//!            ┌──────────────────────────────────────────────┐
//!            ▼                                              │
//! Loading → Selecting → Planning → Authorizing → Executing → Verifying → Checkpointing
//!            │  ▲                      │   ▲
//!            ▼  │                      ▼   │
//!           Idle                 PendingConfirmation
//!
//! terminal: Completed | Stopped | Failed
//! ```
//!
//! Each call to [`OrchestrationKernel::step`] performs at most one phase
//! transition. Before anything else a step drains the control source and
//! honours a STOP or an exhausted budget, so no action is authorized after
//! a STOP has been recorded.
//!
//! Collaborators that answer [`Response::Pending`] leave the phase as it is;
//! the step returns [`StepOutcome::Suspended`] and the same call is made on
//! the next step. Transient failures are retried after a backoff whose
//! deadline is logged in a `collaborator_retry` event.
//!
//! All progress is in the log. Transient fields here (the selected task and
//! its not-yet-authorized plan) are re-derived or re-requested on resume.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

use keel_kernel::event::EventPayload;
use keel_kernel::schema::{
    Artifact, BudgetState, CollaboratorStage, DenialReason, FailureReason, PauseReason,
    PlannedAction, ResourceCost, RunConfig, RunId, RunStatus, StopReason, TaskId, TaskSpec,
    TaskStatus,
};
use keel_kernel::store::{EventBackend, EventStore};

use crate::context;
use crate::contract::{
    CollaboratorError, ExecutionRequest, Executor, PlanRequest, Planner, Response,
};
use crate::control::{ControlSignal, ControlSource, NoControl};
use crate::error::{ContextError, KernelError};
use crate::governor::{self, Decision};
use crate::journal::Journal;
use crate::queue::{self, Selection};
use crate::verifier;

/// Reference under which the goal statement is pinned.
pub const GOAL_REFERENCE: &str = "goal";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Idle,
    Loading,
    Selecting,
    Planning,
    Authorizing,
    PendingConfirmation,
    Executing,
    Verifying,
    Checkpointing,
    Completed,
    Stopped,
    Failed,
}

impl Phase {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Stopped | Self::Failed)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Selecting => "selecting",
            Self::Planning => "planning",
            Self::Authorizing => "authorizing",
            Self::PendingConfirmation => "pending_confirmation",
            Self::Executing => "executing",
            Self::Verifying => "verifying",
            Self::Checkpointing => "checkpointing",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

/// Why a step made no progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Suspension {
    /// A collaborator answered `Pending`.
    Collaborator,
    /// A retry is scheduled for `until_ms`.
    Backoff { until_ms: u64 },
    /// Tasks remain but none can run until something external changes.
    Dependencies,
    /// An operator must approve or reject the action for `task_id`.
    Confirmation { task_id: TaskId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Advanced { phase: Phase },
    Suspended { phase: Phase, reason: Suspension },
    Halted { status: RunStatus },
}

/// The external parties a kernel talks to.
pub struct Collaborators {
    pub planner: Box<dyn Planner>,
    pub executor: Box<dyn Executor>,
    pub control: Box<dyn ControlSource>,
}

impl Collaborators {
    pub fn new(planner: impl Planner + 'static, executor: impl Executor + 'static) -> Self {
        Self {
            planner: Box::new(planner),
            executor: Box::new(executor),
            control: Box::new(NoControl),
        }
    }

    #[must_use]
    pub fn with_control(mut self, control: impl ControlSource + 'static) -> Self {
        self.control = Box::new(control);
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct CheckpointClock {
    steps: u64,
    last_ms: u64,
}

pub struct OrchestrationKernel<B: EventBackend> {
    journal: Journal<B>,
    collaborators: Collaborators,
    phase: Phase,
    selected: Option<TaskId>,
    planned: Option<PlannedAction>,
    /// Completed task whose output the next checkpoint adds to context.
    settled: Option<TaskId>,
    /// Resumed with a task whose execution was cut off mid-call.
    interrupted: bool,
    checkpoint: CheckpointClock,
    fault: Option<String>,
}

fn panic_detail(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// Call a collaborator, turning a panic into a permanent failure.
fn guarded<T>(who: &str, call: impl FnOnce() -> Response<T>) -> Response<T> {
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(response) => response,
        Err(payload) => {
            let detail = panic_detail(payload.as_ref());
            tracing::error!(collaborator = who, %detail, "collaborator panicked");
            Response::Failed(CollaboratorError::permanent(format!(
                "{who} panicked: {detail}"
            )))
        }
    }
}

fn non_empty(detail: String) -> String {
    if detail.trim().is_empty() {
        "unspecified failure".to_string()
    } else {
        detail
    }
}

/// The least an executed action is charged: one step, plus one tool call
/// for tool actions.
fn minimal_usage(action: &PlannedAction) -> ResourceCost {
    governor::reservation_for(&PlannedAction::new(action.kind))
}

impl<B: EventBackend> OrchestrationKernel<B> {
    fn new(journal: Journal<B>, collaborators: Collaborators, phase: Phase) -> Self {
        let now = journal.now_ms();
        Self {
            journal,
            collaborators,
            phase,
            selected: None,
            planned: None,
            settled: None,
            interrupted: false,
            checkpoint: CheckpointClock {
                steps: 0,
                last_ms: now,
            },
            fault: None,
        }
    }

    /// Begin a new run on an empty log and pin its goal.
    ///
    /// # Errors
    ///
    /// [`KernelError::AlreadyStarted`] if the log already holds a run, or
    /// store errors (including an invalid configuration).
    pub fn start(
        store: EventStore<B>,
        config: RunConfig,
        goal: &str,
        collaborators: Collaborators,
    ) -> Result<Self, KernelError> {
        let mut journal = Journal::load(store)?;
        if journal.state().is_started() {
            return Err(KernelError::AlreadyStarted {
                run_id: journal.state().run_id.to_string(),
            });
        }
        journal.record(EventPayload::RunStarted {
            goal: goal.to_string(),
            config,
        })?;
        context::pin(&mut journal, GOAL_REFERENCE, goal)?;
        tracing::info!(run = %journal.state().run_id, "run started");
        Ok(Self::new(journal, collaborators, Phase::Selecting))
    }

    /// Reload a run from its log and pick up where it stopped.
    ///
    /// A task that was running is executed again if it is retryable and
    /// failed otherwise; a task that was being verified is re-verified.
    ///
    /// # Errors
    ///
    /// [`KernelError::NotStarted`] for an empty log; replay errors.
    pub fn resume(store: EventStore<B>, collaborators: Collaborators) -> Result<Self, KernelError> {
        let journal = Journal::load(store)?;
        let state = journal.state();
        if !state.is_started() {
            return Err(KernelError::NotStarted {
                run_id: state.run_id.to_string(),
            });
        }

        let mut selected = None;
        let mut interrupted = false;
        let phase = match &state.status {
            RunStatus::Completed => Phase::Completed,
            RunStatus::Stopped { .. } => Phase::Stopped,
            RunStatus::Failed { .. } => Phase::Failed,
            RunStatus::Running | RunStatus::Paused { .. } => {
                if let Some(task) = state.in_flight() {
                    selected = Some(task.id.clone());
                    if task.status == TaskStatus::Running {
                        interrupted = !state.retry_gate.as_ref().is_some_and(|g| {
                            g.task_id == task.id && g.stage == CollaboratorStage::Executing
                        });
                        Phase::Executing
                    } else {
                        Phase::Verifying
                    }
                } else if state.pending_confirmation.is_some() {
                    Phase::PendingConfirmation
                } else if let Some(gate) = state
                    .retry_gate
                    .as_ref()
                    .filter(|g| g.stage == CollaboratorStage::Planning)
                {
                    selected = Some(gate.task_id.clone());
                    Phase::Planning
                } else {
                    Phase::Selecting
                }
            }
        };
        tracing::info!(
            run = %state.run_id,
            events = state.next_index(),
            phase = phase.as_str(),
            "run resumed"
        );

        let mut kernel = Self::new(journal, collaborators, phase);
        kernel.selected = selected;
        kernel.interrupted = interrupted;
        Ok(kernel)
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[must_use]
    pub fn journal(&self) -> &Journal<B> {
        &self.journal
    }

    #[must_use]
    pub fn run_id(&self) -> &RunId {
        &self.journal.state().run_id
    }

    /// Run status, or `Failed` with the fault if the kernel halted on an
    /// error it could not record.
    #[must_use]
    pub fn status(&self) -> RunStatus {
        let status = &self.journal.state().status;
        match &self.fault {
            Some(reason) if !status.is_terminal() => RunStatus::Failed {
                reason: reason.clone(),
            },
            _ => status.clone(),
        }
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.phase.is_terminal()
    }

    #[must_use]
    pub fn into_journal(self) -> Journal<B> {
        self.journal
    }

    /// Add a task to this run's queue.
    ///
    /// # Errors
    ///
    /// Queue errors; [`KernelError::Halted`] once the run is terminal.
    pub fn enqueue(
        &mut self,
        spec: TaskSpec,
        priority: i64,
        depends_on: &[TaskId],
    ) -> Result<TaskId, KernelError> {
        self.ensure_live()?;
        let id = queue::enqueue(&mut self.journal, spec, priority, depends_on)?;
        if self.phase == Phase::Idle {
            self.phase = Phase::Selecting;
        }
        Ok(id)
    }

    /// Record a STOP. It takes effect at the start of the next step.
    ///
    /// # Errors
    ///
    /// [`KernelError::Halted`] once the run is terminal; store errors.
    pub fn request_stop(&mut self, note: &str) -> Result<(), KernelError> {
        self.ensure_live()?;
        self.record_stop(StopReason::Operator {
            note: note.to_string(),
        })
    }

    /// Record an operator decision for the pending confirmation.
    ///
    /// # Errors
    ///
    /// [`KernelError::Inconsistent`] if no confirmation for `task_id` is
    /// pending; store errors.
    pub fn confirm(
        &mut self,
        task_id: &TaskId,
        approved: bool,
        operator: &str,
    ) -> Result<(), KernelError> {
        self.ensure_live()?;
        let waiting = self
            .journal
            .state()
            .pending_confirmation
            .as_ref()
            .is_some_and(|p| &p.task_id == task_id && p.decision.is_none());
        if !waiting {
            return Err(KernelError::Inconsistent {
                detail: format!("no confirmation pending for {task_id}"),
            });
        }
        self.journal.record(EventPayload::ConfirmationReceived {
            task_id: task_id.clone(),
            approved,
            operator: operator.to_string(),
        })?;
        tracing::info!(task = %task_id, approved, operator, "confirmation received");
        Ok(())
    }

    fn ensure_live(&self) -> Result<(), KernelError> {
        if self.phase.is_terminal() {
            return Err(KernelError::Halted {
                status: self.status().label().to_string(),
            });
        }
        Ok(())
    }

    /// Step until the run halts, suspends, or `max_steps` steps have run.
    ///
    /// # Errors
    ///
    /// As [`step`](Self::step).
    pub fn drive(&mut self, max_steps: usize) -> Result<StepOutcome, KernelError> {
        let mut last = StepOutcome::Advanced { phase: self.phase };
        for _ in 0..max_steps {
            last = self.step()?;
            if !matches!(last, StepOutcome::Advanced { .. }) {
                break;
            }
        }
        Ok(last)
    }

    /// Perform one phase transition.
    ///
    /// # Errors
    ///
    /// Integrity and store errors. The kernel moves to `Failed` and every
    /// later step reports the halt.
    pub fn step(&mut self) -> Result<StepOutcome, KernelError> {
        if self.phase.is_terminal() {
            return Ok(StepOutcome::Halted {
                status: self.status(),
            });
        }
        let from = self.phase;
        match self.advance() {
            Ok(outcome) => {
                if self.phase != from {
                    tracing::debug!(from = from.as_str(), to = self.phase.as_str(), "phase");
                }
                Ok(outcome)
            }
            Err(error) => Err(self.fail(error)),
        }
    }

    fn fail(&mut self, error: KernelError) -> KernelError {
        let reason = error.to_string();
        tracing::error!(error = %reason, integrity = error.is_integrity(), "run halted on error");
        if !error.is_integrity() && !self.journal.state().status.is_terminal() {
            let recorded = self.journal.record(EventPayload::RunStatusChanged {
                status: RunStatus::Failed {
                    reason: reason.clone(),
                },
            });
            if let Err(e) = recorded {
                tracing::error!(error = %e, "could not record run failure");
            }
        }
        self.phase = Phase::Failed;
        self.fault = Some(reason);
        error
    }

    fn advance(&mut self) -> Result<StepOutcome, KernelError> {
        self.drain_control()?;
        if let Some(reason) = self.pending_stop()? {
            if !self.finishing_uninterruptible() {
                return self.halt(reason);
            }
        }
        match self.phase {
            Phase::Idle | Phase::Loading | Phase::Selecting => self.select(),
            Phase::Planning => self.plan(),
            Phase::Authorizing => self.authorize(),
            Phase::PendingConfirmation => self.await_confirmation(),
            Phase::Executing => self.execute(),
            Phase::Verifying => self.verify(),
            Phase::Checkpointing => self.checkpoint(),
            Phase::Completed | Phase::Stopped | Phase::Failed => Ok(StepOutcome::Halted {
                status: self.status(),
            }),
        }
    }

    fn advanced(&mut self, phase: Phase) -> StepOutcome {
        self.phase = phase;
        StepOutcome::Advanced { phase }
    }

    fn suspended(&self, reason: Suspension) -> StepOutcome {
        StepOutcome::Suspended {
            phase: self.phase,
            reason,
        }
    }

    fn config(&self) -> Result<&RunConfig, KernelError> {
        self.journal
            .state()
            .config()
            .ok_or_else(|| KernelError::NotStarted {
                run_id: self.journal.state().run_id.to_string(),
            })
    }

    /// The budget with wall-clock time observed up to now.
    fn elapsed_budget(&self) -> BudgetState {
        let state = self.journal.state();
        let started = state.metadata.as_ref().map_or(0, |m| m.started_at_ms);
        governor::with_elapsed(
            &state.budget,
            self.journal.now_ms().saturating_sub(started),
        )
    }

    // -----------------------------------------------------------------------
    // Control and STOP
    // -----------------------------------------------------------------------

    /// Apply pending signals, acknowledging each once its effect is in the
    /// log. An unreadable source fails the step: a STOP may be waiting in it.
    fn drain_control(&mut self) -> Result<(), KernelError> {
        for signal in self.collaborators.control.poll()? {
            match signal {
                ControlSignal::Stop { note } => self.record_stop(StopReason::Operator { note })?,
                ControlSignal::Confirm {
                    task_id,
                    approved,
                    operator,
                } => {
                    if let Err(e) = self.confirm(&task_id, approved, &operator) {
                        if !matches!(e, KernelError::Inconsistent { .. }) {
                            return Err(e);
                        }
                        tracing::warn!(task = %task_id, "ignoring confirmation: {e}");
                    }
                }
                ControlSignal::Wake => {
                    if self.phase == Phase::Idle {
                        self.phase = Phase::Selecting;
                    }
                }
            }
            self.collaborators.control.ack()?;
        }
        Ok(())
    }

    fn record_stop(&mut self, reason: StopReason) -> Result<(), KernelError> {
        if self.journal.state().stop_requested.is_some() {
            return Ok(());
        }
        tracing::warn!(?reason, "stop requested");
        self.journal.record(EventPayload::StopRequested { reason })?;
        Ok(())
    }

    /// The STOP to honour now, recording one if a budget ran out.
    fn pending_stop(&mut self) -> Result<Option<StopReason>, KernelError> {
        if let Some(reason) = &self.journal.state().stop_requested {
            return Ok(Some(reason.clone()));
        }
        if let Some(dimension) = self.elapsed_budget().exhausted() {
            tracing::warn!(%dimension, "budget exhausted");
            let reason = StopReason::Budget { dimension };
            self.record_stop(reason.clone())?;
            return Ok(Some(reason));
        }
        Ok(None)
    }

    fn finishing_uninterruptible(&self) -> bool {
        matches!(self.phase, Phase::Executing | Phase::Verifying)
            && self
                .journal
                .state()
                .in_flight()
                .is_some_and(|t| t.spec.uninterruptible)
    }

    fn halt(&mut self, reason: StopReason) -> Result<StepOutcome, KernelError> {
        self.record_stop(reason.clone())?;
        let state = self.journal.state();
        let in_flight = state.in_flight().map(|t| {
            let usage = match (t.status, &t.result) {
                (TaskStatus::Verifying, Some(result)) => Some(result.usage),
                _ => None,
            };
            (t.id.clone(), usage)
        });
        let awaiting = state
            .pending_confirmation
            .as_ref()
            .map(|p| p.task_id.clone());

        if let Some((task_id, usage)) = in_flight {
            queue::mark_failed(&mut self.journal, &task_id, FailureReason::Stopped, usage)?;
        }
        if let Some(task_id) = awaiting {
            queue::mark_failed(
                &mut self.journal,
                &task_id,
                FailureReason::Denied {
                    reason: DenialReason::Stopped,
                },
                None,
            )?;
        }

        let reason = self.journal.state().stop_requested.clone().unwrap_or(reason);
        let status = RunStatus::Stopped { reason };
        self.journal.record(EventPayload::RunStatusChanged {
            status: status.clone(),
        })?;
        tracing::warn!(run = %self.journal.state().run_id, "run stopped");
        self.phase = Phase::Stopped;
        Ok(StepOutcome::Halted { status })
    }

    // -----------------------------------------------------------------------
    // Selecting
    // -----------------------------------------------------------------------

    fn set_status(&mut self, status: RunStatus) -> Result<(), KernelError> {
        if self.journal.state().status != status {
            self.journal
                .record(EventPayload::RunStatusChanged { status })?;
        }
        Ok(())
    }

    fn select(&mut self) -> Result<StepOutcome, KernelError> {
        queue::block_unsatisfiable(&mut self.journal)?;
        match queue::select_next(self.journal.state()) {
            Selection::Task(task_id) => {
                self.set_status(RunStatus::Running)?;
                tracing::debug!(task = %task_id, "task selected");
                self.selected = Some(task_id);
                self.planned = None;
                Ok(self.advanced(Phase::Planning))
            }
            Selection::Blocked { waiting } => {
                self.set_status(RunStatus::Paused {
                    reason: PauseReason::Dependencies,
                })?;
                if self.phase != Phase::Idle {
                    tracing::info!(waiting = waiting.len(), "no task ready; run paused");
                }
                self.phase = Phase::Idle;
                Ok(self.suspended(Suspension::Dependencies))
            }
            Selection::Empty => {
                let failed: Vec<String> = self
                    .journal
                    .state()
                    .permanent_failures()
                    .map(|t| t.id.to_string())
                    .collect();
                let (status, phase) = if failed.is_empty() {
                    (RunStatus::Completed, Phase::Completed)
                } else {
                    (
                        RunStatus::Failed {
                            reason: format!("tasks did not complete: {}", failed.join(", ")),
                        },
                        Phase::Failed,
                    )
                };
                self.journal.record(EventPayload::RunStatusChanged {
                    status: status.clone(),
                })?;
                tracing::info!(status = status.label(), "run finished");
                self.phase = phase;
                Ok(StepOutcome::Halted { status })
            }
        }
    }

    // -----------------------------------------------------------------------
    // Collaborator calls
    // -----------------------------------------------------------------------

    /// Attempt number for the next call, or the time to wait until.
    fn next_attempt(&self, task_id: &TaskId, stage: CollaboratorStage) -> Result<u32, u64> {
        match &self.journal.state().retry_gate {
            Some(gate) if &gate.task_id == task_id && gate.stage == stage => {
                if self.journal.now_ms() < gate.not_before_ms {
                    Err(gate.not_before_ms)
                } else {
                    Ok(gate.attempt + 1)
                }
            }
            _ => Ok(1),
        }
    }

    fn schedule_retry(
        &mut self,
        task_id: &TaskId,
        stage: CollaboratorStage,
        attempt: u32,
        detail: String,
    ) -> Result<StepOutcome, KernelError> {
        let delay = self.config()?.retry.backoff_ms(attempt);
        let not_before_ms = self.journal.now_ms().saturating_add(delay);
        tracing::warn!(
            task = %task_id,
            stage = stage.as_str(),
            attempt,
            delay_ms = delay,
            %detail,
            "collaborator failed; retrying"
        );
        self.journal.record(EventPayload::CollaboratorRetry {
            task_id: task_id.clone(),
            stage,
            attempt,
            not_before_ms,
            detail: non_empty(detail),
        })?;
        Ok(self.suspended(Suspension::Backoff {
            until_ms: not_before_ms,
        }))
    }

    fn plan(&mut self) -> Result<StepOutcome, KernelError> {
        let state = self.journal.state();
        let Some(task) = self
            .selected
            .as_ref()
            .and_then(|id| state.task(id))
            .filter(|t| t.status == TaskStatus::Ready)
        else {
            return Ok(self.advanced(Phase::Selecting));
        };
        let task_id = task.id.clone();
        let attempt = match self.next_attempt(&task_id, CollaboratorStage::Planning) {
            Ok(attempt) => attempt,
            Err(until_ms) => return Ok(self.suspended(Suspension::Backoff { until_ms })),
        };
        let config = self.config()?.clone();
        let request = PlanRequest {
            run_id: state.run_id.clone(),
            task_id: task_id.clone(),
            spec: task.spec.clone(),
            context: context::get_active_context(state, config.working_set_budget),
            config,
            attempt,
        };

        let planner = &mut self.collaborators.planner;
        match guarded("planner", || planner.plan(&request)) {
            Response::Ready(action) => {
                tracing::debug!(task = %task_id, action = %action.kind, "action planned");
                self.planned = Some(action);
                Ok(self.advanced(Phase::Authorizing))
            }
            Response::Pending => Ok(self.suspended(Suspension::Collaborator)),
            Response::Failed(error) => {
                let retries = self.config()?.retry.max_retries;
                if error.transient && attempt <= retries {
                    return self.schedule_retry(
                        &task_id,
                        CollaboratorStage::Planning,
                        attempt,
                        error.detail,
                    );
                }
                queue::mark_failed(
                    &mut self.journal,
                    &task_id,
                    FailureReason::Collaborator {
                        stage: CollaboratorStage::Planning,
                        detail: non_empty(error.detail),
                    },
                    None,
                )?;
                Ok(self.advanced(Phase::Selecting))
            }
        }
    }

    fn execute(&mut self) -> Result<StepOutcome, KernelError> {
        let state = self.journal.state();
        let Some(task) = state
            .in_flight()
            .filter(|t| t.status == TaskStatus::Running)
        else {
            return Ok(self.advanced(Phase::Selecting));
        };
        let task_id = task.id.clone();
        let retryable = task.spec.retryable;
        let action = task
            .action
            .clone()
            .ok_or_else(|| KernelError::Inconsistent {
                detail: format!("running task {task_id} has no action"),
            })?;

        if std::mem::take(&mut self.interrupted) && !retryable {
            queue::mark_failed(
                &mut self.journal,
                &task_id,
                FailureReason::Collaborator {
                    stage: CollaboratorStage::Executing,
                    detail: "interrupted before its result was recorded".to_string(),
                },
                Some(minimal_usage(&action)),
            )?;
            return Ok(self.advanced(Phase::Selecting));
        }

        let attempt = match self.next_attempt(&task_id, CollaboratorStage::Executing) {
            Ok(attempt) => attempt,
            Err(until_ms) => return Ok(self.suspended(Suspension::Backoff { until_ms })),
        };
        let request = ExecutionRequest {
            run_id: state.run_id.clone(),
            task_id: task_id.clone(),
            action,
            attempt,
        };

        let executor = &mut self.collaborators.executor;
        match guarded("executor", || executor.execute(&request)) {
            Response::Ready(mut result) => {
                let floor = minimal_usage(&request.action);
                result.usage.steps = result.usage.steps.max(floor.steps);
                result.usage.tool_calls = result.usage.tool_calls.max(floor.tool_calls);
                queue::mark_verifying(&mut self.journal, &task_id, result)?;
                Ok(self.advanced(Phase::Verifying))
            }
            Response::Pending => Ok(self.suspended(Suspension::Collaborator)),
            Response::Failed(error) => {
                let retries = self.config()?.retry.max_retries;
                if error.transient && retryable && attempt <= retries {
                    return self.schedule_retry(
                        &task_id,
                        CollaboratorStage::Executing,
                        attempt,
                        error.detail,
                    );
                }
                queue::mark_failed(
                    &mut self.journal,
                    &task_id,
                    FailureReason::Collaborator {
                        stage: CollaboratorStage::Executing,
                        detail: non_empty(error.detail),
                    },
                    Some(minimal_usage(&request.action)),
                )?;
                Ok(self.advanced(Phase::Selecting))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Authorization
    // -----------------------------------------------------------------------

    fn authorize(&mut self) -> Result<StepOutcome, KernelError> {
        let (Some(task_id), Some(action)) = (self.selected.clone(), self.planned.take()) else {
            return Ok(self.advanced(Phase::Selecting));
        };
        let budget = self.elapsed_budget();
        let state = self.journal.state();
        let decision = governor::authorize(
            &action,
            &budget,
            state.autonomy,
            &self.config()?.risk_policy,
        );
        match decision {
            Decision::Approve { reservation } => {
                queue::mark_running(&mut self.journal, &task_id, action, reservation)?;
                Ok(self.advanced(Phase::Executing))
            }
            Decision::Deny(reason) => self.deny(&task_id, reason),
            Decision::RequireConfirmation { rule } => {
                tracing::info!(task = %task_id, action = %action.kind, "awaiting operator");
                self.journal.record(EventPayload::ConfirmationRequested {
                    task_id: task_id.clone(),
                    action,
                    rule,
                })?;
                self.set_status(RunStatus::Paused {
                    reason: PauseReason::Confirmation {
                        task_id: task_id.clone(),
                    },
                })?;
                self.phase = Phase::PendingConfirmation;
                Ok(self.suspended(Suspension::Confirmation { task_id }))
            }
        }
    }

    fn deny(&mut self, task_id: &TaskId, reason: DenialReason) -> Result<StepOutcome, KernelError> {
        tracing::warn!(task = %task_id, %reason, "action denied");
        queue::mark_failed(
            &mut self.journal,
            task_id,
            FailureReason::Denied {
                reason: reason.clone(),
            },
            None,
        )?;
        match reason {
            DenialReason::BudgetExceeded { dimension } => {
                self.halt(StopReason::Budget { dimension })
            }
            DenialReason::Stopped => {
                let reason = self
                    .journal
                    .state()
                    .stop_requested
                    .clone()
                    .unwrap_or(StopReason::Operator {
                        note: "autonomy stopped".to_string(),
                    });
                self.halt(reason)
            }
            DenialReason::OperatorRejected { .. } => Ok(self.advanced(Phase::Selecting)),
        }
    }

    fn await_confirmation(&mut self) -> Result<StepOutcome, KernelError> {
        let Some(pending) = self.journal.state().pending_confirmation.clone() else {
            return Ok(self.advanced(Phase::Selecting));
        };
        let Some(decision) = pending.decision else {
            return Ok(self.suspended(Suspension::Confirmation {
                task_id: pending.task_id,
            }));
        };
        self.set_status(RunStatus::Running)?;
        let task_id = pending.task_id;
        self.selected = Some(task_id.clone());

        if !decision.approved {
            return self.deny(
                &task_id,
                DenialReason::OperatorRejected {
                    operator: decision.operator,
                },
            );
        }
        let budget = self.elapsed_budget();
        match governor::authorize_confirmed(&pending.action, &budget, self.journal.state().autonomy)
        {
            Decision::Approve { reservation } => {
                queue::mark_running(&mut self.journal, &task_id, pending.action, reservation)?;
                Ok(self.advanced(Phase::Executing))
            }
            Decision::Deny(reason) => self.deny(&task_id, reason),
            Decision::RequireConfirmation { .. } => {
                Ok(self.suspended(Suspension::Confirmation { task_id }))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Verification
    // -----------------------------------------------------------------------

    fn verify(&mut self) -> Result<StepOutcome, KernelError> {
        let state = self.journal.state();
        let Some(task) = state
            .in_flight()
            .filter(|t| t.status == TaskStatus::Verifying)
            .cloned()
        else {
            return Ok(self.advanced(Phase::Selecting));
        };
        let result = task.result.clone().ok_or_else(|| KernelError::Inconsistent {
            detail: format!("verifying task {} has no result", task.id),
        })?;
        let config = self.config()?;
        let max_remediation = config.max_remediation_attempts;
        let verification = verifier::verify(&task, &result, config.rubric_pass_threshold);
        let audit = verifier::audit(&task, &verification);
        self.journal
            .record(EventPayload::AuditRecorded { audit })?;

        if verification.passed {
            for output in &result.artifacts {
                let version = self.journal.state().artifacts.next_version(&output.name);
                let artifact = Artifact::new(
                    &output.name,
                    version,
                    output.kind,
                    output.content.clone(),
                    task.id.clone(),
                );
                tracing::debug!(artifact = %artifact.id, "artifact recorded");
                self.journal
                    .record(EventPayload::ArtifactRecorded { artifact })?;
            }
            queue::mark_completed(&mut self.journal, &task.id, verification, result.usage)?;
            self.settled = Some(task.id);
            return Ok(self.advanced(Phase::Checkpointing));
        }

        let failed_criteria = verification.failed_criteria.clone();
        let attempt = task.remediation_attempt();
        let reason = if attempt < max_remediation {
            let spec = verifier::remediation_spec(&task, &verification, attempt + 1);
            let remediation = queue::enqueue(&mut self.journal, spec, task.priority, &[])?;
            tracing::info!(task = %task.id, %remediation, "remediation enqueued");
            FailureReason::VerificationFailed {
                failed_criteria,
                remediation,
            }
        } else {
            FailureReason::RemediationExhausted { failed_criteria }
        };
        queue::mark_failed(&mut self.journal, &task.id, reason, Some(result.usage))?;
        Ok(self.advanced(Phase::Checkpointing))
    }

    // -----------------------------------------------------------------------
    // Checkpointing
    // -----------------------------------------------------------------------

    fn remember_result(&mut self, task_id: &TaskId) -> Result<(), KernelError> {
        let state = self.journal.state();
        let Some(output) = state
            .task(task_id)
            .and_then(|t| t.result.as_ref())
            .map(|r| r.output.clone())
            .filter(|o| !o.trim().is_empty())
        else {
            return Ok(());
        };
        let relevance = context::relevance_to_goal(state, &output);
        let reference = format!("result/{task_id}");
        match context::add_working(&mut self.journal, &reference, &output, relevance) {
            Ok(_) => Ok(()),
            Err(e @ (ContextError::ItemTooLarge { .. } | ContextError::DuplicateReference { .. })) => {
                tracing::debug!(task = %task_id, "result not added to context: {e}");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn checkpoint(&mut self) -> Result<StepOutcome, KernelError> {
        if let Some(task_id) = self.settled.take() {
            self.remember_result(&task_id)?;
        }

        if let Some(distance) = context::check_drift(&mut self.journal)? {
            let from = self.journal.state().autonomy;
            let to = governor::review_drift(from, self.config()?.drift_floor);
            if to == from {
                tracing::info!(mode = from.as_str(), distance, "drift reviewed, mode kept");
                self.journal.record(EventPayload::DriftReviewed {
                    distance,
                    mode: from,
                })?;
            } else {
                tracing::warn!(from = from.as_str(), to = to.as_str(), "autonomy reduced");
                self.journal.record(EventPayload::AutonomyChanged {
                    from,
                    to,
                    reason: format!("working set drifted {distance}‰ from the goal"),
                })?;
            }
        }

        let policy = self.config()?.checkpoint;
        let now = self.journal.now_ms();
        self.checkpoint.steps += 1;
        let due = self.checkpoint.steps >= policy.every_steps
            || now.saturating_sub(self.checkpoint.last_ms) >= policy.every_ms;
        if due {
            let snapshot = self.journal.snapshot()?;
            tracing::info!(index = snapshot.event_index, "snapshot taken");
            self.checkpoint = CheckpointClock {
                steps: 0,
                last_ms: now,
            };
        }
        Ok(self.advanced(Phase::Selecting))
    }
}
