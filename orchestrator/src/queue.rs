//! Task queue and dependency DAG.
//!
//! The queue holds no state of its own. Every mutation is checked against
//! the materialized [`KernelState`] and then appended as an event; readiness
//! (`pending ⇄ ready`) is re-derived by the fold.
//!
//! Selection order is highest priority first, then earliest insertion.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use keel_kernel::event::{EventPayload, QueueMutation};
use keel_kernel::materialize::KernelState;
use keel_kernel::schema::{
    FailureReason, PlannedAction, ResourceCost, TaskId, TaskResult, TaskSpec, TaskStatus,
    VerificationResult,
};
use keel_kernel::store::EventBackend;

use crate::error::QueueError;
use crate::journal::Journal;

/// Ordering key: higher priority wins, then lower sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: i64,
    seq: Reverse<u64>,
}

#[derive(Debug)]
struct QueueEntry {
    key: QueueKey,
    task_id: TaskId,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

/// Ready tasks of a state, in selection order.
#[derive(Debug, Default)]
pub struct QueueState {
    heap: BinaryHeap<QueueEntry>,
}

impl QueueState {
    #[must_use]
    pub fn from_state(state: &KernelState) -> Self {
        let heap = state
            .tasks_with_status(TaskStatus::Ready)
            .map(|task| QueueEntry {
                key: QueueKey {
                    priority: task.priority,
                    seq: Reverse(task.seq),
                },
                task_id: task.id.clone(),
            })
            .collect();
        Self { heap }
    }

    #[must_use]
    pub fn peek(&self) -> Option<&TaskId> {
        self.heap.peek().map(|e| &e.task_id)
    }

    pub fn pop(&mut self) -> Option<TaskId> {
        self.heap.pop().map(|e| e.task_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Drain into selection order.
    #[must_use]
    pub fn into_ordered(mut self) -> Vec<TaskId> {
        let mut out = Vec::with_capacity(self.heap.len());
        while let Some(id) = self.pop() {
            out.push(id);
        }
        out
    }
}

/// What the queue offers next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Task(TaskId),
    /// Nothing is ready but these tasks are still waiting on dependencies.
    Blocked { waiting: Vec<TaskId> },
    /// Every task has settled.
    Empty,
}

/// Highest-priority ready task, or why there is none.
#[must_use]
pub fn select_next(state: &KernelState) -> Selection {
    if let Some(id) = QueueState::from_state(state).pop() {
        return Selection::Task(id);
    }
    let waiting: Vec<TaskId> = state
        .tasks
        .values()
        .filter(|t| !t.status.is_terminal())
        .map(|t| t.id.clone())
        .collect();
    if waiting.is_empty() {
        Selection::Empty
    } else {
        Selection::Blocked { waiting }
    }
}

/// Add a task to the DAG. Its id is derived from its insertion sequence.
///
/// # Errors
///
/// [`QueueError::UnknownDependency`] or [`QueueError::CycleDetected`]
/// before anything is appended; store errors otherwise.
pub fn enqueue<B: EventBackend>(
    journal: &mut Journal<B>,
    spec: TaskSpec,
    priority: i64,
    depends_on: &[TaskId],
) -> Result<TaskId, QueueError> {
    let state = journal.state();
    let task_id = TaskId::from_seq(state.next_seq);
    if state.task(&task_id).is_some() {
        return Err(QueueError::DuplicateTask { task_id });
    }

    let mut deps: Vec<TaskId> = Vec::with_capacity(depends_on.len());
    for dep in depends_on {
        // A task naming its own id would be its own dependency.
        if *dep == task_id {
            return Err(QueueError::CycleDetected {
                task_id,
                depends_on: dep.clone(),
            });
        }
        if state.task(dep).is_none() {
            return Err(QueueError::UnknownDependency {
                task_id,
                depends_on: dep.clone(),
            });
        }
        if state.depends_transitively(dep, &task_id) {
            return Err(QueueError::CycleDetected {
                task_id,
                depends_on: dep.clone(),
            });
        }
        if !deps.contains(dep) {
            deps.push(dep.clone());
        }
    }

    journal.record(EventPayload::QueueMutation(QueueMutation::Enqueued {
        task_id: task_id.clone(),
        spec,
        priority,
        depends_on: deps,
    }))?;
    tracing::info!(task = %task_id, priority, "task enqueued");
    Ok(task_id)
}

/// Make `task_id` wait for `depends_on`. Idempotent.
///
/// # Errors
///
/// Unknown tasks, a task that has already left the queue, or an edge that
/// would close a cycle.
pub fn add_dependency<B: EventBackend>(
    journal: &mut Journal<B>,
    task_id: &TaskId,
    depends_on: &TaskId,
) -> Result<(), QueueError> {
    let state = journal.state();
    let task = state.task(task_id).ok_or_else(|| QueueError::UnknownTask {
        task_id: task_id.clone(),
    })?;
    if state.task(depends_on).is_none() {
        return Err(QueueError::UnknownDependency {
            task_id: task_id.clone(),
            depends_on: depends_on.clone(),
        });
    }
    if !matches!(task.status, TaskStatus::Pending | TaskStatus::Ready) {
        return Err(QueueError::Settled {
            task_id: task_id.clone(),
            status: task.status,
        });
    }
    if task.depends_on.contains(depends_on) {
        return Ok(());
    }
    if task_id == depends_on || state.depends_transitively(depends_on, task_id) {
        return Err(QueueError::CycleDetected {
            task_id: task_id.clone(),
            depends_on: depends_on.clone(),
        });
    }
    journal.record(EventPayload::QueueMutation(QueueMutation::DependencyAdded {
        task_id: task_id.clone(),
        depends_on: depends_on.clone(),
    }))?;
    tracing::debug!(task = %task_id, depends_on = %depends_on, "dependency added");
    Ok(())
}

/// Change the priority of an unsettled task.
///
/// # Errors
///
/// Unknown or settled tasks; store errors.
pub fn reprioritize<B: EventBackend>(
    journal: &mut Journal<B>,
    task_id: &TaskId,
    priority: i64,
) -> Result<(), QueueError> {
    let task = journal
        .state()
        .task(task_id)
        .ok_or_else(|| QueueError::UnknownTask {
            task_id: task_id.clone(),
        })?;
    if task.status.is_terminal() {
        return Err(QueueError::Settled {
            task_id: task_id.clone(),
            status: task.status,
        });
    }
    if task.priority == priority {
        return Ok(());
    }
    journal.record(EventPayload::QueueMutation(QueueMutation::Reprioritized {
        task_id: task_id.clone(),
        priority,
    }))?;
    Ok(())
}

/// Enqueue a fresh copy of a failed task. The failed task keeps its status.
///
/// # Errors
///
/// [`QueueError::InvalidTransition`] unless `failed` is in `Failed`.
pub fn requeue<B: EventBackend>(
    journal: &mut Journal<B>,
    failed: &TaskId,
) -> Result<TaskId, QueueError> {
    let task = journal
        .state()
        .task(failed)
        .ok_or_else(|| QueueError::UnknownTask {
            task_id: failed.clone(),
        })?;
    if task.status != TaskStatus::Failed {
        return Err(QueueError::InvalidTransition {
            task_id: failed.clone(),
            from: task.status,
            to: TaskStatus::Pending,
        });
    }
    let spec = task.spec.clone();
    let priority = task.priority;
    let deps = task.depends_on.clone();
    enqueue(journal, spec, priority, &deps)
}

fn check_transition(
    state: &KernelState,
    task_id: &TaskId,
    to: TaskStatus,
) -> Result<(), QueueError> {
    let from = state
        .task(task_id)
        .ok_or_else(|| QueueError::UnknownTask {
            task_id: task_id.clone(),
        })?
        .status;
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(QueueError::InvalidTransition {
            task_id: task_id.clone(),
            from,
            to,
        })
    }
}

/// `ready → running` with an authorized action and its reservation.
///
/// # Errors
///
/// Invalid transitions or store errors.
pub fn mark_running<B: EventBackend>(
    journal: &mut Journal<B>,
    task_id: &TaskId,
    action: PlannedAction,
    reservation: ResourceCost,
) -> Result<(), QueueError> {
    check_transition(journal.state(), task_id, TaskStatus::Running)?;
    let task_kind = journal
        .state()
        .task(task_id)
        .map(|t| t.spec.kind.name().to_string())
        .unwrap_or_default();
    journal.record(EventPayload::TaskRunning {
        task_id: task_id.clone(),
        task_kind,
        action,
        reservation,
    })?;
    Ok(())
}

/// `running → verifying` with the executor's result.
///
/// # Errors
///
/// Invalid transitions or store errors.
pub fn mark_verifying<B: EventBackend>(
    journal: &mut Journal<B>,
    task_id: &TaskId,
    result: TaskResult,
) -> Result<(), QueueError> {
    check_transition(journal.state(), task_id, TaskStatus::Verifying)?;
    journal.record(EventPayload::TaskVerifying {
        task_id: task_id.clone(),
        result,
    })?;
    Ok(())
}

/// `verifying → completed`, settling the reservation against `usage`.
///
/// # Errors
///
/// Invalid transitions or store errors.
pub fn mark_completed<B: EventBackend>(
    journal: &mut Journal<B>,
    task_id: &TaskId,
    verification: VerificationResult,
    usage: ResourceCost,
) -> Result<(), QueueError> {
    check_transition(journal.state(), task_id, TaskStatus::Completed)?;
    journal.record(EventPayload::TaskCompleted {
        task_id: task_id.clone(),
        verification,
        usage,
    })?;
    tracing::info!(task = %task_id, "task completed");
    Ok(())
}

/// Fail a task from any non-terminal state that allows it.
///
/// # Errors
///
/// Invalid transitions or store errors.
pub fn mark_failed<B: EventBackend>(
    journal: &mut Journal<B>,
    task_id: &TaskId,
    reason: FailureReason,
    usage: Option<ResourceCost>,
) -> Result<(), QueueError> {
    check_transition(journal.state(), task_id, TaskStatus::Failed)?;
    tracing::warn!(task = %task_id, %reason, "task failed");
    journal.record(EventPayload::TaskFailed {
        task_id: task_id.clone(),
        reason,
        usage,
    })?;
    Ok(())
}

/// Block a task whose dependency can never be satisfied.
///
/// # Errors
///
/// Invalid transitions or store errors.
pub fn mark_blocked<B: EventBackend>(
    journal: &mut Journal<B>,
    task_id: &TaskId,
    blocked_by: &TaskId,
) -> Result<(), QueueError> {
    check_transition(journal.state(), task_id, TaskStatus::Blocked)?;
    journal.record(EventPayload::TaskBlocked {
        task_id: task_id.clone(),
        blocked_by: blocked_by.clone(),
    })?;
    tracing::warn!(task = %task_id, blocked_by = %blocked_by, "task blocked");
    Ok(())
}

/// Block every waiting task with an unsatisfiable dependency, repeating
/// until the blockage stops propagating. Returns the tasks blocked.
///
/// # Errors
///
/// Store errors.
pub fn block_unsatisfiable<B: EventBackend>(
    journal: &mut Journal<B>,
) -> Result<Vec<TaskId>, QueueError> {
    let mut blocked = Vec::new();
    loop {
        let state = journal.state();
        let next = state
            .tasks
            .values()
            .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Ready))
            .find_map(|t| {
                state
                    .unsatisfiable_dependency(t)
                    .map(|dep| (t.id.clone(), dep))
            });
        let Some((task_id, dep)) = next else {
            return Ok(blocked);
        };
        mark_blocked(journal, &task_id, &dep)?;
        blocked.push(task_id);
    }
}
