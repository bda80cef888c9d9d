//! Contracts of the external planning and execution collaborators.
//!
//! Collaborators are untrusted and fallible. The kernel never acts on a
//! planned action without the governor's approval, never commits a result
//! without the verifier's, and treats a panic inside a collaborator as a
//! failure of that call.
//!
//! # Suspension
//!
//! A collaborator that cannot answer yet returns [`Response::Pending`]. The
//! kernel keeps its phase and asks again on the next step, so a long-running
//! call never blocks the scheduler thread.

use keel_kernel::schema::{
    ContextItem, PlannedAction, RunConfig, RunId, TaskId, TaskResult, TaskSpec,
};
use thiserror::Error;

/// Outcome of one collaborator call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response<T> {
    Ready(T),
    /// Not finished; poll again on a later step.
    Pending,
    Failed(CollaboratorError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{detail}")]
pub struct CollaboratorError {
    /// Transient failures are retried with backoff; permanent ones fail the
    /// task immediately.
    pub transient: bool,
    pub detail: String,
}

impl CollaboratorError {
    pub fn transient(detail: impl Into<String>) -> Self {
        Self {
            transient: true,
            detail: detail.into(),
        }
    }

    pub fn permanent(detail: impl Into<String>) -> Self {
        Self {
            transient: false,
            detail: detail.into(),
        }
    }
}

/// Input to the planning collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanRequest {
    pub run_id: RunId,
    pub task_id: TaskId,
    pub spec: TaskSpec,
    /// Active context: pinned items first, then working items by relevance.
    pub context: Vec<ContextItem>,
    pub config: RunConfig,
    /// 1 for the first call, incremented per retry.
    pub attempt: u32,
}

/// Input to the execution collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub run_id: RunId,
    pub task_id: TaskId,
    pub action: PlannedAction,
    pub attempt: u32,
}

/// Turns a task and its context into one concrete action.
pub trait Planner: Send {
    fn plan(&mut self, request: &PlanRequest) -> Response<PlannedAction>;
}

/// Performs an authorized action.
///
/// The kernel only calls `execute` again for the same task after a
/// transient failure if the task is marked retryable.
pub trait Executor: Send {
    fn execute(&mut self, request: &ExecutionRequest) -> Response<TaskResult>;
}

impl<F> Planner for F
where
    F: FnMut(&PlanRequest) -> Response<PlannedAction> + Send,
{
    fn plan(&mut self, request: &PlanRequest) -> Response<PlannedAction> {
        self(request)
    }
}

impl<F> Executor for F
where
    F: FnMut(&ExecutionRequest) -> Response<TaskResult> + Send,
{
    fn execute(&mut self, request: &ExecutionRequest) -> Response<TaskResult> {
        self(request)
    }
}
