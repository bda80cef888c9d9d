//! Typed orchestration errors.
//!
//! Structural errors ([`QueueError`], [`ContextError`]) reject a mutation
//! before any event is appended; the run continues and the caller decides.
//! [`KernelError`] is what ends a run: integrity failures of the log, a
//! store that can no longer be written, or a control source that cannot be
//! read.

use keel_kernel::schema::{TaskId, TaskStatus};
use keel_kernel::store::StoreError;
use thiserror::Error;

use crate::control::ControlError;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("adding {task_id} → {depends_on} would create a cycle")]
    CycleDetected { task_id: TaskId, depends_on: TaskId },

    #[error("{task_id} depends on unknown task {depends_on}")]
    UnknownDependency { task_id: TaskId, depends_on: TaskId },

    #[error("unknown task {task_id}")]
    UnknownTask { task_id: TaskId },

    #[error("task {task_id} already exists")]
    DuplicateTask { task_id: TaskId },

    #[error("task {task_id} cannot go from {from} to {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("task {task_id} is {status} and can no longer change")]
    Settled { task_id: TaskId, status: TaskStatus },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("{reference} ({size} bytes) exceeds the working-set budget of {budget} bytes")]
    ItemTooLarge {
        reference: String,
        size: u64,
        budget: u64,
    },

    #[error("{reference} is already in the working set")]
    DuplicateReference { reference: String },

    #[error("no {tier} context item named {reference}")]
    UnknownReference {
        reference: String,
        tier: &'static str,
    },

    #[error("long-term item {reference} no longer matches its digest")]
    DigestMismatch { reference: String },

    #[error("run has not started")]
    NotStarted,

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("run {run_id} has not started; nothing to resume")]
    NotStarted { run_id: String },

    #[error("run {run_id} already started")]
    AlreadyStarted { run_id: String },

    #[error("run has halted: {status}")]
    Halted { status: String },

    #[error("kernel state is inconsistent: {detail}")]
    Inconsistent { detail: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("control source: {0}")]
    Control(#[from] ControlError),
}

impl KernelError {
    /// Whether the underlying failure is an integrity error of the log.
    #[must_use]
    pub fn is_integrity(&self) -> bool {
        match self {
            Self::Store(e)
            | Self::Queue(QueueError::Store(e))
            | Self::Context(ContextError::Store(e)) => e.is_integrity(),
            _ => false,
        }
    }
}
