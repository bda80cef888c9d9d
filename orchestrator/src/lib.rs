//! Keel Orchestrator: drives a run's task DAG toward its goal.
//!
//! Every component here reads [`KernelState`](keel_kernel::materialize::KernelState)
//! and writes only by appending events through a [`Journal`]. Nothing holds
//! state the log cannot reproduce.
//!
//! # Crate dependency graph
//!
//! ```text
//! keel_kernel  ←  keel_orchestrator  ←  keel_harness
//! (log, fold)     (queue, governor,      (test DSL, log store, CLI)
//!                  verifier, kernel)
//! ```
//!
//! # Key types
//!
//! - [`OrchestrationKernel`]: the step-driven state machine for one run
//! - [`Planner`] / [`Executor`]: the external collaborators it calls
//! - [`Decision`]: the governor's verdict on a planned action
//! - [`Scheduler`]: interleaves steps of many runs

#![forbid(unsafe_code)]

pub mod context;
pub mod contract;
pub mod control;
pub mod error;
pub mod governor;
pub mod journal;
pub mod kernel;
pub mod queue;
pub mod scheduler;
pub mod verifier;

pub use contract::{CollaboratorError, ExecutionRequest, Executor, PlanRequest, Planner, Response};
pub use control::{
    ControlError, ControlInbox, ControlSignal, ControlSource, FileControlInbox, NoControl,
};
pub use error::{ContextError, KernelError, QueueError};
pub use governor::Decision;
pub use journal::Journal;
pub use kernel::{Collaborators, OrchestrationKernel, Phase, StepOutcome, Suspension};
pub use queue::{QueueState, Selection};
pub use scheduler::{Pump, Retired, Scheduler};
