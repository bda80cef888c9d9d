//! File-backed runs driven from the command line.
//!
//! A run file names the run, its goal and the tasks to seed:
//!
//! ```json
//! {
//!   "run_id": "incident-42",
//!   "goal": "summarize the incident",
//!   "config": { "autonomy": "supervised" },
//!   "tasks": [
//!     { "label": "read", "spec": { "title": "read logs", "kind": { "type": "analysis", "topic": "logs" } } }
//!   ]
//! }
//! ```
//!
//! Collaborators are scripted exactly as in a test spec. Opening a run
//! whose log already exists resumes it; seeds are enqueued only once, in
//! file order, so the n-th seed is always `task-000n`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use keel_kernel::clock::{Clock, SystemClock};
use keel_kernel::schema::{Budgets, RunConfig, RunConfigOverrides, RunId, TaskId};
use keel_kernel::store::{BackendError, EventStore, FileBackend};
use keel_orchestrator::{
    Collaborators, FileControlInbox, KernelError, OrchestrationKernel, StepOutcome, Suspension,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::script::ScriptBook;
use crate::spec::QueueInjection;

#[derive(Debug, Error)]
pub enum LiveError {
    #[error("run file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("run file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("seed {label:?} depends on {depends_on:?}, which is not an earlier seed")]
    UnknownLabel { label: String, depends_on: String },

    #[error("{task_id} in the log is {found:?}, but the run file seeds {expected:?}")]
    SeedMismatch {
        task_id: TaskId,
        expected: String,
        found: String,
    },

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Kernel(#[from] KernelError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunFileV1 {
    pub run_id: RunId,
    pub goal: String,
    #[serde(default)]
    pub budgets: Option<Budgets>,
    #[serde(default)]
    pub config: RunConfigOverrides,
    #[serde(default)]
    pub tasks: Vec<QueueInjection>,
}

impl RunFileV1 {
    /// Read and parse a run file.
    ///
    /// # Errors
    ///
    /// I/O and parse errors.
    pub fn load(path: &Path) -> Result<Self, LiveError> {
        let json = std::fs::read_to_string(path).map_err(|source| LiveError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&json).map_err(|source| LiveError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    #[must_use]
    pub fn run_config(&self) -> RunConfig {
        let mut config = self.config.clone().apply(RunConfig::default());
        if let Some(budgets) = self.budgets {
            config.budgets = budgets;
        }
        config
    }
}

/// Open the run described by `file` under `root`, starting it if its log
/// is empty and resuming it otherwise.
///
/// # Errors
///
/// Store and kernel errors; seeds that do not match the tasks already in
/// the log.
pub fn open(
    root: &Path,
    file: &RunFileV1,
    clock: Arc<dyn Clock>,
) -> Result<OrchestrationKernel<FileBackend>, LiveError> {
    let backend = FileBackend::new(root);
    let run_dir = backend.run_dir(&file.run_id)?;
    let store = EventStore::open(file.run_id.clone(), backend, clock).map_err(KernelError::from)?;
    let fresh = store.next_index() == 0;

    let book = ScriptBook::for_goal(&file.goal);
    let (planner, executor) = book.collaborators();
    let collaborators =
        Collaborators::new(planner, executor).with_control(FileControlInbox::new(&run_dir));
    let mut kernel = if fresh {
        OrchestrationKernel::start(store, file.run_config(), &file.goal, collaborators)?
    } else {
        OrchestrationKernel::resume(store, collaborators)?
    };

    let mut labels: BTreeMap<&str, TaskId> = BTreeMap::new();
    for (seq, seed) in file.tasks.iter().enumerate() {
        let id = TaskId::from_seq(seq as u64);
        let existing = kernel
            .journal()
            .state()
            .task(&id)
            .map(|t| t.spec.title.clone());
        match existing {
            Some(title) if title == seed.spec.title => {}
            Some(found) => {
                return Err(LiveError::SeedMismatch {
                    task_id: id,
                    expected: seed.spec.title.clone(),
                    found,
                })
            }
            None if !kernel.is_finished() => {
                let deps = seed
                    .depends_on
                    .iter()
                    .map(|l| {
                        labels
                            .get(l.as_str())
                            .cloned()
                            .ok_or_else(|| LiveError::UnknownLabel {
                                label: seed.label.clone(),
                                depends_on: l.clone(),
                            })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let assigned = kernel.enqueue(seed.spec.clone(), seed.priority, &deps)?;
                tracing::debug!(task = %assigned, label = %seed.label, "seeded");
            }
            None => {}
        }
        book.insert(id.clone(), seed.script.clone());
        labels.insert(&seed.label, id);
    }
    Ok(kernel)
}

/// Directory of `run_id` under `root`, for sending control signals.
///
/// # Errors
///
/// [`BackendError::InvalidRunId`] for ids that are not plain file names.
pub fn run_dir(root: &Path, run_id: &RunId) -> Result<PathBuf, BackendError> {
    FileBackend::new(root).run_dir(run_id)
}

/// How long [`drive`] waits on a suspended run before polling again.
#[derive(Debug, Clone, Copy)]
pub struct WaitPolicy {
    /// Keep polling a run that waits on an operator or a collaborator.
    pub follow: bool,
    pub poll: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            follow: false,
            poll: Duration::from_millis(250),
        }
    }
}

/// Step `kernel` until it halts, `max_steps` steps have run, or it waits on
/// something external and `wait.follow` is off. Backoffs are slept through.
///
/// # Errors
///
/// Kernel errors.
pub fn drive(
    kernel: &mut OrchestrationKernel<FileBackend>,
    max_steps: usize,
    wait: WaitPolicy,
) -> Result<StepOutcome, KernelError> {
    let mut last = StepOutcome::Advanced {
        phase: kernel.phase(),
    };
    for _ in 0..max_steps {
        last = kernel.step()?;
        match &last {
            StepOutcome::Advanced { .. } => {}
            StepOutcome::Halted { .. } => break,
            StepOutcome::Suspended {
                reason: Suspension::Backoff { until_ms },
                ..
            } => {
                let now = kernel.journal().now_ms();
                let pause = Duration::from_millis(until_ms.saturating_sub(now));
                tracing::info!(ms = pause.as_millis(), "backing off");
                std::thread::sleep(pause);
            }
            StepOutcome::Suspended { reason, .. } => {
                if !wait.follow {
                    break;
                }
                tracing::debug!(?reason, "waiting");
                std::thread::sleep(wait.poll);
            }
        }
    }
    Ok(last)
}

/// The system clock, for runs driven from the command line.
#[must_use]
pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}
