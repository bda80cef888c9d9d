//! Scripted collaborators driven by a [`ScriptedBehaviour`] per task.
//!
//! The planner and executor share one [`ScriptBook`]. Remediation tasks are
//! not seeded, so the planner adopts them on first sight: a remediation
//! task answers with its root seed's `remediate` script.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use keel_kernel::schema::{PlannedAction, TaskId, TaskKind, TaskResult};
use keel_orchestrator::{
    CollaboratorError, ExecutionRequest, Executor, PlanRequest, Planner, Response,
};

use crate::spec::{default_action, ExecuteStep, PlanStep, ScriptedBehaviour};

#[derive(Debug, Default)]
struct Cursor {
    plan: usize,
    execute: usize,
}

#[derive(Debug)]
struct Entry {
    behaviour: ScriptedBehaviour,
    remediation: bool,
    cursor: Cursor,
}

/// Next entry of `steps`, repeating the last once exhausted.
fn next_step<'a, T>(steps: &'a [T], cursor: &mut usize) -> Option<&'a T> {
    let step = steps.get(*cursor).or_else(|| steps.last());
    *cursor += 1;
    step
}

#[derive(Debug, Default)]
struct Book {
    entries: BTreeMap<TaskId, Entry>,
    /// Seed behaviour by task id, for adopting remediations.
    seeds: BTreeMap<TaskId, ScriptedBehaviour>,
    default_output: Option<String>,
}

/// Scripts keyed by task id. Clones share the same book.
#[derive(Debug, Clone, Default)]
pub struct ScriptBook {
    inner: Arc<Mutex<Book>>,
}

impl ScriptBook {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A book whose unscripted executions report `goal` as their output,
    /// keeping default results on topic for drift detection.
    #[must_use]
    pub fn for_goal(goal: &str) -> Self {
        let book = Self::default();
        book.book().default_output = Some(goal.to_string());
        book
    }

    fn book(&self) -> MutexGuard<'_, Book> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the script for a seeded task.
    pub fn insert(&self, task_id: TaskId, behaviour: ScriptedBehaviour) {
        let mut book = self.book();
        book.seeds.insert(task_id.clone(), behaviour.clone());
        book.entries.insert(
            task_id,
            Entry {
                behaviour,
                remediation: false,
                cursor: Cursor::default(),
            },
        );
    }

    /// A planner and an executor reading this book.
    #[must_use]
    pub fn collaborators(&self) -> (ScriptedPlanner, ScriptedExecutor) {
        (
            ScriptedPlanner { book: self.clone() },
            ScriptedExecutor { book: self.clone() },
        )
    }

    fn adopt(&self, task_id: &TaskId, kind: &TaskKind) {
        let mut book = self.book();
        if book.entries.contains_key(task_id) {
            return;
        }
        let TaskKind::Remediation { original, .. } = kind else {
            return;
        };
        let behaviour = book.seeds.get(original).cloned().unwrap_or_default();
        tracing::debug!(task = %task_id, %original, "remediation adopts seed script");
        book.entries.insert(
            task_id.clone(),
            Entry {
                behaviour,
                remediation: true,
                cursor: Cursor::default(),
            },
        );
    }

    fn plan_step(&self, task_id: &TaskId) -> Option<PlanStep> {
        let mut book = self.book();
        let entry = book.entries.get_mut(task_id)?;
        next_step(&entry.behaviour.plan, &mut entry.cursor.plan).cloned()
    }

    fn default_output(&self) -> Option<String> {
        self.book().default_output.clone()
    }

    fn execute_step(&self, task_id: &TaskId) -> Option<ExecuteStep> {
        let mut book = self.book();
        let entry = book.entries.get_mut(task_id)?;
        let steps = if entry.remediation {
            &entry.behaviour.remediate
        } else {
            &entry.behaviour.execute
        };
        next_step(steps, &mut entry.cursor.execute).cloned()
    }
}

pub struct ScriptedPlanner {
    book: ScriptBook,
}

impl Planner for ScriptedPlanner {
    fn plan(&mut self, request: &PlanRequest) -> Response<PlannedAction> {
        self.book.adopt(&request.task_id, &request.spec.kind);
        match self.book.plan_step(&request.task_id) {
            Some(PlanStep::Action { action }) => Response::Ready(action),
            Some(PlanStep::Fail { transient, detail }) => Response::Failed(CollaboratorError {
                transient,
                detail,
            }),
            Some(PlanStep::Pending) => Response::Pending,
            None => Response::Ready(default_action(&request.spec.kind)),
        }
    }
}

pub struct ScriptedExecutor {
    book: ScriptBook,
}

impl Executor for ScriptedExecutor {
    fn execute(&mut self, request: &ExecutionRequest) -> Response<TaskResult> {
        match self.book.execute_step(&request.task_id) {
            Some(ExecuteStep::Result { result }) => Response::Ready(result),
            Some(ExecuteStep::Fail { transient, detail }) => Response::Failed(CollaboratorError {
                transient,
                detail,
            }),
            Some(ExecuteStep::Pending) => Response::Pending,
            Some(ExecuteStep::Panic { message }) => panic!("{message}"),
            None => Response::Ready(TaskResult {
                success: true,
                output: self
                    .book
                    .default_output()
                    .unwrap_or_else(|| format!("{} done", request.action.kind)),
                ..TaskResult::default()
            }),
        }
    }
}
