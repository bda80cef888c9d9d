//! Shared helpers for keel benchmark suites.

use std::sync::Arc;

use keel_kernel::clock::ManualClock;
use keel_kernel::event::EventPayload;
use keel_kernel::schema::{
    ActionKind, CheckpointPolicy, PlannedAction, RunConfig, RunId, TaskKind, TaskResult, TaskSpec,
};
use keel_kernel::store::{EventStore, MemoryBackend};
use keel_orchestrator::{
    Collaborators, ExecutionRequest, Journal, OrchestrationKernel, PlanRequest, Response,
};

pub const GOAL: &str = "summarize the incident report";
pub const START_MS: u64 = 1_700_000_000_000;

#[must_use]
pub fn analysis(title: &str) -> TaskSpec {
    TaskSpec::new(
        title,
        TaskKind::Analysis {
            topic: "incident".into(),
        },
    )
}

/// Open a store for `run` on `backend` with a manual clock.
///
/// # Panics
///
/// Panics if the persisted log does not verify. Benchmark setup failures are fatal.
#[must_use]
pub fn open_store(run: &str, backend: MemoryBackend, clock: &ManualClock) -> EventStore<MemoryBackend> {
    EventStore::open(RunId::new(run), backend, Arc::new(clock.clone())).expect("open store")
}

/// A journal on a fresh run that has recorded `run_started`.
///
/// # Panics
///
/// Panics if the run cannot be started.
#[must_use]
pub fn started_journal(run: &str) -> Journal<MemoryBackend> {
    let clock = ManualClock::new(START_MS);
    let mut journal = Journal::load(open_store(run, MemoryBackend::new(), &clock)).expect("load");
    journal
        .record(EventPayload::RunStarted {
            goal: GOAL.into(),
            config: RunConfig::default(),
        })
        .expect("run_started");
    journal
}

fn collaborators() -> Collaborators {
    Collaborators::new(
        |_: &PlanRequest| -> Response<PlannedAction> {
            Response::Ready(PlannedAction::new(ActionKind::Analyze))
        },
        |request: &ExecutionRequest| -> Response<TaskResult> {
            Response::Ready(TaskResult {
                success: true,
                output: format!("{GOAL}: {}", request.task_id),
                ..TaskResult::default()
            })
        },
    )
}

/// Drive a run of `tasks` independent tasks to completion and return its
/// backend, snapshotting every `snapshot_every` checkpoints.
///
/// # Panics
///
/// Panics if the run errors or does not finish.
#[must_use]
pub fn completed_run(run: &str, tasks: usize, snapshot_every: u64) -> MemoryBackend {
    let clock = ManualClock::new(START_MS);
    let backend = MemoryBackend::new();
    let mut config = RunConfig::default();
    config.budgets.max_steps = u64::MAX / 2;
    config.checkpoint = CheckpointPolicy {
        every_steps: snapshot_every,
        every_ms: u64::MAX,
    };
    let mut kernel = OrchestrationKernel::start(
        open_store(run, backend.clone(), &clock),
        config,
        GOAL,
        collaborators(),
    )
    .expect("start");
    for n in 0..tasks {
        kernel.enqueue(analysis(&format!("t{n}")), 0, &[]).expect("enqueue");
    }
    while !kernel.is_finished() {
        kernel.step().expect("step");
        clock.advance(1);
    }
    backend
}
