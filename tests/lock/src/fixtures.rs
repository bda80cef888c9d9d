//! Runs, collaborators and log queries used across lock tests.
//!
//! Every fixture uses a [`ManualClock`] and an in-memory backend unless the
//! caller passes its own, so two calls with the same arguments produce the
//! same log byte for byte.

use std::sync::Arc;

use keel_kernel::clock::ManualClock;
use keel_kernel::event::{EventPayload, EventV1};
use keel_kernel::schema::{
    ActionKind, PlannedAction, RunConfig, RunId, TaskKind, TaskResult, TaskSpec,
};
use keel_kernel::store::{EventBackend, EventStore, MemoryBackend};
use keel_orchestrator::{
    Collaborators, ExecutionRequest, Journal, OrchestrationKernel, PlanRequest, Response,
};

pub const GOAL: &str = "summarize the incident report";
pub const START_MS: u64 = 1_700_000_000_000;

/// An analysis task on the run's goal.
#[must_use]
pub fn analysis(title: &str) -> TaskSpec {
    TaskSpec::new(
        title,
        TaskKind::Analysis {
            topic: "incident".into(),
        },
    )
}

/// A successful result whose output stays on topic.
#[must_use]
pub fn on_topic(output: &str) -> TaskResult {
    TaskResult {
        success: true,
        output: format!("{GOAL}: {output}"),
        ..TaskResult::default()
    }
}

/// Planner that always analyzes; executor that always succeeds on topic.
#[must_use]
pub fn steady_collaborators() -> Collaborators {
    Collaborators::new(
        |_: &PlanRequest| -> Response<PlannedAction> {
            Response::Ready(PlannedAction::new(ActionKind::Analyze))
        },
        |request: &ExecutionRequest| -> Response<TaskResult> {
            Response::Ready(on_topic(request.task_id.as_str()))
        },
    )
}

/// Open a store for `run` on `backend` with a manual clock at [`START_MS`].
///
/// # Panics
///
/// If the store cannot be opened.
#[must_use]
pub fn open_store<B: EventBackend>(run: &str, backend: B, clock: &ManualClock) -> EventStore<B> {
    EventStore::open(RunId::new(run), backend, Arc::new(clock.clone())).unwrap()
}

/// A started in-memory kernel with `tasks` independent analysis tasks.
///
/// # Panics
///
/// If the run cannot be started or seeded.
#[must_use]
pub fn kernel_with_tasks(
    run: &str,
    config: RunConfig,
    tasks: usize,
    collaborators: Collaborators,
) -> (OrchestrationKernel<MemoryBackend>, ManualClock) {
    let clock = ManualClock::new(START_MS);
    let store = open_store(run, MemoryBackend::new(), &clock);
    let mut kernel = OrchestrationKernel::start(store, config, GOAL, collaborators).unwrap();
    for n in 0..tasks {
        kernel.enqueue(analysis(&format!("t{n}")), 0, &[]).unwrap();
    }
    (kernel, clock)
}

/// Step `kernel` until it halts, advancing `clock` 10 ms per step.
///
/// # Panics
///
/// On a kernel error, or if the run has not halted after `max_steps`.
pub fn drive_to_halt<B: EventBackend>(
    kernel: &mut OrchestrationKernel<B>,
    clock: &ManualClock,
    max_steps: usize,
) {
    for _ in 0..max_steps {
        if kernel.is_finished() {
            return;
        }
        kernel.step().unwrap();
        clock.advance(10);
    }
    assert!(kernel.is_finished(), "run did not halt in {max_steps} steps");
}

/// A journal on a fresh in-memory run that has recorded `run_started`.
///
/// # Panics
///
/// If the run cannot be started.
#[must_use]
pub fn started_journal(run: &str) -> Journal<MemoryBackend> {
    let clock = ManualClock::new(START_MS);
    let mut journal = Journal::load(open_store(run, MemoryBackend::new(), &clock)).unwrap();
    journal
        .record(EventPayload::RunStarted {
            goal: GOAL.into(),
            config: RunConfig::default(),
        })
        .unwrap();
    journal
}

/// Event types in log order.
#[must_use]
pub fn event_types(events: &[EventV1]) -> Vec<&'static str> {
    events.iter().map(|e| e.payload.event_type()).collect()
}

/// Index of the first event of `event_type`.
#[must_use]
pub fn first_index(events: &[EventV1], event_type: &str) -> Option<usize> {
    events
        .iter()
        .position(|e| e.payload.event_type() == event_type)
}
