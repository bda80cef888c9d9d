//! Replay determinism lock tests.
//!
//! Proves:
//! 1. Folding the full log reproduces the live state, digest for digest
//! 2. Every snapshot plus the events after it reproduces a genesis replay
//! 3. A file-backed run reloads to the same state in a fresh store
//! 4. Two identical runs produce identical logs

use keel_kernel::clock::ManualClock;
use keel_kernel::schema::{
    AcceptanceCriterion, ActionKind, CheckpointPolicy, DeterministicCheck, PlannedAction,
    RunConfig, TaskResult, TaskSpec,
};
use keel_kernel::store::{FileBackend, MemoryBackend};
use keel_orchestrator::{
    Collaborators, ExecutionRequest, OrchestrationKernel, PlanRequest, Response,
};
use lock_tests::fixtures::{
    analysis, drive_to_halt, kernel_with_tasks, on_topic, open_store, steady_collaborators, GOAL,
    START_MS,
};

fn frequent_snapshots() -> RunConfig {
    RunConfig {
        checkpoint: CheckpointPolicy {
            every_steps: 1,
            every_ms: 60_000,
        },
        ..RunConfig::default()
    }
}

/// First execution of every task returns non-JSON, so each spawns a
/// remediation; the log then covers failure, audit and remediation paths.
fn remediating_collaborators() -> Collaborators {
    Collaborators::new(
        |_: &PlanRequest| -> Response<PlannedAction> {
            Response::Ready(PlannedAction::new(ActionKind::Analyze))
        },
        |request: &ExecutionRequest| -> Response<TaskResult> {
            if request.task_id.as_str() < "task-0003" {
                Response::Ready(on_topic("not json"))
            } else {
                Response::Ready(TaskResult {
                    success: true,
                    output: format!("{{\"goal\":\"{GOAL}\"}}"),
                    ..TaskResult::default()
                })
            }
        },
    )
}

fn json_task(title: &str) -> TaskSpec {
    analysis(title).with_criterion(AcceptanceCriterion::deterministic(
        "json",
        DeterministicCheck::OutputIsJson,
    ))
}

// ---------------------------------------------------------------------------
// 1. Full replay equals live state
// ---------------------------------------------------------------------------

#[test]
fn full_replay_matches_live_state() {
    let (mut kernel, clock) =
        kernel_with_tasks("replay-live", frequent_snapshots(), 0, remediating_collaborators());
    for n in 0..3 {
        kernel.enqueue(json_task(&format!("j{n}")), 0, &[]).unwrap();
    }
    drive_to_halt(&mut kernel, &clock, 200);

    let journal = kernel.journal();
    let replayed = journal.store().replay(None).unwrap();
    assert_eq!(&replayed, journal.state());
    assert_eq!(replayed.digest().unwrap(), journal.state().digest().unwrap());
}

// ---------------------------------------------------------------------------
// 2. Snapshot + tail equals genesis replay, at every snapshot
// ---------------------------------------------------------------------------

#[test]
fn every_snapshot_replays_to_the_genesis_state() {
    let (mut kernel, clock) =
        kernel_with_tasks("replay-snap", frequent_snapshots(), 0, remediating_collaborators());
    for n in 0..3 {
        kernel.enqueue(json_task(&format!("j{n}")), 0, &[]).unwrap();
    }

    let mut snapshots_seen = 0;
    let mut last_snapshot_index = None;
    for _ in 0..200 {
        if kernel.is_finished() {
            break;
        }
        kernel.step().unwrap();
        clock.advance(10);

        let store = kernel.journal().store();
        let Some(snapshot) = store.latest_snapshot().unwrap() else {
            continue;
        };
        if last_snapshot_index == Some(snapshot.event_index) {
            continue;
        }
        last_snapshot_index = Some(snapshot.event_index);
        snapshots_seen += 1;

        store.verify_snapshot(&snapshot).unwrap();
        let from_snapshot = store.replay(Some(&snapshot)).unwrap();
        let from_genesis = store.replay(None).unwrap();
        assert_eq!(
            from_snapshot.digest().unwrap(),
            from_genesis.digest().unwrap(),
            "snapshot at event {} diverges from genesis replay",
            snapshot.event_index
        );
    }
    assert!(kernel.is_finished());
    assert!(snapshots_seen >= 3, "only {snapshots_seen} snapshots taken");
}

// ---------------------------------------------------------------------------
// 3. File-backed persistence
// ---------------------------------------------------------------------------

#[test]
fn file_backed_run_reloads_identically() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(START_MS);
    let store = open_store("persisted", FileBackend::new(dir.path()), &clock);
    let mut kernel =
        OrchestrationKernel::start(store, frequent_snapshots(), GOAL, steady_collaborators())
            .unwrap();
    kernel.enqueue(analysis("a"), 0, &[]).unwrap();
    kernel.enqueue(analysis("b"), 0, &[]).unwrap();
    drive_to_halt(&mut kernel, &clock, 100);
    let live = kernel.journal().state().clone();
    drop(kernel);

    let reopened = open_store("persisted", FileBackend::new(dir.path()), &clock);
    assert_eq!(reopened.verify_chain().unwrap(), live.next_index());
    assert_eq!(reopened.replay_latest().unwrap(), live);
    assert_eq!(reopened.replay(None).unwrap(), live);
}

// ---------------------------------------------------------------------------
// 4. Identical inputs, identical logs
// ---------------------------------------------------------------------------

#[test]
fn identical_runs_produce_identical_logs() {
    let run = || {
        let (mut kernel, clock) =
            kernel_with_tasks("twin", RunConfig::default(), 4, steady_collaborators());
        drive_to_halt(&mut kernel, &clock, 100);
        kernel.journal().store().events().unwrap()
    };
    let first = run();
    let second = run();
    assert_eq!(first, second);
    assert_eq!(
        first.last().map(|e| e.hash.clone()),
        second.last().map(|e| e.hash.clone())
    );
}

#[test]
fn memory_backend_clones_share_the_log() {
    let clock = ManualClock::new(START_MS);
    let backend = MemoryBackend::new();
    let store = open_store("shared", backend.clone(), &clock);
    let mut kernel =
        OrchestrationKernel::start(store, RunConfig::default(), GOAL, steady_collaborators())
            .unwrap();
    kernel.enqueue(analysis("a"), 0, &[]).unwrap();
    drive_to_halt(&mut kernel, &clock, 50);
    let events = kernel.journal().store().events().unwrap();

    let resumed = OrchestrationKernel::resume(
        open_store("shared", backend, &clock),
        steady_collaborators(),
    )
    .unwrap();
    assert!(resumed.is_finished());
    assert_eq!(resumed.journal().store().events().unwrap(), events);
}
