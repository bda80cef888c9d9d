//! STOP latency lock tests.
//!
//! Proves:
//! 1. A STOP recorded before any step halts the run on that step
//! 2. A STOP delivered through the control channel halts on the step that drains it
//! 3. An uninterruptible in-flight task finishes, then the run halts
//! 4. Whenever the STOP lands, no task starts after it and the run is
//!    `Stopped` within one step (interruptible work)

use keel_kernel::event::EventV1;
use keel_kernel::schema::{FailureReason, RunConfig, RunStatus, StopReason, TaskStatus};
use keel_orchestrator::{ControlInbox, Phase, StepOutcome};
use lock_tests::fixtures::{
    analysis, first_index, kernel_with_tasks, steady_collaborators,
};
use proptest::prelude::*;

fn operator_stop(note: &str) -> RunStatus {
    RunStatus::Stopped {
        reason: StopReason::Operator {
            note: note.to_string(),
        },
    }
}

fn starts_after_stop(events: &[EventV1]) -> usize {
    first_index(events, "stop_requested").map_or(0, |stop| {
        events[stop..]
            .iter()
            .filter(|e| e.payload.event_type() == "task_running")
            .count()
    })
}

// ---------------------------------------------------------------------------
// 1. Before the first step
// ---------------------------------------------------------------------------

#[test]
fn stop_before_first_step_halts_immediately() {
    let (mut kernel, _clock) =
        kernel_with_tasks("stop-first", RunConfig::default(), 3, steady_collaborators());
    kernel.request_stop("not today").unwrap();

    let outcome = kernel.step().unwrap();
    assert_eq!(
        outcome,
        StepOutcome::Halted {
            status: operator_stop("not today")
        }
    );
    assert!(kernel.is_finished());
    let events = kernel.journal().store().events().unwrap();
    assert_eq!(first_index(&events, "task_running"), None);
    assert!(kernel
        .journal()
        .state()
        .tasks
        .values()
        .all(|t| t.status == TaskStatus::Ready));
}

// ---------------------------------------------------------------------------
// 2. Control channel
// ---------------------------------------------------------------------------

#[test]
fn signalled_stop_halts_on_the_draining_step() {
    let inbox = ControlInbox::new();
    let collaborators = steady_collaborators().with_control(inbox.clone());
    let (mut kernel, clock) = kernel_with_tasks("stop-signal", RunConfig::default(), 3, collaborators);

    for _ in 0..4 {
        kernel.step().unwrap();
        clock.advance(10);
    }
    assert!(!kernel.is_finished());
    inbox.stop("from the operator");

    let outcome = kernel.step().unwrap();
    assert_eq!(
        outcome,
        StepOutcome::Halted {
            status: operator_stop("from the operator")
        }
    );
    assert_eq!(kernel.step().unwrap(), outcome, "later steps report the halt");
    assert_eq!(starts_after_stop(&kernel.journal().store().events().unwrap()), 0);
}

#[test]
fn in_flight_task_fails_as_stopped() {
    let (mut kernel, clock) =
        kernel_with_tasks("stop-inflight", RunConfig::default(), 2, steady_collaborators());
    while kernel.phase() != Phase::Executing {
        kernel.step().unwrap();
        clock.advance(10);
    }
    let in_flight = kernel.journal().state().in_flight().unwrap().id.clone();
    kernel.request_stop("now").unwrap();
    kernel.step().unwrap();

    let task = kernel.journal().state().task(&in_flight).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.failure, Some(FailureReason::Stopped));
    assert_eq!(kernel.status(), operator_stop("now"));
    assert!(kernel.journal().state().budget.reserved.is_zero());
}

// ---------------------------------------------------------------------------
// 3. Uninterruptible work
// ---------------------------------------------------------------------------

#[test]
fn uninterruptible_task_finishes_before_the_halt() {
    let (mut kernel, clock) =
        kernel_with_tasks("stop-atomic", RunConfig::default(), 0, steady_collaborators());
    let mut spec = analysis("migrate");
    spec.uninterruptible = true;
    let atomic = kernel.enqueue(spec, 5, &[]).unwrap();
    kernel.enqueue(analysis("after"), 0, &[]).unwrap();

    while kernel.phase() != Phase::Executing {
        kernel.step().unwrap();
        clock.advance(10);
    }
    kernel.request_stop("wrap up").unwrap();

    let mut steps = 0;
    while !kernel.is_finished() {
        kernel.step().unwrap();
        clock.advance(10);
        steps += 1;
        assert!(steps <= 4, "uninterruptible task did not settle promptly");
    }
    assert_eq!(kernel.status(), operator_stop("wrap up"));
    assert_eq!(
        kernel.journal().state().task(&atomic).map(|t| t.status),
        Some(TaskStatus::Completed)
    );
    assert_eq!(starts_after_stop(&kernel.journal().store().events().unwrap()), 0);
}

// ---------------------------------------------------------------------------
// 4. Any landing point
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_stop_lands_within_one_step(tasks in 1usize..5, before_step in 0usize..40) {
        let (mut kernel, clock) =
            kernel_with_tasks("stop-prop", RunConfig::default(), tasks, steady_collaborators());
        for _ in 0..before_step {
            if kernel.is_finished() {
                break;
            }
            kernel.step().unwrap();
            clock.advance(10);
        }
        if kernel.is_finished() {
            prop_assert!(kernel.request_stop("late").is_err());
            return Ok(());
        }

        kernel.request_stop("late").unwrap();
        let outcome = kernel.step().unwrap();
        prop_assert_eq!(outcome, StepOutcome::Halted { status: operator_stop("late") });
        prop_assert_eq!(kernel.status(), operator_stop("late"));
        prop_assert_eq!(starts_after_stop(&kernel.journal().store().events().unwrap()), 0);
    }
}
