//! Budget monotonicity lock tests.
//!
//! Proves:
//! 1. A run that would need one step more than `max_steps` stops on budget
//!    with exactly `max_steps` executions in its log
//! 2. `consumed ≤ ceiling` holds in every dimension after every step and in
//!    every snapshot, whatever the executors report
//! 3. No task starts once a stop has been recorded

use std::sync::{Arc, Mutex};

use keel_kernel::event::{EventPayload, EventV1};
use keel_kernel::schema::{
    ActionKind, BudgetDimension, CheckpointPolicy, PlannedAction, ResourceCost, RunConfig,
    RunStatus, StopReason, TaskResult,
};
use keel_orchestrator::{Collaborators, ExecutionRequest, PlanRequest, Response};
use lock_tests::fixtures::{
    drive_to_halt, event_types, first_index, kernel_with_tasks, on_topic, steady_collaborators,
};
use proptest::prelude::*;

fn count(events: &[EventV1], event_type: &str) -> usize {
    event_types(events)
        .into_iter()
        .filter(|t| *t == event_type)
        .count()
}

fn assert_no_start_after_stop(events: &[EventV1]) {
    if let Some(stop) = first_index(events, "stop_requested") {
        assert!(
            events[stop..]
                .iter()
                .all(|e| e.payload.event_type() != "task_running"),
            "task started after stop at event {stop}"
        );
    }
}

// ---------------------------------------------------------------------------
// 1. Step ceiling
// ---------------------------------------------------------------------------

#[test]
fn fourth_step_is_refused_and_the_run_stops_on_budget() {
    let mut config = RunConfig::default();
    config.budgets.max_steps = 3;
    let (mut kernel, clock) = kernel_with_tasks("budget-steps", config, 5, steady_collaborators());
    drive_to_halt(&mut kernel, &clock, 100);

    assert_eq!(
        kernel.status(),
        RunStatus::Stopped {
            reason: StopReason::Budget {
                dimension: BudgetDimension::Steps
            }
        }
    );
    let events = kernel.journal().store().events().unwrap();
    assert_eq!(count(&events, "task_running"), 3);
    assert_eq!(count(&events, "task_completed"), 3);
    assert_no_start_after_stop(&events);

    let budget = &kernel.journal().state().budget;
    assert_eq!(budget.consumed.steps, 3);
    assert!(budget.within_ceilings());
    assert!(budget.reserved.is_zero());
}

#[test]
fn a_run_that_fits_its_budget_completes() {
    let mut config = RunConfig::default();
    config.budgets.max_steps = 3;
    let (mut kernel, clock) = kernel_with_tasks("budget-fits", config, 3, steady_collaborators());
    drive_to_halt(&mut kernel, &clock, 100);

    assert_eq!(kernel.status(), RunStatus::Completed);
    assert_eq!(kernel.journal().state().budget.consumed.steps, 3);
}

#[test]
fn overrunning_executor_is_clamped_and_stops_the_run() {
    let mut config = RunConfig::default();
    config.budgets.max_tokens = 100;
    let collaborators = Collaborators::new(
        |_: &PlanRequest| -> Response<PlannedAction> {
            Response::Ready(PlannedAction::new(ActionKind::Analyze))
        },
        |request: &ExecutionRequest| -> Response<TaskResult> {
            let mut result = on_topic(request.task_id.as_str());
            result.usage.tokens = 70;
            Response::Ready(result)
        },
    );
    let (mut kernel, clock) = kernel_with_tasks("budget-tokens", config, 4, collaborators);
    drive_to_halt(&mut kernel, &clock, 100);

    assert_eq!(
        kernel.status(),
        RunStatus::Stopped {
            reason: StopReason::Budget {
                dimension: BudgetDimension::Tokens
            }
        }
    );
    let state = kernel.journal().state();
    assert_eq!(state.budget.consumed.tokens, 100);
    assert_eq!(state.budget.overrun, vec![BudgetDimension::Tokens]);
    let events = kernel.journal().store().events().unwrap();
    assert_eq!(count(&events, "task_running"), 2);
    assert_no_start_after_stop(&events);
}

#[test]
fn wall_clock_ceiling_stops_before_the_next_task() {
    let mut config = RunConfig::default();
    config.budgets.max_wall_clock_ms = 25;
    let (mut kernel, clock) = kernel_with_tasks("budget-wall", config, 20, steady_collaborators());
    drive_to_halt(&mut kernel, &clock, 100);

    assert_eq!(
        kernel.status(),
        RunStatus::Stopped {
            reason: StopReason::Budget {
                dimension: BudgetDimension::WallClockMs
            }
        }
    );
    let state = kernel.journal().state();
    assert_eq!(state.budget.consumed.wall_clock_ms, 25);
    assert!(state.budget.within_ceilings());
    assert_no_start_after_stop(&kernel.journal().store().events().unwrap());
}

// ---------------------------------------------------------------------------
// 2-3. Any mix of ceilings and reported usage
// ---------------------------------------------------------------------------

fn reporting_collaborators(usage: Arc<Mutex<Vec<ResourceCost>>>) -> Collaborators {
    Collaborators::new(
        |_: &PlanRequest| -> Response<PlannedAction> {
            Response::Ready(PlannedAction::new(ActionKind::Analyze))
        },
        move |request: &ExecutionRequest| -> Response<TaskResult> {
            let mut result = on_topic(request.task_id.as_str());
            let mut queue = usage.lock().unwrap();
            if !queue.is_empty() {
                result.usage = queue.remove(0);
            }
            Response::Ready(result)
        },
    )
}

fn usage_strategy() -> impl Strategy<Value = ResourceCost> {
    (0u64..300, 0u64..3, 0u64..3, 0u64..50).prop_map(|(tokens, steps, tool_calls, cost_units)| {
        ResourceCost {
            tokens,
            wall_clock_ms: 0,
            steps,
            tool_calls,
            cost_units,
        }
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_consumption_never_passes_a_ceiling(
        tasks in 1usize..8,
        max_steps in 1u64..10,
        max_tokens in 50u64..600,
        max_cost_units in 10u64..120,
        usage in proptest::collection::vec(usage_strategy(), 0..8),
    ) {
        let mut config = RunConfig::default();
        config.budgets.max_steps = max_steps;
        config.budgets.max_tokens = max_tokens;
        config.budgets.max_cost_units = max_cost_units;
        config.checkpoint = CheckpointPolicy { every_steps: 1, every_ms: 60_000 };
        let collaborators = reporting_collaborators(Arc::new(Mutex::new(usage)));
        let (mut kernel, clock) = kernel_with_tasks("budget-prop", config, tasks, collaborators);

        for _ in 0..200 {
            if kernel.is_finished() {
                break;
            }
            kernel.step().unwrap();
            clock.advance(10);

            let budget = &kernel.journal().state().budget;
            prop_assert!(budget.within_ceilings(), "live state over ceiling: {:?}", budget);
            if let Some(snapshot) = kernel.journal().store().latest_snapshot().unwrap() {
                prop_assert!(
                    snapshot.state.budget.within_ceilings(),
                    "snapshot at {} over ceiling", snapshot.event_index
                );
            }
        }
        prop_assert!(kernel.is_finished());
        let finished_ok = matches!(
            kernel.status(),
            RunStatus::Completed | RunStatus::Stopped { reason: StopReason::Budget { .. } }
        );
        prop_assert!(finished_ok, "unexpected status {:?}", kernel.status());

        let events = kernel.journal().store().events().unwrap();
        prop_assert!(count(&events, "task_running") as u64 <= max_steps);
        if let Some(stop) = first_index(&events, "stop_requested") {
            prop_assert!(
                events[stop..].iter().all(|e| e.payload.event_type() != "task_running")
            );
        }
    }
}
