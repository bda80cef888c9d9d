//! Task DAG lock tests.
//!
//! Proves:
//! 1. A dependent is never offered, or ready, before its dependency completes
//! 2. No sequence of edge insertions produces a cycle
//! 3. A rejected edge appends nothing
//! 4. In any driven run, every task starts after all of its dependencies completed

use std::collections::BTreeMap;

use keel_kernel::event::{EventPayload, EventV1};
use keel_kernel::schema::{RunConfig, RunStatus, TaskId, TaskStatus};
use keel_orchestrator::queue::{self, select_next};
use keel_orchestrator::{QueueError, Selection};
use lock_tests::fixtures::{
    analysis, drive_to_halt, kernel_with_tasks, started_journal, steady_collaborators,
};
use proptest::prelude::*;

fn running_at(events: &[EventV1]) -> BTreeMap<TaskId, u64> {
    events
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::TaskRunning { task_id, .. } => Some((task_id.clone(), e.index)),
            _ => None,
        })
        .collect()
}

fn completed_at(events: &[EventV1]) -> BTreeMap<TaskId, u64> {
    events
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::TaskCompleted { task_id, .. } => Some((task_id.clone(), e.index)),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// 1. Dependency ordering
// ---------------------------------------------------------------------------

#[test]
fn dependent_waits_for_its_dependency() {
    let (mut kernel, clock) =
        kernel_with_tasks("dag-order", RunConfig::default(), 0, steady_collaborators());
    let a = kernel.enqueue(analysis("A"), 0, &[]).unwrap();
    // Higher priority must not let B jump ahead of its dependency.
    let b = kernel.enqueue(analysis("B"), 10, &[a.clone()]).unwrap();

    assert_eq!(select_next(kernel.journal().state()), Selection::Task(a.clone()));
    assert_eq!(
        kernel.journal().state().task(&b).map(|t| t.status),
        Some(TaskStatus::Pending)
    );

    let mut b_offered_after_a = false;
    for _ in 0..100 {
        if kernel.is_finished() {
            break;
        }
        let state = kernel.journal().state();
        let a_done = state.task(&a).map(|t| t.status) == Some(TaskStatus::Completed);
        let b_status = state.task(&b).map(|t| t.status);
        if !a_done {
            assert_eq!(b_status, Some(TaskStatus::Pending), "B left pending before A completed");
        } else if b_status == Some(TaskStatus::Ready) {
            assert_eq!(select_next(state), Selection::Task(b.clone()));
            b_offered_after_a = true;
        }
        kernel.step().unwrap();
        clock.advance(10);
    }
    assert!(b_offered_after_a);
    assert_eq!(kernel.status(), RunStatus::Completed);

    let events = kernel.journal().store().events().unwrap();
    assert!(completed_at(&events)[&a] < running_at(&events)[&b]);
}

// ---------------------------------------------------------------------------
// 2-3. Random edge insertions
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_random_edges_never_close_a_cycle(
        edges in proptest::collection::vec((0u64..10, 0u64..10), 0..60),
    ) {
        let mut journal = started_journal("dag-prop");
        let ids: Vec<TaskId> = (0..10)
            .map(|n| queue::enqueue(&mut journal, analysis(&format!("t{n}")), 0, &[]).unwrap())
            .collect();

        for (from, to) in edges {
            let (task, dep) = (&ids[from as usize], &ids[to as usize]);
            let before = journal.state().next_index();
            match queue::add_dependency(&mut journal, task, dep) {
                Ok(()) => {}
                Err(QueueError::CycleDetected { .. }) => {
                    prop_assert_eq!(journal.state().next_index(), before);
                }
                Err(other) => panic!("unexpected error: {other}"),
            }
            let state = journal.state();
            for id in &ids {
                let task = state.task(id).unwrap();
                for d in &task.depends_on {
                    prop_assert!(
                        !state.depends_transitively(d, id),
                        "cycle through {} and {}", id, d
                    );
                }
            }
        }
    }

    #[test]
    fn prop_driven_runs_respect_dependencies(
        deps in proptest::collection::vec(proptest::collection::vec(any::<prop::sample::Index>(), 0..3), 1..8),
    ) {
        let (mut kernel, clock) =
            kernel_with_tasks("dag-drive", RunConfig::default(), 0, steady_collaborators());
        let mut ids: Vec<TaskId> = Vec::new();
        for (n, picks) in deps.iter().enumerate() {
            // Depending only on earlier tasks keeps every insertion legal.
            let on: Vec<TaskId> = if ids.is_empty() {
                Vec::new()
            } else {
                picks.iter().map(|p| ids[p.index(ids.len())].clone()).collect()
            };
            let id = kernel.enqueue(analysis(&format!("t{n}")), (n % 3) as i64, &on).unwrap();
            ids.push(id);
        }
        drive_to_halt(&mut kernel, &clock, 200);
        prop_assert_eq!(kernel.status(), RunStatus::Completed);

        let events = kernel.journal().store().events().unwrap();
        let started = running_at(&events);
        let completed = completed_at(&events);
        let state = kernel.journal().state();
        for id in &ids {
            let task = state.task(id).unwrap();
            for dep in &task.depends_on {
                prop_assert!(
                    completed[dep] < started[id],
                    "{} started before its dependency {} completed", id, dep
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// 3. Self edges
// ---------------------------------------------------------------------------

#[test]
fn self_dependency_is_rejected_without_an_event() {
    let mut journal = started_journal("dag-self");
    let a = queue::enqueue(&mut journal, analysis("a"), 0, &[]).unwrap();
    let before = journal.state().next_index();
    assert!(matches!(
        queue::add_dependency(&mut journal, &a, &a),
        Err(QueueError::CycleDetected { .. })
    ));
    assert_eq!(journal.state().next_index(), before);
}

#[test]
fn enqueue_naming_its_own_id_is_a_cycle() {
    let mut journal = started_journal("dag-self-enqueue");
    queue::enqueue(&mut journal, analysis("a"), 0, &[]).unwrap();
    let own = TaskId::from_seq(journal.state().next_seq);
    let before = journal.state().next_index();
    assert!(matches!(
        queue::enqueue(&mut journal, analysis("b"), 0, &[own]),
        Err(QueueError::CycleDetected { .. })
    ));
    assert_eq!(journal.state().next_index(), before);
}
