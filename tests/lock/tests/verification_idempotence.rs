//! Verification idempotence lock tests.
//!
//! Proves:
//! 1. `verify` twice on the same `(task, result, criteria)` yields the same record
//! 2. `audit` of that record is equally stable
//! 3. Verdicts recorded during a run are re-derived exactly from the final state

use std::collections::BTreeMap;

use keel_kernel::event::EventPayload;
use keel_kernel::schema::{
    AcceptanceCriterion, DeterministicCheck, RubricMeasure, RunConfig, TaskResult, TaskSpec,
};
use keel_orchestrator::{queue, verifier};
use lock_tests::fixtures::{analysis, drive_to_halt, kernel_with_tasks, started_journal, GOAL};
use proptest::prelude::*;

fn all_criteria() -> Vec<AcceptanceCriterion> {
    vec![
        AcceptanceCriterion::deterministic("succeeded", DeterministicCheck::ExecutionSucceeded),
        AcceptanceCriterion::deterministic("json", DeterministicCheck::OutputIsJson),
        AcceptanceCriterion::deterministic(
            "mentions-goal",
            DeterministicCheck::OutputContains {
                needle: "incident".into(),
            },
        ),
        AcceptanceCriterion::deterministic(
            "quiet-logs",
            DeterministicCheck::LogsExclude {
                needle: "panic".into(),
            },
        ),
        AcceptanceCriterion::deterministic(
            "short",
            DeterministicCheck::MaxOutputBytes { limit: 40 },
        ),
        AcceptanceCriterion::rubric(
            "quality",
            3,
            RubricMeasure::ReportedScore {
                key: "quality".into(),
            },
        ),
        AcceptanceCriterion::rubric(
            "cites",
            1,
            RubricMeasure::OutputMentions {
                needle: "source".into(),
            },
        ),
    ]
}

fn spec_with(mask: &[bool], threshold: Option<u32>) -> TaskSpec {
    let mut spec = analysis("verified");
    for (criterion, keep) in all_criteria().into_iter().zip(mask) {
        if *keep {
            spec = spec.with_criterion(criterion);
        }
    }
    spec.rubric_threshold = threshold;
    spec
}

fn result_strategy() -> impl Strategy<Value = TaskResult> {
    (
        any::<bool>(),
        prop_oneof![
            Just(r#"{"incident":"resolved","source":"pager"}"#.to_string()),
            Just("the incident is resolved".to_string()),
            "[a-z {}\":]{0,60}",
        ],
        proptest::collection::vec(prop_oneof![Just("ok"), Just("panic: boom")], 0..3),
        proptest::option::of(0u32..1500),
    )
        .prop_map(|(success, output, logs, quality)| TaskResult {
            success,
            output,
            logs: logs.into_iter().map(str::to_string).collect(),
            scores: quality
                .map(|q| BTreeMap::from([("quality".to_string(), q)]))
                .unwrap_or_default(),
            ..TaskResult::default()
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn prop_verify_and_audit_are_idempotent(
        mask in proptest::collection::vec(any::<bool>(), 7),
        threshold in proptest::option::of(0u32..=1000),
        default_threshold in 0u32..=1000,
        result in result_strategy(),
    ) {
        let mut journal = started_journal("verify-prop");
        let id = queue::enqueue(&mut journal, spec_with(&mask, threshold), 0, &[]).unwrap();
        let task = journal.state().task(&id).unwrap().clone();

        let first = verifier::verify(&task, &result, default_threshold);
        let second = verifier::verify(&task, &result, default_threshold);
        prop_assert_eq!(&first, &second);
        prop_assert_eq!(
            verifier::verify(&task.clone(), &result.clone(), default_threshold),
            first.clone()
        );

        let audit_a = verifier::audit(&task, &first);
        let audit_b = verifier::audit(&task, &second);
        prop_assert_eq!(&audit_a, &audit_b);
        prop_assert_eq!(audit_a.passed, first.passed);
        prop_assert_eq!(first.passed, first.failed_criteria.is_empty());
    }
}

#[test]
fn recorded_verdicts_rederive_from_final_state() {
    let (mut kernel, clock) = kernel_with_tasks(
        "verify-rederive",
        RunConfig::default(),
        0,
        lock_tests::fixtures::steady_collaborators(),
    );
    kernel
        .enqueue(
            analysis("mentions").with_criterion(AcceptanceCriterion::deterministic(
                "goal",
                DeterministicCheck::OutputContains {
                    needle: GOAL.into(),
                },
            )),
            0,
            &[],
        )
        .unwrap();
    kernel
        .enqueue(
            analysis("scored").with_criterion(AcceptanceCriterion::rubric(
                "cites",
                1,
                RubricMeasure::OutputMentions {
                    needle: "incident".into(),
                },
            )),
            0,
            &[],
        )
        .unwrap();
    drive_to_halt(&mut kernel, &clock, 100);

    let state = kernel.journal().state();
    let threshold = state.config().unwrap().rubric_pass_threshold;
    let mut checked = 0;
    for event in kernel.journal().store().events().unwrap() {
        if let EventPayload::TaskCompleted {
            task_id,
            verification,
            ..
        } = event.payload
        {
            let task = state.task(&task_id).unwrap();
            let result = task.result.as_ref().unwrap();
            assert_eq!(verifier::verify(task, result, threshold), verification);
            checked += 1;
        }
    }
    assert_eq!(checked, 2);
}
