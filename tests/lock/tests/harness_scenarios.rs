//! End-to-end harness scenarios.
//!
//! Proves:
//! 1. A result failing one deterministic check spawns exactly one
//!    remediation, with no dependencies, naming the failed criterion
//! 2. A forbidden task kind that executes fails the test and the result
//!    names the violated condition
//! 3. Operator confirmations scheduled in a spec reach the run
//! 4. Transient collaborator failures are retried after backoff
//! 5. Every persisted trace reloads with a verified chain and digest

use keel_harness::log_store::TestLogStore;
use keel_harness::runner::{self, TestResultV1, ViolationKind};
use keel_harness::spec::{Condition, TestSpecV1};
use keel_kernel::event::{EventPayload, EventV1, QueueMutation};
use keel_kernel::schema::{AcceptanceCriterion, DeterministicCheck, RunStatus, TaskKind};
use lock_tests::fixtures::event_types;

fn run(json: &str) -> (TestResultV1, Vec<EventV1>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let log = TestLogStore::new(dir.path());
    let spec = TestSpecV1::from_json(json).unwrap();
    let result = runner::run(&spec, &log).unwrap();
    let trace = log.load_trace(&result.trace.key).unwrap();
    assert_eq!(trace.digest, result.trace.digest);
    (result, trace.events, dir)
}

// ---------------------------------------------------------------------------
// 1. Remediation
// ---------------------------------------------------------------------------

const JSON_REMEDIATION: &str = r#"{
    "name": "json remediation",
    "goal": "produce a machine-readable incident report",
    "seeds": [
        { "label": "report",
          "spec": {
              "title": "write report",
              "kind": { "type": "analysis", "topic": "incident" },
              "criteria": [
                  { "type": "deterministic", "name": "valid-json", "check": { "check": "output_is_json" } }
              ]
          },
          "script": {
              "execute": [ { "outcome": "result", "result": { "success": true, "output": "incident report: machine-readable soon" } } ],
              "remediate": [ { "outcome": "result", "result": { "success": true, "output": "{\"report\": \"machine-readable incident report\"}" } } ]
          } }
    ],
    "must": [
        { "condition": "run_status", "status": "completed" },
        { "condition": "remediation_spawned", "task": "report" },
        { "condition": "task_status", "task": "report", "status": "failed" },
        { "condition": "audit_flagged", "severity": "error" }
    ]
}"#;

#[test]
fn failed_check_spawns_exactly_one_remediation() {
    let (result, events, _dir) = run(JSON_REMEDIATION);
    assert!(result.passed, "{}", result.summary());

    let remediations: Vec<_> = events
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::QueueMutation(QueueMutation::Enqueued {
                spec, depends_on, ..
            }) if matches!(spec.kind, TaskKind::Remediation { .. }) => Some((spec, depends_on)),
            _ => None,
        })
        .collect();
    assert_eq!(remediations.len(), 1);

    let (spec, depends_on) = remediations[0];
    assert!(depends_on.is_empty());
    let TaskKind::Remediation {
        failed_criteria,
        attempt,
        ..
    } = &spec.kind
    else {
        unreachable!()
    };
    assert_eq!(failed_criteria, &["valid-json"]);
    assert_eq!(*attempt, 1);
    assert_eq!(
        spec.criteria,
        [AcceptanceCriterion::deterministic(
            "valid-json",
            DeterministicCheck::OutputIsJson
        )]
    );
    assert_eq!(spec.title, "write report (remediation 1)");
}

// ---------------------------------------------------------------------------
// 2. Must-not conditions
// ---------------------------------------------------------------------------

#[test]
fn forbidden_task_kind_fails_the_test() {
    let (result, events, _dir) = run(
        r#"{
            "name": "no shell",
            "goal": "inspect the incident host",
            "seeds": [
                { "label": "read", "spec": { "title": "read logs", "kind": { "type": "analysis", "topic": "incident" } } },
                { "label": "sh", "depends_on": ["read"],
                  "spec": { "title": "restart", "kind": { "type": "tool_use", "tool": "sh" } } }
            ],
            "must": [ { "condition": "run_status", "status": "completed" } ],
            "must_not": [
                { "condition": "task_kind_executed", "kind": "tool_use" },
                { "condition": "task_kind_executed", "kind": "code_change" }
            ]
        }"#,
    );
    assert!(!result.passed);
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.violations.len(), 1);

    let violation = &result.violations[0];
    assert_eq!(violation.kind, ViolationKind::MustNot);
    assert_eq!(
        violation.condition,
        Condition::TaskKindExecuted {
            kind: "tool_use".into()
        }
    );
    let running = events
        .iter()
        .find(|e| {
            matches!(&e.payload, EventPayload::TaskRunning { task_kind, .. } if task_kind == "tool_use")
        })
        .unwrap();
    assert!(violation.detail.contains(&format!("event {}", running.index)));
}

#[test]
fn the_same_run_without_the_forbidden_kind_passes() {
    let (result, _, _dir) = run(
        r#"{
            "name": "analysis only",
            "goal": "inspect the incident host",
            "seeds": [
                { "label": "read", "spec": { "title": "read logs", "kind": { "type": "analysis", "topic": "incident" } } }
            ],
            "must_not": [ { "condition": "task_kind_executed", "kind": "tool_use" } ]
        }"#,
    );
    assert!(result.passed, "{}", result.summary());
    assert!(result.violations.is_empty());
}

// ---------------------------------------------------------------------------
// 3. Confirmations
// ---------------------------------------------------------------------------

#[test]
fn scheduled_confirmation_releases_a_manual_run() {
    let (result, events, _dir) = run(
        r#"{
            "name": "manual approval",
            "goal": "rotate the incident credentials",
            "config": { "autonomy": "manual" },
            "seeds": [
                { "label": "rotate", "spec": { "title": "rotate", "kind": { "type": "analysis", "topic": "credentials" } } }
            ],
            "signals": [
                { "at_step": 3, "signal": { "signal": "confirm", "task": "rotate", "approved": true, "operator": "oncall" } }
            ],
            "must": [
                { "condition": "run_status", "status": "completed" },
                { "condition": "event_order", "first": "confirmation_received", "then": "task_running" }
            ]
        }"#,
    );
    assert!(result.passed, "{}", result.summary());
    let types = event_types(&events);
    let requested = types.iter().position(|t| *t == "confirmation_requested").unwrap();
    let received = types.iter().position(|t| *t == "confirmation_received").unwrap();
    assert!(requested < received);
}

#[test]
fn unanswered_confirmation_leaves_the_run_paused() {
    let (result, _, _dir) = run(
        r#"{
            "name": "nobody home",
            "goal": "rotate the incident credentials",
            "config": { "autonomy": "manual" },
            "seeds": [
                { "label": "rotate", "spec": { "title": "rotate", "kind": { "type": "analysis", "topic": "credentials" } } }
            ],
            "must": [ { "condition": "event_count", "event_type": "task_running", "max": 0 } ]
        }"#,
    );
    assert!(result.passed, "{}", result.summary());
    assert!(!result.halted);
    assert!(matches!(result.status, RunStatus::Paused { .. }));
}

// ---------------------------------------------------------------------------
// 4. Retries
// ---------------------------------------------------------------------------

#[test]
fn transient_failure_is_retried_after_backoff() {
    let (result, events, _dir) = run(
        r#"{
            "name": "flaky executor",
            "goal": "summarize the incident",
            "seeds": [
                { "label": "flaky",
                  "spec": { "title": "summarize", "kind": { "type": "analysis", "topic": "incident" }, "retryable": true },
                  "script": { "execute": [
                      { "outcome": "fail", "transient": true, "detail": "connection reset" },
                      { "outcome": "result", "result": { "success": true, "output": "summarize the incident: done" } }
                  ] } }
            ],
            "must": [
                { "condition": "run_status", "status": "completed" },
                { "condition": "event_count", "event_type": "collaborator_retry", "min": 1, "max": 1 }
            ]
        }"#,
    );
    assert!(result.passed, "{}", result.summary());

    let retry = events
        .iter()
        .find_map(|e| match &e.payload {
            EventPayload::CollaboratorRetry { not_before_ms, .. } => Some((e.timestamp_ms, *not_before_ms)),
            _ => None,
        })
        .unwrap();
    let resumed = events
        .iter()
        .filter(|e| e.payload.event_type() == "task_verifying")
        .map(|e| e.timestamp_ms)
        .next()
        .unwrap();
    assert!(retry.1 > retry.0);
    assert!(resumed >= retry.1, "retried before its backoff elapsed");
}

// ---------------------------------------------------------------------------
// 5. Persistence
// ---------------------------------------------------------------------------

#[test]
fn repeated_runs_keep_separate_verified_traces() {
    let dir = tempfile::tempdir().unwrap();
    let log = TestLogStore::new(dir.path());
    let spec = TestSpecV1::from_json(JSON_REMEDIATION).unwrap();
    let first = runner::run(&spec, &log).unwrap();
    let second = runner::run(&spec, &log).unwrap();

    assert_ne!(first.trace.key, second.trace.key);
    assert_eq!(first.trace.digest, second.trace.digest);
    assert_eq!(log.keys().unwrap().len(), 2);
    for key in log.keys().unwrap() {
        let stored = log.load_trace(&key).unwrap();
        assert_eq!(log.load_result(&key).unwrap().trace.digest, stored.digest);
    }
}
