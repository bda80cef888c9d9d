//! Binary that drives a fixed run through the kernel and a fixed spec
//! through the harness, printing deterministic output lines for
//! cross-process verification.
//!
//! Usage: `scenario_fixture`
//! Output: six lines, each `key=value`:
//!   `event_count`=...
//!   `head_hash`=sha256:...
//!   `state_digest`=sha256:...
//!   `run_status`=completed
//!   `trace_digest`=sha256:...
//!   `test_passed`=true

use keel_harness::log_store::TestLogStore;
use keel_harness::runner;
use keel_harness::spec::TestSpecV1;
use keel_kernel::schema::{AcceptanceCriterion, DeterministicCheck, RunConfig};
use lock_tests::fixtures::{analysis, drive_to_halt, kernel_with_tasks, steady_collaborators};

const SPEC: &str = r#"{
    "name": "crossproc",
    "goal": "summarize the incident report",
    "seeds": [
        { "label": "a", "spec": { "title": "read", "kind": { "type": "analysis", "topic": "incident" } } },
        { "label": "b", "depends_on": ["a"],
          "spec": { "title": "check", "kind": { "type": "analysis", "topic": "incident" },
                    "criteria": [ { "type": "deterministic", "name": "json", "check": { "check": "output_is_json" } } ] },
          "script": {
              "execute": [ { "outcome": "result", "result": { "success": true, "output": "not json" } } ],
              "remediate": [ { "outcome": "result", "result": { "success": true, "output": "{\"incident\": \"summarized\"}" } } ]
          } }
    ],
    "must": [ { "condition": "run_status", "status": "completed" } ]
}"#;

fn main() {
    let (mut kernel, clock) =
        kernel_with_tasks("crossproc", RunConfig::default(), 2, steady_collaborators());
    let first = kernel
        .journal()
        .state()
        .tasks
        .keys()
        .next()
        .cloned()
        .expect("seeded tasks");
    kernel
        .enqueue(
            analysis("gated").with_criterion(AcceptanceCriterion::deterministic(
                "mentions",
                DeterministicCheck::OutputContains {
                    needle: "incident".into(),
                },
            )),
            3,
            &[first],
        )
        .expect("enqueue");
    drive_to_halt(&mut kernel, &clock, 200);

    let journal = kernel.journal();
    let head = journal.store().head().expect("run has events");
    println!("event_count={}", head.index + 1);
    println!("head_hash={}", head.hash);
    println!(
        "state_digest={}",
        journal.state().digest().expect("state digest")
    );
    println!("run_status={}", kernel.status().label());

    let dir = std::env::temp_dir().join(format!("keel-scenario-fixture-{}", std::process::id()));
    let log = TestLogStore::new(&dir);
    let spec = TestSpecV1::from_json(SPEC).expect("fixture spec parses");
    let result = runner::run(&spec, &log).expect("harness run");
    let _ = std::fs::remove_dir_all(&dir);
    println!("trace_digest={}", result.trace.digest);
    println!("test_passed={}", result.passed);
}
