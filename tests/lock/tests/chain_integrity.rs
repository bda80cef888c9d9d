//! Hash-chain integrity lock tests.
//!
//! Proves:
//! 1. Every event links to its predecessor's hash, from the genesis seed
//! 2. An event whose `prev_hash` is not the head is refused and not persisted
//! 3. Mutating any persisted event is detected at that index
//! 4. A corrupted file-backed log cannot be opened
//! 5. A kernel whose log moves underneath it halts `Failed` without writing
//! 6. Runs with identical histories still have distinct chains

use keel_kernel::clock::ManualClock;
use keel_kernel::event::{EventPayload, EventV1};
use keel_kernel::proof::hash::{genesis_hash, ContentHash};
use keel_kernel::schema::{RunConfig, RunId, RunStatus};
use keel_kernel::store::{self, FileBackend, MemoryBackend, StoreError};
use keel_orchestrator::{KernelError, OrchestrationKernel};
use lock_tests::fixtures::{
    analysis, drive_to_halt, kernel_with_tasks, open_store, steady_collaborators, GOAL, START_MS,
};

fn finished_log(run: &str) -> (MemoryBackend, Vec<EventV1>) {
    let clock = ManualClock::new(START_MS);
    let backend = MemoryBackend::new();
    let mut kernel = OrchestrationKernel::start(
        open_store(run, backend.clone(), &clock),
        RunConfig::default(),
        GOAL,
        steady_collaborators(),
    )
    .unwrap();
    kernel.enqueue(analysis("a"), 0, &[]).unwrap();
    kernel.enqueue(analysis("b"), 1, &[]).unwrap();
    drive_to_halt(&mut kernel, &clock, 100);
    let events = kernel.journal().store().events().unwrap();
    (backend, events)
}

// ---------------------------------------------------------------------------
// 1. Links
// ---------------------------------------------------------------------------

#[test]
fn every_event_links_to_its_predecessor() {
    let (_, events) = finished_log("links");
    assert!(events.len() > 10);
    assert_eq!(events[0].prev_hash, genesis_hash());
    for pair in events.windows(2) {
        assert_eq!(pair[1].prev_hash, pair[0].hash);
        assert_eq!(pair[1].index, pair[0].index + 1);
    }
    for event in &events {
        assert_eq!(event.compute_hash().unwrap(), event.hash);
    }
    store::verify_chain(&events).unwrap();
}

// ---------------------------------------------------------------------------
// 2. Refused appends
// ---------------------------------------------------------------------------

#[test]
fn append_with_foreign_prev_hash_is_refused_and_not_persisted() {
    let clock = ManualClock::new(START_MS);
    let backend = MemoryBackend::new();
    let mut store = open_store("refuse", backend.clone(), &clock);
    store
        .append(EventPayload::RunStarted {
            goal: GOAL.into(),
            config: RunConfig::default(),
        })
        .unwrap();
    let head_before = store.head().cloned();

    let bogus_prev = ContentHash::parse(&format!("sha256:{}", "ab".repeat(32))).unwrap();
    let event = EventV1::seal(
        store.next_index(),
        RunId::new("refuse"),
        START_MS,
        EventPayload::RunStatusChanged {
            status: RunStatus::Completed,
        },
        bogus_prev.clone(),
    )
    .unwrap();

    match store.append_event(event) {
        Err(StoreError::ChainCorruption {
            index,
            expected,
            found,
        }) => {
            assert_eq!(index, 1);
            assert_eq!(Some(&expected), head_before.as_ref().map(|h| &h.hash));
            assert_eq!(found, bogus_prev);
        }
        other => panic!("expected ChainCorruption, got {other:?}"),
    }
    assert_eq!(backend.len(&RunId::new("refuse")), 1);
    assert_eq!(store.head().cloned(), head_before);
    assert_eq!(store.next_index(), 1);
}

#[test]
fn append_with_forged_hash_is_refused() {
    let clock = ManualClock::new(START_MS);
    let mut store = open_store("forge", MemoryBackend::new(), &clock);
    let mut event = EventV1::seal(
        0,
        RunId::new("forge"),
        START_MS,
        EventPayload::RunStarted {
            goal: GOAL.into(),
            config: RunConfig::default(),
        },
        genesis_hash(),
    )
    .unwrap();
    event.payload = EventPayload::RunStarted {
        goal: "something else".into(),
        config: RunConfig::default(),
    };
    assert!(matches!(
        store.append_event(event),
        Err(StoreError::ChainCorruption { index: 0, .. })
    ));
    assert_eq!(store.next_index(), 0);
}

// ---------------------------------------------------------------------------
// 3. Mutation anywhere is detected where it happened
// ---------------------------------------------------------------------------

#[test]
fn mutating_any_event_is_detected_at_its_index() {
    let (_, events) = finished_log("mutate");
    for target in 0..events.len() {
        let mut tampered = events.clone();
        tampered[target].timestamp_ms += 1;
        match store::verify_chain(&tampered) {
            Err(StoreError::ChainCorruption { index, .. }) => {
                assert_eq!(index, target as u64, "mutation at {target} reported at {index}");
            }
            other => panic!("mutation at {target} not detected: {other:?}"),
        }
    }
}

#[test]
fn reopening_a_rewritten_log_fails() {
    let (backend, events) = finished_log("rewrite");
    let run = RunId::new("rewrite");
    let middle = events.len() as u64 / 2;
    assert!(backend.rewrite(&run, middle, |e| e.timestamp_ms += 1));

    let clock = ManualClock::new(START_MS);
    let reopened = keel_kernel::store::EventStore::open(
        run,
        backend,
        std::sync::Arc::new(clock),
    );
    assert!(matches!(
        reopened,
        Err(StoreError::ChainCorruption { index, .. }) if index == middle
    ));
}

// ---------------------------------------------------------------------------
// 4. File-backed corruption
// ---------------------------------------------------------------------------

#[test]
fn single_byte_change_in_events_file_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(START_MS);
    let mut kernel = OrchestrationKernel::start(
        open_store("bytes", FileBackend::new(dir.path()), &clock),
        RunConfig::default(),
        GOAL,
        steady_collaborators(),
    )
    .unwrap();
    kernel.enqueue(analysis("a"), 0, &[]).unwrap();
    drive_to_halt(&mut kernel, &clock, 50);
    drop(kernel);

    let path = dir.path().join("bytes").join("events.jsonl");
    let text = std::fs::read_to_string(&path).unwrap();
    let at = text.find(GOAL).unwrap();
    let mut bytes = text.into_bytes();
    bytes[at] = b'S';
    std::fs::write(&path, bytes).unwrap();

    let result = keel_kernel::store::EventStore::open(
        RunId::new("bytes"),
        FileBackend::new(dir.path()),
        std::sync::Arc::new(clock),
    );
    let error = result.err().expect("corrupted log opened");
    assert!(error.is_integrity(), "{error}");
}

// ---------------------------------------------------------------------------
// 5. Corruption under a live kernel
// ---------------------------------------------------------------------------

#[test]
fn kernel_halts_failed_when_the_log_moves_underneath_it() {
    let clock = ManualClock::new(START_MS);
    let backend = MemoryBackend::new();
    let mut kernel = OrchestrationKernel::start(
        open_store("moved", backend.clone(), &clock),
        RunConfig::default(),
        GOAL,
        steady_collaborators(),
    )
    .unwrap();
    kernel.enqueue(analysis("a"), 0, &[]).unwrap();
    let run = RunId::new("moved");
    let head = backend.len(&run) as u64 - 1;
    let forged = genesis_hash();
    assert!(backend.rewrite(&run, head, |e| e.hash = forged));

    let mut error = None;
    for _ in 0..10 {
        match kernel.step() {
            Ok(_) => clock.advance(10),
            Err(e) => {
                error = Some(e);
                break;
            }
        }
    }
    let error: KernelError = error.expect("corruption went unnoticed");
    assert!(error.is_integrity(), "{error}");
    assert!(kernel.is_finished());
    assert!(matches!(kernel.status(), RunStatus::Failed { .. }));
    assert_eq!(backend.len(&run) as u64, head + 1, "nothing written after corruption");
}

// ---------------------------------------------------------------------------
// 6. Chains are per run
// ---------------------------------------------------------------------------

#[test]
fn independent_kernels_do_not_share_chains() {
    let (a, _) = kernel_with_tasks("one", RunConfig::default(), 1, steady_collaborators());
    let (b, _) = kernel_with_tasks("two", RunConfig::default(), 1, steady_collaborators());
    let head_a = a.journal().store().head().cloned().unwrap();
    let head_b = b.journal().store().head().cloned().unwrap();
    assert_eq!(head_a.index, head_b.index);
    assert_ne!(head_a.hash, head_b.hash);
}
