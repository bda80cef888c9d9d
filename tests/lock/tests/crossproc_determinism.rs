//! Cross-process determinism test.
//!
//! Spawns the `scenario_fixture` binary under several environment variants
//! and asserts that all produce identical output. This proves that event
//! hashes, state digests and persisted traces are not influenced by
//! process-level state (cwd, locale, env vars, wall-clock time).

use std::path::Path;
use std::process::Command;

/// The `scenario_fixture` binary lives next to the test binaries' parent dir.
fn binary_path() -> String {
    let mut path = std::env::current_exe()
        .expect("can resolve test binary path")
        .parent()
        .expect("binary dir exists")
        .parent()
        .expect("deps parent exists")
        .to_path_buf();
    path.push("scenario_fixture");
    path.to_string_lossy().to_string()
}

fn workspace_root() -> String {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .expect("tests/ exists")
        .parent()
        .expect("workspace root exists")
        .to_string_lossy()
        .to_string()
}

fn run_variant(work_dir: &str, env_overrides: &[(&str, &str)]) -> String {
    let bin = binary_path();
    let mut command = Command::new(&bin);
    command
        .current_dir(work_dir)
        .env_remove("LC_ALL")
        .env_remove("LC_COLLATE")
        .env_remove("LANG")
        .env_remove("LANGUAGE");
    for &(key, val) in env_overrides {
        command.env(key, val);
    }

    let output = command.output().unwrap_or_else(|e| {
        panic!("failed to spawn {bin} (work_dir={work_dir}, overrides={env_overrides:?}): {e}")
    });
    assert!(
        output.status.success(),
        "scenario_fixture exited with {}: stderr={}",
        output.status,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).expect("stdout is valid UTF-8")
}

// ---------------------------------------------------------------------------
// Cross-process determinism
// ---------------------------------------------------------------------------

#[test]
fn crossproc_determinism_four_env_variants() {
    let root = workspace_root();
    let baseline = run_variant(&root, &[]);

    assert!(baseline.contains("head_hash=sha256:"), "baseline missing head_hash");
    assert!(baseline.contains("run_status=completed"), "baseline run did not complete");
    assert!(baseline.contains("test_passed=true"), "baseline spec did not pass");
    assert_eq!(baseline.lines().count(), 6);

    let alt_cwd = if cfg!(target_os = "windows") {
        "C:\\"
    } else {
        "/tmp"
    };
    let variant_cwd = run_variant(alt_cwd, &[]);
    assert_eq!(
        baseline, variant_cwd,
        "output differs when cwd changes from {root} to {alt_cwd}"
    );

    let variant_locale = run_variant(&root, &[("LC_ALL", "C"), ("LANG", "C")]);
    assert_eq!(baseline, variant_locale, "output differs when LC_ALL=C LANG=C");

    let variant_noise = run_variant(
        &root,
        &[
            ("KEEL_NOISE", "should_not_matter"),
            ("KEEL_LOG", "trace"),
            ("TZ", "America/New_York"),
        ],
    );
    assert_eq!(
        baseline, variant_noise,
        "output differs with spurious env vars (KEEL_NOISE, KEEL_LOG, TZ)"
    );
}
