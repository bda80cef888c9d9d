//! `keel`: drive, signal, inspect and test orchestration runs.
//!
//! Exit codes: `0` success (a run reached `completed` or is waiting, a test
//! passed, a log verified); `1` the run failed or stopped, the test failed,
//! or verification found corruption; `2` anything else went wrong.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use keel_harness::live::{self, RunFileV1, WaitPolicy};
use keel_harness::log_store::TestLogStore;
use keel_harness::runner;
use keel_harness::spec::TestSpecV1;
use keel_kernel::clock::SystemClock;
use keel_kernel::schema::{RunId, RunStatus, TaskId};
use keel_kernel::store::{EventStore, FileBackend, StoreError};
use keel_orchestrator::{ControlSignal, FileControlInbox, StepOutcome};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "keel", version, about = "Event-sourced task orchestration")]
struct Cli {
    /// Log filter, e.g. `info` or `keel_orchestrator=debug` (env: KEEL_LOG)
    #[arg(long, global = true, env = "KEEL_LOG", default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct StoreOpts {
    /// Root directory of run logs (env: KEEL_DIR)
    #[arg(long, env = "KEEL_DIR", default_value = ".keel")]
    dir: PathBuf,
}

#[derive(Args, Debug, Clone)]
struct RunSelect {
    #[command(flatten)]
    store: StoreOpts,

    /// Run id
    #[arg(long)]
    run: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start or resume the run described by a run file
    Run {
        file: PathBuf,

        #[command(flatten)]
        store: StoreOpts,

        /// Steps to drive before returning
        #[arg(long, default_value_t = 10_000)]
        max_steps: usize,

        /// Keep polling while the run waits on an operator
        #[arg(long)]
        follow: bool,

        /// Poll interval in milliseconds with --follow
        #[arg(long, default_value_t = 250)]
        poll_ms: u64,
    },

    /// Ask a run to stop at its next step
    Stop {
        #[command(flatten)]
        select: RunSelect,

        #[arg(long, default_value = "operator request")]
        reason: String,
    },

    /// Approve or reject the action a run is waiting on
    Confirm {
        #[command(flatten)]
        select: RunSelect,

        /// Task awaiting confirmation, e.g. task-0002
        #[arg(long)]
        task: String,

        #[arg(long)]
        reject: bool,

        #[arg(long, env = "USER", default_value = "operator")]
        operator: String,
    },

    /// Print a run's status from its log
    Status {
        #[command(flatten)]
        select: RunSelect,
    },

    /// Verify a run's hash chain and latest snapshot
    Verify {
        #[command(flatten)]
        select: RunSelect,
    },

    /// Run a test spec with scripted collaborators
    Test {
        spec: PathBuf,

        /// Where traces and results are kept
        #[arg(long, env = "KEEL_TEST_LOGS", default_value = ".keel-tests")]
        log_dir: PathBuf,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(&cli.log_level);
    match dispatch(cli.command) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(2)
        }
    }
}

fn setup_logging(filter: &str) {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn dispatch(command: Command) -> Result<ExitCode> {
    match command {
        Command::Run {
            file,
            store,
            max_steps,
            follow,
            poll_ms,
        } => run(
            &file,
            &store.dir,
            max_steps,
            WaitPolicy {
                follow,
                poll: Duration::from_millis(poll_ms),
            },
        ),
        Command::Stop { select, reason } => {
            signal(&select, &ControlSignal::Stop { note: reason })
        }
        Command::Confirm {
            select,
            task,
            reject,
            operator,
        } => signal(
            &select,
            &ControlSignal::Confirm {
                task_id: TaskId::new(task),
                approved: !reject,
                operator,
            },
        ),
        Command::Status { select } => status(&select),
        Command::Verify { select } => verify(&select),
        Command::Test {
            spec,
            log_dir,
            json,
        } => test(&spec, &log_dir, json),
    }
}

fn outcome_code(status: &RunStatus) -> ExitCode {
    match status {
        RunStatus::Stopped { .. } | RunStatus::Failed { .. } => ExitCode::from(1),
        RunStatus::Running | RunStatus::Paused { .. } | RunStatus::Completed => ExitCode::SUCCESS,
    }
}

fn run(file: &Path, dir: &Path, max_steps: usize, wait: WaitPolicy) -> Result<ExitCode> {
    let run_file = RunFileV1::load(file)?;
    let mut kernel = live::open(dir, &run_file, live::system_clock())
        .with_context(|| format!("opening run {}", run_file.run_id))?;
    let outcome = live::drive(&mut kernel, max_steps, wait)?;
    let status = kernel.status();
    match outcome {
        StepOutcome::Suspended { reason, .. } => {
            println!("run {}: {} ({reason:?})", run_file.run_id, status.label());
        }
        StepOutcome::Advanced { phase } => {
            println!(
                "run {}: {} (step limit reached in {})",
                run_file.run_id,
                status.label(),
                phase.as_str()
            );
        }
        StepOutcome::Halted { .. } => println!("run {}: {}", run_file.run_id, status.label()),
    }
    if let Some(error) = &kernel.journal().state().last_error {
        println!("last error: {error}");
    }
    Ok(outcome_code(&status))
}

fn signal(select: &RunSelect, signal: &ControlSignal) -> Result<ExitCode> {
    let run_dir = live::run_dir(&select.store.dir, &RunId::new(select.run.as_str()))?;
    anyhow::ensure!(run_dir.is_dir(), "no run {} under {}", select.run, select.store.dir.display());
    FileControlInbox::send(&run_dir, signal)?;
    println!("signal queued for {}", select.run);
    Ok(ExitCode::SUCCESS)
}

fn open_store(select: &RunSelect) -> Result<EventStore<FileBackend>> {
    let store = EventStore::open(
        RunId::new(select.run.as_str()),
        FileBackend::new(&select.store.dir),
        Arc::new(SystemClock),
    )?;
    anyhow::ensure!(store.next_index() > 0, "run {} has no events", select.run);
    Ok(store)
}

fn status(select: &RunSelect) -> Result<ExitCode> {
    let state = open_store(select)?.replay_latest()?;
    let json = serde_json::json!({
        "run_id": state.run_id,
        "status": state.status,
        "autonomy": state.autonomy,
        "events": state.next_index(),
        "tasks": state.tasks.values().map(|t| serde_json::json!({
            "id": t.id,
            "title": t.spec.title,
            "status": t.status,
        })).collect::<Vec<_>>(),
        "budget": state.budget,
        "last_error": state.last_error,
    });
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(ExitCode::SUCCESS)
}

fn verify(select: &RunSelect) -> Result<ExitCode> {
    // Opening replays the chain, so corruption usually surfaces here.
    let store = match open_store(select) {
        Ok(store) => store,
        Err(e)
            if e.downcast_ref::<StoreError>()
                .is_some_and(StoreError::is_integrity) =>
        {
            println!("corrupt: {e}");
            return Ok(ExitCode::from(1));
        }
        Err(e) => return Err(e),
    };
    let events = store.verify_chain()?;
    println!("chain: {events} events verify");
    match store.latest_snapshot()? {
        Some(snapshot) => match store.verify_snapshot(&snapshot) {
            Ok(()) => println!("snapshot at event {} matches replay", snapshot.event_index),
            Err(e) if e.is_integrity() => {
                println!("corrupt: {e}");
                return Ok(ExitCode::from(1));
            }
            Err(e) => return Err(e.into()),
        },
        None => println!("no snapshot"),
    }
    Ok(ExitCode::SUCCESS)
}

fn test(spec: &Path, log_dir: &Path, json: bool) -> Result<ExitCode> {
    let text = std::fs::read_to_string(spec)
        .with_context(|| format!("reading {}", spec.display()))?;
    let spec = TestSpecV1::from_json(&text).with_context(|| format!("parsing {}", spec.display()))?;
    let result = runner::run(&spec, &TestLogStore::new(log_dir))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("{}", result.summary());
    }
    Ok(if result.passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}
