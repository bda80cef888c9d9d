//! Keel Harness: scripted runs, test specs and the `keel` command line.
//!
//! The harness never decides anything the orchestrator decides. It supplies
//! scripted collaborators, drives the kernel one step at a time, and judges
//! the resulting event log against a [`TestSpecV1`](spec::TestSpecV1).
//!
//! - [`spec`]: the scenario DSL (seeds, signals, conditions, rubric)
//! - [`script`]: planner and executor that replay per-task scripts
//! - [`runner`]: deterministic test runs and condition evaluation
//! - [`log_store`]: persisted traces, verified on load
//! - [`live`]: file-backed runs for the CLI

#![forbid(unsafe_code)]

pub mod live;
pub mod log_store;
pub mod runner;
pub mod script;
pub mod spec;
