//! Keel Kernel: the event-sourced core of the Keel orchestrator.
//!
//! # API Surface
//!
//! - [`store::EventStore::append`] -- validate, hash-chain and durably persist an event
//! - [`store::EventStore::replay`] -- fold the log (optionally from a snapshot) into [`materialize::KernelState`]
//! - [`store::EventStore::snapshot`] -- capture state keyed to the last applied event
//!
//! # Module Dependency Direction
//!
//! `proof` ← `schema` ← `event` ← `materialize` ← `store`
//!
//! One-way only. `proof` depends on nothing internal. `store` is the only
//! module that performs I/O.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod clock;
pub mod event;
pub mod materialize;
pub mod proof;
pub mod schema;
pub mod store;
