//! Shared fixtures for the cross-crate lock tests.

pub mod fixtures;
