//! Proof module: canonical JSON, domain-separated hashing.
//!
//! Depends on nothing internal. Every other kernel module hashes through here.

pub mod canon;
pub mod hash;
pub mod hash_domain;
