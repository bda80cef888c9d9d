//! `SnapshotV1`: a materialized state pinned to the event it was taken after.
//!
//! ```text
//! hash = sha256(KEEL::SNAPSHOT::V1\0 ‖ raw(event_hash) ‖ canonical_json(state))
//! ```
//!
//! Committing to `event_hash` ties the snapshot to one exact log prefix:
//! any tool can validate it by recomputing the chain up to `event_index`.

use serde::{Deserialize, Serialize};

use crate::materialize::KernelState;
use crate::proof::canon::{canonical_bytes, CanonError};
use crate::proof::hash::{chained_hash, ContentHash, HashDomain};
use crate::schema::RunId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotV1 {
    pub run_id: RunId,
    pub event_index: u64,
    pub event_hash: ContentHash,
    pub state: KernelState,
    pub hash: ContentHash,
}

impl SnapshotV1 {
    /// Snapshot `state` at its last applied event. `None` if no event has
    /// been applied.
    ///
    /// # Errors
    ///
    /// Returns [`CanonError`] if the state cannot be canonicalized.
    pub fn capture(state: &KernelState) -> Result<Option<Self>, CanonError> {
        let Some(event_index) = state.last_event_index else {
            return Ok(None);
        };
        let event_hash = state.last_event_hash.clone();
        let hash = snapshot_hash(&event_hash, state)?;
        Ok(Some(Self {
            run_id: state.run_id.clone(),
            event_index,
            event_hash,
            state: state.clone(),
            hash,
        }))
    }

    /// Recompute the hash from `event_hash` and `state`.
    ///
    /// # Errors
    ///
    /// Returns [`CanonError`] if the state cannot be canonicalized.
    pub fn compute_hash(&self) -> Result<ContentHash, CanonError> {
        snapshot_hash(&self.event_hash, &self.state)
    }

    /// Whether the snapshot is internally consistent: its hash recomputes and
    /// its state is positioned exactly at `event_index`/`event_hash`.
    ///
    /// # Errors
    ///
    /// Returns [`CanonError`] if the state cannot be canonicalized.
    pub fn is_self_consistent(&self) -> Result<bool, CanonError> {
        Ok(self.compute_hash()? == self.hash
            && self.state.run_id == self.run_id
            && self.state.last_event_index == Some(self.event_index)
            && self.state.last_event_hash == self.event_hash)
    }
}

fn snapshot_hash(event_hash: &ContentHash, state: &KernelState) -> Result<ContentHash, CanonError> {
    Ok(chained_hash(
        HashDomain::Snapshot,
        event_hash,
        &canonical_bytes(state)?,
    ))
}
