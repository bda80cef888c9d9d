//! The durable ordered log a store writes through.
//!
//! A backend knows nothing about hashing or payload schemas. It persists
//! events and snapshots keyed by `(run_id, index)` and refuses anything that
//! would leave a gap or rewrite history.

use thiserror::Error;

use super::snapshot::SnapshotV1;
use crate::event::EventV1;
use crate::proof::hash::ContentHash;
use crate::schema::RunId;

/// Last persisted event of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventHead {
    pub index: u64,
    pub hash: ContentHash,
}

impl EventHead {
    #[must_use]
    pub fn of(event: &EventV1) -> Self {
        Self {
            index: event.index,
            hash: event.hash.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("run {run_id}: expected event index {expected}, got {found}")]
    NonContiguous {
        run_id: RunId,
        expected: u64,
        found: u64,
    },

    #[error("run {run_id}: snapshot at {index} is past the log head")]
    SnapshotAhead { run_id: RunId, index: u64 },

    #[error("run id `{run_id}` cannot name a log location")]
    InvalidRunId { run_id: RunId },

    #[error("corrupt record in {location}: {detail}")]
    Corrupt { location: String, detail: String },
}

/// Ordered, durable, per-run append and read.
///
/// `append` must not return until the event is durable. Implementations
/// reject an event whose index is not exactly one past the current head.
pub trait EventBackend: Send {
    /// Persist `event` at the end of its run's log.
    ///
    /// # Errors
    ///
    /// [`BackendError::NonContiguous`] on a gap or rewrite; I/O errors.
    fn append(&mut self, event: &EventV1) -> Result<(), BackendError>;

    /// Events of `run_id` with `index >= from`, in order.
    ///
    /// # Errors
    ///
    /// I/O or decoding errors.
    fn read_from(&self, run_id: &RunId, from: u64) -> Result<Vec<EventV1>, BackendError>;

    /// Last persisted event, or `None` for an empty log.
    ///
    /// # Errors
    ///
    /// I/O or decoding errors.
    fn head(&self, run_id: &RunId) -> Result<Option<EventHead>, BackendError>;

    /// Persist a snapshot keyed by the index of the event it was taken after.
    ///
    /// # Errors
    ///
    /// [`BackendError::SnapshotAhead`] if the snapshot refers to an event
    /// that has not been persisted; I/O errors.
    fn put_snapshot(&mut self, snapshot: &SnapshotV1) -> Result<(), BackendError>;

    /// Snapshot with the highest event index.
    ///
    /// # Errors
    ///
    /// I/O or decoding errors.
    fn latest_snapshot(&self, run_id: &RunId) -> Result<Option<SnapshotV1>, BackendError>;
}

/// Shared contiguity check for backends.
pub(crate) fn check_next(
    run_id: &RunId,
    head: Option<&EventHead>,
    event: &EventV1,
) -> Result<(), BackendError> {
    let expected = head.map_or(0, |h| h.index + 1);
    if event.index == expected {
        Ok(())
    } else {
        Err(BackendError::NonContiguous {
            run_id: run_id.clone(),
            expected,
            found: event.index,
        })
    }
}
