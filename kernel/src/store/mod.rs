//! Event Store: the append-only, hash-chained log of one run.
//!
//! [`EventStore`] is the single writer for its run. It caches the head it
//! last wrote and compares it with the backend's head before every append:
//! a mismatch means someone else wrote to the log (or it was tampered with),
//! and the append fails with [`StoreError::ChainCorruption`] without
//! persisting anything.
//!
//! # Append pipeline
//!
//! 1. Validate the payload against its type's schema
//! 2. Compare the persisted head with the cached head
//! 3. Seal: assign index, monotone timestamp, `prev_hash`, `hash`
//! 4. Run the caller's check (the materializer, for the kernel)
//! 5. Persist durably, then advance the cached head

pub mod backend;
pub mod file;
pub mod memory;
pub mod snapshot;

use std::sync::Arc;

use thiserror::Error;

pub use backend::{BackendError, EventBackend, EventHead};
pub use file::FileBackend;
pub use memory::MemoryBackend;
pub use snapshot::SnapshotV1;

use crate::clock::Clock;
use crate::event::{EventPayload, EventV1};
use crate::materialize::{self, KernelState, MaterializeError};
use crate::proof::canon::CanonError;
use crate::proof::hash::{genesis_hash, ContentHash};
use crate::schema::{RunId, SchemaViolation};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("chain corruption at event {index}: expected {expected}, found {found}")]
    ChainCorruption {
        index: u64,
        expected: ContentHash,
        found: ContentHash,
    },

    #[error("validation failed: {0}")]
    Validation(#[from] SchemaViolation),

    #[error("backend: {0}")]
    Backend(#[from] BackendError),

    #[error("canonicalization: {0}")]
    Canon(#[from] CanonError),

    #[error("materialize: {0}")]
    Materialize(#[from] MaterializeError),

    #[error("snapshot at event {index} does not match the log: {detail}")]
    SnapshotMismatch { index: u64, detail: String },

    #[error("event belongs to run {found}, store is for {expected}")]
    RunMismatch { expected: RunId, found: RunId },
}

impl StoreError {
    /// Integrity errors are fatal to the run: the log can no longer be
    /// trusted and must be surfaced, not repaired.
    #[must_use]
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            Self::ChainCorruption { .. }
                | Self::Validation(_)
                | Self::Materialize(_)
                | Self::SnapshotMismatch { .. }
                | Self::RunMismatch { .. }
        )
    }
}

/// Append-only, hash-chained event log for one run.
pub struct EventStore<B: EventBackend> {
    run_id: RunId,
    backend: B,
    head: Option<EventHead>,
    last_timestamp_ms: u64,
    clock: Arc<dyn Clock>,
}

impl<B: EventBackend> std::fmt::Debug for EventStore<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore")
            .field("run_id", &self.run_id)
            .field("head", &self.head)
            .finish_non_exhaustive()
    }
}

impl<B: EventBackend> EventStore<B> {
    /// Open the log of `run_id`, verifying whatever is already persisted.
    ///
    /// # Errors
    ///
    /// [`StoreError::ChainCorruption`] if the persisted chain does not
    /// verify; backend errors.
    pub fn open(run_id: RunId, backend: B, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let events = backend.read_from(&run_id, 0)?;
        verify_chain(&events)?;
        if let Some(foreign) = events.iter().find(|e| e.run_id != run_id) {
            return Err(StoreError::RunMismatch {
                expected: run_id,
                found: foreign.run_id.clone(),
            });
        }
        let head = events.last().map(EventHead::of);
        let last_timestamp_ms = events.last().map_or(0, |e| e.timestamp_ms);
        tracing::debug!(run = %run_id, events = events.len(), "event store opened");
        Ok(Self {
            run_id,
            backend,
            head,
            last_timestamp_ms,
            clock,
        })
    }

    #[must_use]
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    #[must_use]
    pub fn head(&self) -> Option<&EventHead> {
        self.head.as_ref()
    }

    #[must_use]
    pub fn next_index(&self) -> u64 {
        self.head.as_ref().map_or(0, |h| h.index + 1)
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn head_hash(&self) -> ContentHash {
        self.head.as_ref().map_or_else(genesis_hash, |h| h.hash.clone())
    }

    /// The persisted head must be the head this store last wrote.
    fn check_persisted_head(&self) -> Result<(), StoreError> {
        let persisted = self.backend.head(&self.run_id)?;
        if persisted == self.head {
            return Ok(());
        }
        let index = persisted
            .as_ref()
            .map_or(0, |h| h.index)
            .max(self.next_index());
        Err(StoreError::ChainCorruption {
            index,
            expected: self.head_hash(),
            found: persisted.map_or_else(genesis_hash, |h| h.hash),
        })
    }

    /// Append `payload` as the next event.
    ///
    /// # Errors
    ///
    /// [`StoreError::Validation`] if the payload violates its schema,
    /// [`StoreError::ChainCorruption`] if the log moved under this store,
    /// or backend errors. Nothing is persisted on error.
    pub fn append(&mut self, payload: EventPayload) -> Result<EventV1, StoreError> {
        self.append_checked(payload, |_| Ok(()))
    }

    /// [`append`](Self::append), running `check` on the sealed event before it
    /// is persisted. A failing check aborts the append.
    ///
    /// # Errors
    ///
    /// As [`append`](Self::append), plus whatever `check` returns.
    pub fn append_checked<F>(
        &mut self,
        payload: EventPayload,
        check: F,
    ) -> Result<EventV1, StoreError>
    where
        F: FnOnce(&EventV1) -> Result<(), StoreError>,
    {
        payload.validate()?;
        self.check_persisted_head()?;
        let timestamp_ms = self.clock.now_ms().max(self.last_timestamp_ms);
        let event = EventV1::seal(
            self.next_index(),
            self.run_id.clone(),
            timestamp_ms,
            payload,
            self.head_hash(),
        )?;
        check(&event)?;
        self.persist(event)
    }

    /// Append an event built elsewhere (import, replication).
    ///
    /// # Errors
    ///
    /// [`StoreError::ChainCorruption`] if the event does not extend the
    /// current head or its hash does not recompute. Nothing is persisted on
    /// error.
    pub fn append_event(&mut self, event: EventV1) -> Result<EventV1, StoreError> {
        if event.run_id != self.run_id {
            return Err(StoreError::RunMismatch {
                expected: self.run_id.clone(),
                found: event.run_id,
            });
        }
        event.payload.validate()?;
        self.check_persisted_head()?;
        let expected_prev = self.head_hash();
        if event.index != self.next_index() || event.prev_hash != expected_prev {
            return Err(StoreError::ChainCorruption {
                index: event.index,
                expected: expected_prev,
                found: event.prev_hash,
            });
        }
        let recomputed = event.compute_hash()?;
        if recomputed != event.hash {
            return Err(StoreError::ChainCorruption {
                index: event.index,
                expected: recomputed,
                found: event.hash,
            });
        }
        if event.timestamp_ms < self.last_timestamp_ms {
            return Err(SchemaViolation::new(
                event.event_type(),
                format!(
                    "timestamp {} precedes the head's {}",
                    event.timestamp_ms, self.last_timestamp_ms
                ),
            )
            .into());
        }
        self.persist(event)
    }

    fn persist(&mut self, event: EventV1) -> Result<EventV1, StoreError> {
        self.backend.append(&event)?;
        self.head = Some(EventHead::of(&event));
        self.last_timestamp_ms = event.timestamp_ms;
        tracing::debug!(
            run = %self.run_id,
            index = event.index,
            event_type = event.event_type(),
            "event appended"
        );
        Ok(event)
    }

    /// Events with `index >= from`.
    ///
    /// # Errors
    ///
    /// Backend errors.
    pub fn read_from(&self, from: u64) -> Result<Vec<EventV1>, StoreError> {
        Ok(self.backend.read_from(&self.run_id, from)?)
    }

    /// The whole log.
    ///
    /// # Errors
    ///
    /// Backend errors.
    pub fn events(&self) -> Result<Vec<EventV1>, StoreError> {
        self.read_from(0)
    }

    /// Fold the log into state, starting from `from` if given.
    ///
    /// A snapshot is first checked against the log: its hash must recompute
    /// and the event it names must carry the hash it commits to. Events after
    /// it are chain-verified from that hash onward, so replay cost is bounded
    /// by the suffix.
    ///
    /// # Errors
    ///
    /// [`StoreError::SnapshotMismatch`], [`StoreError::ChainCorruption`],
    /// materialization or backend errors.
    pub fn replay(&self, from: Option<&SnapshotV1>) -> Result<KernelState, StoreError> {
        let Some(snapshot) = from else {
            let events = self.events()?;
            verify_chain(&events)?;
            return Ok(materialize::fold(
                KernelState::genesis(self.run_id.clone()),
                &events,
            )?);
        };
        self.check_snapshot_header(snapshot)?;
        let mut events = self.read_from(snapshot.event_index)?;
        let anchor = events.first().ok_or_else(|| StoreError::SnapshotMismatch {
            index: snapshot.event_index,
            detail: "event is not in the log".to_string(),
        })?;
        if anchor.hash != snapshot.event_hash {
            return Err(StoreError::SnapshotMismatch {
                index: snapshot.event_index,
                detail: format!(
                    "log has {} at that index, snapshot commits to {}",
                    anchor.hash, snapshot.event_hash
                ),
            });
        }
        verify_chain_from(&events, snapshot.event_index, &anchor.prev_hash)?;
        events.remove(0);
        let state = materialize::fold(snapshot.state.clone(), &events)?;
        tracing::debug!(
            run = %self.run_id,
            from = snapshot.event_index,
            replayed = events.len(),
            "replayed from snapshot"
        );
        Ok(state)
    }

    /// Replay from the latest snapshot, or from genesis if there is none.
    ///
    /// # Errors
    ///
    /// As [`replay`](Self::replay).
    pub fn replay_latest(&self) -> Result<KernelState, StoreError> {
        let snapshot = self.latest_snapshot()?;
        self.replay(snapshot.as_ref())
    }

    /// Snapshot `state`, which must be positioned at the current head.
    ///
    /// # Errors
    ///
    /// [`StoreError::SnapshotMismatch`] if `state` is not at the head or
    /// there is nothing to snapshot; backend errors.
    pub fn snapshot(&mut self, state: &KernelState) -> Result<SnapshotV1, StoreError> {
        let index = state.last_event_index.unwrap_or(0);
        let at_head = state.run_id == self.run_id
            && self
                .head
                .as_ref()
                .is_some_and(|h| Some(h.index) == state.last_event_index && h.hash == state.last_event_hash);
        if !at_head {
            return Err(StoreError::SnapshotMismatch {
                index,
                detail: "state is not positioned at the store head".to_string(),
            });
        }
        let snapshot = SnapshotV1::capture(state)?.ok_or_else(|| StoreError::SnapshotMismatch {
            index,
            detail: "no event has been applied".to_string(),
        })?;
        self.backend.put_snapshot(&snapshot)?;
        tracing::info!(
            run = %self.run_id,
            index = snapshot.event_index,
            hash = %snapshot.hash,
            "snapshot taken"
        );
        Ok(snapshot)
    }

    /// # Errors
    ///
    /// Backend errors.
    pub fn latest_snapshot(&self) -> Result<Option<SnapshotV1>, StoreError> {
        Ok(self.backend.latest_snapshot(&self.run_id)?)
    }

    /// Verify the whole persisted chain. Returns the number of events.
    ///
    /// # Errors
    ///
    /// [`StoreError::ChainCorruption`] at the first bad event.
    pub fn verify_chain(&self) -> Result<u64, StoreError> {
        let events = self.events()?;
        verify_chain(&events)?;
        Ok(events.len() as u64)
    }

    /// Validate `snapshot` against the log: recompute the chain from genesis
    /// up to its index, check it commits to that event, and check that
    /// re-folding the prefix yields the captured state.
    ///
    /// # Errors
    ///
    /// [`StoreError::SnapshotMismatch`] or [`StoreError::ChainCorruption`].
    pub fn verify_snapshot(&self, snapshot: &SnapshotV1) -> Result<(), StoreError> {
        self.check_snapshot_header(snapshot)?;
        let mut events = self.events()?;
        let keep = usize::try_from(snapshot.event_index)
            .ok()
            .and_then(|i| i.checked_add(1))
            .filter(|n| *n <= events.len())
            .ok_or_else(|| StoreError::SnapshotMismatch {
                index: snapshot.event_index,
                detail: "event is not in the log".to_string(),
            })?;
        events.truncate(keep);
        verify_chain(&events)?;
        let last_hash = events.last().map(|e| &e.hash);
        if last_hash != Some(&snapshot.event_hash) {
            return Err(StoreError::SnapshotMismatch {
                index: snapshot.event_index,
                detail: "snapshot does not commit to the logged event".to_string(),
            });
        }
        let refolded = materialize::fold(KernelState::genesis(self.run_id.clone()), &events)?;
        if refolded != snapshot.state {
            return Err(StoreError::SnapshotMismatch {
                index: snapshot.event_index,
                detail: "captured state differs from the replayed prefix".to_string(),
            });
        }
        Ok(())
    }

    fn check_snapshot_header(&self, snapshot: &SnapshotV1) -> Result<(), StoreError> {
        if snapshot.run_id != self.run_id {
            return Err(StoreError::RunMismatch {
                expected: self.run_id.clone(),
                found: snapshot.run_id.clone(),
            });
        }
        if !snapshot.is_self_consistent()? {
            return Err(StoreError::SnapshotMismatch {
                index: snapshot.event_index,
                detail: "snapshot hash or position does not recompute".to_string(),
            });
        }
        Ok(())
    }
}

/// Verify a complete log from genesis.
///
/// # Errors
///
/// [`StoreError::ChainCorruption`] at the first event whose index, link or
/// hash is wrong.
pub fn verify_chain(events: &[EventV1]) -> Result<(), StoreError> {
    verify_chain_from(events, 0, &genesis_hash())
}

/// Verify a contiguous run of events starting at `start`, whose first event
/// must link to `prev`.
///
/// # Errors
///
/// [`StoreError::ChainCorruption`] at the first bad event.
pub fn verify_chain_from(
    events: &[EventV1],
    start: u64,
    prev: &ContentHash,
) -> Result<(), StoreError> {
    let mut expected_prev = prev.clone();
    for (offset, event) in events.iter().enumerate() {
        let index = start + offset as u64;
        if event.index != index || event.prev_hash != expected_prev {
            return Err(StoreError::ChainCorruption {
                index,
                expected: expected_prev,
                found: event.prev_hash.clone(),
            });
        }
        let recomputed = event.compute_hash()?;
        if recomputed != event.hash {
            return Err(StoreError::ChainCorruption {
                index,
                expected: recomputed,
                found: event.hash.clone(),
            });
        }
        expected_prev = recomputed;
    }
    Ok(())
}
