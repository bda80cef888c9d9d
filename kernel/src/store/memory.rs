//! In-memory backend. Clones share one log, so two stores opened on clones
//! of the same backend behave like two writers on one durable log.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::backend::{check_next, BackendError, EventBackend, EventHead};
use super::snapshot::SnapshotV1;
use crate::event::EventV1;
use crate::schema::RunId;

#[derive(Debug, Default)]
struct RunLog {
    events: Vec<EventV1>,
    snapshots: BTreeMap<u64, SnapshotV1>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    runs: Arc<Mutex<BTreeMap<RunId, RunLog>>>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn runs(&self) -> MutexGuard<'_, BTreeMap<RunId, RunLog>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Overwrite a persisted event in place, bypassing every check.
    ///
    /// Exists to exercise corruption detection. Returns `false` if there is
    /// no such event.
    pub fn rewrite(&self, run_id: &RunId, index: u64, edit: impl FnOnce(&mut EventV1)) -> bool {
        let mut runs = self.runs();
        let slot = runs
            .get_mut(run_id)
            .and_then(|log| usize::try_from(index).ok().and_then(|i| log.events.get_mut(i)));
        match slot {
            Some(event) => {
                edit(event);
                true
            }
            None => false,
        }
    }

    /// Number of events persisted for `run_id`.
    #[must_use]
    pub fn len(&self, run_id: &RunId) -> usize {
        self.runs().get(run_id).map_or(0, |log| log.events.len())
    }

    #[must_use]
    pub fn is_empty(&self, run_id: &RunId) -> bool {
        self.len(run_id) == 0
    }
}

impl EventBackend for MemoryBackend {
    fn append(&mut self, event: &EventV1) -> Result<(), BackendError> {
        let mut runs = self.runs();
        let log = runs.entry(event.run_id.clone()).or_default();
        let head = log.events.last().map(EventHead::of);
        check_next(&event.run_id, head.as_ref(), event)?;
        log.events.push(event.clone());
        Ok(())
    }

    fn read_from(&self, run_id: &RunId, from: u64) -> Result<Vec<EventV1>, BackendError> {
        let runs = self.runs();
        let Some(log) = runs.get(run_id) else {
            return Ok(Vec::new());
        };
        let start = usize::try_from(from).unwrap_or(usize::MAX);
        Ok(log.events.iter().skip(start).cloned().collect())
    }

    fn head(&self, run_id: &RunId) -> Result<Option<EventHead>, BackendError> {
        Ok(self
            .runs()
            .get(run_id)
            .and_then(|log| log.events.last().map(EventHead::of)))
    }

    fn put_snapshot(&mut self, snapshot: &SnapshotV1) -> Result<(), BackendError> {
        let mut runs = self.runs();
        let log = runs.entry(snapshot.run_id.clone()).or_default();
        let persisted = log.events.len() as u64;
        if snapshot.event_index >= persisted {
            return Err(BackendError::SnapshotAhead {
                run_id: snapshot.run_id.clone(),
                index: snapshot.event_index,
            });
        }
        log.snapshots.insert(snapshot.event_index, snapshot.clone());
        Ok(())
    }

    fn latest_snapshot(&self, run_id: &RunId) -> Result<Option<SnapshotV1>, BackendError> {
        Ok(self
            .runs()
            .get(run_id)
            .and_then(|log| log.snapshots.values().next_back().cloned()))
    }
}
