//! `Journal`: a run's event store paired with the state folded from it.
//!
//! This is the explicit per-run handle every component writes through.
//! [`Journal::record`] appends an event and applies it in one motion: the
//! event is materialized before it is persisted, so an event the state
//! machine rejects never reaches the log.

use keel_kernel::event::{EventPayload, EventV1};
use keel_kernel::materialize::{self, KernelState};
use keel_kernel::store::{EventBackend, EventStore, SnapshotV1, StoreError};

#[derive(Debug)]
pub struct Journal<B: EventBackend> {
    store: EventStore<B>,
    state: KernelState,
}

impl<B: EventBackend> Journal<B> {
    /// Load state from the latest snapshot plus the events after it.
    ///
    /// # Errors
    ///
    /// Replay errors from the store.
    pub fn load(store: EventStore<B>) -> Result<Self, StoreError> {
        let state = store.replay_latest()?;
        Ok(Self { store, state })
    }

    #[must_use]
    pub fn state(&self) -> &KernelState {
        &self.state
    }

    #[must_use]
    pub fn store(&self) -> &EventStore<B> {
        &self.store
    }

    /// Current time on the store's clock.
    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.store.clock().now_ms()
    }

    /// Append `payload` and apply it to the state.
    ///
    /// # Errors
    ///
    /// Validation, integrity or backend errors. If persisting fails after
    /// the state accepted the event, the state is re-derived from the log.
    pub fn record(&mut self, payload: EventPayload) -> Result<EventV1, StoreError> {
        let state = &mut self.state;
        let mut applied = false;
        let result = self.store.append_checked(payload, |event| {
            materialize::apply(state, event)?;
            applied = true;
            Ok(())
        });
        if result.is_err() && applied {
            self.state = self.store.replay_latest()?;
        }
        result
    }

    /// Snapshot the current state at the store head.
    ///
    /// # Errors
    ///
    /// Store errors.
    pub fn snapshot(&mut self) -> Result<SnapshotV1, StoreError> {
        self.store.snapshot(&self.state)
    }

    /// Events with `index >= from`.
    ///
    /// # Errors
    ///
    /// Backend errors.
    pub fn read_from(&self, from: u64) -> Result<Vec<EventV1>, StoreError> {
        self.store.read_from(from)
    }

    #[must_use]
    pub fn into_store(self) -> EventStore<B> {
        self.store
    }
}
