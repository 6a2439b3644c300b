//! Profiling session - sole owner of the buffer and the store
//!
//! Producers and the flusher talk to the session, never to the buffer
//! directly. All buffer mutation and the whole flush cycle run under the same
//! buffer lock, so a producer can never observe a half-reset accumulator and
//! two producers can never create the same identity twice.

use super::buffer::{AggregationBuffer, RecordError};
use super::flush::{FlushCoordinator, FlushError, FlushReport, FlushState};
use super::store::ProfileStore;
use super::types::{ClassId, FunctionId, ProfileEvent, ThreadId};
use std::sync::{Mutex, MutexGuard, PoisonError};

pub struct ProfileSession<S> {
    buffer: Mutex<AggregationBuffer>,
    store: Mutex<S>,
    coordinator: FlushCoordinator,
}

impl<S: ProfileStore> ProfileSession<S> {
    pub fn new(store: S) -> Self {
        Self {
            buffer: Mutex::new(AggregationBuffer::new()),
            store: Mutex::new(store),
            coordinator: FlushCoordinator::new(),
        }
    }

    pub fn record_call(
        &self,
        thread_id: ThreadId,
        parent_id: FunctionId,
        child_id: FunctionId,
        delta: i64,
    ) -> Result<(), RecordError> {
        self.lock_buffer()
            .record_call(thread_id, parent_id, child_id, delta)
    }

    pub fn record_sample(
        &self,
        thread_id: ThreadId,
        function_id: FunctionId,
        delta: i64,
    ) -> Result<(), RecordError> {
        self.lock_buffer().record_sample(thread_id, function_id, delta)
    }

    pub fn record_allocation(
        &self,
        class_id: ClassId,
        function_id: FunctionId,
        count: i64,
        size: i64,
    ) -> Result<(), RecordError> {
        self.lock_buffer()
            .record_allocation(class_id, function_id, count, size)
    }

    /// Record one producer event.
    pub fn record(&self, event: &ProfileEvent) -> Result<(), RecordError> {
        match *event {
            ProfileEvent::Call {
                thread_id,
                parent_id,
                child_id,
                time,
            } => self.record_call(thread_id, parent_id, child_id, time),
            ProfileEvent::Sample {
                thread_id,
                function_id,
                time,
            } => self.record_sample(thread_id, function_id, time),
            ProfileEvent::Allocation {
                class_id,
                function_id,
                count,
                size,
            } => self.record_allocation(class_id, function_id, count, size),
        }
    }

    /// Events recorded since the last successful flush
    pub fn pending_events(&self) -> u64 {
        self.lock_buffer().pending_events()
    }

    /// True once at least `threshold` events are waiting to be flushed.
    pub fn should_flush(&self, threshold: u64) -> bool {
        let pending = self.pending_events();
        pending > 0 && pending >= threshold
    }

    pub fn state(&self) -> FlushState {
        self.coordinator.state()
    }

    pub fn coordinator(&self) -> &FlushCoordinator {
        &self.coordinator
    }

    /// Merge every pending delta into the store in one transaction.
    ///
    /// Blocks until commit or rollback. Returns `FlushError::InProgress`
    /// without waiting if another thread is already flushing.
    pub fn flush(&self) -> Result<FlushReport, FlushError> {
        let permit = self.coordinator.enter().inspect_err(|_| {
            log::debug!("Flush requested while another is in progress");
        })?;

        let mut buffer = self.lock_buffer();
        let mut store = self.lock_store();
        permit.run(&mut buffer, &mut *store)
    }

    /// Read-only view of the pending deltas.
    pub fn with_buffer<R>(&self, f: impl FnOnce(&AggregationBuffer) -> R) -> R {
        f(&self.lock_buffer())
    }

    /// Run a read query against the store. Waits for an active flush to
    /// finish, so readers only ever see committed counters.
    pub fn with_store<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&self.lock_store())
    }

    /// Flush what is left and hand back the store.
    ///
    /// On failure the session is returned with its pending deltas intact.
    pub fn close(self) -> Result<S, (FlushError, Self)> {
        match self.flush() {
            Ok(report) => {
                log::info!(
                    "✅ Final flush complete: {} queries in {}ms",
                    report.queries,
                    report.elapsed.as_millis()
                );
                Ok(self.into_store())
            }
            Err(e) => Err((e, self)),
        }
    }

    /// Hand back the store without flushing.
    pub fn into_store(self) -> S {
        self.store
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // Buffer mutations are single calls and flush resets only run after
    // commit, so a poisoned guard still holds a consistent buffer.
    fn lock_buffer(&self) -> MutexGuard<'_, AggregationBuffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // A cycle that unwinds rolls its transaction back before the guard drops.
    fn lock_store(&self) -> MutexGuard<'_, S> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
