//! Flush coordinator - one atomic cycle across all three series
//!
//! A cycle opens a transaction, pushes calls, samples and allocations (in that
//! order), commits, and only then applies the post-flush buffer actions. Any
//! failure rolls the transaction back and leaves the buffer exactly as it was,
//! so the next cycle retries the same deltas.
//!
//! ```text
//! Idle → Flushing → {Committed | RolledBack} → Idle
//! ```

use super::buffer::AggregationBuffer;
use super::store::{ProfileStore, StoreError};
use super::upsert::{flush_series, AllocationSeries, CallSeries, SampleSeries, Series, SeriesFlush};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlushError {
    /// Another cycle is active; nothing was touched.
    #[error("a flush is already in progress")]
    InProgress,
    #[error("failed to begin flush transaction: {0}")]
    Begin(#[source] StoreError),
    #[error("{series} flush failed after {queries} queries in {}ms: {source}", .elapsed.as_millis())]
    Store {
        series: &'static str,
        queries: usize,
        elapsed: Duration,
        #[source]
        source: StoreError,
    },
    #[error("commit failed after {queries} queries in {}ms: {source}", .elapsed.as_millis())]
    Commit {
        queries: usize,
        elapsed: Duration,
        #[source]
        source: StoreError,
    },
}

impl FlushError {
    /// Store operations issued before the cycle was abandoned
    pub fn queries(&self) -> Option<usize> {
        match self {
            FlushError::Store { queries, .. } | FlushError::Commit { queries, .. } => {
                Some(*queries)
            }
            FlushError::InProgress | FlushError::Begin(_) => None,
        }
    }

    pub fn elapsed(&self) -> Option<Duration> {
        match self {
            FlushError::Store { elapsed, .. } | FlushError::Commit { elapsed, .. } => {
                Some(*elapsed)
            }
            FlushError::InProgress | FlushError::Begin(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FlushState {
    Idle,
    Flushing,
}

/// Per-series counts of a committed cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SeriesSummary {
    pub queries: usize,
    pub merged: usize,
    pub inserted: usize,
}

impl<K> From<&SeriesFlush<K>> for SeriesSummary {
    fn from(outcome: &SeriesFlush<K>) -> Self {
        Self {
            queries: outcome.queries,
            merged: outcome.merged,
            inserted: outcome.inserted,
        }
    }
}

/// Diagnostics of a committed cycle
#[derive(Debug, Clone, Serialize)]
pub struct FlushReport {
    pub calls: SeriesSummary,
    pub samples: SeriesSummary,
    pub allocations: SeriesSummary,
    pub queries: usize,
    pub elapsed: Duration,
    pub completed_at: DateTime<Utc>,
}

/// Enforces the single-flusher invariant and runs flush cycles.
#[derive(Debug, Default)]
pub struct FlushCoordinator {
    in_flight: AtomicBool,
    committed: AtomicU64,
    rolled_back: AtomicU64,
}

impl FlushCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> FlushState {
        if self.in_flight.load(Ordering::Acquire) {
            FlushState::Flushing
        } else {
            FlushState::Idle
        }
    }

    /// Cycles that committed since creation
    pub fn committed_cycles(&self) -> u64 {
        self.committed.load(Ordering::Relaxed)
    }

    /// Cycles abandoned after entering `Flushing`
    pub fn rolled_back_cycles(&self) -> u64 {
        self.rolled_back.load(Ordering::Relaxed)
    }

    /// Claim the right to flush. Fails immediately if a cycle is active.
    ///
    /// The claim is released when the returned permit is dropped.
    pub fn enter(&self) -> Result<FlushPermit<'_>, FlushError> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| FlushError::InProgress)?;
        Ok(FlushPermit { coordinator: self })
    }

    /// Run one cycle if no other is active.
    pub fn flush(
        &self,
        buffer: &mut AggregationBuffer,
        store: &mut dyn ProfileStore,
    ) -> Result<FlushReport, FlushError> {
        self.enter()?.run(buffer, store)
    }
}

/// Proof that the holder is the only active flusher.
#[derive(Debug)]
pub struct FlushPermit<'a> {
    coordinator: &'a FlushCoordinator,
}

impl FlushPermit<'_> {
    /// Run the cycle. Consumes the permit; the coordinator returns to `Idle`
    /// once commit or rollback has completed.
    pub fn run(
        self,
        buffer: &mut AggregationBuffer,
        store: &mut dyn ProfileStore,
    ) -> Result<FlushReport, FlushError> {
        let result = run_cycle(buffer, store);
        match &result {
            Ok(_) => {
                self.coordinator.committed.fetch_add(1, Ordering::Relaxed);
            }
            // Never entered a transaction
            Err(FlushError::Begin(_)) => {}
            Err(_) => {
                self.coordinator.rolled_back.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }
}

impl Drop for FlushPermit<'_> {
    fn drop(&mut self) {
        self.coordinator.in_flight.store(false, Ordering::Release);
    }
}

/// Open transaction of one cycle. Dropping it before `committed` is set rolls
/// back, so every early return and any panic out of a store call leaves the
/// store without a dangling transaction.
struct CycleTransaction<'a> {
    store: &'a mut dyn ProfileStore,
    committed: bool,
}

impl<'a> CycleTransaction<'a> {
    fn begin(store: &'a mut dyn ProfileStore) -> Result<Self, FlushError> {
        store.begin().map_err(FlushError::Begin)?;
        Ok(Self {
            store,
            committed: false,
        })
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.store.commit()?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for CycleTransaction<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if std::thread::panicking() {
            log::error!("❌ Flush aborted by a panic, rolling back");
        }
        if let Err(e) = self.store.rollback() {
            log::error!("❌ Rollback failed on {} store: {}", self.store.backend_type(), e);
        }
    }
}

fn run_cycle(
    buffer: &mut AggregationBuffer,
    store: &mut dyn ProfileStore,
) -> Result<FlushReport, FlushError> {
    let timer = Instant::now();
    let mut queries = 0usize;

    let mut tx = CycleTransaction::begin(store)?;

    let calls = flush_step::<CallSeries>(&mut *tx.store, buffer, &mut queries, timer)?;
    let samples = flush_step::<SampleSeries>(&mut *tx.store, buffer, &mut queries, timer)?;
    let allocations =
        flush_step::<AllocationSeries>(&mut *tx.store, buffer, &mut queries, timer)?;

    if let Err(source) = tx.commit() {
        let elapsed = timer.elapsed();
        log::warn!(
            "⚠️  Flush commit failed after {} queries ({}ms), pending deltas kept: {}",
            queries,
            elapsed.as_millis(),
            source
        );
        return Err(FlushError::Commit {
            queries,
            elapsed,
            source,
        });
    }
    drop(tx);

    CallSeries::after_commit(buffer, &calls.keys);
    SampleSeries::after_commit(buffer, &samples.keys);
    AllocationSeries::after_commit(buffer, &allocations.keys);
    buffer.mark_flushed();

    let elapsed = timer.elapsed();
    log::debug!(
        "Database update took {} milliseconds for {} queries.",
        elapsed.as_millis(),
        queries
    );

    Ok(FlushReport {
        calls: SeriesSummary::from(&calls),
        samples: SeriesSummary::from(&samples),
        allocations: SeriesSummary::from(&allocations),
        queries,
        elapsed,
        completed_at: Utc::now(),
    })
}

// The caller's `CycleTransaction` rolls back once the error propagates.
fn flush_step<S: Series>(
    store: &mut dyn ProfileStore,
    buffer: &AggregationBuffer,
    queries: &mut usize,
    timer: Instant,
) -> Result<SeriesFlush<S::Key>, FlushError> {
    match flush_series::<S>(store, buffer) {
        Ok(outcome) => {
            *queries += outcome.queries;
            Ok(outcome)
        }
        Err(err) => {
            *queries += err.queries;
            let elapsed = timer.elapsed();
            log::warn!(
                "⚠️  {} flush failed after {} queries, rolling back: {}",
                S::NAME,
                *queries,
                err.source
            );
            Err(FlushError::Store {
                series: S::NAME,
                queries: *queries,
                elapsed,
                source: err.source,
            })
        }
    }
}
