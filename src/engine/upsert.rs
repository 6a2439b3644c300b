//! Merge-first, insert-on-miss flushing of one series
//!
//! For every entry with a non-zero accumulator the flusher issues the additive
//! update filtered by the full identity. Only when that update touched no row
//! is the raw delta inserted. Issuing the insert first could duplicate an
//! existing row, since the probe is the only way to learn whether one exists.

use super::buffer::{AccumulatorMap, AggregationBuffer};
use super::store::{ProfileStore, StoreError};
use super::types::{Accumulator, AllocData, AllocKey, CallKey, SampleKey};

/// One of the three aggregate series, bound to its store operations and to
/// the post-flush action applied to its buffer entries.
pub trait Series {
    type Key: Ord + Copy + std::fmt::Debug;
    type Value: Accumulator;

    /// Label used in logs and errors
    const NAME: &'static str;

    fn entries(buffer: &AggregationBuffer) -> &AccumulatorMap<Self::Key, Self::Value>;

    fn update(
        store: &mut dyn ProfileStore,
        key: &Self::Key,
        value: &Self::Value,
    ) -> Result<usize, StoreError>;

    fn insert(
        store: &mut dyn ProfileStore,
        key: &Self::Key,
        value: &Self::Value,
    ) -> Result<(), StoreError>;

    /// Runs once the flush holding `keys` has committed.
    fn after_commit(buffer: &mut AggregationBuffer, keys: &[Self::Key]);
}

pub struct CallSeries;

impl Series for CallSeries {
    type Key = CallKey;
    type Value = i64;

    const NAME: &'static str = "calls";

    fn entries(buffer: &AggregationBuffer) -> &AccumulatorMap<CallKey, i64> {
        buffer.calls()
    }

    fn update(store: &mut dyn ProfileStore, key: &CallKey, time: &i64) -> Result<usize, StoreError> {
        store.update_call(key, *time)
    }

    fn insert(store: &mut dyn ProfileStore, key: &CallKey, time: &i64) -> Result<(), StoreError> {
        store.insert_call(key, *time)
    }

    fn after_commit(buffer: &mut AggregationBuffer, keys: &[CallKey]) {
        for key in keys {
            buffer.reset_call(key);
        }
    }
}

pub struct SampleSeries;

impl Series for SampleSeries {
    type Key = SampleKey;
    type Value = i64;

    const NAME: &'static str = "samples";

    fn entries(buffer: &AggregationBuffer) -> &AccumulatorMap<SampleKey, i64> {
        buffer.samples()
    }

    fn update(
        store: &mut dyn ProfileStore,
        key: &SampleKey,
        time: &i64,
    ) -> Result<usize, StoreError> {
        store.update_sample(key, *time)
    }

    fn insert(store: &mut dyn ProfileStore, key: &SampleKey, time: &i64) -> Result<(), StoreError> {
        store.insert_sample(key, *time)
    }

    fn after_commit(buffer: &mut AggregationBuffer, keys: &[SampleKey]) {
        for key in keys {
            buffer.reset_sample(key);
        }
    }
}

pub struct AllocationSeries;

impl Series for AllocationSeries {
    type Key = AllocKey;
    type Value = AllocData;

    const NAME: &'static str = "allocations";

    fn entries(buffer: &AggregationBuffer) -> &AccumulatorMap<AllocKey, AllocData> {
        buffer.allocations()
    }

    fn update(
        store: &mut dyn ProfileStore,
        key: &AllocKey,
        data: &AllocData,
    ) -> Result<usize, StoreError> {
        store.update_allocation(key, data)
    }

    fn insert(
        store: &mut dyn ProfileStore,
        key: &AllocKey,
        data: &AllocData,
    ) -> Result<(), StoreError> {
        store.insert_allocation(key, data)
    }

    // Persisted rows are found again through the update path, so the whole
    // series is dropped, zero entries included.
    fn after_commit(buffer: &mut AggregationBuffer, _keys: &[AllocKey]) {
        buffer.clear_allocations();
    }
}

/// Outcome of pushing one series into the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesFlush<K> {
    /// Store operations issued (updates plus inserts)
    pub queries: usize,
    /// Entries merged into an existing row
    pub merged: usize,
    /// Entries that created a new row
    pub inserted: usize,
    /// Identities written, awaiting their post-commit action
    pub keys: Vec<K>,
}

impl<K> Default for SeriesFlush<K> {
    fn default() -> Self {
        Self {
            queries: 0,
            merged: 0,
            inserted: 0,
            keys: Vec::new(),
        }
    }
}

/// Failure part-way through a series. `queries` counts the operations issued
/// before and including the failing one.
#[derive(Debug)]
pub struct SeriesError {
    pub queries: usize,
    pub source: StoreError,
}

/// Push every non-zero pending delta of series `S` into `store`.
///
/// The buffer is only read here; the post-flush action is deferred to
/// `Series::after_commit` so that a rolled-back cycle leaves it untouched.
pub fn flush_series<S: Series>(
    store: &mut dyn ProfileStore,
    buffer: &AggregationBuffer,
) -> Result<SeriesFlush<S::Key>, SeriesError> {
    let mut outcome = SeriesFlush::default();

    for (key, value) in S::entries(buffer).iter() {
        if value.is_zero() {
            continue;
        }

        outcome.queries += 1;
        let affected = S::update(store, key, value).map_err(|source| SeriesError {
            queries: outcome.queries,
            source,
        })?;

        if affected == 0 {
            outcome.queries += 1;
            S::insert(store, key, value).map_err(|source| SeriesError {
                queries: outcome.queries,
                source,
            })?;
            outcome.inserted += 1;
        } else {
            outcome.merged += 1;
        }

        outcome.keys.push(*key);
    }

    log::debug!(
        "{} flushed: {} merged, {} inserted, {} queries",
        S::NAME,
        outcome.merged,
        outcome.inserted,
        outcome.queries
    );

    Ok(outcome)
}
