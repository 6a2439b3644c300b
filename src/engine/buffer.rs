//! Process-local aggregation buffer
//!
//! Holds the pending deltas for call edges, function samples and allocation
//! stats accumulated since the last successful flush. The buffer itself does
//! no locking: `ProfileSession` owns it behind a single mutex that producers
//! and the flusher share.

use super::types::{
    Accumulator, AllocData, AllocKey, CallKey, ClassId, FunctionId, SampleKey, ThreadId,
};
use std::collections::btree_map::{self, BTreeMap};
use thiserror::Error;

/// A delta rejected at the recording call. The buffer is left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("negative {field} delta: {value}")]
    NegativeDelta { field: &'static str, value: i64 },
    #[error("{field} accumulator would overflow")]
    Overflow { field: &'static str },
}

/// Mapping from a composite identity to its pending accumulator.
///
/// Entries are created lazily on first observation and kept across flushes
/// unless explicitly removed, so zeroed entries are reused by the next cycle.
/// Enumeration is ordered by key, which keeps flush diagnostics reproducible.
#[derive(Debug, Clone)]
pub struct AccumulatorMap<K, V> {
    entries: BTreeMap<K, V>,
}

impl<K: Ord + Copy, V: Accumulator> AccumulatorMap<K, V> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Finds or creates the entry for `key` and merges `delta` into it.
    ///
    /// On overflow the map is left untouched and the overflowing component
    /// is returned.
    pub fn add(&mut self, key: K, delta: V) -> Result<(), &'static str> {
        match self.entries.entry(key) {
            btree_map::Entry::Occupied(mut slot) => {
                let merged = slot.get().checked_merge(&delta)?;
                *slot.get_mut() = merged;
            }
            btree_map::Entry::Vacant(slot) => {
                slot.insert(delta);
            }
        }
        Ok(())
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    /// Enumerates the current contents in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> + '_ {
        self.entries.iter()
    }

    /// Sets the accumulator to zero in place, keeping the entry.
    pub fn reset(&mut self, key: &K) {
        if let Some(value) = self.entries.get_mut(key) {
            *value = V::default();
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Ord + Copy, V: Accumulator> Default for AccumulatorMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Pending deltas for all three series plus the count of events recorded
/// since the last successful flush.
#[derive(Debug, Clone, Default)]
pub struct AggregationBuffer {
    calls: AccumulatorMap<CallKey, i64>,
    samples: AccumulatorMap<SampleKey, i64>,
    allocations: AccumulatorMap<AllocKey, AllocData>,
    pending_events: u64,
}

impl AggregationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attributes `delta` elapsed time to the caller -> callee edge on a thread.
    pub fn record_call(
        &mut self,
        thread_id: ThreadId,
        parent_id: FunctionId,
        child_id: FunctionId,
        delta: i64,
    ) -> Result<(), RecordError> {
        check_non_negative("time", delta)?;
        self.calls
            .add(CallKey::new(thread_id, parent_id, child_id), delta)
            .map_err(|field| RecordError::Overflow { field })?;
        self.pending_events += 1;
        Ok(())
    }

    /// Attributes `delta` exclusive time to a function on a thread.
    pub fn record_sample(
        &mut self,
        thread_id: ThreadId,
        function_id: FunctionId,
        delta: i64,
    ) -> Result<(), RecordError> {
        check_non_negative("time", delta)?;
        self.samples
            .add(SampleKey::new(thread_id, function_id), delta)
            .map_err(|field| RecordError::Overflow { field })?;
        self.pending_events += 1;
        Ok(())
    }

    /// Adds `count` objects totalling `size` bytes of a class allocated at a call site.
    pub fn record_allocation(
        &mut self,
        class_id: ClassId,
        function_id: FunctionId,
        count: i64,
        size: i64,
    ) -> Result<(), RecordError> {
        check_non_negative("count", count)?;
        check_non_negative("size", size)?;
        self.allocations
            .add(AllocKey::new(class_id, function_id), AllocData::new(count, size))
            .map_err(|field| RecordError::Overflow { field })?;
        self.pending_events += 1;
        Ok(())
    }

    pub fn calls(&self) -> &AccumulatorMap<CallKey, i64> {
        &self.calls
    }

    pub fn samples(&self) -> &AccumulatorMap<SampleKey, i64> {
        &self.samples
    }

    pub fn allocations(&self) -> &AccumulatorMap<AllocKey, AllocData> {
        &self.allocations
    }

    pub fn reset_call(&mut self, key: &CallKey) {
        self.calls.reset(key);
    }

    pub fn reset_sample(&mut self, key: &SampleKey) {
        self.samples.reset(key);
    }

    pub fn clear_allocations(&mut self) {
        self.allocations.clear();
    }

    /// Events recorded since the last successful flush
    pub fn pending_events(&self) -> u64 {
        self.pending_events
    }

    pub(crate) fn mark_flushed(&mut self) {
        self.pending_events = 0;
    }
}

fn check_non_negative(field: &'static str, value: i64) -> Result<(), RecordError> {
    if value < 0 {
        return Err(RecordError::NegativeDelta { field, value });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_sample_accumulates_per_identity() {
        let mut buffer = AggregationBuffer::new();
        buffer.record_sample(1, 42, 100).unwrap();
        buffer.record_sample(1, 42, 50).unwrap();
        buffer.record_sample(2, 42, 7).unwrap();

        assert_eq!(buffer.samples().len(), 2);
        assert_eq!(buffer.samples().get(&SampleKey::new(1, 42)), Some(&150));
        assert_eq!(buffer.samples().get(&SampleKey::new(2, 42)), Some(&7));
        assert_eq!(buffer.pending_events(), 3);
    }

    #[test]
    fn test_record_call_creates_single_entry() {
        let mut buffer = AggregationBuffer::new();
        for _ in 0..5 {
            buffer.record_call(3, 10, 11, 4).unwrap();
        }
        assert_eq!(buffer.calls().len(), 1);
        assert_eq!(buffer.calls().get(&CallKey::new(3, 10, 11)), Some(&20));
    }

    #[test]
    fn test_negative_delta_rejected_without_side_effects() {
        let mut buffer = AggregationBuffer::new();
        let err = buffer.record_call(1, 2, 3, -5).unwrap_err();
        assert_eq!(
            err,
            RecordError::NegativeDelta {
                field: "time",
                value: -5
            }
        );
        assert!(buffer.calls().is_empty());
        assert_eq!(buffer.pending_events(), 0);

        assert!(buffer.record_allocation(1, 2, 1, -1).is_err());
        assert!(buffer.allocations().is_empty());
    }

    #[test]
    fn test_overflow_keeps_previous_value() {
        let mut buffer = AggregationBuffer::new();
        buffer.record_sample(1, 1, i64::MAX).unwrap();
        let err = buffer.record_sample(1, 1, 1).unwrap_err();
        assert_eq!(err, RecordError::Overflow { field: "time" });
        assert_eq!(buffer.samples().get(&SampleKey::new(1, 1)), Some(&i64::MAX));
        assert_eq!(buffer.pending_events(), 1);
    }

    #[test]
    fn test_reset_keeps_entry_and_clear_drops_allocations() {
        let mut buffer = AggregationBuffer::new();
        buffer.record_call(1, 2, 3, 10).unwrap();
        buffer.record_sample(1, 2, 10).unwrap();
        buffer.record_allocation(7, 3, 2, 64).unwrap();

        buffer.reset_call(&CallKey::new(1, 2, 3));
        buffer.reset_sample(&SampleKey::new(1, 2));
        buffer.clear_allocations();

        assert_eq!(buffer.calls().get(&CallKey::new(1, 2, 3)), Some(&0));
        assert_eq!(buffer.samples().get(&SampleKey::new(1, 2)), Some(&0));
        assert!(buffer.allocations().is_empty());
    }

    #[test]
    fn test_allocation_enumeration_grouped_by_class() {
        let mut buffer = AggregationBuffer::new();
        buffer.record_allocation(9, 1, 1, 8).unwrap();
        buffer.record_allocation(2, 5, 1, 8).unwrap();
        buffer.record_allocation(2, 4, 1, 8).unwrap();

        let order: Vec<AllocKey> = buffer.allocations().iter().map(|(k, _)| *k).collect();
        assert_eq!(
            order,
            vec![AllocKey::new(2, 4), AllocKey::new(2, 5), AllocKey::new(9, 1)]
        );
    }

    #[test]
    fn test_allocation_overflow_names_component() {
        let mut buffer = AggregationBuffer::new();
        buffer.record_allocation(7, 3, i64::MAX, 8).unwrap();
        buffer.record_allocation(8, 3, 1, i64::MAX).unwrap();

        assert_eq!(
            buffer.record_allocation(7, 3, 1, 8),
            Err(RecordError::Overflow { field: "count" })
        );
        assert_eq!(
            buffer.record_allocation(8, 3, 1, 1),
            Err(RecordError::Overflow { field: "size" })
        );
        assert_eq!(
            buffer.allocations().get(&AllocKey::new(7, 3)),
            Some(&AllocData::new(i64::MAX, 8))
        );
        assert_eq!(buffer.pending_events(), 2);
    }
}
