//! Identities and accumulators for the three aggregate series
//!
//! Every series maps a composite identity (a small `Copy` key) to an
//! accumulator. Keys order by their fields in declaration order, so
//! allocation stats group by class first and call site second.

use serde::{Deserialize, Serialize};

pub type ThreadId = u32;
pub type FunctionId = u32;
pub type ClassId = u32;
pub type SnapshotId = u32;

/// Discriminator of the live, not-yet-snapshotted session
pub const LIVE_SNAPSHOT: SnapshotId = 0;

/// Caller -> callee relationship observed on one thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallKey {
    pub thread_id: ThreadId,
    pub parent_id: FunctionId,
    pub child_id: FunctionId,
}

impl CallKey {
    pub fn new(thread_id: ThreadId, parent_id: FunctionId, child_id: FunctionId) -> Self {
        Self {
            thread_id,
            parent_id,
            child_id,
        }
    }
}

/// Exclusive time of one function on one thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SampleKey {
    pub thread_id: ThreadId,
    pub function_id: FunctionId,
}

impl SampleKey {
    pub fn new(thread_id: ThreadId, function_id: FunctionId) -> Self {
        Self {
            thread_id,
            function_id,
        }
    }
}

/// Objects of one class allocated at one call site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AllocKey {
    pub class_id: ClassId,
    pub function_id: FunctionId,
}

impl AllocKey {
    pub fn new(class_id: ClassId, function_id: FunctionId) -> Self {
        Self {
            class_id,
            function_id,
        }
    }
}

/// Count/size pair, both merged by addition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocData {
    pub count: i64,
    pub size: i64,
}

impl AllocData {
    pub fn new(count: i64, size: i64) -> Self {
        Self { count, size }
    }
}

/// A pending delta held by the aggregation buffer.
///
/// `is_zero` decides whether a flush has anything to write for the entry.
pub trait Accumulator: Copy + Default {
    fn is_zero(&self) -> bool;

    /// Adds `other` component-wise. On overflow nothing is merged and the
    /// error names the offending component.
    fn checked_merge(&self, other: &Self) -> Result<Self, &'static str>;
}

/// Elapsed time in the call and sample series
impl Accumulator for i64 {
    fn is_zero(&self) -> bool {
        *self == 0
    }

    fn checked_merge(&self, other: &Self) -> Result<Self, &'static str> {
        self.checked_add(*other).ok_or("time")
    }
}

impl Accumulator for AllocData {
    fn is_zero(&self) -> bool {
        self.count == 0 && self.size == 0
    }

    fn checked_merge(&self, other: &Self) -> Result<Self, &'static str> {
        Ok(Self {
            count: self.count.checked_add(other.count).ok_or("count")?,
            size: self.size.checked_add(other.size).ok_or("size")?,
        })
    }
}

/// One discrete profiling event as delivered by a producer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProfileEvent {
    Call {
        thread_id: ThreadId,
        parent_id: FunctionId,
        child_id: FunctionId,
        time: i64,
    },
    Sample {
        thread_id: ThreadId,
        function_id: FunctionId,
        time: i64,
    },
    Allocation {
        class_id: ClassId,
        function_id: FunctionId,
        count: i64,
        size: i64,
    },
}

/// Persisted call edge as read back by consumers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRow {
    pub thread_id: ThreadId,
    pub parent_id: FunctionId,
    pub child_id: FunctionId,
    pub snapshot_id: SnapshotId,
    pub time: i64,
}

/// Persisted per-function sample time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleRow {
    pub thread_id: ThreadId,
    pub function_id: FunctionId,
    pub snapshot_id: SnapshotId,
    pub time: i64,
}

/// Persisted allocation totals
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRow {
    pub class_id: ClassId,
    pub function_id: FunctionId,
    pub count: i64,
    pub size: i64,
}
