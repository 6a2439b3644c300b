//! # Profile aggregation engine
//!
//! In-memory aggregation of live profiling events and their durable,
//! transactional merge into persistent counters.
//!
//! ## Architecture
//!
//! ```text
//! record_call / record_sample / record_allocation
//!     ↓
//! ProfileSession (single owner, one buffer lock)
//!     ↓
//! AggregationBuffer (calls, samples, allocations)
//!     ↓
//! FlushCoordinator (one transaction per cycle)
//!     ↓
//! flush_series × 3 (update by identity, insert on miss)
//!     ↓
//! ProfileStore → SqliteStore (Calls, Samples, Allocations)
//! ```
//!
//! Series are flushed in a fixed order: calls, samples, allocations. After a
//! commit, call and sample entries are zeroed and kept; allocation entries are
//! dropped. A failed cycle rolls back and leaves the buffer as it was.
//!
//! ## Module Organization
//!
//! - `types` - Identities, accumulators and persisted row shapes
//! - `buffer` - Generic accumulator map and the aggregation buffer
//! - `store` - Persistent store contract
//! - `sqlite` - SQLite adapter, schema and read queries
//! - `upsert` - Merge-first, insert-on-miss flushing of one series
//! - `flush` - Flush cycle coordination and diagnostics
//! - `session` - Owner of the buffer and the store
//! - `scheduler` - Optional background flush task
//! - `config` - Environment configuration

pub mod buffer;
pub mod config;
pub mod flush;
pub mod scheduler;
pub mod session;
pub mod sqlite;
pub mod store;
pub mod types;
pub mod upsert;

// Re-export commonly used types
pub use buffer::{AccumulatorMap, AggregationBuffer, RecordError};
pub use config::EngineConfig;
pub use flush::{FlushCoordinator, FlushError, FlushReport, FlushState, SeriesSummary};
pub use scheduler::{flush_scheduler_task, SchedulerStats};
pub use session::ProfileSession;
pub use sqlite::SqliteStore;
pub use store::{ProfileStore, StoreError};
pub use types::{
    AllocData, AllocKey, AllocationRow, CallKey, CallRow, ProfileEvent, SampleKey, SampleRow,
    LIVE_SNAPSHOT,
};
