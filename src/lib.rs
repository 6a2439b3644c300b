//! proftally - aggregation and durable flush of live profiling counters
//!
//! Call-graph edges, per-function sample time and allocation statistics are
//! accumulated in memory and merged into SQLite counters in atomic flush
//! cycles. See [`engine`] for the architecture.

pub mod engine;

pub use engine::{
    EngineConfig, FlushError, FlushReport, ProfileSession, ProfileStore, RecordError,
    SqliteStore, StoreError,
};
