//! Persistent store contract used by the flusher
//!
//! A store exposes, per series, an additive "update by identity" returning the
//! number of rows it touched and a plain insert, plus explicit transaction
//! boundaries. Schema and pragma setup belong to the concrete adapter.

use super::types::{AllocData, AllocKey, CallKey, SampleKey};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Database file not found: {}", .0.display())]
    MissingDatabase(PathBuf),
    #[error("a transaction is already active")]
    TransactionActive,
    #[error("no active transaction")]
    NoTransaction,
    /// Merging the delta would push a stored counter past `i64::MAX`.
    #[error("{table} counter would overflow")]
    CounterOverflow { table: &'static str },
}

/// Backing store for aggregated counters.
///
/// Update operations are additive (`Time = Time + delta`) and filtered by the
/// full identity; for calls and samples they only match live-session rows.
/// A return of zero means no row exists yet for the identity; an update that
/// would overflow an existing counter fails with `StoreError::CounterOverflow`.
pub trait ProfileStore: Send {
    fn begin(&mut self) -> Result<(), StoreError>;

    fn commit(&mut self) -> Result<(), StoreError>;

    fn rollback(&mut self) -> Result<(), StoreError>;

    fn update_call(&mut self, key: &CallKey, time: i64) -> Result<usize, StoreError>;

    fn insert_call(&mut self, key: &CallKey, time: i64) -> Result<(), StoreError>;

    fn update_sample(&mut self, key: &SampleKey, time: i64) -> Result<usize, StoreError>;

    fn insert_sample(&mut self, key: &SampleKey, time: i64) -> Result<(), StoreError>;

    fn update_allocation(&mut self, key: &AllocKey, data: &AllocData)
        -> Result<usize, StoreError>;

    fn insert_allocation(&mut self, key: &AllocKey, data: &AllocData) -> Result<(), StoreError>;

    /// Get backend type for logging
    fn backend_type(&self) -> &'static str;
}
