//! Engine configuration from environment variables

use super::session::ProfileSession;
use super::sqlite::SqliteStore;
use super::store::StoreError;
use std::env;
use std::time::Duration;

/// Configuration for a profiling session and its flush scheduler
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Path to the SQLite database file (None = in-memory)
    pub db_path: Option<String>,

    /// Delete an existing database file on open
    pub create_new: bool,

    /// Maximum time pending deltas may wait, in milliseconds
    pub flush_interval_ms: u64,

    /// Pending events that force a flush before the interval elapses
    pub flush_threshold: u64,

    /// Scheduler tick in milliseconds
    pub poll_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            create_new: true,
            flush_interval_ms: 1_000,
            flush_threshold: 10_000,
            poll_interval_ms: 100,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `PROFTALLY_DB_PATH` (default: in-memory; `:memory:` also selects it)
    /// - `PROFTALLY_CREATE_NEW` (default: true)
    /// - `PROFTALLY_FLUSH_INTERVAL_MS` (default: 1000)
    /// - `PROFTALLY_FLUSH_THRESHOLD` (default: 10000)
    /// - `PROFTALLY_POLL_INTERVAL_MS` (default: 100)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable source.
    /// Unparseable values fall back to the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        Self {
            db_path: lookup("PROFTALLY_DB_PATH")
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty() && s != ":memory:"),

            create_new: lookup("PROFTALLY_CREATE_NEW")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.create_new),

            flush_interval_ms: lookup("PROFTALLY_FLUSH_INTERVAL_MS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.flush_interval_ms),

            flush_threshold: lookup("PROFTALLY_FLUSH_THRESHOLD")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.flush_threshold),

            poll_interval_ms: lookup("PROFTALLY_POLL_INTERVAL_MS")
                .and_then(|s| s.parse().ok())
                .filter(|ms| *ms > 0)
                .unwrap_or(defaults.poll_interval_ms),
        }
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Open the configured store.
    pub fn open_store(&self) -> Result<SqliteStore, StoreError> {
        match &self.db_path {
            Some(path) => SqliteStore::open(path, self.create_new),
            None => SqliteStore::open_in_memory(),
        }
    }

    /// Open the configured store and wrap it in a fresh session.
    pub fn open_session(&self) -> Result<ProfileSession<SqliteStore>, StoreError> {
        Ok(ProfileSession::new(self.open_store()?))
    }
}
