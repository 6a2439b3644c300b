//! SQLite adapter for the persistent store
//!
//! Opens either an in-memory database or a file, applies the session PRAGMAs,
//! creates the schema from `sql/` and serves the prepared merge/insert
//! statements used by the flusher. Consumers read the accumulated rows back
//! through `call_rows`, `sample_rows` and `allocation_rows`.

use super::store::{ProfileStore, StoreError};
use super::types::{
    AllocData, AllocKey, AllocationRow, CallKey, CallRow, SampleKey, SampleRow, SnapshotId,
};
use rusqlite::{params, Connection, Params};
use std::fs;
use std::path::Path;

const SCHEMA: [(&str, &str); 3] = [
    ("01_calls.sql", include_str!("../../sql/01_calls.sql")),
    ("02_samples.sql", include_str!("../../sql/02_samples.sql")),
    ("03_allocations.sql", include_str!("../../sql/03_allocations.sql")),
];

// Updates refuse to push a counter past i64::MAX, where SQLite would
// silently switch the column to REAL. A refused update matches no row, so the
// adapter tells it apart from a missing row with the matching existence query.
const UPDATE_CALL: &str = "UPDATE Calls SET Time = Time + ?1 \
     WHERE ThreadId = ?2 AND ParentId = ?3 AND ChildId = ?4 AND SnapshotId = 0 \
     AND Time <= 9223372036854775807 - ?1";
const CALL_EXISTS: &str = "SELECT 1 FROM Calls \
     WHERE ThreadId = ?1 AND ParentId = ?2 AND ChildId = ?3 AND SnapshotId = 0";
const INSERT_CALL: &str =
    "INSERT INTO Calls (Time, ThreadId, ParentId, ChildId) VALUES (?1, ?2, ?3, ?4)";

const UPDATE_SAMPLE: &str = "UPDATE Samples SET Time = Time + ?1 \
     WHERE ThreadId = ?2 AND FunctionId = ?3 AND SnapshotId = 0 \
     AND Time <= 9223372036854775807 - ?1";
const SAMPLE_EXISTS: &str =
    "SELECT 1 FROM Samples WHERE ThreadId = ?1 AND FunctionId = ?2 AND SnapshotId = 0";
const INSERT_SAMPLE: &str =
    "INSERT INTO Samples (Time, ThreadId, FunctionId) VALUES (?1, ?2, ?3)";

const UPDATE_ALLOCATION: &str = "UPDATE Allocations SET Count = Count + ?1, Size = Size + ?2 \
     WHERE ClassId = ?3 AND FunctionId = ?4 \
     AND Count <= 9223372036854775807 - ?1 AND Size <= 9223372036854775807 - ?2";
const ALLOCATION_EXISTS: &str =
    "SELECT 1 FROM Allocations WHERE ClassId = ?1 AND FunctionId = ?2";
const INSERT_ALLOCATION: &str =
    "INSERT INTO Allocations (Count, Size, ClassId, FunctionId) VALUES (?1, ?2, ?3, ?4)";

/// Apply the PRAGMAs used for a live profiling session.
///
/// Durability is traded for flush throughput: the data is rebuilt from the
/// profiler on the next run anyway.
pub fn apply_session_pragmas(conn: &Connection) -> Result<(), StoreError> {
    conn.pragma_update(None, "synchronous", "OFF")?;
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "MEMORY", |row| row.get(0))?;
    log::debug!("SQLite journal_mode={}", mode);
    Ok(())
}

/// Create the Calls, Samples and Allocations tables. Idempotent.
pub fn create_schema(conn: &Connection) -> Result<(), StoreError> {
    for (name, sql) in SCHEMA {
        log::debug!("   ├─ Executing: {}", name);
        conn.execute_batch(sql)?;
    }
    Ok(())
}

pub struct SqliteStore {
    conn: Connection,
    name: String,
}

impl SqliteStore {
    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::finish_open(conn, "memory".to_string())
    }

    /// Open a database file.
    ///
    /// With `create_new` any existing file is deleted first; otherwise the file
    /// must already exist.
    pub fn open(db_path: impl AsRef<Path>, create_new: bool) -> Result<Self, StoreError> {
        let path = db_path.as_ref();

        if create_new {
            if path.exists() {
                fs::remove_file(path)?;
            }
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
        } else if !path.exists() {
            return Err(StoreError::MissingDatabase(path.to_path_buf()));
        }

        let conn = Connection::open(path)?;
        Self::finish_open(conn, path.display().to_string())
    }

    fn finish_open(conn: Connection, name: String) -> Result<Self, StoreError> {
        apply_session_pragmas(&conn)?;
        create_schema(&conn)?;

        log::info!("✅ SQLite profile store initialized: {}", name);

        Ok(Self { conn, name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Direct access for consumers issuing their own read queries.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    /// Called after an update matched nothing: fine if the row is missing,
    /// an overflow if it exists.
    fn ensure_absent(
        &self,
        exists_sql: &str,
        params: impl Params,
        table: &'static str,
    ) -> Result<(), StoreError> {
        if self.conn.prepare_cached(exists_sql)?.exists(params)? {
            return Err(StoreError::CounterOverflow { table });
        }
        Ok(())
    }

    pub fn call_rows(&self, snapshot_id: SnapshotId) -> Result<Vec<CallRow>, StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT ThreadId, ParentId, ChildId, SnapshotId, Time FROM Calls
             WHERE SnapshotId = ?1
             ORDER BY ThreadId, ParentId, ChildId",
        )?;
        let rows = stmt
            .query_map([snapshot_id], |row| {
                Ok(CallRow {
                    thread_id: row.get(0)?,
                    parent_id: row.get(1)?,
                    child_id: row.get(2)?,
                    snapshot_id: row.get(3)?,
                    time: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn sample_rows(&self, snapshot_id: SnapshotId) -> Result<Vec<SampleRow>, StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT ThreadId, FunctionId, SnapshotId, Time FROM Samples
             WHERE SnapshotId = ?1
             ORDER BY ThreadId, FunctionId",
        )?;
        let rows = stmt
            .query_map([snapshot_id], |row| {
                Ok(SampleRow {
                    thread_id: row.get(0)?,
                    function_id: row.get(1)?,
                    snapshot_id: row.get(2)?,
                    time: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn allocation_rows(&self) -> Result<Vec<AllocationRow>, StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT ClassId, FunctionId, Count, Size FROM Allocations
             ORDER BY ClassId, FunctionId",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(AllocationRow {
                    class_id: row.get(0)?,
                    function_id: row.get(1)?,
                    count: row.get(2)?,
                    size: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl ProfileStore for SqliteStore {
    fn begin(&mut self) -> Result<(), StoreError> {
        if self.in_transaction() {
            return Err(StoreError::TransactionActive);
        }
        self.conn.execute_batch("BEGIN")?;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        if !self.in_transaction() {
            return Err(StoreError::NoTransaction);
        }
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        // SQLite rolls back on its own for some errors (e.g. SQLITE_FULL)
        if !self.in_transaction() {
            log::debug!("Rollback requested with no active transaction on {}", self.name);
            return Ok(());
        }
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    fn update_call(&mut self, key: &CallKey, time: i64) -> Result<usize, StoreError> {
        let rows = self
            .conn
            .prepare_cached(UPDATE_CALL)?
            .execute(params![time, key.thread_id, key.parent_id, key.child_id])?;
        if rows == 0 {
            self.ensure_absent(
                CALL_EXISTS,
                params![key.thread_id, key.parent_id, key.child_id],
                "Calls",
            )?;
        }
        Ok(rows)
    }

    fn insert_call(&mut self, key: &CallKey, time: i64) -> Result<(), StoreError> {
        let mut stmt = self.conn.prepare_cached(INSERT_CALL)?;
        stmt.execute(params![time, key.thread_id, key.parent_id, key.child_id])?;
        Ok(())
    }

    fn update_sample(&mut self, key: &SampleKey, time: i64) -> Result<usize, StoreError> {
        let rows = self
            .conn
            .prepare_cached(UPDATE_SAMPLE)?
            .execute(params![time, key.thread_id, key.function_id])?;
        if rows == 0 {
            self.ensure_absent(
                SAMPLE_EXISTS,
                params![key.thread_id, key.function_id],
                "Samples",
            )?;
        }
        Ok(rows)
    }

    fn insert_sample(&mut self, key: &SampleKey, time: i64) -> Result<(), StoreError> {
        let mut stmt = self.conn.prepare_cached(INSERT_SAMPLE)?;
        stmt.execute(params![time, key.thread_id, key.function_id])?;
        Ok(())
    }

    fn update_allocation(
        &mut self,
        key: &AllocKey,
        data: &AllocData,
    ) -> Result<usize, StoreError> {
        let rows = self
            .conn
            .prepare_cached(UPDATE_ALLOCATION)?
            .execute(params![data.count, data.size, key.class_id, key.function_id])?;
        if rows == 0 {
            self.ensure_absent(
                ALLOCATION_EXISTS,
                params![key.class_id, key.function_id],
                "Allocations",
            )?;
        }
        Ok(rows)
    }

    fn insert_allocation(&mut self, key: &AllocKey, data: &AllocData) -> Result<(), StoreError> {
        let mut stmt = self.conn.prepare_cached(INSERT_ALLOCATION)?;
        stmt.execute(params![data.count, data.size, key.class_id, key.function_id])?;
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "SQLite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_update_reports_zero_rows_for_new_identity() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let key = CallKey::new(1, 2, 3);

        assert_eq!(store.update_call(&key, 10).unwrap(), 0);
        store.insert_call(&key, 10).unwrap();
        assert_eq!(store.update_call(&key, 5).unwrap(), 1);

        let rows = store.call_rows(0).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].time, 15);
        assert_eq!(rows[0].snapshot_id, 0);
    }

    #[test]
    fn test_update_ignores_snapshotted_rows() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store
            .connection()
            .execute(
                "INSERT INTO Samples (ThreadId, FunctionId, SnapshotId, Time) VALUES (1, 42, 3, 500)",
                [],
            )
            .unwrap();

        assert_eq!(store.update_sample(&SampleKey::new(1, 42), 10).unwrap(), 0);
        assert_eq!(store.sample_rows(3).unwrap()[0].time, 500);
    }

    #[test]
    fn test_allocation_update_adds_both_columns() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let key = AllocKey::new(7, 3);
        store.insert_allocation(&key, &AllocData::new(2, 64)).unwrap();
        assert_eq!(store.update_allocation(&key, &AllocData::new(1, 32)).unwrap(), 1);

        let rows = store.allocation_rows().unwrap();
        assert_eq!(
            rows,
            vec![AllocationRow {
                class_id: 7,
                function_id: 3,
                count: 3,
                size: 96
            }]
        );
    }

    #[test]
    fn test_update_refuses_to_overflow_counter() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let key = SampleKey::new(1, 42);
        store.insert_sample(&key, i64::MAX - 5).unwrap();

        let err = store.update_sample(&key, 10).unwrap_err();
        assert!(matches!(err, StoreError::CounterOverflow { table: "Samples" }));

        let (kind, time): (String, i64) = store
            .connection()
            .query_row(
                "SELECT typeof(Time), Time FROM Samples WHERE ThreadId = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(kind, "integer");
        assert_eq!(time, i64::MAX - 5);

        // Exactly reaching the limit is still allowed
        assert_eq!(store.update_sample(&key, 5).unwrap(), 1);
        assert_eq!(store.sample_rows(0).unwrap()[0].time, i64::MAX);
    }

    #[test]
    fn test_call_and_allocation_overflow_detected() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let call = CallKey::new(1, 2, 3);
        store.insert_call(&call, i64::MAX).unwrap();
        assert!(matches!(
            store.update_call(&call, 1),
            Err(StoreError::CounterOverflow { table: "Calls" })
        ));

        let alloc = AllocKey::new(7, 3);
        store
            .insert_allocation(&alloc, &AllocData::new(1, i64::MAX - 1))
            .unwrap();
        assert!(matches!(
            store.update_allocation(&alloc, &AllocData::new(1, 2)),
            Err(StoreError::CounterOverflow {
                table: "Allocations"
            })
        ));
        assert_eq!(store.allocation_rows().unwrap()[0].count, 1);
    }

    #[test]
    fn test_rollback_discards_writes() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.begin().unwrap();
        assert!(store.in_transaction());
        store.insert_sample(&SampleKey::new(1, 1), 9).unwrap();
        store.rollback().unwrap();

        assert!(!store.in_transaction());
        assert!(store.sample_rows(0).unwrap().is_empty());
    }

    #[test]
    fn test_transaction_misuse_is_reported() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        assert!(matches!(store.commit(), Err(StoreError::NoTransaction)));
        store.begin().unwrap();
        assert!(matches!(store.begin(), Err(StoreError::TransactionActive)));
        store.commit().unwrap();
        // Nothing left to roll back
        store.rollback().unwrap();
    }

    #[test]
    fn test_open_existing_requires_file() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("missing.sqlite");

        let result = SqliteStore::open(&db_path, false);
        assert!(matches!(result, Err(StoreError::MissingDatabase(_))));
    }

    #[test]
    fn test_create_new_replaces_existing_file() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("session.sqlite");

        {
            let mut store = SqliteStore::open(&db_path, true).unwrap();
            store.insert_sample(&SampleKey::new(1, 1), 5).unwrap();
        }

        let reopened = SqliteStore::open(&db_path, false).unwrap();
        assert_eq!(reopened.sample_rows(0).unwrap().len(), 1);
        drop(reopened);

        let fresh = SqliteStore::open(&db_path, true).unwrap();
        assert!(fresh.sample_rows(0).unwrap().is_empty());
    }

    #[test]
    fn test_session_pragmas_applied() {
        let store = SqliteStore::open_in_memory().unwrap();
        let journal_mode: String = store
            .connection()
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(journal_mode.to_lowercase(), "memory");

        let synchronous: i64 = store
            .connection()
            .query_row("PRAGMA synchronous", [], |row| row.get(0))
            .unwrap();
        assert_eq!(synchronous, 0);
    }
}
