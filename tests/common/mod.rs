//! Shared helpers for integration tests

#![allow(dead_code)]

use proftally::engine::{AllocData, AllocKey, CallKey, ProfileStore, SampleKey, SqliteStore, StoreError};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};

/// A store operation as observed by `RecordingStore`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Begin,
    Commit,
    Rollback,
    UpdateCall(CallKey, usize),
    InsertCall(CallKey),
    UpdateSample(SampleKey, usize),
    InsertSample(SampleKey),
    UpdateAllocation(AllocKey, usize),
    InsertAllocation(AllocKey),
}

/// Delegates to an in-memory SQLite store while logging every operation.
///
/// `fail_commit` makes the next commit fail; `stall` parks the first update
/// until the test releases it; `panic_on_update` panics in the next call or
/// sample update.
pub struct RecordingStore {
    pub inner: SqliteStore,
    pub ops: Arc<Mutex<Vec<Op>>>,
    pub fail_commit: bool,
    pub stall: Option<(Sender<()>, Receiver<()>)>,
    pub panic_on_update: bool,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self {
            inner: SqliteStore::open_in_memory().unwrap(),
            ops: Arc::new(Mutex::new(Vec::new())),
            fail_commit: false,
            stall: None,
            panic_on_update: false,
        }
    }

    fn log(&self, op: Op) {
        self.ops.lock().unwrap().push(op);
    }

    fn before_update(&mut self) {
        if self.panic_on_update {
            self.panic_on_update = false;
            panic!("store update blew up");
        }
        if let Some((entered, release)) = self.stall.take() {
            entered.send(()).unwrap();
            release.recv().unwrap();
        }
    }
}

pub fn take_ops(ops: &Arc<Mutex<Vec<Op>>>) -> Vec<Op> {
    std::mem::take(&mut *ops.lock().unwrap())
}

impl ProfileStore for RecordingStore {
    fn begin(&mut self) -> Result<(), StoreError> {
        self.log(Op::Begin);
        self.inner.begin()
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.log(Op::Commit);
        if self.fail_commit {
            self.fail_commit = false;
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk went away",
            )));
        }
        self.inner.commit()
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        self.log(Op::Rollback);
        self.inner.rollback()
    }

    fn update_call(&mut self, key: &CallKey, time: i64) -> Result<usize, StoreError> {
        self.before_update();
        let rows = self.inner.update_call(key, time)?;
        self.log(Op::UpdateCall(*key, rows));
        Ok(rows)
    }

    fn insert_call(&mut self, key: &CallKey, time: i64) -> Result<(), StoreError> {
        self.inner.insert_call(key, time)?;
        self.log(Op::InsertCall(*key));
        Ok(())
    }

    fn update_sample(&mut self, key: &SampleKey, time: i64) -> Result<usize, StoreError> {
        self.before_update();
        let rows = self.inner.update_sample(key, time)?;
        self.log(Op::UpdateSample(*key, rows));
        Ok(rows)
    }

    fn insert_sample(&mut self, key: &SampleKey, time: i64) -> Result<(), StoreError> {
        self.inner.insert_sample(key, time)?;
        self.log(Op::InsertSample(*key));
        Ok(())
    }

    fn update_allocation(&mut self, key: &AllocKey, data: &AllocData) -> Result<usize, StoreError> {
        let rows = self.inner.update_allocation(key, data)?;
        self.log(Op::UpdateAllocation(*key, rows));
        Ok(rows)
    }

    fn insert_allocation(&mut self, key: &AllocKey, data: &AllocData) -> Result<(), StoreError> {
        self.inner.insert_allocation(key, data)?;
        self.log(Op::InsertAllocation(*key));
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "recording"
    }
}
