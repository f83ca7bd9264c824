//! In-memory state store.
//!
//! A `BTreeMap` behind a mutex with buffered transactions. Commit applies
//! the write set in one critical section, so readers never observe a
//! half-applied transaction.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::errors::{StateError, StateResult};
use super::store::{StateStore, StateTransaction};

/// In-memory transactional store for one partition.
#[derive(Clone, Default, Debug)]
pub struct MemoryStateStore {
    inner: Arc<StoreInner>,
}

#[derive(Default, Debug)]
struct StoreInner {
    map: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    txn_open: AtomicBool,
    // Remaining injected commit failures, drained one per commit attempt.
    commit_failures: Mutex<u32>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed entries.
    pub fn len(&self) -> usize {
        self.inner.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of committed entries, for assertions.
    pub fn entries(&self) -> BTreeMap<Vec<u8>, Vec<u8>> {
        self.inner.map.lock().clone()
    }

    /// Fail the next `count` commits. Test support for the engine's
    /// infrastructure failure path.
    pub fn inject_commit_failures(&self, count: u32) {
        *self.inner.commit_failures.lock() = count;
    }
}

impl StateStore for MemoryStateStore {
    fn begin(&self) -> StateResult<Box<dyn StateTransaction>> {
        if self.inner.txn_open.swap(true, Ordering::AcqRel) {
            return Err(StateError::txn_conflict(
                "a transaction is already open on this store",
            ));
        }
        Ok(Box::new(MemoryTransaction {
            inner: Arc::clone(&self.inner),
            writes: BTreeMap::new(),
            finished: false,
        }))
    }

    fn get(&self, key: &[u8]) -> StateResult<Option<Vec<u8>>> {
        Ok(self.inner.map.lock().get(key).cloned())
    }
}

#[derive(Debug)]
struct MemoryTransaction {
    inner: Arc<StoreInner>,
    // Staged writes; `None` marks a staged deletion.
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    finished: bool,
}

impl StateTransaction for MemoryTransaction {
    fn get(&self, key: &[u8]) -> StateResult<Option<Vec<u8>>> {
        if let Some(staged) = self.writes.get(key) {
            return Ok(staged.clone());
        }
        Ok(self.inner.map.lock().get(key).cloned())
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> StateResult<()> {
        self.writes.insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> StateResult<()> {
        self.writes.insert(key.to_vec(), None);
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> StateResult<()> {
        {
            let mut failures = self.inner.commit_failures.lock();
            if *failures > 0 {
                *failures -= 1;
                // The slot is released on drop.
                return Err(StateError::txn_failed("injected commit failure"));
            }
        }
        let mut map = self.inner.map.lock();
        for (key, value) in std::mem::take(&mut self.writes) {
            match value {
                Some(value) => {
                    map.insert(key, value);
                }
                None => {
                    map.remove(&key);
                }
            }
        }
        drop(map);
        self.finished = true;
        self.inner.txn_open.store(false, Ordering::Release);
        Ok(())
    }

    fn rollback(self: Box<Self>) {
        // Drop discards the write set and releases the transaction slot.
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.inner.txn_open.store(false, Ordering::Release);
        }
    }
}
