//! In-memory log for embedding and tests.
//!
//! Appends are assigned dense positions starting at 1 and commit
//! immediately; every append advances the committed position and notifies
//! subscribers. Readers share the backing store and observe records in
//! append order.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;

use super::errors::{LogError, LogResult};
use super::record::{Intent, PendingRecord, Record, RecordBatch, ValueType, UNSET_POSITION};
use super::stream::{LogBatchWriter, LogStream, LogStreamReader};

const DEFAULT_MAX_FRAGMENT_SIZE: usize = 4 * 1024 * 1024;

/// Append-only in-memory log for one partition.
#[derive(Clone)]
pub struct MemoryLog {
    inner: Arc<MemoryLogInner>,
}

struct MemoryLogInner {
    partition_id: u32,
    max_fragment_size: usize,
    state: Mutex<MemoryLogState>,
    commit_tx: watch::Sender<i64>,
}

struct MemoryLogState {
    records: Vec<Record>,
    next_position: i64,
    // Remaining injected append failures, drained one per append attempt.
    failures_left: u32,
}

impl MemoryLog {
    pub fn new(partition_id: u32) -> Self {
        Self::with_max_fragment_size(partition_id, DEFAULT_MAX_FRAGMENT_SIZE)
    }

    pub fn with_max_fragment_size(partition_id: u32, max_fragment_size: usize) -> Self {
        let (commit_tx, _) = watch::channel(UNSET_POSITION);
        Self {
            inner: Arc::new(MemoryLogInner {
                partition_id,
                max_fragment_size,
                state: Mutex::new(MemoryLogState {
                    records: Vec::new(),
                    next_position: 1,
                    failures_left: 0,
                }),
                commit_tx,
            }),
        }
    }

    /// Append an externally injected command. The record's source position
    /// equals its own assigned position.
    pub fn append_command(
        &self,
        key: i64,
        value_type: ValueType,
        intent: Intent,
        payload: impl Into<Vec<u8>>,
    ) -> LogResult<i64> {
        let mut state = self.inner.state.lock();
        let position = state.next_position;
        state.next_position += 1;
        state.records.push(Record {
            position,
            source_position: position,
            key,
            value_type,
            intent,
            timestamp: Utc::now(),
            payload: payload.into(),
        });
        drop(state);
        let _ = self.inner.commit_tx.send(position);
        Ok(position)
    }

    /// Append a batch of staged records, assigning positions in order.
    /// Returns the highest assigned position.
    pub fn append_batch(&self, batch: RecordBatch) -> LogResult<i64> {
        if batch.is_empty() {
            return Ok(UNSET_POSITION);
        }
        let mut state = self.inner.state.lock();
        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(LogError::append_failed(
                "injected append failure",
                std::io::Error::new(std::io::ErrorKind::Other, "injected"),
            ));
        }
        let now = Utc::now();
        let mut highest = UNSET_POSITION;
        for pending in batch.into_records() {
            let position = state.next_position;
            state.next_position += 1;
            state.records.push(pending.into_record(position, now));
            highest = position;
        }
        drop(state);
        let _ = self.inner.commit_tx.send(highest);
        Ok(highest)
    }

    /// Append one already-positioned follow-up. Test support for building
    /// pre-crash log contents; the position must continue the sequence.
    pub fn append_follow_up(
        &self,
        source_position: i64,
        key: i64,
        value_type: ValueType,
        intent: Intent,
        payload: impl Into<Vec<u8>>,
    ) -> LogResult<i64> {
        let mut batch = RecordBatch::new();
        batch.push(PendingRecord {
            source_position,
            key,
            value_type,
            intent,
            payload: payload.into(),
        });
        self.append_batch(batch)
    }

    /// Fail the next `count` batch appends with a retryable error. Test
    /// support for the engine's backoff path.
    pub fn inject_append_failures(&self, count: u32) {
        self.inner.state.lock().failures_left = count;
    }

    /// Snapshot of all records, in position order.
    pub fn records(&self) -> Vec<Record> {
        self.inner.state.lock().records.clone()
    }

    /// Number of records on the log.
    pub fn len(&self) -> usize {
        self.inner.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl LogStream for MemoryLog {
    fn partition_id(&self) -> u32 {
        self.inner.partition_id
    }

    async fn new_reader(&self) -> LogResult<Box<dyn LogStreamReader>> {
        Ok(Box::new(MemoryLogReader {
            inner: Arc::clone(&self.inner),
            index: 0,
        }))
    }

    async fn new_batch_writer(&self) -> LogResult<Box<dyn LogBatchWriter>> {
        Ok(Box::new(MemoryLogBatchWriter {
            log: self.clone(),
        }))
    }

    fn commit_position(&self) -> i64 {
        *self.inner.commit_tx.borrow()
    }

    fn commit_updates(&self) -> watch::Receiver<i64> {
        self.inner.commit_tx.subscribe()
    }
}

struct MemoryLogReader {
    inner: Arc<MemoryLogInner>,
    index: usize,
}

impl LogStreamReader for MemoryLogReader {
    fn has_next(&mut self) -> bool {
        self.index < self.inner.state.lock().records.len()
    }

    fn next(&mut self) -> Option<LogResult<Record>> {
        let state = self.inner.state.lock();
        let record = state.records.get(self.index)?.clone();
        drop(state);
        self.index += 1;
        Some(Ok(record))
    }

    fn seek_to_next_event(&mut self, position: i64) -> bool {
        if position == UNSET_POSITION {
            self.index = 0;
            return true;
        }
        let state = self.inner.state.lock();
        match state.records.binary_search_by_key(&position, |r| r.position) {
            Ok(at) => {
                self.index = at + 1;
                true
            }
            Err(at) => {
                self.index = at;
                false
            }
        }
    }
}

struct MemoryLogBatchWriter {
    log: MemoryLog,
}

#[async_trait]
impl LogBatchWriter for MemoryLogBatchWriter {
    fn max_fragment_size(&self) -> usize {
        self.log.inner.max_fragment_size
    }

    async fn append(&mut self, batch: RecordBatch) -> LogResult<i64> {
        self.log.append_batch(batch)
    }
}
