//! Log abstraction consumed by the engine.
//!
//! The engine is the only writer of follow-up records on its partition, but
//! external producers may append commands at any time. Readers observe only
//! records at or below the committed position; commit advances are announced
//! on a watch channel so an idle engine can sleep until new records arrive.

use async_trait::async_trait;
use tokio::sync::watch;

use super::errors::LogResult;
use super::record::{Record, RecordBatch};

/// One partition's append-only record log.
#[async_trait]
pub trait LogStream: Send + Sync {
    /// The partition this log belongs to.
    fn partition_id(&self) -> u32;

    /// Open a new sequential reader positioned at the start of the log.
    async fn new_reader(&self) -> LogResult<Box<dyn LogStreamReader>>;

    /// Open a new batch writer.
    async fn new_batch_writer(&self) -> LogResult<Box<dyn LogBatchWriter>>;

    /// The highest committed position, or `UNSET_POSITION` when empty.
    fn commit_position(&self) -> i64;

    /// Subscribe to committed-position updates. The receiver yields the new
    /// committed position after every advance.
    fn commit_updates(&self) -> watch::Receiver<i64>;
}

/// Sequential cursor over committed records.
///
/// Readers are owned by a single task; none of the methods are re-entrant.
pub trait LogStreamReader: Send {
    /// Returns true when a committed record is available at the cursor.
    fn has_next(&mut self) -> bool;

    /// Read the record at the cursor and advance past it.
    ///
    /// Returns `None` at the end of the committed log. An `Err` indicates
    /// corruption and is fatal.
    fn next(&mut self) -> Option<LogResult<Record>>;

    /// Position the cursor directly after the record at `position`.
    ///
    /// With `UNSET_POSITION` the cursor moves to the start of the log and
    /// the seek succeeds. Otherwise the seek succeeds only if a record with
    /// exactly that position exists; on failure the cursor is left at the
    /// first record beyond `position`.
    fn seek_to_next_event(&mut self, position: i64) -> bool;
}

/// All-or-nothing appender for follow-up record batches.
#[async_trait]
pub trait LogBatchWriter: Send {
    /// Largest batch, in encoded bytes, a single append may carry.
    fn max_fragment_size(&self) -> usize;

    /// Append every record of the batch atomically.
    ///
    /// Returns the highest position assigned, or `UNSET_POSITION` for an
    /// empty batch. On error nothing from the batch is visible to readers.
    async fn append(&mut self, batch: RecordBatch) -> LogResult<i64>;
}
