//! Partition log subsystem.
//!
//! The log is an append-only, totally ordered sequence of records with a
//! committed position that only moves forward. The engine consumes it
//! through three seams: a stream handle, a sequential reader, and an
//! all-or-nothing batch writer.
//!
//! Two implementations ship with the crate:
//! - [`MemoryLog`], for embedding and tests
//! - [`FileLog`], a durable fsync-on-append segment file
//!
//! # Invariants Enforced
//!
//! - Positions are strictly ascending within a partition
//! - A batch is visible entirely or not at all
//! - Readers never observe records beyond the committed position
//! - Corruption halts the reader; nothing is skipped or repaired

mod errors;
mod file;
mod memory;
mod record;
mod stream;

pub use errors::{LogError, LogErrorCode, LogResult, Severity};
pub use file::FileLog;
pub use memory::MemoryLog;
pub use record::{Intent, PendingRecord, Record, RecordBatch, ValueType, UNSET_POSITION};
pub use stream::{LogBatchWriter, LogStream, LogStreamReader};
