//! File-backed log segment.
//!
//! One append-only file per partition. Every append is fsynced before it is
//! acknowledged and before the committed position advances; a record that
//! was never acknowledged may be torn, which reads detect via checksum and
//! length validation.
//!
//! Corruption policy is strict: the first invalid record halts the reader.
//! No skipping, no repair.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;

use super::errors::{LogError, LogResult};
use super::record::{Intent, Record, RecordBatch, ValueType, UNSET_POSITION};
use super::stream::{LogBatchWriter, LogStream, LogStreamReader};

const DEFAULT_MAX_FRAGMENT_SIZE: usize = 4 * 1024 * 1024;

/// Durable single-partition log backed by one append-only file.
#[derive(Clone, Debug)]
pub struct FileLog {
    inner: Arc<FileLogInner>,
}

#[derive(Debug)]
struct FileLogInner {
    partition_id: u32,
    path: PathBuf,
    max_fragment_size: usize,
    writer: Mutex<WriterState>,
    /// Committed byte length, readable without the writer lock.
    committed_len: AtomicU64,
    commit_tx: watch::Sender<i64>,
}

#[derive(Debug)]
struct WriterState {
    file: File,
    next_position: i64,
    len: u64,
}

impl FileLog {
    /// Open or create the log file at `<data_dir>/log/partition-<id>.log`.
    ///
    /// Existing content is scanned and validated in full; the next position
    /// continues after the highest stored record.
    ///
    /// # Errors
    ///
    /// Fails with `TIDE_LOG_CORRUPTION` if any stored record is invalid and
    /// with `TIDE_LOG_APPEND_FAILED` if the file cannot be created.
    pub fn open(data_dir: &Path, partition_id: u32) -> LogResult<Self> {
        let log_dir = data_dir.join("log");
        if !log_dir.exists() {
            fs::create_dir_all(&log_dir).map_err(|e| {
                LogError::append_failed(
                    format!("failed to create log directory: {}", log_dir.display()),
                    e,
                )
            })?;
        }
        let path = log_dir.join(format!("partition-{}.log", partition_id));

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| {
                LogError::append_failed(
                    format!("failed to open log file: {}", path.display()),
                    e,
                )
            })?;

        let (len, last_position) = scan_existing(&path)?;

        let (commit_tx, _) = watch::channel(last_position);
        Ok(Self {
            inner: Arc::new(FileLogInner {
                partition_id,
                path,
                max_fragment_size: DEFAULT_MAX_FRAGMENT_SIZE,
                writer: Mutex::new(WriterState {
                    file,
                    next_position: if last_position == UNSET_POSITION {
                        1
                    } else {
                        last_position + 1
                    },
                    len,
                }),
                committed_len: AtomicU64::new(len),
                commit_tx,
            }),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Append an externally injected command and fsync it.
    pub fn append_command(
        &self,
        key: i64,
        value_type: ValueType,
        intent: Intent,
        payload: impl Into<Vec<u8>>,
    ) -> LogResult<i64> {
        let mut state = self.inner.writer.lock();
        let position = state.next_position;
        let record = Record {
            position,
            source_position: position,
            key,
            value_type,
            intent,
            timestamp: Utc::now(),
            payload: payload.into(),
        };
        self.inner.write_records(&mut state, &[record], position)?;
        Ok(position)
    }

    fn append_batch(&self, batch: RecordBatch) -> LogResult<i64> {
        if batch.is_empty() {
            return Ok(UNSET_POSITION);
        }
        let mut state = self.inner.writer.lock();
        let now = Utc::now();
        let mut records = Vec::with_capacity(batch.len());
        let mut highest = UNSET_POSITION;
        let mut position = state.next_position;
        for pending in batch.into_records() {
            records.push(pending.into_record(position, now));
            highest = position;
            position += 1;
        }
        self.inner.write_records(&mut state, &records, highest)?;
        Ok(highest)
    }
}

impl FileLogInner {
    /// Write the serialized records in one buffer, fsync, then publish the
    /// new committed length and position. On a write error the file is
    /// restored to its previous length so partial batches never commit.
    fn write_records(
        &self,
        state: &mut WriterState,
        records: &[Record],
        highest: i64,
    ) -> LogResult<()> {
        let mut buf = Vec::new();
        for record in records {
            buf.extend_from_slice(&record.serialize());
        }

        let old_len = state.len;
        if let Err(e) = state.file.write_all(&buf) {
            let _ = state.file.set_len(old_len);
            return Err(LogError::append_failed(
                format!("failed to append batch ending at position {}", highest),
                e,
            ));
        }

        state.file.sync_all().map_err(|e| {
            LogError::fsync_failed(
                format!("fsync failed after append at position {}", highest),
                e,
            )
        })?;

        state.len = old_len + buf.len() as u64;
        state.next_position = highest + 1;
        self.committed_len.store(state.len, Ordering::Release);
        let _ = self.commit_tx.send(highest);
        Ok(())
    }
}

/// Validate the whole file and return its length and highest position.
fn scan_existing(path: &Path) -> LogResult<(u64, i64)> {
    let file = File::open(path).map_err(|e| {
        LogError::append_failed(format!("failed to open log file: {}", path.display()), e)
    })?;
    let file_len = file
        .metadata()
        .map_err(|e| LogError::append_failed("failed to read log metadata", e))?
        .len();

    let mut cursor = RecordCursor::new(BufReader::new(file), file_len);
    while cursor.read_next()?.is_some() {}
    Ok((cursor.offset, cursor.last_position))
}

/// Low-level sequential record decoder over a file.
struct RecordCursor {
    reader: BufReader<File>,
    offset: u64,
    limit: u64,
    last_position: i64,
}

impl RecordCursor {
    fn new(reader: BufReader<File>, limit: u64) -> Self {
        Self {
            reader,
            offset: 0,
            limit,
            last_position: UNSET_POSITION,
        }
    }

    fn rewind(&mut self) -> LogResult<()> {
        self.reader
            .seek(SeekFrom::Start(0))
            .map_err(|e| LogError::corruption(format!("failed to seek log start: {}", e)))?;
        self.offset = 0;
        self.last_position = UNSET_POSITION;
        Ok(())
    }

    fn seek_back_to(&mut self, offset: u64, last_position: i64) -> LogResult<()> {
        self.reader
            .seek(SeekFrom::Start(offset))
            .map_err(|e| LogError::corruption(format!("failed to seek log offset: {}", e)))?;
        self.offset = offset;
        self.last_position = last_position;
        Ok(())
    }

    fn read_next(&mut self) -> LogResult<Option<Record>> {
        if self.offset >= self.limit {
            return Ok(None);
        }
        let remaining = self.limit - self.offset;
        if remaining < 4 {
            return Err(LogError::corruption_at_offset(
                self.offset,
                format!("truncated log: {} trailing bytes", remaining),
            ));
        }

        let mut len_buf = [0u8; 4];
        self.reader.read_exact(&mut len_buf).map_err(|e| {
            LogError::corruption_at_offset(self.offset, format!("failed to read record length: {}", e))
        })?;
        let record_length = u32::from_le_bytes(len_buf) as u64;
        if record_length > remaining {
            return Err(LogError::corruption_at_offset(
                self.offset,
                format!(
                    "record length {} exceeds remaining {} bytes",
                    record_length, remaining
                ),
            ));
        }
        if record_length < 4 {
            return Err(LogError::corruption_at_offset(
                self.offset,
                format!("invalid record length: {}", record_length),
            ));
        }

        let mut record_buf = vec![0u8; record_length as usize];
        record_buf[..4].copy_from_slice(&len_buf);
        self.reader.read_exact(&mut record_buf[4..]).map_err(|e| {
            LogError::corruption_at_offset(self.offset, format!("failed to read record body: {}", e))
        })?;

        let (record, consumed) = Record::deserialize(&record_buf)
            .map_err(|e| LogError::corruption_at_offset(self.offset, e.to_string()))?;

        if record.position <= self.last_position {
            return Err(LogError::corruption_at_position(
                record.position,
                format!(
                    "non-ascending position: previous {}, read {}",
                    self.last_position, record.position
                ),
            ));
        }

        self.offset += consumed as u64;
        self.last_position = record.position;
        Ok(Some(record))
    }
}

#[async_trait]
impl LogStream for FileLog {
    fn partition_id(&self) -> u32 {
        self.inner.partition_id
    }

    async fn new_reader(&self) -> LogResult<Box<dyn LogStreamReader>> {
        let file = File::open(&self.inner.path).map_err(|e| {
            LogError::append_failed(
                format!("failed to open log file: {}", self.inner.path.display()),
                e,
            )
        })?;
        Ok(Box::new(FileLogReader {
            inner: Arc::clone(&self.inner),
            cursor: RecordCursor::new(BufReader::new(file), 0),
        }))
    }

    async fn new_batch_writer(&self) -> LogResult<Box<dyn LogBatchWriter>> {
        Ok(Box::new(FileLogBatchWriter { log: self.clone() }))
    }

    fn commit_position(&self) -> i64 {
        *self.inner.commit_tx.borrow()
    }

    fn commit_updates(&self) -> watch::Receiver<i64> {
        self.inner.commit_tx.subscribe()
    }
}

struct FileLogReader {
    inner: Arc<FileLogInner>,
    cursor: RecordCursor,
}

impl FileLogReader {
    fn refresh_limit(&mut self) {
        self.cursor.limit = self.inner.committed_len.load(Ordering::Acquire);
    }
}

impl LogStreamReader for FileLogReader {
    fn has_next(&mut self) -> bool {
        self.refresh_limit();
        self.cursor.offset < self.cursor.limit
    }

    fn next(&mut self) -> Option<LogResult<Record>> {
        self.refresh_limit();
        self.cursor.read_next().transpose()
    }

    fn seek_to_next_event(&mut self, position: i64) -> bool {
        self.refresh_limit();
        if self.cursor.rewind().is_err() {
            return false;
        }
        if position == UNSET_POSITION {
            return true;
        }
        loop {
            let before_offset = self.cursor.offset;
            let before_position = self.cursor.last_position;
            match self.cursor.read_next() {
                Ok(Some(record)) => {
                    if record.position == position {
                        return true;
                    }
                    if record.position > position {
                        // Leave the cursor at the overshooting record.
                        let _ = self.cursor.seek_back_to(before_offset, before_position);
                        return false;
                    }
                }
                Ok(None) => return false,
                Err(_) => return false,
            }
        }
    }
}

struct FileLogBatchWriter {
    log: FileLog,
}

#[async_trait]
impl LogBatchWriter for FileLogBatchWriter {
    fn max_fragment_size(&self) -> usize {
        self.log.inner.max_fragment_size
    }

    async fn append(&mut self, batch: RecordBatch) -> LogResult<i64> {
        self.log.append_batch(batch)
    }
}
