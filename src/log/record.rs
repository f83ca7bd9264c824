//! Record types and wire format for the partition log.
//!
//! Every record on the log carries its assigned position, the position of
//! the source event that caused it to be written, and an opaque payload.
//! A record whose `source_position` equals its own `position` is a command
//! (an externally injected source event); anything else is a follow-up
//! emitted by a handler.
//!
//! Wire format (little-endian):
//! - Record Length (u32), total length including this field and the checksum
//! - Position (i64)
//! - Source Position (i64)
//! - Key (i64)
//! - Value Type (u16)
//! - Intent (u8)
//! - Timestamp millis (i64)
//! - Payload Length (u32) + Payload
//! - Checksum (u32, CRC32 over everything before it)

use std::io;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Sentinel for "no position".
pub const UNSET_POSITION: i64 = -1;

/// Opaque discriminant for the kind of value a record carries.
///
/// The engine never interprets value types; they key the handler registry
/// and the decoded-value cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValueType(pub u16);

/// Opaque discriminant for what a record asks for or reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Intent(pub u8);

/// One record as stored on the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Position assigned by the log. Strictly ascending within a partition.
    pub position: i64,
    /// Position of the record that caused this one to be written.
    /// Equal to `position` for commands.
    pub source_position: i64,
    /// Application-level entity key.
    pub key: i64,
    /// Value type discriminant.
    pub value_type: ValueType,
    /// Intent discriminant.
    pub intent: Intent,
    /// Wall-clock time the record was appended.
    pub timestamp: DateTime<Utc>,
    /// Opaque record body.
    pub payload: Vec<u8>,
}

impl Record {
    /// Returns true if this record is a command (a source event).
    pub fn is_command(&self) -> bool {
        self.position == self.source_position
    }

    /// Serialize the record body (everything between the length prefix and
    /// the checksum). The checksum is computed over the length field plus
    /// this body.
    fn serialize_body(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 * 4 + 2 + 1 + 4 + self.payload.len());
        buf.extend_from_slice(&self.position.to_le_bytes());
        buf.extend_from_slice(&self.source_position.to_le_bytes());
        buf.extend_from_slice(&self.key.to_le_bytes());
        buf.extend_from_slice(&self.value_type.0.to_le_bytes());
        buf.push(self.intent.0);
        buf.extend_from_slice(&self.timestamp.timestamp_millis().to_le_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Serialize the complete record, length-prefixed and checksummed.
    pub fn serialize(&self) -> Vec<u8> {
        let body = self.serialize_body();
        let record_length = (4 + body.len() + 4) as u32;

        let mut checksum_data = Vec::with_capacity(4 + body.len());
        checksum_data.extend_from_slice(&record_length.to_le_bytes());
        checksum_data.extend_from_slice(&body);
        let checksum = crc32fast::hash(&checksum_data);

        let mut out = Vec::with_capacity(record_length as usize);
        out.extend_from_slice(&record_length.to_le_bytes());
        out.extend_from_slice(&body);
        out.extend_from_slice(&checksum.to_le_bytes());
        out
    }

    /// Deserialize one record from the front of `data`, verifying the
    /// checksum.
    ///
    /// Returns the record and the number of bytes consumed.
    ///
    /// # Errors
    ///
    /// Returns an `io::Error` on truncation, checksum mismatch, or a
    /// malformed field. Callers treat any of these as log corruption.
    pub fn deserialize(data: &[u8]) -> io::Result<(Self, usize)> {
        // length + position + source + key + value_type + intent + timestamp
        // + payload_len + checksum
        const MIN_RECORD_SIZE: usize = 4 + 8 + 8 + 8 + 2 + 1 + 8 + 4 + 4;

        if data.len() < MIN_RECORD_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "record too short",
            ));
        }

        let record_length = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if record_length < MIN_RECORD_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid record length: {}", record_length),
            ));
        }
        if data.len() < record_length {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "record truncated: expected {} bytes, got {}",
                    record_length,
                    data.len()
                ),
            ));
        }

        let checksum_offset = record_length - 4;
        let stored_checksum = u32::from_le_bytes([
            data[checksum_offset],
            data[checksum_offset + 1],
            data[checksum_offset + 2],
            data[checksum_offset + 3],
        ]);
        let computed_checksum = crc32fast::hash(&data[0..checksum_offset]);
        if computed_checksum != stored_checksum {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "checksum mismatch: computed {:08x}, stored {:08x}",
                    computed_checksum, stored_checksum
                ),
            ));
        }

        let mut at = 4;
        let mut read_i64 = |data: &[u8]| -> i64 {
            let v = i64::from_le_bytes([
                data[at],
                data[at + 1],
                data[at + 2],
                data[at + 3],
                data[at + 4],
                data[at + 5],
                data[at + 6],
                data[at + 7],
            ]);
            at += 8;
            v
        };
        let position = read_i64(data);
        let source_position = read_i64(data);
        let key = read_i64(data);

        let value_type = ValueType(u16::from_le_bytes([data[at], data[at + 1]]));
        at += 2;
        let intent = Intent(data[at]);
        at += 1;

        let timestamp_ms = i64::from_le_bytes([
            data[at],
            data[at + 1],
            data[at + 2],
            data[at + 3],
            data[at + 4],
            data[at + 5],
            data[at + 6],
            data[at + 7],
        ]);
        at += 8;
        let timestamp = Utc
            .timestamp_millis_opt(timestamp_ms)
            .single()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("invalid record timestamp: {}", timestamp_ms),
                )
            })?;

        let payload_len =
            u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]) as usize;
        at += 4;
        if at + payload_len != checksum_offset {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("payload length {} does not match record length", payload_len),
            ));
        }
        let payload = data[at..at + payload_len].to_vec();

        Ok((
            Record {
                position,
                source_position,
                key,
                value_type,
                intent,
                timestamp,
                payload,
            },
            record_length,
        ))
    }
}

/// A follow-up record staged by a handler, before the log has assigned its
/// position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRecord {
    /// Position of the command that produced this record.
    pub source_position: i64,
    pub key: i64,
    pub value_type: ValueType,
    pub intent: Intent,
    pub payload: Vec<u8>,
}

impl PendingRecord {
    /// Approximate on-log size, used to enforce the writer's fragment limit.
    pub fn encoded_len(&self) -> usize {
        // length prefix + fixed header fields + payload + checksum
        4 + 8 + 8 + 8 + 2 + 1 + 8 + 4 + self.payload.len() + 4
    }

    /// Materialize this record at a log-assigned position.
    pub fn into_record(self, position: i64, timestamp: DateTime<Utc>) -> Record {
        Record {
            position,
            source_position: self.source_position,
            key: self.key,
            value_type: self.value_type,
            intent: self.intent,
            timestamp,
            payload: self.payload,
        }
    }
}

/// An all-or-nothing unit of follow-up appends.
#[derive(Debug, Default)]
pub struct RecordBatch {
    records: Vec<PendingRecord>,
    byte_size: usize,
}

impl RecordBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record to the batch.
    pub fn push(&mut self, record: PendingRecord) {
        self.byte_size += record.encoded_len();
        self.records.push(record);
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Total encoded size of all staged records.
    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    pub fn records(&self) -> &[PendingRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<PendingRecord> {
        self.records
    }
}
