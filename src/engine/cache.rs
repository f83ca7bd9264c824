//! Pooled decoded-value containers.
//!
//! Steady-state processing decodes one record per iteration; the pool keeps
//! one reusable container per value type so the hot path does not allocate
//! per record. Containers are only valid until the next `load` for the same
//! value type and must not be held across a suspension point.

use std::collections::HashMap;

use crate::log::ValueType;

/// Reusable container for one record's decoded value.
#[derive(Debug, Default)]
pub struct DecodedValue {
    bytes: Vec<u8>,
}

impl DecodedValue {
    /// Replace the contents with `payload`, reusing the allocation.
    pub fn load(&mut self, payload: &[u8]) {
        self.bytes.clear();
        self.bytes.extend_from_slice(payload);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Parse the contents as JSON. Handlers working with structured
    /// payloads use this; binary payloads stay on `as_bytes`.
    pub fn as_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_slice(&self.bytes)
    }
}

/// Pool of decoded-value containers, keyed by value type.
#[derive(Debug, Default)]
pub struct RecordValueCache {
    pool: HashMap<ValueType, DecodedValue>,
}

impl RecordValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the container for `value_type`, creating it on first use.
    pub fn get(&mut self, value_type: ValueType) -> &mut DecodedValue {
        self.pool.entry(value_type).or_default()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.pool.len()
    }
}
