//! Typed view over the engine's own keys in the state store.
//!
//! The engine persists exactly one scalar per partition: the position of
//! the last record whose effects are fully committed. It is written only
//! inside the same transaction as those effects, which is what makes
//! recovery exact.

use crate::log::UNSET_POSITION;

use super::errors::{StateError, StateResult};
use super::store::{StateStore, StateTransaction};

/// Typed accessor for per-partition engine state.
#[derive(Debug, Clone, Copy)]
pub struct EngineState {
    partition_id: u32,
}

impl EngineState {
    pub fn new(partition_id: u32) -> Self {
        Self { partition_id }
    }

    pub fn partition_id(&self) -> u32 {
        self.partition_id
    }

    fn position_key(&self) -> Vec<u8> {
        format!("tidemill/{}/last_processed_position", self.partition_id).into_bytes()
    }

    /// Read the persisted last-processed position, `UNSET_POSITION` when
    /// the partition has never processed a record.
    pub fn last_processed_position(&self, store: &dyn StateStore) -> StateResult<i64> {
        match store.get(&self.position_key())? {
            Some(raw) => decode_position(&raw),
            None => Ok(UNSET_POSITION),
        }
    }

    /// Stage the last-processed position into an open transaction.
    pub fn put_last_processed_position(
        &self,
        txn: &mut dyn StateTransaction,
        position: i64,
    ) -> StateResult<()> {
        txn.put(&self.position_key(), &position.to_le_bytes())
    }
}

fn decode_position(raw: &[u8]) -> StateResult<i64> {
    let bytes: [u8; 8] = raw.try_into().map_err(|_| {
        StateError::read_failed(format!(
            "stored position has invalid length {}",
            raw.len()
        ))
    })?;
    Ok(i64::from_le_bytes(bytes))
}
