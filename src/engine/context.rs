//! Shared context for the two engine state machines.
//!
//! Built once during startup, then owned by the processing task. After the
//! engine reports recovered, nothing outside that task may touch it; the
//! fields are crate-private and every mutation happens between iterations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::log::{LogBatchWriter, LogStream, LogStreamReader};
use crate::metrics::EngineMetrics;
use crate::state::{EngineState, StateStore};

use super::cache::RecordValueCache;
use super::registry::RecordProcessorMap;

/// References shared by replay and steady-state processing.
pub struct ProcessingContext {
    pub(crate) partition_id: u32,
    pub(crate) log: Arc<dyn LogStream>,
    pub(crate) reader: Box<dyn LogStreamReader>,
    pub(crate) writer: Box<dyn LogBatchWriter>,
    pub(crate) max_fragment_size: usize,
    pub(crate) registry: RecordProcessorMap,
    pub(crate) store: Arc<dyn StateStore>,
    pub(crate) state: EngineState,
    pub(crate) cache: RecordValueCache,
    /// True while the engine is allowed to keep running. Cleared by close;
    /// checked before every iteration and after every suspension.
    pub(crate) run: Arc<AtomicBool>,
    pub(crate) metrics: Arc<EngineMetrics>,
}

impl ProcessingContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        partition_id: u32,
        log: Arc<dyn LogStream>,
        reader: Box<dyn LogStreamReader>,
        writer: Box<dyn LogBatchWriter>,
        registry: RecordProcessorMap,
        store: Arc<dyn StateStore>,
        run: Arc<AtomicBool>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        let max_fragment_size = writer.max_fragment_size();
        Self {
            partition_id,
            log,
            reader,
            writer,
            max_fragment_size,
            registry,
            store,
            state: EngineState::new(partition_id),
            cache: RecordValueCache::new(),
            run,
            metrics,
        }
    }

    pub(crate) fn partition_id(&self) -> u32 {
        self.partition_id
    }

    /// The abort condition of both state machines.
    pub(crate) fn is_aborted(&self) -> bool {
        !self.run.load(Ordering::Acquire)
    }
}
