//! Steady-state processing.
//!
//! One iteration: read a record, dispatch it, let the handler stage
//! follow-ups and store writes, append the batch, then commit the store
//! transaction with the new last-processed position. The append happens
//! before the commit; after a crash in between, recovery finds the
//! follow-ups on the log and reapplies the command without re-emitting
//! them. There is no suspension between append and commit.
//!
//! Transient failures abort the transaction, reposition the reader, and
//! retry the same record after a bounded, jittered backoff. Everything
//! else fails the engine.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use tracing::{debug, warn};

use super::context::ProcessingContext;
use super::errors::{EngineError, EngineResult};
use super::registry::{FollowUpWriter, TypedRecord};
use super::retry::{BackoffState, RetryPolicy};

/// Result of one processing iteration.
#[derive(Debug)]
pub(crate) enum StepOutcome {
    /// A record was consumed; schedule the next iteration immediately.
    Advanced,
    /// The committed log is exhausted; wait for the commit condition.
    NoWork,
    /// A transient failure; retry the same record after the delay.
    Retry(Duration),
}

/// Steady-state processing state machine.
pub(crate) struct ProcessingStateMachine {
    last_processed: i64,
    last_written: i64,
    backoff: BackoffState,
    default_retry: RetryPolicy,
}

impl ProcessingStateMachine {
    pub(crate) fn new(last_processed: i64, last_written: i64, default_retry: RetryPolicy) -> Self {
        Self {
            last_processed,
            last_written,
            backoff: BackoffState::default(),
            default_retry,
        }
    }

    pub(crate) fn last_processed(&self) -> i64 {
        self.last_processed
    }

    pub(crate) fn last_written(&self) -> i64 {
        self.last_written
    }

    /// Run one iteration. At most one record is in flight at any time.
    pub(crate) async fn step(&mut self, ctx: &mut ProcessingContext) -> EngineResult<StepOutcome> {
        if !ctx.reader.has_next() {
            return Ok(StepOutcome::NoWork);
        }
        let record = match ctx.reader.next() {
            None => return Ok(StepOutcome::NoWork),
            Some(Err(e)) => {
                return Err(EngineError::processing_failed(format!(
                    "log corruption on partition {}",
                    ctx.partition_id()
                ))
                .with_source(&e));
            }
            Some(Ok(record)) => record,
        };

        if !record.is_command() {
            // Our own follow-up, or one acknowledged before a restart.
            return Ok(StepOutcome::Advanced);
        }

        let Some(handler) = ctx.registry.get_mut(record.value_type, record.intent) else {
            // No handler registered: skip, but still persist the position
            // so a restart never revisits a long skip run.
            debug!(
                partition_id = ctx.partition_id,
                position = record.position,
                value_type = record.value_type.0,
                intent = record.intent.0,
                "no handler registered, skipping record"
            );
            let mut txn = ctx.store.begin().map_err(|e| {
                EngineError::processing_failed("failed to open store transaction").with_source(&e)
            })?;
            ctx.state
                .put_last_processed_position(txn.as_mut(), record.position)
                .map_err(|e| {
                    EngineError::processing_failed("failed to stage position").with_source(&e)
                })?;
            txn.commit().map_err(|e| {
                EngineError::processing_failed("failed to commit position").with_source(&e)
            })?;
            self.last_processed = record.position;
            self.backoff.reset();
            ctx.metrics.increment_skipped();
            return Ok(StepOutcome::Advanced);
        };
        let policy = handler.retry_policy().unwrap_or(self.default_retry);

        let mut txn = ctx.store.begin().map_err(|e| {
            EngineError::processing_failed("failed to open store transaction").with_source(&e)
        })?;

        let value = ctx.cache.get(record.value_type);
        value.load(&record.payload);
        let typed = TypedRecord::new(&record, value);
        let mut writer = FollowUpWriter::processing(record.position, ctx.max_fragment_size);

        let result = catch_unwind(AssertUnwindSafe(|| {
            handler.process(&typed, &mut writer, txn.as_mut())
        }));
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_retryable() => {
                txn.rollback();
                return self.retry(ctx, &policy, &e);
            }
            Ok(Err(e)) => {
                txn.rollback();
                return Err(EngineError::processing_failed(format!(
                    "handler failed at position {}",
                    record.position
                ))
                .with_source(&e));
            }
            Err(_) => {
                txn.rollback();
                return Err(EngineError::processing_failed(format!(
                    "handler panicked at position {}",
                    record.position
                )));
            }
        }

        // Append the staged batch before committing the transaction.
        let batch = writer.take_batch();
        let staged = batch.len() as u64;
        if staged > 0 {
            match ctx.writer.append(batch).await {
                Ok(highest) => {
                    self.last_written = self.last_written.max(highest);
                }
                Err(e) if !e.is_fatal() => {
                    txn.rollback();
                    return self.retry(ctx, &policy, &e);
                }
                Err(e) => {
                    txn.rollback();
                    return Err(EngineError::processing_failed(format!(
                        "log append failed at position {}",
                        record.position
                    ))
                    .with_source(&e));
                }
            }
        }

        ctx.state
            .put_last_processed_position(txn.as_mut(), record.position)
            .map_err(|e| {
                EngineError::processing_failed("failed to stage position").with_source(&e)
            })?;
        txn.commit().map_err(|e| {
            EngineError::processing_failed(format!(
                "store commit failed at position {}",
                record.position
            ))
            .with_source(&e)
        })?;

        self.last_processed = record.position;
        self.backoff.reset();
        ctx.metrics.increment_processed();
        ctx.metrics.add_follow_ups_written(staged);
        Ok(StepOutcome::Advanced)
    }

    /// Reposition the reader onto the failed record and compute the next
    /// backoff delay, failing the engine when the budget is spent.
    fn retry(
        &mut self,
        ctx: &mut ProcessingContext,
        policy: &RetryPolicy,
        cause: &dyn std::fmt::Display,
    ) -> EngineResult<StepOutcome> {
        ctx.reader.seek_to_next_event(self.last_processed);
        match self.backoff.next_delay(policy) {
            Some(delay) => {
                warn!(
                    partition_id = ctx.partition_id,
                    attempt = self.backoff.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    cause = %cause,
                    "transient processing failure, retrying"
                );
                ctx.metrics.increment_retries();
                Ok(StepOutcome::Retry(delay))
            }
            None => Err(EngineError::processing_failed(format!(
                "retries exhausted after {} attempts",
                self.backoff.attempts()
            ))
            .with_source(cause)),
        }
    }
}
