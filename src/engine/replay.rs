//! Recovery by replay.
//!
//! Brings the store forward from the snapshot boundary to the last position
//! that was written before a crash, without emitting any new log records.
//! Two passes over the log, both linear:
//!
//! 1. Scan forward from the boundary and collect the replay target: the
//!    highest source position carried by any follow-up record. Follow-ups
//!    are the only durable evidence that their command finished its append
//!    step before the crash; a command without follow-ups on the log is
//!    reprocessed from scratch in steady state, which is safe because its
//!    store transaction never committed. The scan also seeds the
//!    last-written position from the highest follow-up position seen.
//! 2. Seek back to the boundary and reapply every command up to the
//!    target in replay mode. Follow-ups are consumed without effect; a
//!    follow-up whose command lies at or before the boundary is already
//!    acknowledged and is skipped the same way.
//!
//! Commands past the target were appended after the crash and are left for
//! steady-state processing.

use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::{debug, info};

use crate::log::{Record, UNSET_POSITION};

use super::context::ProcessingContext;
use super::errors::{EngineError, EngineResult};
use super::registry::{FollowUpWriter, TypedRecord};

/// One-shot recovery state machine.
pub(crate) struct ReprocessingStateMachine {
    snapshot_position: i64,
}

/// How a recovery run ended.
#[derive(Debug)]
pub(crate) enum ReplayResult {
    Completed(ReplayOutcome),
    /// The engine was closed mid-recovery.
    Aborted,
}

/// Statistics and resume positions from a completed recovery.
#[derive(Debug, Clone, Default)]
pub(crate) struct ReplayOutcome {
    /// Highest source position carried by a follow-up (the replay target).
    pub(crate) replay_target: i64,
    /// Last position whose effects are committed after replay.
    pub(crate) last_processed: i64,
    /// Highest follow-up position observed on the log.
    pub(crate) last_written: i64,
    /// Commands reapplied through a handler.
    pub(crate) commands_replayed: u64,
    /// Commands consumed without a registered handler.
    pub(crate) commands_skipped: u64,
    /// Records seen during the scan pass.
    pub(crate) records_seen: u64,
}

impl ReprocessingStateMachine {
    pub(crate) fn new(snapshot_position: i64) -> Self {
        Self { snapshot_position }
    }

    /// Run recovery to completion.
    ///
    /// # Errors
    ///
    /// Fails with `TIDE_ENGINE_RECOVERY_FAILED` when the snapshot position
    /// is absent from the log, the log is corrupt, or a handler fails while
    /// reapplying a command.
    pub(crate) async fn run(&mut self, ctx: &mut ProcessingContext) -> EngineResult<ReplayResult> {
        let snapshot = self.snapshot_position;

        if !ctx.reader.seek_to_next_event(snapshot) && snapshot != UNSET_POSITION {
            return Err(EngineError::recovery_failed(format!(
                "cannot recover partition {}: snapshot position {} not found in the log",
                ctx.partition_id(),
                snapshot
            )));
        }

        let mut outcome = ReplayOutcome {
            replay_target: snapshot,
            last_processed: snapshot,
            last_written: snapshot,
            ..ReplayOutcome::default()
        };

        // Scan pass: find the replay target and the log end.
        loop {
            if ctx.is_aborted() {
                return Ok(ReplayResult::Aborted);
            }
            match ctx.reader.next() {
                None => break,
                Some(Err(e)) => {
                    return Err(EngineError::recovery_failed(format!(
                        "log corruption while scanning partition {}",
                        ctx.partition_id()
                    ))
                    .with_source(&e));
                }
                Some(Ok(record)) => {
                    outcome.records_seen += 1;
                    if !record.is_command() {
                        outcome.replay_target =
                            outcome.replay_target.max(record.source_position);
                        outcome.last_written = outcome.last_written.max(record.position);
                    }
                }
            }
        }

        debug!(
            partition_id = ctx.partition_id(),
            snapshot_position = snapshot,
            replay_target = outcome.replay_target,
            records_seen = outcome.records_seen,
            "recovery scan complete"
        );

        // The boundary seek is known to succeed; it succeeded above.
        ctx.reader.seek_to_next_event(snapshot);

        if outcome.replay_target <= snapshot {
            // Nothing to reapply. Trailing follow-ups, if any, are already
            // acknowledged; steady state consumes them without effect.
            return Ok(ReplayResult::Completed(outcome));
        }

        // Replay pass.
        let mut consumed = snapshot;
        loop {
            if ctx.is_aborted() {
                return Ok(ReplayResult::Aborted);
            }
            let record = match ctx.reader.next() {
                None => break,
                Some(Err(e)) => {
                    return Err(EngineError::recovery_failed(format!(
                        "log corruption while replaying partition {}",
                        ctx.partition_id()
                    ))
                    .with_source(&e));
                }
                Some(Ok(record)) => record,
            };

            if record.is_command() && record.position > outcome.replay_target {
                // Appended after the crash; steady state owns it. Put the
                // cursor back so it is read again.
                ctx.reader.seek_to_next_event(consumed);
                break;
            }
            consumed = record.position;

            if record.is_command() {
                self.replay_command(ctx, &record, &mut outcome)?;
                outcome.last_processed = record.position;
            }
        }

        info!(
            partition_id = ctx.partition_id(),
            replay_target = outcome.replay_target,
            commands_replayed = outcome.commands_replayed,
            commands_skipped = outcome.commands_skipped,
            "recovery replay complete"
        );

        Ok(ReplayResult::Completed(outcome))
    }

    /// Reapply one command's store effects and commit its position.
    fn replay_command(
        &mut self,
        ctx: &mut ProcessingContext,
        record: &Record,
        outcome: &mut ReplayOutcome,
    ) -> EngineResult<()> {
        let mut txn = ctx.store.begin().map_err(|e| {
            EngineError::recovery_failed("failed to open store transaction").with_source(&e)
        })?;

        match ctx.registry.get_mut(record.value_type, record.intent) {
            None => {
                outcome.commands_skipped += 1;
            }
            Some(handler) => {
                let value = ctx.cache.get(record.value_type);
                value.load(&record.payload);
                let typed = TypedRecord::new(record, value);
                let mut writer =
                    FollowUpWriter::replay(record.position, ctx.max_fragment_size);

                let result = catch_unwind(AssertUnwindSafe(|| {
                    handler.process(&typed, &mut writer, txn.as_mut())
                }));
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        txn.rollback();
                        return Err(EngineError::recovery_failed(format!(
                            "handler failed while replaying position {}",
                            record.position
                        ))
                        .with_source(&e));
                    }
                    Err(_) => {
                        txn.rollback();
                        return Err(EngineError::recovery_failed(format!(
                            "handler panicked while replaying position {}",
                            record.position
                        )));
                    }
                }
                outcome.commands_replayed += 1;
                ctx.metrics.increment_replayed();
            }
        }

        ctx.state
            .put_last_processed_position(txn.as_mut(), record.position)
            .map_err(|e| {
                EngineError::recovery_failed("failed to stage position").with_source(&e)
            })?;
        txn.commit().map_err(|e| {
            EngineError::recovery_failed("failed to commit replayed state").with_source(&e)
        })?;
        Ok(())
    }
}
