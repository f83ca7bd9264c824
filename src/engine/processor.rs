//! Stream processor supervisor.
//!
//! Owns the engine lifecycle: opening wires the collaborators and drives
//! recovery, steady state runs the processing loop, and close, pause,
//! resume, position getters, and health are served from the outside.
//!
//! All mutable engine state lives on one tokio task. External callers hold
//! a [`StreamProcessor`] handle whose async operations enqueue commands on
//! an MPSC channel; the task answers each command through a oneshot
//! between iterations, so callers always observe a consistent snapshot.
//! The handle's `opened` flag doubles as the abort condition: clearing it
//! is the only cross-thread mutation, everything else is message passing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::log::{Intent, LogStream, ValueType, UNSET_POSITION};
use crate::metrics::EngineMetrics;
use crate::state::StateStore;

use super::context::ProcessingContext;
use super::errors::{EngineError, EngineResult};
use super::health::{EnginePhase, FailureListener, HealthShared, HealthStatus};
use super::processing::{ProcessingStateMachine, StepOutcome};
use super::registry::{RecordProcessor, RecordProcessorMap};
use super::replay::{ReplayResult, ReprocessingStateMachine};
use super::retry::RetryPolicy;

enum EngineCommand {
    Pause(oneshot::Sender<()>),
    Resume(oneshot::Sender<()>),
    LastProcessed(oneshot::Sender<i64>),
    LastWritten(oneshot::Sender<i64>),
    Close(oneshot::Sender<()>),
}

/// Builder for one partition's stream processor.
pub struct StreamProcessorBuilder {
    log: Arc<dyn LogStream>,
    store: Arc<dyn StateStore>,
    registry: RecordProcessorMap,
    config: EngineConfig,
    metrics: Arc<EngineMetrics>,
}

impl StreamProcessorBuilder {
    pub fn new(log: Arc<dyn LogStream>, store: Arc<dyn StateStore>) -> Self {
        Self {
            log,
            store,
            registry: RecordProcessorMap::new(),
            config: EngineConfig::default(),
            metrics: Arc::new(EngineMetrics::new()),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a handler for one `(value_type, intent)` pair.
    pub fn with_processor(
        mut self,
        value_type: ValueType,
        intent: Intent,
        processor: Box<dyn RecordProcessor>,
    ) -> Self {
        self.registry.register(value_type, intent, processor);
        self
    }

    /// Replace the whole registry.
    pub fn with_registry(mut self, registry: RecordProcessorMap) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn build(self) -> StreamProcessor {
        let (commands_tx, commands_rx) =
            mpsc::channel(self.config.command_channel_capacity.max(1));
        let health = Arc::new(HealthShared::new(self.config.health_tick_interval()));
        StreamProcessor {
            partition_id: self.log.partition_id(),
            opened: Arc::new(AtomicBool::new(false)),
            commands: commands_tx,
            setup: Mutex::new(Some(EngineSetup {
                log: self.log,
                store: self.store,
                registry: self.registry,
                config: self.config,
                commands_rx,
            })),
            health,
            metrics: self.metrics,
            shared: Arc::new(FailureShared::default()),
            join: tokio::sync::Mutex::new(None),
        }
    }
}

struct EngineSetup {
    log: Arc<dyn LogStream>,
    store: Arc<dyn StateStore>,
    registry: RecordProcessorMap,
    config: EngineConfig,
    commands_rx: mpsc::Receiver<EngineCommand>,
}

#[derive(Default)]
struct FailureShared {
    listeners: Mutex<Vec<Box<dyn FailureListener>>>,
    failure: Mutex<Option<Arc<EngineError>>>,
}

/// Handle to one partition's engine.
///
/// Every async operation completes on the processing task. The handle is
/// cheap to share behind an `Arc`; one instance drives one open/close
/// cycle, and a failed instance is replaced, not reopened.
pub struct StreamProcessor {
    partition_id: u32,
    opened: Arc<AtomicBool>,
    commands: mpsc::Sender<EngineCommand>,
    setup: Mutex<Option<EngineSetup>>,
    health: Arc<HealthShared>,
    metrics: Arc<EngineMetrics>,
    shared: Arc<FailureShared>,
    join: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl StreamProcessor {
    pub fn partition_id(&self) -> u32 {
        self.partition_id
    }

    /// Open the engine: spawn the processing task, run recovery, and start
    /// steady-state processing.
    ///
    /// Completes once recovery finished. On recovery failure the engine
    /// transitions to Failed and this returns the failure.
    ///
    /// # Errors
    ///
    /// `TIDE_ENGINE_ALREADY_OPENED` when called twice,
    /// `TIDE_ENGINE_LIFECYCLE_FAILED` when collaborators cannot be
    /// acquired or the instance was closed before,
    /// `TIDE_ENGINE_RECOVERY_FAILED` when replay fails.
    pub async fn open(&self) -> EngineResult<()> {
        if self
            .opened
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(EngineError::already_opened(self.partition_id));
        }
        let setup = { self.setup.lock().take() };
        let Some(setup) = setup else {
            self.opened.store(false, Ordering::Release);
            return Err(EngineError::lifecycle_failed(
                "a closed stream processor cannot be reopened; build a new instance",
            ));
        };

        let (open_tx, open_rx) = oneshot::channel();
        let engine = Engine {
            partition_id: self.partition_id,
            instance_id: Uuid::new_v4(),
            config: setup.config,
            log: setup.log,
            store: setup.store,
            registry: Some(setup.registry),
            commands: setup.commands_rx,
            run_flag: Arc::clone(&self.opened),
            health: Arc::clone(&self.health),
            metrics: Arc::clone(&self.metrics),
            shared: Arc::clone(&self.shared),
            paused: false,
            failed: false,
        };
        let span = info_span!(
            "stream_processor",
            partition_id = self.partition_id,
            instance_id = %engine.instance_id
        );
        let handle = tokio::spawn(engine.run(open_tx).instrument(span));
        *self.join.lock().await = Some(handle);

        match open_rx.await {
            Ok(result) => result,
            Err(_) => Err(EngineError::lifecycle_failed(
                "engine task ended before recovery completed",
            )),
        }
    }

    /// Close the engine and release its resources. Idempotent; never fails.
    pub async fn close(&self) {
        self.opened.store(false, Ordering::Release);
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .commands
            .send(EngineCommand::Close(reply_tx))
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
        if let Some(handle) = self.join.lock().await.take() {
            let _ = handle.await;
        }
    }

    /// Stop starting new iterations. A record in flight completes first.
    pub async fn pause_processing(&self) -> EngineResult<()> {
        self.ask(EngineCommand::Pause).await
    }

    /// Resume after [`pause_processing`](Self::pause_processing).
    pub async fn resume_processing(&self) -> EngineResult<()> {
        self.ask(EngineCommand::Resume).await
    }

    /// Position of the last record whose effects are fully committed.
    pub async fn last_processed_position(&self) -> EngineResult<i64> {
        self.ask(EngineCommand::LastProcessed).await
    }

    /// Highest position this engine has written to the log.
    pub async fn last_written_position(&self) -> EngineResult<i64> {
        self.ask(EngineCommand::LastWritten).await
    }

    /// Current health, computed from phase, progress, and the tick
    /// watchdog.
    pub fn health_status(&self) -> HealthStatus {
        self.health.status()
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> EnginePhase {
        self.health.phase()
    }

    pub fn metrics(&self) -> Arc<EngineMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Register a failure listener. Invoked exactly once if the engine
    /// fails; a listener added after the failure is invoked immediately.
    pub fn add_failure_listener(&self, listener: Box<dyn FailureListener>) {
        let existing = { self.shared.failure.lock().clone() };
        match existing {
            Some(error) => listener.on_failure(&error),
            None => self.shared.listeners.lock().push(listener),
        }
    }

    async fn ask<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> EngineCommand,
    ) -> EngineResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(make(reply_tx))
            .await
            .map_err(|_| EngineError::closed("engine task is not running"))?;
        reply_rx
            .await
            .map_err(|_| EngineError::closed("engine task stopped before answering"))
    }
}

/// The processing task. Owns every mutable engine structure.
struct Engine {
    partition_id: u32,
    instance_id: Uuid,
    config: EngineConfig,
    log: Arc<dyn LogStream>,
    store: Arc<dyn StateStore>,
    registry: Option<RecordProcessorMap>,
    commands: mpsc::Receiver<EngineCommand>,
    run_flag: Arc<AtomicBool>,
    health: Arc<HealthShared>,
    metrics: Arc<EngineMetrics>,
    shared: Arc<FailureShared>,
    paused: bool,
    failed: bool,
}

impl Engine {
    async fn run(mut self, open_tx: oneshot::Sender<EngineResult<()>>) {
        // Starting hooks: acquire the writer, then the reader.
        let mut ctx = match self.start().await {
            Ok(ctx) => ctx,
            Err(e) => {
                error!(error = %e, "stream processor failed to start");
                self.health.set_phase(EnginePhase::Closed);
                self.run_flag.store(false, Ordering::Release);
                let _ = open_tx.send(Err(e));
                return;
            }
        };

        for handler in ctx.registry.iter_mut() {
            handler.on_open();
        }

        self.health.set_phase(EnginePhase::Reprocessing);
        self.metrics.increment_recovery_runs();
        let recovery_started = Instant::now();

        let replay_result = match ctx.state.last_processed_position(ctx.store.as_ref()) {
            Err(e) => Err(
                EngineError::recovery_failed("failed to read snapshot position").with_source(&e)
            ),
            Ok(snapshot) => {
                info!(snapshot_position = snapshot, "stream processor recovering");
                ReprocessingStateMachine::new(snapshot).run(&mut ctx).await
            }
        };

        let mut init_processed = UNSET_POSITION;
        let mut init_written = UNSET_POSITION;
        match replay_result {
            Ok(ReplayResult::Completed(outcome)) => {
                let duration = recovery_started.elapsed();
                self.metrics.observe_recovery_duration(duration);
                info!(
                    duration_ms = duration.as_millis() as u64,
                    commands_replayed = outcome.commands_replayed,
                    last_processed = outcome.last_processed,
                    last_written = outcome.last_written,
                    "recovery complete"
                );
                init_processed = outcome.last_processed;
                init_written = outcome.last_written;
                self.health.set_phase(EnginePhase::Processing);
                let _ = open_tx.send(Ok(()));
                for handler in ctx.registry.iter_mut() {
                    handler.on_recovered();
                }
            }
            Ok(ReplayResult::Aborted) => {
                info!("stream processor closed during recovery");
                let _ = open_tx.send(Err(EngineError::lifecycle_failed(
                    "closed before recovery completed",
                )));
                self.shutdown(&mut ctx);
                return;
            }
            Err(e) => {
                self.metrics.increment_recovery_failures();
                let err = self.fail(&mut ctx, e);
                let _ = open_tx.send(Err(err));
            }
        }

        let default_retry = RetryPolicy::from_config(&self.config.retry);
        let mut sm = ProcessingStateMachine::new(init_processed, init_written, default_retry);
        let mut commit_rx = ctx.log.commit_updates();

        let tick_interval = self.config.health_tick_interval();
        let mut next_tick = Instant::now() + tick_interval;
        let mut retry_at: Option<Instant> = None;
        let mut worked = false;
        let mut attempted = false;

        loop {
            // Control commands are serviced between iterations only; a
            // record in flight always completes first.
            while let Ok(cmd) = self.commands.try_recv() {
                self.handle_command(cmd, &mut ctx, &sm);
            }
            if !self.run_flag.load(Ordering::Acquire) {
                break;
            }

            let now = Instant::now();
            if now >= next_tick {
                self.observe_tick(worked, attempted);
                worked = false;
                attempted = false;
                next_tick = now + tick_interval;
            }

            let can_step = !self.failed
                && !self.paused
                && retry_at.map_or(true, |at| Instant::now() >= at);
            if can_step {
                retry_at = None;
                match sm.step(&mut ctx).await {
                    Ok(StepOutcome::Advanced) => {
                        worked = true;
                        attempted = true;
                        // Cooperative yield between iterations.
                        tokio::task::yield_now().await;
                        continue;
                    }
                    Ok(StepOutcome::NoWork) => {}
                    Ok(StepOutcome::Retry(delay)) => {
                        attempted = true;
                        retry_at = Some(Instant::now() + delay);
                        continue;
                    }
                    Err(e) => {
                        self.fail(&mut ctx, e);
                        continue;
                    }
                }
            }

            // Idle: wait for a command, the health tick, the retry
            // deadline, or the next commit-position advance.
            tokio::select! {
                biased;
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd, &mut ctx, &sm),
                        None => break,
                    }
                }
                _ = tokio::time::sleep_until(next_tick) => {}
                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(|| Instant::now() + std::time::Duration::from_secs(86400 * 365))),
                    if retry_at.is_some() =>
                {
                    // The deadline has passed; the next iteration may step.
                    retry_at = None;
                }
                changed = commit_rx.changed(),
                    if !self.failed && !self.paused && retry_at.is_none() =>
                {
                    if changed.is_err() {
                        self.fail(
                            &mut ctx,
                            EngineError::processing_failed(
                                "log stream dropped its commit-position channel",
                            ),
                        );
                    }
                }
            }
        }

        self.shutdown(&mut ctx);
        // Dropping the context closes the reader and writer and
        // deregisters the commit-position subscription.
    }

    async fn start(&mut self) -> EngineResult<ProcessingContext> {
        let writer = self.log.new_batch_writer().await.map_err(|e| {
            EngineError::lifecycle_failed("failed to acquire batch writer").with_source(&e)
        })?;
        let reader = self.log.new_reader().await.map_err(|e| {
            EngineError::lifecycle_failed("failed to acquire log reader").with_source(&e)
        })?;
        let registry = self.registry.take().unwrap_or_default();
        Ok(ProcessingContext::new(
            self.partition_id,
            Arc::clone(&self.log),
            reader,
            writer,
            registry,
            Arc::clone(&self.store),
            Arc::clone(&self.run_flag),
            Arc::clone(&self.metrics),
        ))
    }

    fn handle_command(
        &mut self,
        cmd: EngineCommand,
        ctx: &mut ProcessingContext,
        sm: &ProcessingStateMachine,
    ) {
        match cmd {
            EngineCommand::Pause(reply) => {
                if !self.paused && !self.failed {
                    self.paused = true;
                    self.health.set_phase(EnginePhase::Paused);
                    info!("processing paused");
                    for handler in ctx.registry.iter_mut() {
                        handler.on_paused();
                    }
                }
                let _ = reply.send(());
            }
            EngineCommand::Resume(reply) => {
                if self.paused && !self.failed {
                    self.paused = false;
                    self.health.set_phase(EnginePhase::Processing);
                    info!("processing resumed");
                    for handler in ctx.registry.iter_mut() {
                        handler.on_resumed();
                    }
                }
                let _ = reply.send(());
            }
            EngineCommand::LastProcessed(reply) => {
                let _ = reply.send(sm.last_processed());
            }
            EngineCommand::LastWritten(reply) => {
                let _ = reply.send(sm.last_written());
            }
            EngineCommand::Close(reply) => {
                self.run_flag.store(false, Ordering::Release);
                let _ = reply.send(());
            }
        }
    }

    /// Transition to Failed, notify listeners exactly once, and keep the
    /// task alive so getters and close still work.
    fn fail(&mut self, ctx: &mut ProcessingContext, err: EngineError) -> EngineError {
        if self.failed {
            return err;
        }
        self.failed = true;
        self.metrics.increment_engine_failures();
        error!(error = %err, "stream processor failed");
        self.health.set_phase(EnginePhase::Failed);
        for handler in ctx.registry.iter_mut() {
            handler.on_failed();
        }
        let shared_err = Arc::new(err.clone());
        *self.shared.failure.lock() = Some(Arc::clone(&shared_err));
        let listeners = std::mem::take(&mut *self.shared.listeners.lock());
        for listener in listeners {
            listener.on_failure(&shared_err);
        }
        err
    }

    fn observe_tick(&self, worked: bool, attempted: bool) {
        // Idle counts as progress; attempting without completing does not.
        let progress = worked || !attempted;
        debug!(progress, "health tick");
        self.health.record_tick(progress);
    }

    fn shutdown(&mut self, ctx: &mut ProcessingContext) {
        if !self.failed {
            for handler in ctx.registry.iter_mut() {
                handler.on_close();
            }
            self.health.set_phase(EnginePhase::Closed);
        }
        info!("stream processor closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MemoryLog;
    use crate::state::MemoryStateStore;

    fn build_processor() -> StreamProcessor {
        let log = MemoryLog::new(1);
        let store = MemoryStateStore::new();
        StreamProcessorBuilder::new(Arc::new(log), Arc::new(store)).build()
    }

    #[tokio::test]
    async fn test_double_open_is_rejected() {
        let processor = build_processor();
        processor.open().await.unwrap();

        let err = processor.open().await.unwrap_err();
        assert_eq!(err.code().code(), "TIDE_ENGINE_ALREADY_OPENED");

        processor.close().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let processor = build_processor();
        processor.open().await.unwrap();
        processor.close().await;
        processor.close().await;
        assert_eq!(processor.phase(), EnginePhase::Closed);
    }

    #[tokio::test]
    async fn test_close_without_open_is_a_no_op() {
        let processor = build_processor();
        processor.close().await;
    }

    #[tokio::test]
    async fn test_reopen_after_close_is_rejected() {
        let processor = build_processor();
        processor.open().await.unwrap();
        processor.close().await;

        let err = processor.open().await.unwrap_err();
        assert_eq!(err.code().code(), "TIDE_ENGINE_LIFECYCLE_FAILED");
    }

    #[tokio::test]
    async fn test_calls_after_close_report_closed() {
        let processor = build_processor();
        processor.open().await.unwrap();
        processor.close().await;

        let err = processor.last_processed_position().await.unwrap_err();
        assert_eq!(err.code().code(), "TIDE_ENGINE_CLOSED");
    }
}
