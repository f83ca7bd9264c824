//! End-to-end engine scenarios over the in-memory log and store.
//!
//! Each test drives a full stream processor instance: open, feed commands,
//! observe the log, the store, positions, phase, and health.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tidemill::config::{EngineConfig, RetryConfig};
use tidemill::engine::{
    EngineError, EnginePhase, FailureListener, FollowUpWriter, HealthStatus, ProcessingError,
    RecordProcessor, StreamProcessor, StreamProcessorBuilder, TypedRecord,
};
use tidemill::log::{Intent, MemoryLog, ValueType, UNSET_POSITION};
use tidemill::state::{MemoryStateStore, StateStore, StateTransaction};
use tokio::time::{sleep, Instant};

const ORDER: ValueType = ValueType(1);
const CREATE: Intent = Intent(0);
const CREATED: Intent = Intent(1);

// =============================================================================
// Test Utilities
// =============================================================================

/// Writes the command payload under `order/<key>` and stages one CREATED
/// follow-up carrying the same payload.
struct CreateOrderProcessor;

impl RecordProcessor for CreateOrderProcessor {
    fn process(
        &mut self,
        record: &TypedRecord<'_>,
        writer: &mut FollowUpWriter,
        txn: &mut dyn StateTransaction,
    ) -> Result<(), ProcessingError> {
        let key = format!("order/{}", record.key);
        txn.put(key.as_bytes(), record.value().as_bytes())
            .map_err(|e| ProcessingError::fatal(e.to_string()))?;
        writer.stage(record.key, record.value_type, CREATED, record.value().as_bytes())?;
        Ok(())
    }
}

struct CountingListener(Arc<AtomicUsize>);

impl FailureListener for CountingListener {
    fn on_failure(&self, _error: &EngineError) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn test_config() -> EngineConfig {
    EngineConfig {
        health_tick_interval_ms: 50,
        command_channel_capacity: 16,
        retry: RetryConfig {
            base_delay_ms: 1,
            max_delay_ms: 5,
            max_retries: Some(10),
        },
    }
}

fn build_processor(log: &MemoryLog, store: &MemoryStateStore) -> StreamProcessor {
    StreamProcessorBuilder::new(Arc::new(log.clone()), Arc::new(store.clone()))
        .with_processor(ORDER, CREATE, Box::new(CreateOrderProcessor))
        .with_config(test_config())
        .build()
}

async fn wait_for_processed(processor: &StreamProcessor, want: i64) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while processor.last_processed_position().await.unwrap() < want {
        assert!(
            Instant::now() < deadline,
            "timed out waiting for position {}",
            want
        );
        sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_for_phase(processor: &StreamProcessor, phase: EnginePhase) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while processor.phase() != phase {
        assert!(
            Instant::now() < deadline,
            "timed out waiting for phase {:?}",
            phase
        );
        sleep(Duration::from_millis(5)).await;
    }
}

// =============================================================================
// Seed Scenarios
// =============================================================================

#[tokio::test]
async fn test_empty_log_opens_into_processing() {
    let log = MemoryLog::new(1);
    let store = MemoryStateStore::new();
    let processor = build_processor(&log, &store);

    processor.open().await.unwrap();

    assert_eq!(processor.phase(), EnginePhase::Processing);
    assert_eq!(
        processor.last_processed_position().await.unwrap(),
        UNSET_POSITION
    );
    assert_eq!(
        processor.last_written_position().await.unwrap(),
        UNSET_POSITION
    );
    assert_eq!(processor.health_status(), HealthStatus::Healthy);

    // Idle counts as progress; the engine stays healthy across ticks.
    sleep(Duration::from_millis(150)).await;
    assert_eq!(processor.health_status(), HealthStatus::Healthy);

    processor.close().await;
}

#[tokio::test]
async fn test_single_command_produces_single_follow_up() {
    let log = MemoryLog::new(1);
    let c1 = log.append_command(9, ORDER, CREATE, b"order-9".to_vec()).unwrap();
    let store = MemoryStateStore::new();
    let processor = build_processor(&log, &store);

    processor.open().await.unwrap();
    wait_for_processed(&processor, c1).await;

    let records = log.records();
    assert_eq!(records.len(), 2);
    assert!(records[0].is_command());
    assert_eq!(records[1].source_position, c1);
    assert_eq!(records[1].intent, CREATED);
    assert_eq!(records[1].payload, b"order-9");

    assert_eq!(processor.last_processed_position().await.unwrap(), c1);
    assert_eq!(processor.last_written_position().await.unwrap(), 2);
    assert_eq!(store.get(b"order/9").unwrap(), Some(b"order-9".to_vec()));

    processor.close().await;
}

#[tokio::test]
async fn test_crash_after_append_before_commit_replays_without_new_writes() {
    // Pre-crash state: the command and its follow-up reached the log, the
    // store transaction did not commit.
    let log = MemoryLog::new(1);
    let c1 = log.append_command(9, ORDER, CREATE, b"order-9".to_vec()).unwrap();
    log.append_follow_up(c1, 9, ORDER, CREATED, b"order-9".to_vec()).unwrap();

    let store = MemoryStateStore::new();
    let processor = build_processor(&log, &store);
    processor.open().await.unwrap();
    wait_for_processed(&processor, c1).await;

    // Give any erroneous re-emission a chance to land before asserting.
    sleep(Duration::from_millis(50)).await;
    assert_eq!(log.len(), 2, "recovery must not append new records");
    assert_eq!(processor.last_processed_position().await.unwrap(), c1);
    assert_eq!(processor.last_written_position().await.unwrap(), 2);
    // The replayed command reproduced its store effects.
    assert_eq!(store.get(b"order/9").unwrap(), Some(b"order-9".to_vec()));
    assert_eq!(processor.metrics().snapshot().records_replayed, 1);

    processor.close().await;
}

#[tokio::test]
async fn test_unknown_record_type_is_skipped_and_acknowledged() {
    let log = MemoryLog::new(1);
    let c1 = log
        .append_command(5, ValueType(42), Intent(7), b"?".to_vec())
        .unwrap();
    let store = MemoryStateStore::new();
    let processor = build_processor(&log, &store);

    processor.open().await.unwrap();
    wait_for_processed(&processor, c1).await;

    assert_eq!(log.len(), 1, "skipping must not append records");
    assert_eq!(processor.last_processed_position().await.unwrap(), c1);
    assert_eq!(processor.metrics().snapshot().records_skipped, 1);

    processor.close().await;
}

#[tokio::test]
async fn test_pause_stops_new_iterations_and_resume_continues_in_order() {
    let log = MemoryLog::new(1);
    let c1 = log.append_command(1, ORDER, CREATE, b"one".to_vec()).unwrap();
    let store = MemoryStateStore::new();
    let processor = build_processor(&log, &store);

    processor.open().await.unwrap();
    wait_for_processed(&processor, c1).await;

    processor.pause_processing().await.unwrap();
    assert_eq!(processor.phase(), EnginePhase::Paused);
    assert_eq!(processor.health_status(), HealthStatus::Unhealthy);

    // Commands arriving while paused are not processed.
    log.append_command(2, ORDER, CREATE, b"two".to_vec()).unwrap();
    log.append_command(3, ORDER, CREATE, b"three".to_vec()).unwrap();
    sleep(Duration::from_millis(60)).await;
    assert_eq!(processor.last_processed_position().await.unwrap(), c1);
    assert_eq!(log.len(), 3);

    processor.resume_processing().await.unwrap();
    assert_eq!(processor.phase(), EnginePhase::Processing);
    wait_for_processed(&processor, 4).await;

    // Both pending commands were processed, in order.
    let records = log.records();
    assert_eq!(records.len(), 5);
    let follow_up_sources: Vec<i64> = records
        .iter()
        .filter(|r| !r.is_command())
        .map(|r| r.source_position)
        .collect();
    assert_eq!(follow_up_sources, vec![1, 3, 4]);
    assert_eq!(store.get(b"order/2").unwrap(), Some(b"two".to_vec()));
    assert_eq!(store.get(b"order/3").unwrap(), Some(b"three".to_vec()));

    processor.close().await;
}

#[tokio::test]
async fn test_recovery_failure_fails_open_and_notifies_listener_once() {
    // The store claims position 42, but the log has no such record.
    let log = MemoryLog::new(1);
    let store = MemoryStateStore::new();
    {
        let mut txn = store.begin().unwrap();
        txn.put(b"tidemill/1/last_processed_position", &42i64.to_le_bytes())
            .unwrap();
        txn.commit().unwrap();
    }

    let processor = build_processor(&log, &store);
    let failures = Arc::new(AtomicUsize::new(0));
    processor.add_failure_listener(Box::new(CountingListener(Arc::clone(&failures))));

    let err = processor.open().await.unwrap_err();
    assert_eq!(err.code().code(), "TIDE_ENGINE_RECOVERY_FAILED");
    assert!(err.message().contains("42"));

    assert_eq!(processor.phase(), EnginePhase::Failed);
    assert_eq!(processor.health_status(), HealthStatus::Unhealthy);
    assert_eq!(failures.load(Ordering::SeqCst), 1);

    // A listener registered after the failure is told immediately.
    let late = Arc::new(AtomicUsize::new(0));
    processor.add_failure_listener(Box::new(CountingListener(Arc::clone(&late))));
    assert_eq!(late.load(Ordering::SeqCst), 1);
    // The first listener was not invoked again.
    assert_eq!(failures.load(Ordering::SeqCst), 1);

    // Failed is terminal; close still works but the phase stays Failed.
    processor.close().await;
    assert_eq!(processor.phase(), EnginePhase::Failed);
}

// =============================================================================
// Failure And Retry Behavior
// =============================================================================

#[tokio::test]
async fn test_transient_append_failures_are_retried() {
    let log = MemoryLog::new(1);
    let c1 = log.append_command(9, ORDER, CREATE, b"x".to_vec()).unwrap();
    log.inject_append_failures(2);
    let store = MemoryStateStore::new();
    let processor = build_processor(&log, &store);

    processor.open().await.unwrap();
    wait_for_processed(&processor, c1).await;

    // The follow-up was appended exactly once despite the retries.
    assert_eq!(log.len(), 2);
    assert!(processor.metrics().snapshot().retries >= 2);
    assert_eq!(processor.phase(), EnginePhase::Processing);

    processor.close().await;
}

#[tokio::test]
async fn test_fatal_handler_error_fails_the_engine() {
    struct RejectingProcessor;
    impl RecordProcessor for RejectingProcessor {
        fn process(
            &mut self,
            _record: &TypedRecord<'_>,
            _writer: &mut FollowUpWriter,
            _txn: &mut dyn StateTransaction,
        ) -> Result<(), ProcessingError> {
            Err(ProcessingError::fatal("unreconstructible state"))
        }
    }

    let log = MemoryLog::new(1);
    let store = MemoryStateStore::new();
    let processor = StreamProcessorBuilder::new(Arc::new(log.clone()), Arc::new(store.clone()))
        .with_processor(ORDER, CREATE, Box::new(RejectingProcessor))
        .with_config(test_config())
        .build();

    let failures = Arc::new(AtomicUsize::new(0));
    processor.add_failure_listener(Box::new(CountingListener(Arc::clone(&failures))));

    processor.open().await.unwrap();
    log.append_command(1, ORDER, CREATE, b"x".to_vec()).unwrap();

    wait_for_phase(&processor, EnginePhase::Failed).await;
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    assert_eq!(processor.health_status(), HealthStatus::Unhealthy);

    // The task stays alive for getters; nothing was acknowledged.
    assert_eq!(
        processor.last_processed_position().await.unwrap(),
        UNSET_POSITION
    );
    assert!(store.get(b"order/1").unwrap().is_none());

    processor.close().await;
}

// =============================================================================
// Lifecycle Hooks
// =============================================================================

#[derive(Clone, Default)]
struct EventTrail(Arc<Mutex<Vec<String>>>);

impl EventTrail {
    fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

struct RecordingProcessor {
    trail: EventTrail,
}

impl RecordProcessor for RecordingProcessor {
    fn process(
        &mut self,
        record: &TypedRecord<'_>,
        writer: &mut FollowUpWriter,
        _txn: &mut dyn StateTransaction,
    ) -> Result<(), ProcessingError> {
        self.trail.push(format!("process:{}", record.position));
        writer.stage(record.key, record.value_type, CREATED, b"")?;
        Ok(())
    }

    fn on_open(&mut self) {
        self.trail.push("open");
    }
    fn on_recovered(&mut self) {
        self.trail.push("recovered");
    }
    fn on_paused(&mut self) {
        self.trail.push("paused");
    }
    fn on_resumed(&mut self) {
        self.trail.push("resumed");
    }
    fn on_close(&mut self) {
        self.trail.push("close");
    }
    fn on_failed(&mut self) {
        self.trail.push("failed");
    }
}

#[tokio::test]
async fn test_lifecycle_hooks_fire_in_order() {
    let log = MemoryLog::new(1);
    let c1 = log.append_command(1, ORDER, CREATE, b"x".to_vec()).unwrap();
    let store = MemoryStateStore::new();
    let trail = EventTrail::default();
    let processor = StreamProcessorBuilder::new(Arc::new(log.clone()), Arc::new(store.clone()))
        .with_processor(
            ORDER,
            CREATE,
            Box::new(RecordingProcessor {
                trail: trail.clone(),
            }),
        )
        .with_config(test_config())
        .build();

    processor.open().await.unwrap();
    wait_for_processed(&processor, c1).await;
    processor.pause_processing().await.unwrap();
    processor.resume_processing().await.unwrap();
    processor.close().await;

    assert_eq!(
        trail.events(),
        vec![
            "open",
            "recovered",
            "process:1",
            "paused",
            "resumed",
            "close"
        ]
    );
}
