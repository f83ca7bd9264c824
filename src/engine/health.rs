//! Health reporting for the processing task.
//!
//! The task records a tick every interval together with whether it made
//! progress in the window that just ended. Idle counts as progress; a task
//! stuck inside one iteration stops ticking entirely, which the watchdog
//! catches: if more than two intervals pass without a tick observation the
//! engine is reported unhealthy.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use super::errors::EngineError;

/// Externally visible health of one engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Lifecycle phase of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    /// Built but not yet opened.
    Initial,
    /// Replaying history from the snapshot boundary.
    Reprocessing,
    /// Steady-state processing.
    Processing,
    /// Processing suspended by request.
    Paused,
    /// Terminal until a new instance replaces this one.
    Failed,
    /// Shut down.
    Closed,
}

impl EnginePhase {
    fn as_u8(self) -> u8 {
        match self {
            EnginePhase::Initial => 0,
            EnginePhase::Reprocessing => 1,
            EnginePhase::Processing => 2,
            EnginePhase::Paused => 3,
            EnginePhase::Failed => 4,
            EnginePhase::Closed => 5,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => EnginePhase::Reprocessing,
            2 => EnginePhase::Processing,
            3 => EnginePhase::Paused,
            4 => EnginePhase::Failed,
            5 => EnginePhase::Closed,
            _ => EnginePhase::Initial,
        }
    }
}

/// Callback invoked exactly once when the engine transitions to Failed.
pub trait FailureListener: Send {
    fn on_failure(&self, error: &EngineError);
}

/// Health state shared between the processing task and external callers.
pub(crate) struct HealthShared {
    phase: AtomicU8,
    epoch: Instant,
    tick_interval: Duration,
    /// Milliseconds since `epoch` at the most recent tick.
    last_tick_ms: AtomicU64,
    /// Whether the window ending at the last tick saw progress.
    progress_at_tick: AtomicBool,
}

impl HealthShared {
    pub(crate) fn new(tick_interval: Duration) -> Self {
        Self {
            phase: AtomicU8::new(EnginePhase::Initial.as_u8()),
            epoch: Instant::now(),
            tick_interval,
            last_tick_ms: AtomicU64::new(0),
            progress_at_tick: AtomicBool::new(true),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub(crate) fn phase(&self) -> EnginePhase {
        EnginePhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub(crate) fn set_phase(&self, phase: EnginePhase) {
        self.phase.store(phase.as_u8(), Ordering::Release);
        // Entering an active phase restarts the watchdog window.
        if matches!(phase, EnginePhase::Reprocessing | EnginePhase::Processing) {
            self.last_tick_ms.store(self.now_ms(), Ordering::Release);
            self.progress_at_tick.store(true, Ordering::Release);
        }
    }

    pub(crate) fn record_tick(&self, progress: bool) {
        self.last_tick_ms.store(self.now_ms(), Ordering::Release);
        self.progress_at_tick.store(progress, Ordering::Release);
    }

    pub(crate) fn status(&self) -> HealthStatus {
        match self.phase() {
            EnginePhase::Initial => HealthStatus::Healthy,
            EnginePhase::Paused | EnginePhase::Failed | EnginePhase::Closed => {
                HealthStatus::Unhealthy
            }
            EnginePhase::Reprocessing | EnginePhase::Processing => {
                let since_tick = self
                    .now_ms()
                    .saturating_sub(self.last_tick_ms.load(Ordering::Acquire));
                if since_tick > 2 * self.tick_interval.as_millis() as u64 {
                    return HealthStatus::Unhealthy;
                }
                if !self.progress_at_tick.load(Ordering::Acquire) {
                    return HealthStatus::Unhealthy;
                }
                HealthStatus::Healthy
            }
        }
    }
}
