//! Engine error types.
//!
//! Two layers:
//! - [`ProcessingError`] is what handlers return. Only its retryable
//!   variant keeps the engine alive; everything else is fatal.
//! - [`EngineError`] is what the engine surfaces to its caller and to
//!   failure listeners. It is cloneable so the same failure can complete a
//!   pending open future and notify listeners; sources are rendered into
//!   the details field rather than chained.
//!
//! Error codes:
//! - TIDE_ENGINE_RECOVERY_FAILED (FATAL)
//! - TIDE_ENGINE_PROCESSING_FAILED (FATAL)
//! - TIDE_ENGINE_LIFECYCLE_FAILED (FATAL)
//! - TIDE_ENGINE_ALREADY_OPENED (ERROR)
//! - TIDE_ENGINE_CLOSED (ERROR)

use std::fmt;

/// Severity of an engine error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The call failed; the engine instance is unaffected.
    Error,
    /// The engine instance is no longer usable.
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "ERROR"),
            Severity::Fatal => write!(f, "FATAL"),
        }
    }
}

/// Engine-level error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineErrorCode {
    /// Replay from the snapshot boundary failed.
    RecoveryFailed,
    /// Steady-state processing hit a non-retryable failure.
    ProcessingFailed,
    /// Startup or shutdown plumbing failed.
    LifecycleFailed,
    /// `open` was called on an instance that is already open.
    AlreadyOpened,
    /// The engine task is gone; the call could not be delivered.
    Closed,
}

impl EngineErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            EngineErrorCode::RecoveryFailed => "TIDE_ENGINE_RECOVERY_FAILED",
            EngineErrorCode::ProcessingFailed => "TIDE_ENGINE_PROCESSING_FAILED",
            EngineErrorCode::LifecycleFailed => "TIDE_ENGINE_LIFECYCLE_FAILED",
            EngineErrorCode::AlreadyOpened => "TIDE_ENGINE_ALREADY_OPENED",
            EngineErrorCode::Closed => "TIDE_ENGINE_CLOSED",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            EngineErrorCode::RecoveryFailed
            | EngineErrorCode::ProcessingFailed
            | EngineErrorCode::LifecycleFailed => Severity::Fatal,
            EngineErrorCode::AlreadyOpened | EngineErrorCode::Closed => Severity::Error,
        }
    }
}

impl fmt::Display for EngineErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Error surfaced by the stream processor.
#[derive(Debug, Clone)]
pub struct EngineError {
    code: EngineErrorCode,
    message: String,
    details: Option<String>,
}

impl EngineError {
    pub fn recovery_failed(message: impl Into<String>) -> Self {
        Self {
            code: EngineErrorCode::RecoveryFailed,
            message: message.into(),
            details: None,
        }
    }

    pub fn processing_failed(message: impl Into<String>) -> Self {
        Self {
            code: EngineErrorCode::ProcessingFailed,
            message: message.into(),
            details: None,
        }
    }

    pub fn lifecycle_failed(message: impl Into<String>) -> Self {
        Self {
            code: EngineErrorCode::LifecycleFailed,
            message: message.into(),
            details: None,
        }
    }

    pub fn already_opened(partition_id: u32) -> Self {
        Self {
            code: EngineErrorCode::AlreadyOpened,
            message: format!("stream processor for partition {} is already open", partition_id),
            details: None,
        }
    }

    pub fn closed(message: impl Into<String>) -> Self {
        Self {
            code: EngineErrorCode::Closed,
            message: message.into(),
            details: None,
        }
    }

    /// Attach the rendered cause of this error.
    pub fn with_source(mut self, source: &dyn fmt::Display) -> Self {
        self.details = Some(source.to_string());
        self
    }

    pub fn code(&self) -> EngineErrorCode {
        self.code
    }

    pub fn severity(&self) -> Severity {
        self.code.severity()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.code.severity(),
            self.code.code(),
            self.message
        )?;
        if let Some(ref details) = self.details {
            write!(f, " (caused by: {})", details)?;
        }
        Ok(())
    }
}

impl std::error::Error for EngineError {}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Error returned by a record handler.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    /// The failure is expected to clear on its own; the engine retries the
    /// iteration after a bounded backoff.
    #[error("transient processing failure: {reason}")]
    Retryable { reason: String },
    /// The failure is deterministic; the engine fails.
    #[error("fatal processing failure: {reason}")]
    Fatal { reason: String },
}

impl ProcessingError {
    pub fn retryable(reason: impl Into<String>) -> Self {
        ProcessingError::Retryable {
            reason: reason.into(),
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        ProcessingError::Fatal {
            reason: reason.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ProcessingError::Retryable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            EngineErrorCode::RecoveryFailed.code(),
            "TIDE_ENGINE_RECOVERY_FAILED"
        );
        assert_eq!(
            EngineErrorCode::ProcessingFailed.code(),
            "TIDE_ENGINE_PROCESSING_FAILED"
        );
        assert_eq!(EngineErrorCode::Closed.code(), "TIDE_ENGINE_CLOSED");
    }

    #[test]
    fn test_severities() {
        assert!(EngineError::recovery_failed("x").is_fatal());
        assert!(EngineError::processing_failed("x").is_fatal());
        assert!(!EngineError::already_opened(1).is_fatal());
        assert!(!EngineError::closed("x").is_fatal());
    }

    #[test]
    fn test_display_includes_source() {
        let cause = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let err = EngineError::processing_failed("append failed").with_source(&cause);
        let display = format!("{}", err);
        assert!(display.contains("TIDE_ENGINE_PROCESSING_FAILED"));
        assert!(display.contains("disk on fire"));
    }

    #[test]
    fn test_processing_error_classification() {
        assert!(ProcessingError::retryable("net blip").is_retryable());
        assert!(!ProcessingError::fatal("bad state").is_retryable());
    }
}
