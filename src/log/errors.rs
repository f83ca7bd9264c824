//! Log error types.
//!
//! Error codes:
//! - TIDE_LOG_APPEND_FAILED (ERROR severity, retryable by the engine)
//! - TIDE_LOG_FSYNC_FAILED (FATAL severity)
//! - TIDE_LOG_CORRUPTION (FATAL severity)
//! - TIDE_LOG_CLOSED (FATAL severity)

use std::fmt;
use std::io;

/// Severity levels for log errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The operation failed but may be retried.
    Error,
    /// The log must not be written to again.
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

/// Log-specific error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogErrorCode {
    /// An append did not reach the log.
    AppendFailed,
    /// Appended bytes could not be made durable.
    FsyncFailed,
    /// A stored record failed validation.
    Corruption,
    /// The log was closed underneath the caller.
    Closed,
}

impl LogErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            LogErrorCode::AppendFailed => "TIDE_LOG_APPEND_FAILED",
            LogErrorCode::FsyncFailed => "TIDE_LOG_FSYNC_FAILED",
            LogErrorCode::Corruption => "TIDE_LOG_CORRUPTION",
            LogErrorCode::Closed => "TIDE_LOG_CLOSED",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            LogErrorCode::AppendFailed => Severity::Error,
            LogErrorCode::FsyncFailed => Severity::Fatal,
            LogErrorCode::Corruption => Severity::Fatal,
            LogErrorCode::Closed => Severity::Fatal,
        }
    }
}

impl fmt::Display for LogErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Log error with code, message, and optional context.
#[derive(Debug)]
pub struct LogError {
    code: LogErrorCode,
    message: String,
    details: Option<String>,
    source: Option<io::Error>,
}

impl LogError {
    pub fn append_failed(message: impl Into<String>, source: io::Error) -> Self {
        Self {
            code: LogErrorCode::AppendFailed,
            message: message.into(),
            details: None,
            source: Some(source),
        }
    }

    pub fn fsync_failed(message: impl Into<String>, source: io::Error) -> Self {
        Self {
            code: LogErrorCode::FsyncFailed,
            message: message.into(),
            details: None,
            source: Some(source),
        }
    }

    pub fn corruption(message: impl Into<String>) -> Self {
        Self {
            code: LogErrorCode::Corruption,
            message: message.into(),
            details: None,
            source: None,
        }
    }

    /// Corruption error carrying the byte offset at which reading failed.
    pub fn corruption_at_offset(offset: u64, reason: impl Into<String>) -> Self {
        Self {
            code: LogErrorCode::Corruption,
            message: reason.into(),
            details: Some(format!("byte_offset: {}", offset)),
            source: None,
        }
    }

    /// Corruption error carrying the position at which validation failed.
    pub fn corruption_at_position(position: i64, reason: impl Into<String>) -> Self {
        Self {
            code: LogErrorCode::Corruption,
            message: reason.into(),
            details: Some(format!("position: {}", position)),
            source: None,
        }
    }

    pub fn closed(message: impl Into<String>) -> Self {
        Self {
            code: LogErrorCode::Closed,
            message: message.into(),
            details: None,
            source: None,
        }
    }

    pub fn code(&self) -> LogErrorCode {
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

    /// Returns whether the engine must stop using this log.
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

impl fmt::Display for LogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.code.severity(),
            self.code.code(),
            self.message
        )?;
        if let Some(ref details) = self.details {
            write!(f, " ({})", details)?;
        }
        Ok(())
    }
}

impl std::error::Error for LogError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Result type for log operations.
pub type LogResult<T> = Result<T, LogError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(LogErrorCode::AppendFailed.code(), "TIDE_LOG_APPEND_FAILED");
        assert_eq!(LogErrorCode::FsyncFailed.code(), "TIDE_LOG_FSYNC_FAILED");
        assert_eq!(LogErrorCode::Corruption.code(), "TIDE_LOG_CORRUPTION");
        assert_eq!(LogErrorCode::Closed.code(), "TIDE_LOG_CLOSED");
    }

    #[test]
    fn test_append_failures_are_retryable() {
        let err = LogError::append_failed(
            "write failed",
            io::Error::new(io::ErrorKind::Other, "disk full"),
        );
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_corruption_is_fatal() {
        assert!(LogError::corruption("checksum mismatch").is_fatal());
        assert!(LogError::corruption_at_offset(128, "truncated").is_fatal());
    }

    #[test]
    fn test_display_contains_code_and_details() {
        let err = LogError::corruption_at_offset(64, "checksum mismatch");
        let display = format!("{}", err);
        assert!(display.contains("TIDE_LOG_CORRUPTION"));
        assert!(display.contains("FATAL"));
        assert!(display.contains("byte_offset: 64"));
    }
}
