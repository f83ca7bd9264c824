//! State store error types.
//!
//! Error codes:
//! - TIDE_STATE_TXN_CONFLICT (FATAL): a second transaction was opened on a
//!   context that already has one
//! - TIDE_STATE_TXN_FAILED (FATAL): a transaction could not commit
//! - TIDE_STATE_READ_FAILED (FATAL): a read could not be served
//!
//! Every state error is fatal to the engine: the store backs the
//! exactly-once bookkeeping, and continuing without it would corrupt state.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateErrorCode {
    TxnConflict,
    TxnFailed,
    ReadFailed,
}

impl StateErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            StateErrorCode::TxnConflict => "TIDE_STATE_TXN_CONFLICT",
            StateErrorCode::TxnFailed => "TIDE_STATE_TXN_FAILED",
            StateErrorCode::ReadFailed => "TIDE_STATE_READ_FAILED",
        }
    }
}

impl fmt::Display for StateErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// State store error.
#[derive(Debug)]
pub struct StateError {
    code: StateErrorCode,
    message: String,
}

impl StateError {
    pub fn txn_conflict(message: impl Into<String>) -> Self {
        Self {
            code: StateErrorCode::TxnConflict,
            message: message.into(),
        }
    }

    pub fn txn_failed(message: impl Into<String>) -> Self {
        Self {
            code: StateErrorCode::TxnFailed,
            message: message.into(),
        }
    }

    pub fn read_failed(message: impl Into<String>) -> Self {
        Self {
            code: StateErrorCode::ReadFailed,
            message: message.into(),
        }
    }

    pub fn code(&self) -> StateErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[FATAL] {}: {}", self.code.code(), self.message)
    }
}

impl std::error::Error for StateError {}

/// Result type for state store operations.
pub type StateResult<T> = Result<T, StateError>;
