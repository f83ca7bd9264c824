//! The stream processing engine.
//!
//! One engine instance owns one partition: it reads commands from the
//! partition log, dispatches them to registered handlers, appends the
//! follow-up records they stage, and commits derived state together with
//! the record's position in one store transaction. Recovery replays the
//! log from the snapshot boundary and reproduces store effects without
//! re-emitting records.
//!
//! # Invariants Enforced
//!
//! - Records are applied in strictly ascending position order
//! - Exactly one record is in flight at any time
//! - Follow-ups reach the log before the store transaction that
//!   acknowledges their command commits
//! - The last-processed position is persisted in the same transaction as
//!   the state it summarizes

mod cache;
mod context;
mod errors;
mod health;
mod processing;
mod processor;
mod registry;
mod replay;
mod retry;

pub use cache::{DecodedValue, RecordValueCache};
pub use context::ProcessingContext;
pub use errors::{EngineError, EngineErrorCode, EngineResult, ProcessingError, Severity};
pub use health::{EnginePhase, FailureListener, HealthStatus};
pub use processor::{StreamProcessor, StreamProcessorBuilder};
pub use registry::{FollowUpWriter, RecordProcessor, RecordProcessorMap, TypedRecord};
pub use retry::RetryPolicy;
