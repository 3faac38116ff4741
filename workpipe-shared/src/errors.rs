//! Error types for workpipe.

use thiserror::Error;

/// Result alias used across workpipe crates.
pub type WorkpipeResult<T> = Result<T, WorkpipeError>;

/// All errors surfaced by workpipe.
///
/// Per-item stage failures never travel as `Err` through the pipeline; they are
/// recorded on the work item. The variants here reach callers only for build-time
/// misconfiguration, channel contract violations, and lifecycle errors.
#[derive(Debug, Error)]
pub enum WorkpipeError {
    /// Invalid pipeline or option configuration (detected at build time).
    #[error("configuration error: {0}")]
    Config(String),

    /// A write was attempted on a channel writer that already sent EOF.
    #[error("channel writer is already at EOF")]
    AlreadyAtEof,

    /// Byte channel failure (peer vanished, malformed frame, wrong role).
    #[error("channel error: {0}")]
    Channel(String),

    /// A worker subprocess could not be spawned.
    #[error("spawn error: {0}")]
    Spawn(String),

    /// Payload or protocol message could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A worker reported failure.
    #[error("worker error: {0}")]
    Worker(String),

    /// The pipeline or executor pool is shut down.
    #[error("pipeline is shut down")]
    Shutdown,

    /// The work item was cancelled before the operation could run.
    #[error("work item cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for WorkpipeError {
    fn from(err: serde_json::Error) -> Self {
        WorkpipeError::Serialization(err.to_string())
    }
}
