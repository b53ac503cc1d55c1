//! The error taxonomy of the design document, as concrete types.
//!
//! Each variant owns the component tag used for the single-line stderr
//! diagnostic (`[SEQ-QUEUE]`, `[MEMORY-MONITOR]`, ...) so that `main.rs`
//! and any library caller render the same message regardless of which
//! layer first observed the failure.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SeqError {
    #[error("[SEQ-CLI] usage error: {0}")]
    Usage(String),

    #[error("[SEQ-QUEUE] queue is closed; submission rejected")]
    QueueClosed,

    #[error("[SEQ-QUEUE] could not acquire lock within retry budget: {0}")]
    LockBusy(String),

    #[error("[SEQ-ENFORCE] unsupported launcher in command: {0}")]
    UnsupportedLauncher(String),

    #[error("[SEQ-ENFORCE] unrecognized tool (--only_verified set): {0}")]
    UnrecognizedTool(String),

    #[error("[wait_all] command timed out after {0}s")]
    Timeout(u64),

    #[error("[MEMORY-MONITOR] process tree exceeded memory cap ({0} MiB); killed")]
    MemoryCap(u64),

    #[error("[SEQ-ENGINE] internal invariant violation: {0}")]
    InternalInvariantViolation(String),

    #[error("[SEQ-QUEUE] job not found: {0}")]
    JobNotFound(String),

    #[error("[SEQ-QUEUE] run not found: {0}")]
    RunNotFound(String),

    #[error("[SEQ-CLI] refused to interpret shell metacharacters in command: {0}")]
    UnsafeCommandVector(String),
}

impl SeqError {
    /// Process exit code this error maps to.
    pub fn exit_code(&self) -> i32 {
        match self {
            SeqError::Usage(_) => 1,
            SeqError::QueueClosed => 1,
            SeqError::UnsafeCommandVector(_) => 1,
            SeqError::Timeout(_) => 124,
            _ => 1,
        }
    }
}
