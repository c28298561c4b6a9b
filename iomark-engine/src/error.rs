//! Engine error taxonomy and process exit codes.
//!
//! Every error carries enough context to print the per-operation error
//! line (target, worker, op number, offset, sizes, errno) and maps to a
//! process exit code. When several errors are observed over a run the
//! most severe one wins.

use std::io;
use thiserror::Error;

/// Process exit codes. Severity ordering is numeric: 6 > 5 > 4 > 3 > 2 > 1 > 0.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const INIT_FAILURE: i32 = 1;
    pub const INVALID_ARGUMENT: i32 = 2;
    pub const INVALID_OPTION: i32 = 3;
    pub const TARGET_START: i32 = 4;
    pub const CANCELLED: i32 = 5;
    pub const IO_ERROR: i32 = 6;
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad argument value or combination detected before any thread spawns.
    #[error("invalid argument: {0}")]
    Config(String),

    /// A recognized option with an unusable value.
    #[error("invalid option: {0}")]
    Option(String),

    /// Allocation, open, bind, or similar resource failure.
    #[error("resource failure: {what}: {source}")]
    Resource {
        what: String,
        #[source]
        source: io::Error,
    },

    /// A target could not be brought up (open/size/connect).
    #[error("target {target} failed to start: {reason}")]
    TargetStart { target: usize, reason: String },

    /// An I/O operation failed after exhausting its retries.
    #[error(
        "target {target} worker {worker} op {op_number} offset {offset}: \
         requested {requested} bytes, transferred {actual}: {source}"
    )]
    Io {
        target: usize,
        worker: usize,
        op_number: i64,
        offset: i64,
        requested: usize,
        actual: i64,
        #[source]
        source: io::Error,
    },

    /// End-to-end framing violation (bad magic, bad length, reset peer).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The per-target error budget was exhausted.
    #[error("error budget exhausted: {errors} errors (max {max})")]
    ErrorBudget { errors: u64, max: u64 },

    /// The configured run time elapsed. This is a normal stop.
    #[error("run time expired")]
    RuntimeExpired,

    /// External abort (signal or API call).
    #[error("cancelled")]
    Cancelled,
}

impl EngineError {
    /// Exit code this error maps to.
    pub fn severity(&self) -> i32 {
        match self {
            EngineError::Io { .. } | EngineError::ErrorBudget { .. } => exit_code::IO_ERROR,
            EngineError::Protocol(_) => exit_code::IO_ERROR,
            EngineError::Cancelled => exit_code::CANCELLED,
            EngineError::TargetStart { .. } => exit_code::TARGET_START,
            EngineError::Option(_) => exit_code::INVALID_OPTION,
            EngineError::Config(_) => exit_code::INVALID_ARGUMENT,
            EngineError::Resource { .. } => exit_code::INIT_FAILURE,
            EngineError::RuntimeExpired => exit_code::SUCCESS,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        let io = EngineError::Io {
            target: 0,
            worker: 0,
            op_number: 7,
            offset: 4096,
            requested: 4096,
            actual: 0,
            source: io::Error::from_raw_os_error(libc::ENOSPC),
        };
        assert_eq!(io.severity(), exit_code::IO_ERROR);
        assert!(io.severity() > EngineError::Cancelled.severity());
        assert!(
            EngineError::Cancelled.severity()
                > EngineError::TargetStart {
                    target: 0,
                    reason: "no file".into()
                }
                .severity()
        );
        assert!(
            EngineError::Option("bad".into()).severity()
                > EngineError::Config("bad".into()).severity()
        );
        assert_eq!(EngineError::RuntimeExpired.severity(), exit_code::SUCCESS);
    }

    #[test]
    fn test_io_error_line_has_full_context() {
        let err = EngineError::Io {
            target: 2,
            worker: 1,
            op_number: 500,
            offset: 2_048_000,
            requested: 4096,
            actual: -1,
            source: io::Error::from_raw_os_error(libc::ENOSPC),
        };
        let line = err.to_string();
        assert!(line.contains("target 2"));
        assert!(line.contains("worker 1"));
        assert!(line.contains("op 500"));
        assert!(line.contains("offset 2048000"));
        assert!(line.contains("4096 bytes"));
    }
}
