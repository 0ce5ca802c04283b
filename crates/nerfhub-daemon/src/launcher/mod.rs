//! Job launcher.
//!
//! One-shot jobs run on dedicated OS threads and hand back exactly one
//! result through a [`ResultSink`]. Viewer workers run as child processes
//! that report their endpoint on the first stdout line and then answer
//! control requests line by line.

mod identity;
mod process;
mod sink;
mod thread;

use std::time::Duration;

pub use identity::identity_key;
pub use process::{BIND_FAILED, ERROR_SENTINEL, WorkerCommand, WorkerProcess};
pub use sink::ResultSink;
pub use thread::JobLauncher;

use crate::coordination::CoordinationError;
use crate::storage::DatabaseError;

/// Terminal failure of a one-shot job.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// The job observed a stop request and ended early.
    #[error("Job stopped on request ({key})")]
    Aborted { key: String },

    #[error("Job {job} failed: {reason}")]
    WorkerFailure { job: String, reason: String },

    #[error("Job {job} produced no result within {timeout:?}")]
    DeadlineExceeded { job: String, timeout: Duration },

    #[error("Coordination store error: {0}")]
    Store(#[from] DatabaseError),
}

impl JobError {
    /// Failure raised by a workload itself.
    pub fn failed(job: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::WorkerFailure {
            job: job.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<CoordinationError> for JobError {
    fn from(err: CoordinationError) -> Self {
        match err {
            CoordinationError::Aborted { key } => Self::Aborted { key },
            CoordinationError::Store(e) => Self::Store(e),
        }
    }
}

/// Worker process errors.
#[derive(Debug, thiserror::Error)]
pub enum LauncherError {
    #[error("Failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("Worker failed to start: {reason}")]
    StartupFailed { reason: String },

    #[error("Worker {id} has exited")]
    Exited { id: String },

    #[error("Worker {id} did not answer {request:?} within {timeout:?}")]
    RequestTimeout {
        id: String,
        request: String,
        timeout: Duration,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
