use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use super::task::TaskId;

/// Classified reason an attempt failed. Transient kinds are eligible for
/// retry; the rest terminate the task on first occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    NavigationInterrupted,
    SessionCrashed,
    InvalidTarget,
    ExtractionMalformed,
    Cancelled,
}

impl FailureKind {
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            FailureKind::Timeout
                | FailureKind::NavigationInterrupted
                | FailureKind::SessionCrashed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::NavigationInterrupted => "navigation_interrupted",
            FailureKind::SessionCrashed => "session_crashed",
            FailureKind::InvalidTarget => "invalid_target",
            FailureKind::ExtractionMalformed => "extraction_malformed",
            FailureKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Submission-time rejections. These never enter the task lifecycle.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("task target must not be empty")]
    InvalidTask,
    #[error("duplicate task id: {0}")]
    Duplicate(TaskId),
    #[error("queue capacity exceeded")]
    CapacityExceeded,
    #[error("queue closed to new submissions")]
    Closed,
}

/// Infrastructure-level pool failures. Surfaced to workers, not recorded
/// as task outcomes unless the acquire timeout forces a requeue.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no session available within {0:?}")]
    Exhausted(Duration),
    #[error("engine launch failed after {attempts} attempts: {last_error}")]
    LaunchFailed { attempts: u32, last_error: String },
    #[error("session pool is shut down")]
    Terminated,
}
