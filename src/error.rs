//! Error types for the task scheduler.

use crate::scheduler::task::TaskId;

/// Failure of the OS-level wake timer.
///
/// Carries the underlying OS error so callers can log the raw code.
#[derive(Debug, thiserror::Error)]
#[error("wake timer {op} failed: {source}")]
pub struct TimerError {
    /// Operation that failed (`"create"`, `"arm"`, `"cancel"`, ...).
    pub op: &'static str,
    /// Underlying OS error.
    #[source]
    pub source: std::io::Error,
}

impl TimerError {
    /// Build a timer error from the calling thread's last OS error.
    pub(crate) fn last_os_error(op: &'static str) -> Self {
        Self {
            op,
            source: std::io::Error::last_os_error(),
        }
    }

    /// Raw OS error code, when the failure came from a system call.
    #[must_use]
    pub fn os_code(&self) -> Option<i32> {
        self.source.raw_os_error()
    }
}

/// Top-level error type for the scheduler.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// A task with the same id is already registered.
    #[error("duplicate task id: {0}")]
    DuplicateTask(TaskId),

    /// Task definition rejected on registration or update.
    #[error("invalid task: {0}")]
    InvalidTask(String),

    /// Wake timer creation or arming failed.
    #[error(transparent)]
    Timer(#[from] TimerError),

    /// Scheduler state could not be loaded or saved.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, SchedulerError>;
