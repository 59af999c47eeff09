use thiserror::Error;

use crate::task::{TaskId, TaskStatus};

/// Errors returned across the submission/polling boundary.
///
/// Task-level failures (unreadable documents, exhausted providers, timeouts) are not
/// errors of the gateway call itself; they are recorded on the task as a
/// [`TaskFailure`](crate::task::TaskFailure) and surfaced through status polling.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("task `{0}` not found")]
    TaskNotFound(TaskId),
    #[error("result for task `{id}` is not ready (status: {status})")]
    ResultNotReady { id: TaskId, status: TaskStatus },
    #[error("submission queue is full (capacity {capacity}); retry later")]
    Backpressure { capacity: usize },
    #[error("engine is shutting down")]
    ShuttingDown,
}

impl EngineError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Whether a caller may reasonably retry the same call later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Backpressure { .. } | Self::ResultNotReady { .. })
    }
}
