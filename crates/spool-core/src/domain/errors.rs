//! Errors raised while executing a task.
//!
//! Every variant ends up in the record's `error_message` when the task is
//! marked `failed`; none of them is fatal to the worker loop.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The task was loaded from storage and never bound to a handler.
    #[error("unbound task: no handler bound for task_type={task_type}")]
    Unbound { task_type: String },

    /// The handler reported a failure.
    #[error("{0}")]
    Failed(String),

    /// The execution context was cancelled before the work finished.
    #[error("task cancelled")]
    Cancelled,

    #[error("task timed out after {0:?}")]
    TimedOut(Duration),

    #[error("task panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}
