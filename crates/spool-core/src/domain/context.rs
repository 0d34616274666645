//! ExecutionContext - what a running task can see about its own execution.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::ids::TaskId;

/// Passed to [`Task::execute`](super::Task::execute).
///
/// Long-running handlers should watch [`cancelled`](Self::cancelled) (or poll
/// [`is_cancelled`](Self::is_cancelled)) and return
/// [`TaskError::Cancelled`](super::TaskError::Cancelled) so the worker can hand
/// the task back to the queue instead of failing it.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    task_id: TaskId,
    attempt: u32,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl ExecutionContext {
    pub fn new(task_id: TaskId, attempt: u32, cancel: CancellationToken) -> Self {
        Self {
            task_id,
            attempt,
            cancel,
            deadline: None,
        }
    }

    /// A context nobody will ever cancel.
    pub fn detached(task_id: TaskId, attempt: u32) -> Self {
        Self::new(task_id, attempt, CancellationToken::new())
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// 1 for the first claim, incremented by every later claim.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the worker asks the task to stop.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}
