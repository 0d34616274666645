//! Task record: the persisted row.

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};

use super::context::ExecutionContext;
use super::errors::TaskError;
use super::ids::TaskId;
use super::status::TaskStatus;
use super::task::{Task, TaskEnvelope, TaskType};

/// Metadata + envelope for one task.
///
/// Design:
/// - This is the shape of a row in the task store, the single source of truth.
/// - Only `status`, `error_message`, `attempts` and `updated_at` ever change.
/// - A record is itself a [`Task`], but an inert one: it has no handler, so
///   `execute` fails with [`TaskError::Unbound`] until the registry binds it.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub envelope: TaskEnvelope,
    pub status: TaskStatus,

    /// Set when the task failed, `None` otherwise.
    pub error_message: Option<String>,

    /// Number of successful claims so far.
    pub attempts: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// A fresh pending record.
    pub fn new(envelope: TaskEnvelope, now: DateTime<Utc>) -> Self {
        let now = normalize_timestamp(now);
        Self {
            envelope,
            status: TaskStatus::Pending,
            error_message: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> TaskId {
        self.envelope.task_id()
    }

    pub fn task_type(&self) -> &TaskType {
        self.envelope.task_type()
    }

    /// Pending -> Processing. Counts one attempt.
    pub fn start_attempt(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Processing;
        self.attempts = self.attempts.saturating_add(1);
        self.error_message = None;
        self.touch(now);
    }

    /// Apply a status change. `error_message` is kept only for `Failed`.
    pub fn transition(&mut self, status: TaskStatus, error_message: Option<String>, now: DateTime<Utc>) {
        self.status = status;
        self.error_message = match status {
            TaskStatus::Failed => error_message,
            _ => None,
        };
        self.touch(now);
    }

    /// `updated_at` never moves backwards, even if the clock does.
    fn touch(&mut self, now: DateTime<Utc>) {
        let now = normalize_timestamp(now);
        if now > self.updated_at {
            self.updated_at = now;
        }
    }
}

/// Timestamps are kept at microsecond precision so that values read back from
/// a database compare equal to what was written.
pub fn normalize_timestamp(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(6)
}

#[async_trait]
impl Task for TaskRecord {
    fn id(&self) -> TaskId {
        self.envelope.task_id()
    }

    fn task_type(&self) -> &str {
        self.envelope.task_type().as_str()
    }

    fn payload(&self) -> &[u8] {
        self.envelope.payload()
    }

    fn status(&self) -> TaskStatus {
        self.status
    }

    async fn execute(&self, _ctx: &ExecutionContext) -> Result<(), TaskError> {
        Err(TaskError::Unbound {
            task_type: self.task_type().to_string(),
        })
    }
}
