//! The task abstraction and its transport form.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::context::ExecutionContext;
use super::errors::TaskError;
use super::ids::TaskId;
use super::status::TaskStatus;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskType(String);

impl TaskType {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A unit of background work.
///
/// The queue core only depends on this trait; concrete variants come from the
/// typed layer (`typed::TypedTask`) or from host-provided factories.
///
/// `execute` must be idempotent or safe to retry: delivery is at-least-once.
#[async_trait]
pub trait Task: Send + Sync {
    fn id(&self) -> TaskId;

    fn task_type(&self) -> &str;

    /// Opaque serialized payload, interpreted only by the type's handler.
    fn payload(&self) -> &[u8];

    fn status(&self) -> TaskStatus;

    async fn execute(&self, ctx: &ExecutionContext) -> Result<(), TaskError>;
}

/// TaskType + payload + TaskId, with no execution logic attached.
///
/// This is what an enqueuer hands to the store and what a factory receives
/// during reconstitution. Executing it fails with [`TaskError::Unbound`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEnvelope {
    task_id: TaskId,
    task_type: TaskType,
    payload: Vec<u8>,
}

impl TaskEnvelope {
    pub fn new(task_id: TaskId, task_type: TaskType, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            task_id,
            task_type,
            payload: payload.into(),
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn task_type(&self) -> &TaskType {
        &self.task_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

#[async_trait]
impl Task for TaskEnvelope {
    fn id(&self) -> TaskId {
        self.task_id
    }

    fn task_type(&self) -> &str {
        self.task_type.as_str()
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn status(&self) -> TaskStatus {
        TaskStatus::Pending
    }

    async fn execute(&self, _ctx: &ExecutionContext) -> Result<(), TaskError> {
        Err(TaskError::Unbound {
            task_type: self.task_type.to_string(),
        })
    }
}
