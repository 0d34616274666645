//! TaskRegistry - task_type から実行可能な Task を再構成する
//!
//! Records come out of the store inert. The registry maps each task_type to a
//! [`TaskFactory`] that turns the stored envelope back into a runnable task.
//! Registration is static: the host fills the registry before any worker
//! starts.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use super::handler::{Handler, TaskFactory, TypedFactory};
use super::task::TaskPayload;
use crate::domain::{ExecutionContext, Task, TaskError, TaskId, TaskRecord, TaskStatus};

/// RegistryError は登録時のエラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("factory for task type '{0}' is already registered")]
    AlreadyRegistered(String),
}

/// Why a stored record could not be turned back into a task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconstituteError {
    #[error("unknown type: no factory registered for '{0}'")]
    UnknownType(String),

    #[error("malformed payload for '{task_type}': {reason}")]
    Decode { task_type: String, reason: String },
}

#[derive(Clone, Default)]
pub struct TaskRegistry {
    factories: HashMap<String, Arc<dyn TaskFactory>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed handler under `T::TYPE`.
    pub fn register<T, H>(&mut self, handler: H) -> Result<(), RegistryError>
    where
        T: TaskPayload,
        H: Handler<T> + 'static,
    {
        self.register_factory(T::TYPE, TypedFactory::<T, H>::new(handler))
    }

    pub fn register_factory<F>(
        &mut self,
        task_type: impl Into<String>,
        factory: F,
    ) -> Result<(), RegistryError>
    where
        F: TaskFactory + 'static,
    {
        let task_type = task_type.into();
        if self.factories.contains_key(&task_type) {
            return Err(RegistryError::AlreadyRegistered(task_type));
        }
        self.factories.insert(task_type, Arc::new(factory));
        Ok(())
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.factories.contains_key(task_type)
    }

    /// Registered task types, sorted.
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    /// Bind a stored record to its factory.
    ///
    /// The returned task reports the record's current status.
    pub fn reconstitute(&self, record: &TaskRecord) -> Result<Box<dyn Task>, ReconstituteError> {
        let task_type = record.task_type().as_str();
        let factory = self
            .factories
            .get(task_type)
            .ok_or_else(|| ReconstituteError::UnknownType(task_type.to_string()))?;

        let inner = factory.build(record.envelope.clone())?;
        Ok(Box::new(BoundTask {
            inner,
            status: record.status,
        }))
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("types", &self.registered_types())
            .finish()
    }
}

/// Factory output paired with the status it was loaded in.
struct BoundTask {
    inner: Box<dyn Task>,
    status: TaskStatus,
}

#[async_trait]
impl Task for BoundTask {
    fn id(&self) -> TaskId {
        self.inner.id()
    }

    fn task_type(&self) -> &str {
        self.inner.task_type()
    }

    fn payload(&self) -> &[u8] {
        self.inner.payload()
    }

    fn status(&self) -> TaskStatus {
        self.status
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<(), TaskError> {
        self.inner.execute(ctx).await
    }
}
