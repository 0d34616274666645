//! Handler trait と TaskFactory
//!
//! # 二層構造
//! - **表層（Typed）**: `Handler<T>` - 型安全、デコード済みの payload を受け取る
//! - **内部（Dyn）**: `TaskFactory` - object-safe、envelope から `Box<dyn Task>` を作る
//!
//! `TypedFactory<T, H>` が両者をつなぎます。

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use super::codec::PayloadCodec;
use super::registry::ReconstituteError;
use super::task::TaskPayload;
use crate::domain::{ExecutionContext, Task, TaskEnvelope, TaskError, TaskId, TaskStatus};

/// Handler は decoded payload を実行する
///
/// # 使用例
/// ```ignore
/// struct GenerateCardsHandler;
///
/// #[async_trait]
/// impl Handler<GenerateCards> for GenerateCardsHandler {
///     async fn handle(&self, task: &GenerateCards, ctx: &ExecutionContext) -> Result<(), TaskError> {
///         // ...
///         Ok(())
///     }
/// }
/// ```
///
/// Delivery is at-least-once: `handle` may run again for the same task after
/// a crash, so it must be idempotent.
#[async_trait]
pub trait Handler<T: TaskPayload>: Send + Sync {
    async fn handle(&self, task: &T, ctx: &ExecutionContext) -> Result<(), TaskError>;
}

/// Builds an executable task from a stored envelope.
///
/// Implemented by [`TypedFactory`] and by any
/// `Fn(TaskEnvelope) -> Result<Box<dyn Task>, ReconstituteError>` closure.
pub trait TaskFactory: Send + Sync {
    fn build(&self, envelope: TaskEnvelope) -> Result<Box<dyn Task>, ReconstituteError>;
}

impl<F> TaskFactory for F
where
    F: Fn(TaskEnvelope) -> Result<Box<dyn Task>, ReconstituteError> + Send + Sync,
{
    fn build(&self, envelope: TaskEnvelope) -> Result<Box<dyn Task>, ReconstituteError> {
        self(envelope)
    }
}

/// A decoded payload bound to its handler.
pub struct TypedTask<T: TaskPayload, H> {
    envelope: TaskEnvelope,
    task: T,
    handler: Arc<H>,
}

impl<T: TaskPayload, H: Handler<T>> TypedTask<T, H> {
    pub fn new(envelope: TaskEnvelope, task: T, handler: Arc<H>) -> Self {
        Self {
            envelope,
            task,
            handler,
        }
    }
}

#[async_trait]
impl<T: TaskPayload, H: Handler<T>> Task for TypedTask<T, H> {
    fn id(&self) -> TaskId {
        self.envelope.task_id()
    }

    fn task_type(&self) -> &str {
        T::TYPE
    }

    fn payload(&self) -> &[u8] {
        self.envelope.payload()
    }

    fn status(&self) -> TaskStatus {
        TaskStatus::Pending
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<(), TaskError> {
        self.handler.handle(&self.task, ctx).await
    }
}

/// Decodes `T` from the payload and binds it to a shared `H`.
pub struct TypedFactory<T, H> {
    handler: Arc<H>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: TaskPayload, H: Handler<T>> TypedFactory<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler: Arc::new(handler),
            _marker: PhantomData,
        }
    }
}

impl<T: TaskPayload, H: Handler<T> + 'static> TaskFactory for TypedFactory<T, H> {
    fn build(&self, envelope: TaskEnvelope) -> Result<Box<dyn Task>, ReconstituteError> {
        let task = PayloadCodec::decode::<T>(envelope.payload()).map_err(|e| {
            ReconstituteError::Decode {
                task_type: T::TYPE.to_string(),
                reason: e.to_string(),
            }
        })?;
        Ok(Box::new(TypedTask::new(envelope, task, Arc::clone(&self.handler))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskType;
    use crate::typed::testing::{Echo, EchoHandler};
    use ulid::Ulid;

    fn envelope(payload: &[u8]) -> TaskEnvelope {
        TaskEnvelope::new(
            TaskId::from_ulid(Ulid::new()),
            TaskType::new(<Echo as TaskPayload>::TYPE),
            payload.to_vec(),
        )
    }

    #[tokio::test]
    async fn typed_factory_binds_payload_to_handler() {
        let handler = EchoHandler::default();
        let seen = handler.seen();
        let factory = TypedFactory::<Echo, _>::new(handler);

        let env = envelope(br#"{"message":"hello"}"#);
        let id = env.task_id();
        let task = factory.build(env).unwrap();

        assert_eq!(task.id(), id);
        assert_eq!(task.task_type(), "test.echo.v1");

        task.execute(&ExecutionContext::detached(id, 1)).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["hello".to_string()]);
    }

    #[test]
    fn typed_factory_rejects_malformed_payload() {
        let factory = TypedFactory::<Echo, _>::new(EchoHandler::default());

        let err = factory.build(envelope(b"[1,2,3]")).err().unwrap();
        assert!(matches!(err, ReconstituteError::Decode { ref task_type, .. } if task_type == "test.echo.v1"));
    }

    #[test]
    fn closures_are_factories() {
        let factory = |env: TaskEnvelope| -> Result<Box<dyn Task>, ReconstituteError> {
            Ok(Box::new(env))
        };
        let task = factory.build(envelope(b"{}")).unwrap();
        assert_eq!(task.payload(), b"{}");
    }
}
