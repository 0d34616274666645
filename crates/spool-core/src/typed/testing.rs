//! Payloads and handlers shared by the crate's tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::handler::Handler;
use super::task::TaskPayload;
use crate::domain::{ExecutionContext, TaskError, TaskId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Echo {
    pub message: String,
}

impl TaskPayload for Echo {
    const TYPE: &'static str = "test.echo.v1";
}

/// Records every message it handles.
#[derive(Default)]
pub struct EchoHandler {
    seen: Arc<Mutex<Vec<String>>>,
}

impl EchoHandler {
    pub fn seen(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.seen)
    }
}

#[async_trait]
impl Handler<Echo> for EchoHandler {
    async fn handle(&self, task: &Echo, _ctx: &ExecutionContext) -> Result<(), TaskError> {
        self.seen.lock().unwrap().push(task.message.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fail {
    pub reason: String,
}

impl TaskPayload for Fail {
    const TYPE: &'static str = "test.fail.v1";
}

pub struct FailHandler;

#[async_trait]
impl Handler<Fail> for FailHandler {
    async fn handle(&self, task: &Fail, _ctx: &ExecutionContext) -> Result<(), TaskError> {
        Err(TaskError::failed(task.reason.clone()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Counted {
    pub work_ms: u64,
}

impl TaskPayload for Counted {
    const TYPE: &'static str = "test.counted.v1";
}

/// Counts executions per task id and sleeps for `work_ms`.
#[derive(Default)]
pub struct CountingHandler {
    runs: Arc<Mutex<HashMap<TaskId, usize>>>,
}

impl CountingHandler {
    pub fn runs(&self) -> Arc<Mutex<HashMap<TaskId, usize>>> {
        Arc::clone(&self.runs)
    }
}

#[async_trait]
impl Handler<Counted> for CountingHandler {
    async fn handle(&self, task: &Counted, ctx: &ExecutionContext) -> Result<(), TaskError> {
        *self.runs.lock().unwrap().entry(ctx.task_id()).or_default() += 1;
        tokio::time::sleep(Duration::from_millis(task.work_ms)).await;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Blocking;

impl TaskPayload for Blocking {
    const TYPE: &'static str = "test.blocking.v1";
}

/// Waits until cancelled, then reports `Cancelled`.
pub struct CooperativeHandler;

#[async_trait]
impl Handler<Blocking> for CooperativeHandler {
    async fn handle(&self, _task: &Blocking, ctx: &ExecutionContext) -> Result<(), TaskError> {
        ctx.cancelled().await;
        Err(TaskError::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Explode;

impl TaskPayload for Explode {
    const TYPE: &'static str = "test.explode.v1";
}

pub struct PanicHandler;

#[async_trait]
impl Handler<Explode> for PanicHandler {
    async fn handle(&self, _task: &Explode, _ctx: &ExecutionContext) -> Result<(), TaskError> {
        panic!("handler blew up");
    }
}
