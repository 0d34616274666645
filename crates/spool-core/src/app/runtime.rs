//! Runtime - キューの表面（enqueue / worker / reaper / start）

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::reaper_loop::{ReapSummary, ReaperLoop};
use super::status::QueueCounts;
use super::worker_loop::{WorkerLoop, WorkerSettings, WorkerStats, WorkerStatsSnapshot};
use crate::config::QueueConfig;
use crate::domain::{Task, TaskEnvelope, TaskId, TaskRecord, TaskType};
use crate::ports::{IdGenerator, StoreError, TaskStore};
use crate::typed::{CodecError, PayloadCodec, TaskPayload, TaskRegistry};

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error(transparent)]
    Encode(#[from] CodecError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Everything a process needs to produce and consume tasks.
///
/// Built by [`AppBuilder`](super::AppBuilder). Producers only need
/// `enqueue`; a worker process calls [`start`](Self::start).
pub struct Runtime {
    store: Arc<dyn TaskStore>,
    registry: Arc<TaskRegistry>,
    id_generator: Arc<dyn IdGenerator>,
    config: QueueConfig,
    stats: Arc<WorkerStats>,
}

impl Runtime {
    pub(crate) fn new(
        store: Arc<dyn TaskStore>,
        registry: TaskRegistry,
        id_generator: Arc<dyn IdGenerator>,
        config: QueueConfig,
    ) -> Self {
        Self {
            store,
            registry: Arc::new(registry),
            id_generator,
            config,
            stats: Arc::new(WorkerStats::default()),
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Persist a typed task as `pending`.
    pub async fn enqueue<T: TaskPayload>(&self, payload: &T) -> Result<TaskId, EnqueueError> {
        let bytes = PayloadCodec::encode(payload)?;
        self.enqueue_raw(T::TYPE, bytes).await
    }

    /// Persist a task from its tag and already-serialized payload.
    ///
    /// The tag is not checked against the registry: the consuming process may
    /// register types this one does not know.
    pub async fn enqueue_raw(
        &self,
        task_type: &str,
        payload: impl Into<Vec<u8>>,
    ) -> Result<TaskId, EnqueueError> {
        let envelope = TaskEnvelope::new(
            self.id_generator.generate_task_id(),
            TaskType::new(task_type),
            payload,
        );
        let record = self.submit(&envelope).await?;
        Ok(record.id())
    }

    /// Persist a task built by the caller, keeping its id.
    pub async fn submit(&self, task: &dyn Task) -> Result<TaskRecord, EnqueueError> {
        let record = self.store.save_task(task).await?;
        info!(task_id = %record.id(), task_type = %record.task_type(), "task enqueued");
        Ok(record)
    }

    pub fn worker(&self, worker_id: usize) -> WorkerLoop {
        WorkerLoop::new(
            worker_id,
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            WorkerSettings::from_config(&self.config),
        )
        .with_stats(Arc::clone(&self.stats))
    }

    pub fn reaper(&self) -> ReaperLoop {
        ReaperLoop::from_config(Arc::clone(&self.store), &self.config)
    }

    /// Requeue every processing task regardless of age.
    ///
    /// Only safe when no other worker process is running.
    pub async fn recover(&self) -> Result<ReapSummary, StoreError> {
        self.reaper().sweep(Duration::ZERO).await
    }

    pub async fn counts(&self) -> Result<QueueCounts, StoreError> {
        self.store.count_by_status().await
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Spawn `worker_count` workers and one reaper.
    ///
    /// With `recover_on_start`, processing tasks left by a previous run are
    /// requeued first.
    pub async fn start(&self) -> Result<RuntimeHandle, StoreError> {
        if self.config.recover_on_start {
            let summary = self.recover().await?;
            if summary.scanned > 0 {
                warn!(
                    requeued = summary.requeued,
                    exhausted = summary.exhausted,
                    "recovered tasks left in processing by a previous run"
                );
            }
        }

        let shutdown = CancellationToken::new();
        let mut joins = Vec::with_capacity(self.config.worker_count + 1);
        for worker_id in 0..self.config.worker_count {
            let worker = self.worker(worker_id);
            joins.push(tokio::spawn(worker.run(shutdown.clone())));
        }
        joins.push(tokio::spawn(self.reaper().run(shutdown.clone())));

        info!(workers = self.config.worker_count, "runtime started");
        Ok(RuntimeHandle { shutdown, joins })
    }
}

/// Running workers and reaper.
/// - `request_shutdown()` stops new claims and cancels running executions
/// - `shutdown_and_join()` also waits for every loop to exit
pub struct RuntimeHandle {
    shutdown: CancellationToken,
    joins: Vec<JoinHandle<()>>,
}

impl RuntimeHandle {
    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(e) = join.await {
                warn!(error = %e, "runtime task ended abnormally");
            }
        }
        info!("runtime stopped");
    }
}
