//! WorkerLoop - タスク実行ループ
//!
//! # フロー
//! 1. `get_pending_tasks()` で候補を取得（古い順）
//! 2. `claim_task()` で pending → processing（負けたら次の候補へ）
//! 3. `TaskRegistry::reconstitute()` で実行可能な Task に戻す
//! 4. 別の tokio task で `execute()`（panic を捕捉するため）
//! 5. `finish_claim()` で completed / failed / pending を報告（自分の attempt のときだけ）

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::retry::RetryPolicy;
use crate::config::QueueConfig;
use crate::domain::{
    ClaimOutcome, ExecutionContext, TaskError, TaskId, TaskRecord, TaskStatus, UpdateOutcome,
};
use crate::ports::{StoreError, TaskStore};
use crate::typed::TaskRegistry;

/// Knobs a worker needs from [`QueueConfig`].
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub poll_interval: Duration,
    pub execution_timeout: Option<Duration>,
    pub report_attempts: u32,
    pub retry: RetryPolicy,
}

impl WorkerSettings {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            execution_timeout: config.execution_timeout(),
            report_attempts: config.report_attempts.max(1),
            retry: RetryPolicy::from_config(&config.retry),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

/// What happened to one claimed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Completed,
    Failed(String),
    /// Handed back to `pending` because the worker is shutting down.
    Released,
}

impl Disposition {
    fn status(&self) -> TaskStatus {
        match self {
            Disposition::Completed => TaskStatus::Completed,
            Disposition::Failed(_) => TaskStatus::Failed,
            Disposition::Released => TaskStatus::Pending,
        }
    }

    fn error_message(&self) -> Option<&str> {
        match self {
            Disposition::Failed(message) => Some(message),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    pub task_id: TaskId,
    pub attempt: u32,
    pub disposition: Disposition,
    /// False when the final status could not be written. The reaper will
    /// eventually pick the task up again.
    pub reported: bool,
}

/// Counters shared by every slot of a runtime.
#[derive(Debug, Default)]
pub struct WorkerStats {
    claimed: AtomicU64,
    claim_conflicts: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    released: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStatsSnapshot {
    pub claimed: u64,
    pub claim_conflicts: u64,
    pub completed: u64,
    pub failed: u64,
    pub released: u64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            claimed: self.claimed.load(Ordering::Relaxed),
            claim_conflicts: self.claim_conflicts.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
        }
    }

    fn record(&self, disposition: &Disposition) {
        let counter = match disposition {
            Disposition::Completed => &self.completed,
            Disposition::Failed(_) => &self.failed,
            Disposition::Released => &self.released,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// One worker slot. Holds at most one claimed task at a time.
pub struct WorkerLoop {
    worker_id: usize,
    store: Arc<dyn TaskStore>,
    registry: Arc<TaskRegistry>,
    settings: WorkerSettings,
    stats: Arc<WorkerStats>,
}

impl WorkerLoop {
    pub fn new(
        worker_id: usize,
        store: Arc<dyn TaskStore>,
        registry: Arc<TaskRegistry>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            worker_id,
            store,
            registry,
            settings,
            stats: Arc::new(WorkerStats::default()),
        }
    }

    pub fn with_stats(mut self, stats: Arc<WorkerStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn stats(&self) -> &Arc<WorkerStats> {
        &self.stats
    }

    /// Poll until `shutdown` fires. A task already running when it fires is
    /// allowed to finish (or release itself) before this returns.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(worker_id = self.worker_id, "worker started");
        let mut failures = 0u32;

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let delay = match self.poll_once(&shutdown).await {
                Ok(Some(_)) => {
                    failures = 0;
                    continue;
                }
                Ok(None) => {
                    failures = 0;
                    self.settings.poll_interval
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = self.settings.retry.next_delay(failures);
                    warn!(
                        worker_id = self.worker_id,
                        error = %e,
                        failures,
                        retry_in_ms = delay.as_millis() as u64,
                        "polling failed"
                    );
                    delay
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(worker_id = self.worker_id, "worker stopped");
    }

    /// Claim and run at most one pending task.
    ///
    /// Returns `None` when every candidate was taken by someone else (or there
    /// were none). Candidates are tried oldest first.
    pub async fn poll_once(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<Option<ExecutionReport>, StoreError> {
        let candidates = self.store.get_pending_tasks().await?;

        for candidate in candidates {
            if shutdown.is_cancelled() {
                return Ok(None);
            }

            match self.store.claim_task(candidate.id()).await? {
                ClaimOutcome::Claimed(record) => {
                    self.stats.claimed.fetch_add(1, Ordering::Relaxed);
                    return Ok(Some(self.run_claimed(record, shutdown).await));
                }
                ClaimOutcome::AlreadyTaken { current } => {
                    self.stats.claim_conflicts.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        worker_id = self.worker_id,
                        task_id = %candidate.id(),
                        current = %current,
                        "candidate already taken"
                    );
                }
                ClaimOutcome::NotFound => {
                    debug!(worker_id = self.worker_id, task_id = %candidate.id(), "candidate vanished");
                }
            }
        }

        Ok(None)
    }

    async fn run_claimed(&self, record: TaskRecord, shutdown: &CancellationToken) -> ExecutionReport {
        let span = info_span!(
            "task",
            task_id = %record.id(),
            task_type = %record.task_type(),
            worker_id = self.worker_id,
            attempt = record.attempts,
        );

        async {
            let disposition = self.execute(&record, shutdown).await;
            match &disposition {
                Disposition::Completed => info!("task completed"),
                Disposition::Failed(message) => warn!(error = %message, "task failed"),
                Disposition::Released => info!("task released for another worker"),
            }
            self.stats.record(&disposition);

            let reported = self.report(record.id(), record.attempts, &disposition).await;
            ExecutionReport {
                task_id: record.id(),
                attempt: record.attempts,
                disposition,
                reported,
            }
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, record: &TaskRecord, shutdown: &CancellationToken) -> Disposition {
        let task = match self.registry.reconstitute(record) {
            Ok(task) => task,
            Err(e) => return Disposition::Failed(e.to_string()),
        };

        let mut ctx = ExecutionContext::new(record.id(), record.attempts, shutdown.child_token());
        if let Some(timeout) = self.settings.execution_timeout {
            ctx = ctx.with_timeout(timeout);
        }

        let exec_ctx = ctx.clone();
        let mut handle = tokio::spawn(async move { task.execute(&exec_ctx).await });

        let result = match self.settings.execution_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, &mut handle).await {
                Ok(joined) => flatten(joined),
                Err(_) => {
                    handle.abort();
                    Err(TaskError::TimedOut(timeout))
                }
            },
            None => flatten(handle.await),
        };

        match result {
            Ok(()) => Disposition::Completed,
            Err(TaskError::Cancelled) => Disposition::Released,
            Err(_) if ctx.is_cancelled() => Disposition::Released,
            Err(e) => Disposition::Failed(e.to_string()),
        }
    }

    /// Write the final status of claim `attempt`, retrying store errors.
    /// Returns whether the write went through (or turned out to be moot).
    async fn report(&self, id: TaskId, attempt: u32, disposition: &Disposition) -> bool {
        let status = disposition.status();
        let attempts = self.settings.report_attempts;

        for try_no in 1..=attempts {
            match self
                .store
                .finish_claim(id, attempt, status, disposition.error_message())
                .await
            {
                Ok(UpdateOutcome::Updated(_)) => return true,
                Ok(UpdateOutcome::NotFound) => {
                    warn!(%status, "task disappeared before its status could be recorded");
                    return true;
                }
                Ok(UpdateOutcome::Rejected { current, requested }) => {
                    warn!(%current, %requested, "status report rejected");
                    return true;
                }
                Ok(UpdateOutcome::Superseded { current, attempts }) => {
                    // the reaper requeued it while we were running
                    warn!(%current, attempts, %status, "claim superseded; status not recorded");
                    return true;
                }
                Err(e) => {
                    if try_no == attempts {
                        error!(
                            error = %e,
                            %status,
                            attempts,
                            "giving up on status report; the reaper will recover the task"
                        );
                        break;
                    }
                    let delay = self.settings.retry.next_delay(try_no);
                    warn!(error = %e, report_try = try_no, retry_in_ms = delay.as_millis() as u64, "status report failed");
                    tokio::time::sleep(delay).await;
                }
            }
        }

        false
    }
}

fn flatten(joined: Result<Result<(), TaskError>, JoinError>) -> Result<(), TaskError> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(TaskError::Panicked(panic_message(e.into_panic()))),
        Err(_) => Err(TaskError::failed("execution aborted")),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
