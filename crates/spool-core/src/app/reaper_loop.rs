//! ReaperLoop - processing のまま止まったタスクの回収
//!
//! # フロー
//! 1. `get_processing_tasks(stuck_after)` で古い processing を取得
//! 2. 各行を `reclaim_task(id, updated_at, max_attempts)` で条件付きに戻す
//!    - 試行回数が残っていれば pending へ
//!    - 使い切っていれば failed へ
//!    - その間に worker が報告していれば何もしない
//!
//! This is the only path by which a crashed worker's task runs again.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::QueueConfig;
use crate::domain::ReclaimOutcome;
use crate::ports::{StoreError, TaskStore};

/// Floor for the sweep interval; a zero-period ticker is not allowed.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Result of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReapSummary {
    pub scanned: usize,
    pub requeued: usize,
    pub exhausted: usize,
    pub skipped: usize,
}

pub struct ReaperLoop {
    store: Arc<dyn TaskStore>,
    stuck_after: Duration,
    interval: Duration,
    max_attempts: Option<u32>,
}

impl ReaperLoop {
    /// `interval` is clamped to at least one millisecond.
    pub fn new(
        store: Arc<dyn TaskStore>,
        stuck_after: Duration,
        interval: Duration,
        max_attempts: Option<u32>,
    ) -> Self {
        Self {
            store,
            stuck_after,
            interval: interval.max(MIN_INTERVAL),
            max_attempts,
        }
    }

    pub fn from_config(store: Arc<dyn TaskStore>, config: &QueueConfig) -> Self {
        Self::new(
            store,
            config.stuck_task_age(),
            config.recovery_interval(),
            config.max_attempts(),
        )
    }

    /// One sweep with the configured age.
    pub async fn scan(&self) -> Result<ReapSummary, StoreError> {
        self.sweep(self.stuck_after).await
    }

    /// One sweep over processing tasks idle for longer than `older_than`.
    /// `Duration::ZERO` takes every processing task.
    pub async fn sweep(&self, older_than: Duration) -> Result<ReapSummary, StoreError> {
        let stale = self.store.get_processing_tasks(older_than).await?;
        let mut summary = ReapSummary {
            scanned: stale.len(),
            ..Default::default()
        };

        for record in stale {
            let outcome = self
                .store
                .reclaim_task(record.id(), record.updated_at, self.max_attempts)
                .await?;
            match outcome {
                ReclaimOutcome::Requeued(_) => {
                    summary.requeued += 1;
                    info!(
                        task_id = %record.id(),
                        task_type = %record.task_type(),
                        attempts = record.attempts,
                        "requeued stuck task"
                    );
                }
                ReclaimOutcome::Exhausted(_) => {
                    summary.exhausted += 1;
                    warn!(
                        task_id = %record.id(),
                        task_type = %record.task_type(),
                        attempts = record.attempts,
                        "stuck task out of attempts, marked failed"
                    );
                }
                ReclaimOutcome::Skipped => summary.skipped += 1,
            }
        }

        Ok(summary)
    }

    /// Sweep every `interval` until `shutdown` fires. The first sweep happens
    /// one interval after start.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            stuck_after_secs = self.stuck_after.as_secs(),
            interval_secs = self.interval.as_secs(),
            "reaper started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.scan().await {
                Ok(summary) if summary.scanned > 0 => info!(
                    scanned = summary.scanned,
                    requeued = summary.requeued,
                    exhausted = summary.exhausted,
                    skipped = summary.skipped,
                    "reaper sweep finished"
                ),
                Ok(_) => {}
                Err(e) => error!(error = %e, "failed to check for stuck tasks"),
            }
        }

        info!("reaper stopped");
    }
}
