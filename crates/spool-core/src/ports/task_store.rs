//! TaskStore port - タスクレコードの正本（source of truth）
//!
//! Every state transition goes through this trait, and every implementation
//! enforces the state machine itself, atomically:
//!
//! ```text
//! pending --(claim)--> processing --(success)--> completed
//!                                 --(failure)--> failed
//! processing --(recovery | release)--> pending
//! ```
//!
//! `completed` and `failed` are terminal. Entering `processing` is only
//! possible through [`TaskStore::claim_task`]. Workers leave it through
//! [`TaskStore::finish_claim`], which is fenced on the attempt they claimed.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::app::status::QueueCounts;
use crate::domain::{
    ClaimOutcome, ReclaimOutcome, Task, TaskId, TaskRecord, TaskStatus, UpdateOutcome,
};

/// Storage failures. Losing a race is never one of these; see the outcome
/// enums for that.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task {0} already exists")]
    DuplicateId(TaskId),

    #[error("database error: {0}")]
    Database(String),

    /// A row that cannot be decoded (bad id, unknown status, bad timestamp).
    #[error("corrupt record {id}: {reason}")]
    CorruptRecord { id: String, reason: String },
}

/// Persistent home of task records.
///
/// # Thread Safety
/// - `Send + Sync`; one store is shared by every worker and the reaper
/// - workers in other processes may share the same backing database
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new task as `pending` with `attempts = 0`.
    async fn save_task(&self, task: &dyn Task) -> Result<TaskRecord, StoreError>;

    /// Move a task to `status`. `error_message` is stored only for `Failed`.
    async fn update_task_status(
        &self,
        id: TaskId,
        status: TaskStatus,
        error_message: Option<&str>,
    ) -> Result<UpdateOutcome, StoreError>;

    /// Record how the claim numbered `attempt` ended: `Completed`, `Failed`,
    /// or `Pending` to hand the task back.
    ///
    /// Superseded unless the record is still `processing` at exactly that
    /// attempt, so a worker whose claim was reclaimed cannot touch a newer
    /// owner's claim.
    async fn finish_claim(
        &self,
        id: TaskId,
        attempt: u32,
        status: TaskStatus,
        error_message: Option<&str>,
    ) -> Result<UpdateOutcome, StoreError>;

    async fn get_task(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError>;

    /// All pending records, oldest first. Candidates only: claim before running.
    async fn get_pending_tasks(&self) -> Result<Vec<TaskRecord>, StoreError>;

    /// Processing records not updated for longer than `older_than`, oldest
    /// first. A zero duration returns every processing record.
    async fn get_processing_tasks(&self, older_than: Duration)
    -> Result<Vec<TaskRecord>, StoreError>;

    /// Atomically move `pending -> processing` and count one attempt.
    async fn claim_task(&self, id: TaskId) -> Result<ClaimOutcome, StoreError>;

    /// Atomically move a stale `processing` record back to `pending`, or to
    /// `failed` once `attempts` has reached `max_attempts`.
    ///
    /// Skipped unless the record is still `processing` with exactly
    /// `seen_updated_at`, so a worker that reports in between wins.
    async fn reclaim_task(
        &self,
        id: TaskId,
        seen_updated_at: DateTime<Utc>,
        max_attempts: Option<u32>,
    ) -> Result<ReclaimOutcome, StoreError>;

    async fn count_by_status(&self) -> Result<QueueCounts, StoreError>;
}

/// Which processing records count as stale for a given `older_than`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Staleness {
    /// Zero duration: every processing record.
    Any,
    /// `updated_at` strictly before the cutoff.
    Before(DateTime<Utc>),
    /// The cutoff lies before any representable time.
    Never,
}

impl Staleness {
    pub(crate) fn at(now: DateTime<Utc>, older_than: Duration) -> Self {
        if older_than.is_zero() {
            return Staleness::Any;
        }
        chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|d| now.checked_sub_signed(d))
            .map(Staleness::Before)
            .unwrap_or(Staleness::Never)
    }

    pub(crate) fn matches(&self, updated_at: DateTime<Utc>) -> bool {
        match self {
            Staleness::Any => true,
            Staleness::Before(cutoff) => updated_at < *cutoff,
            Staleness::Never => false,
        }
    }
}

/// Message stored on a task the reaper gave up on.
pub fn exhausted_message(attempts: u32) -> String {
    format!("exceeded max attempts ({attempts}) without completing")
}

/// Whether a reclaimed record has used up its attempt budget.
pub fn attempts_exhausted(attempts: u32, max_attempts: Option<u32>) -> bool {
    match max_attempts {
        Some(max) => attempts >= max,
        None => false,
    }
}
