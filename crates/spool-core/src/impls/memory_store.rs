//! InMemoryTaskStore - テスト用・単一プロセス用の正本
//!
//! A single `tokio::sync::Mutex` guards every record, so each trait method is
//! one atomic step. Nothing survives a restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::app::status::QueueCounts;
use crate::domain::{
    ClaimOutcome, ReclaimOutcome, Task, TaskEnvelope, TaskId, TaskRecord, TaskStatus, TaskType,
    UpdateOutcome,
};
use crate::ports::task_store::{Staleness, attempts_exhausted, exhausted_message};
use crate::ports::{Clock, StoreError, SystemClock, TaskStore};

struct Entry {
    /// Insertion order, breaks `created_at` ties.
    seq: u64,
    record: TaskRecord,
}

#[derive(Default)]
struct InMemoryState {
    records: HashMap<TaskId, Entry>,
    next_seq: u64,
}

impl InMemoryState {
    fn sorted_by_age<'a>(&self, entries: impl Iterator<Item = &'a Entry>) -> Vec<TaskRecord> {
        let mut matched: Vec<&Entry> = entries.collect();
        matched.sort_by_key(|e| (e.record.created_at, e.seq));
        matched.into_iter().map(|e| e.record.clone()).collect()
    }
}

pub struct InMemoryTaskStore {
    state: Mutex<InMemoryState>,
    clock: Arc<dyn Clock>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(InMemoryState::default()),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn save_task(&self, task: &dyn Task) -> Result<TaskRecord, StoreError> {
        let envelope = TaskEnvelope::new(
            task.id(),
            TaskType::new(task.task_type()),
            task.payload().to_vec(),
        );
        let record = TaskRecord::new(envelope, self.now());

        let mut state = self.state.lock().await;
        if state.records.contains_key(&record.id()) {
            return Err(StoreError::DuplicateId(record.id()));
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.records.insert(
            record.id(),
            Entry {
                seq,
                record: record.clone(),
            },
        );
        Ok(record)
    }

    async fn update_task_status(
        &self,
        id: TaskId,
        status: TaskStatus,
        error_message: Option<&str>,
    ) -> Result<UpdateOutcome, StoreError> {
        let now = self.now();
        let mut state = self.state.lock().await;
        let Some(entry) = state.records.get_mut(&id) else {
            return Ok(UpdateOutcome::NotFound);
        };

        let current = entry.record.status;
        if status == TaskStatus::Processing || !current.can_transition_to(status) {
            return Ok(UpdateOutcome::Rejected {
                current,
                requested: status,
            });
        }

        entry
            .record
            .transition(status, error_message.map(str::to_string), now);
        Ok(UpdateOutcome::Updated(entry.record.clone()))
    }

    async fn finish_claim(
        &self,
        id: TaskId,
        attempt: u32,
        status: TaskStatus,
        error_message: Option<&str>,
    ) -> Result<UpdateOutcome, StoreError> {
        let now = self.now();
        let mut state = self.state.lock().await;
        let Some(entry) = state.records.get_mut(&id) else {
            return Ok(UpdateOutcome::NotFound);
        };

        let record = &mut entry.record;
        if !TaskStatus::Processing.can_transition_to(status) {
            return Ok(UpdateOutcome::Rejected {
                current: record.status,
                requested: status,
            });
        }
        if record.status != TaskStatus::Processing || record.attempts != attempt {
            return Ok(UpdateOutcome::Superseded {
                current: record.status,
                attempts: record.attempts,
            });
        }

        record.transition(status, error_message.map(str::to_string), now);
        Ok(UpdateOutcome::Updated(record.clone()))
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.records.get(&id).map(|e| e.record.clone()))
    }

    async fn get_pending_tasks(&self) -> Result<Vec<TaskRecord>, StoreError> {
        let state = self.state.lock().await;
        let pending = state
            .records
            .values()
            .filter(|e| e.record.status == TaskStatus::Pending);
        Ok(state.sorted_by_age(pending))
    }

    async fn get_processing_tasks(
        &self,
        older_than: Duration,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let filter = Staleness::at(self.now(), older_than);
        let state = self.state.lock().await;
        let stale = state.records.values().filter(|e| {
            e.record.status == TaskStatus::Processing && filter.matches(e.record.updated_at)
        });
        Ok(state.sorted_by_age(stale))
    }

    async fn claim_task(&self, id: TaskId) -> Result<ClaimOutcome, StoreError> {
        let now = self.now();
        let mut state = self.state.lock().await;
        let Some(entry) = state.records.get_mut(&id) else {
            return Ok(ClaimOutcome::NotFound);
        };

        if entry.record.status != TaskStatus::Pending {
            return Ok(ClaimOutcome::AlreadyTaken {
                current: entry.record.status,
            });
        }

        entry.record.start_attempt(now);
        Ok(ClaimOutcome::Claimed(entry.record.clone()))
    }

    async fn reclaim_task(
        &self,
        id: TaskId,
        seen_updated_at: DateTime<Utc>,
        max_attempts: Option<u32>,
    ) -> Result<ReclaimOutcome, StoreError> {
        let now = self.now();
        let mut state = self.state.lock().await;
        let Some(entry) = state.records.get_mut(&id) else {
            return Ok(ReclaimOutcome::Skipped);
        };

        let record = &mut entry.record;
        if record.status != TaskStatus::Processing || record.updated_at != seen_updated_at {
            return Ok(ReclaimOutcome::Skipped);
        }

        if attempts_exhausted(record.attempts, max_attempts) {
            let message = exhausted_message(record.attempts);
            record.transition(TaskStatus::Failed, Some(message), now);
            return Ok(ReclaimOutcome::Exhausted(record.clone()));
        }

        record.transition(TaskStatus::Pending, None, now);
        Ok(ReclaimOutcome::Requeued(record.clone()))
    }

    async fn count_by_status(&self) -> Result<QueueCounts, StoreError> {
        let state = self.state.lock().await;
        let mut counts = QueueCounts::default();
        for entry in state.records.values() {
            counts.record(entry.record.status);
        }
        Ok(counts)
    }
}
