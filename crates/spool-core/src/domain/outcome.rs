//! Outcomes of store transitions.
//!
//! Losing a race or finding nothing to update is a normal result, not an error,
//! so these are plain enums rather than `Err` variants.

use super::record::TaskRecord;
use super::status::TaskStatus;

/// Result of an atomic `pending -> processing` claim.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// This caller now owns the task. Carries the record after the claim.
    Claimed(TaskRecord),

    /// Someone else got there first (or the task already moved on).
    AlreadyTaken { current: TaskStatus },

    NotFound,
}

impl ClaimOutcome {
    pub fn is_claimed(&self) -> bool {
        matches!(self, ClaimOutcome::Claimed(_))
    }
}

/// Result of `update_task_status` and `finish_claim`.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Updated(TaskRecord),

    /// No record with that id. Callers decide whether this matters.
    NotFound,

    /// The requested transition is not an edge of the state machine.
    Rejected {
        current: TaskStatus,
        requested: TaskStatus,
    },

    /// The claim being finished is no longer the live one: the record left
    /// `processing` or was claimed again since.
    Superseded { current: TaskStatus, attempts: u32 },
}

impl UpdateOutcome {
    pub fn is_updated(&self) -> bool {
        matches!(self, UpdateOutcome::Updated(_))
    }
}

/// Result of reclaiming a stale processing task.
#[derive(Debug, Clone, PartialEq)]
pub enum ReclaimOutcome {
    /// Back to pending.
    Requeued(TaskRecord),

    /// Attempt budget used up; moved to failed.
    Exhausted(TaskRecord),

    /// The record is no longer processing, or was touched after the snapshot.
    Skipped,
}
