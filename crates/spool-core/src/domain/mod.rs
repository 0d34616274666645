//! Domain model (ids, status, records, the task abstraction, outcomes).

pub mod context;
pub mod errors;
pub mod ids;
pub mod outcome;
pub mod record;
pub mod status;
pub mod task;

pub use self::context::ExecutionContext;
pub use self::errors::TaskError;
pub use self::ids::{ParseTaskIdError, TaskId};
pub use self::outcome::{ClaimOutcome, ReclaimOutcome, UpdateOutcome};
pub use self::record::TaskRecord;
pub use self::status::{ParseStatusError, TaskStatus};
pub use self::task::{Task, TaskEnvelope, TaskType};
