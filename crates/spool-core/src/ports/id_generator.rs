//! IdGenerator port - ID 生成の抽象化
//!
//! Task ids are ULIDs: time-sortable and unique without coordination, so a
//! producer can mint one without asking the store.

use ulid::Ulid;

use crate::domain::ids::TaskId;
use crate::ports::Clock;

/// IdGenerator は TaskId を生成
pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;
}

/// ULID generator whose timestamp part comes from a [`Clock`].
///
/// With a `FixedClock` every id shares the same millisecond prefix; the random
/// part still keeps them distinct.
#[derive(Debug, Clone)]
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_task_id(&self) -> TaskId {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        TaskId::from(Ulid::from_parts(timestamp_ms, rand::random()))
    }
}
