//! SqliteTaskStore - SQLite を正本とする TaskStore 実装
//!
//! Every transition is a single `BEGIN IMMEDIATE` transaction that checks the
//! current status in its `WHERE` clause and then re-reads the row, so workers
//! in other processes sharing the same file cannot both win a claim.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{OptionalExtension, TransactionBehavior, params};
use tokio_rusqlite::Connection;
use tracing::debug;

use super::schema::init_schema;
use crate::app::status::QueueCounts;
use crate::domain::{
    ClaimOutcome, ReclaimOutcome, Task, TaskEnvelope, TaskId, TaskRecord, TaskStatus, TaskType,
    UpdateOutcome,
};
use crate::ports::task_store::{Staleness, attempts_exhausted, exhausted_message};
use crate::ports::{Clock, StoreError, SystemClock, TaskStore};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const COLUMNS: &str =
    "id, type, payload, status, error_message, attempts, created_at, updated_at";

/// SQLite-backed task store.
pub struct SqliteTaskStore {
    conn: Connection,
    clock: Arc<dyn Clock>,
}

impl SqliteTaskStore {
    /// Open (or create) a database file and make sure the schema exists.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(path).await.map_err(db_err)?;

        conn.call(|conn| {
            conn.busy_timeout(BUSY_TIMEOUT)?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |_row| Ok(()))?;
            init_schema(conn)
        })
        .await
        .map_err(db_err)?;

        Ok(Self::from_connection(conn))
    }

    /// A private in-memory database (tests, demos).
    pub async fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await.map_err(db_err)?;

        conn.call(|conn| init_schema(conn)).await.map_err(db_err)?;

        Ok(Self::from_connection(conn))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn,
            clock: Arc::new(SystemClock),
        }
    }

    fn now(&self) -> String {
        encode_ts(self.clock.now())
    }

    async fn list(
        &self,
        filter: &'static str,
        cutoff: Option<String>,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let rows = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {COLUMNS} FROM tasks WHERE {filter} ORDER BY created_at, rowid"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = match cutoff {
                    Some(cutoff) => stmt
                        .query_map([cutoff], read_row)?
                        .collect::<Result<Vec<_>, _>>()?,
                    None => stmt.query_map([], read_row)?.collect::<Result<Vec<_>, _>>()?,
                };
                Ok(rows)
            })
            .await
            .map_err(db_err)?;

        rows.into_iter().map(TaskRecord::try_from).collect()
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn save_task(&self, task: &dyn Task) -> Result<TaskRecord, StoreError> {
        let envelope = TaskEnvelope::new(
            task.id(),
            TaskType::new(task.task_type()),
            task.payload().to_vec(),
        );
        let record = TaskRecord::new(envelope, self.clock.now());

        let id = record.id().to_key();
        let task_type = record.task_type().as_str().to_string();
        let payload = record.envelope.payload().to_vec();
        let created_at = encode_ts(record.created_at);

        let inserted = self
            .conn
            .call(move |conn| {
                let result = conn.execute(
                    "INSERT INTO tasks (id, type, payload, status, error_message, attempts, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, NULL, 0, ?5, ?5)",
                    params![id, task_type, payload, TaskStatus::Pending.as_str(), created_at],
                );
                match result {
                    Ok(_) => Ok(true),
                    Err(rusqlite::Error::SqliteFailure(e, _))
                        if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                    {
                        Ok(false)
                    }
                    Err(e) => Err(e.into()),
                }
            })
            .await
            .map_err(db_err)?;

        if !inserted {
            return Err(StoreError::DuplicateId(record.id()));
        }
        Ok(record)
    }

    async fn update_task_status(
        &self,
        id: TaskId,
        status: TaskStatus,
        error_message: Option<&str>,
    ) -> Result<UpdateOutcome, StoreError> {
        // Statuses allowed to move into `status`. Processing is reserved for claims.
        let predecessors: Vec<String> = if status == TaskStatus::Processing {
            Vec::new()
        } else {
            TaskStatus::ALL
                .into_iter()
                .filter(|from| from.can_transition_to(status))
                .map(|from| format!("'{}'", from.as_str()))
                .collect()
        };
        let error_message = match status {
            TaskStatus::Failed => error_message.map(str::to_string),
            _ => None,
        };
        let key = id.to_key();
        let now = self.now();

        let (changed, row) = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let changed = if predecessors.is_empty() {
                    0
                } else {
                    let sql = format!(
                        "UPDATE tasks
                         SET status = ?2, error_message = ?3, updated_at = MAX(updated_at, ?4)
                         WHERE id = ?1 AND status IN ({})",
                        predecessors.join(", ")
                    );
                    tx.execute(&sql, params![key, status.as_str(), error_message, now])?
                };
                let row = fetch_row(&tx, &key)?;
                tx.commit()?;
                Ok((changed, row))
            })
            .await
            .map_err(db_err)?;

        let Some(row) = row else {
            return Ok(UpdateOutcome::NotFound);
        };
        let record = TaskRecord::try_from(row)?;
        if changed == 1 {
            Ok(UpdateOutcome::Updated(record))
        } else {
            Ok(UpdateOutcome::Rejected {
                current: record.status,
                requested: status,
            })
        }
    }

    async fn finish_claim(
        &self,
        id: TaskId,
        attempt: u32,
        status: TaskStatus,
        error_message: Option<&str>,
    ) -> Result<UpdateOutcome, StoreError> {
        let allowed = TaskStatus::Processing.can_transition_to(status);
        let error_message = match status {
            TaskStatus::Failed => error_message.map(str::to_string),
            _ => None,
        };
        let key = id.to_key();
        let now = self.now();

        let (changed, row) = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let changed = if allowed {
                    tx.execute(
                        "UPDATE tasks
                         SET status = ?2, error_message = ?3, updated_at = MAX(updated_at, ?4)
                         WHERE id = ?1 AND status = 'processing' AND attempts = ?5",
                        params![key, status.as_str(), error_message, now, attempt],
                    )?
                } else {
                    0
                };
                let row = fetch_row(&tx, &key)?;
                tx.commit()?;
                Ok((changed, row))
            })
            .await
            .map_err(db_err)?;

        let Some(row) = row else {
            return Ok(UpdateOutcome::NotFound);
        };
        let record = TaskRecord::try_from(row)?;
        if changed == 1 {
            Ok(UpdateOutcome::Updated(record))
        } else if !allowed {
            Ok(UpdateOutcome::Rejected {
                current: record.status,
                requested: status,
            })
        } else {
            debug!(task_id = %id, attempt, current = %record.status, attempts = record.attempts, "claim superseded");
            Ok(UpdateOutcome::Superseded {
                current: record.status,
                attempts: record.attempts,
            })
        }
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let key = id.to_key();
        let row = self
            .conn
            .call(move |conn| Ok(fetch_row(conn, &key)?))
            .await
            .map_err(db_err)?;

        row.map(TaskRecord::try_from).transpose()
    }

    async fn get_pending_tasks(&self) -> Result<Vec<TaskRecord>, StoreError> {
        self.list("status = 'pending'", None).await
    }

    async fn get_processing_tasks(
        &self,
        older_than: Duration,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        match Staleness::at(self.clock.now(), older_than) {
            Staleness::Any => self.list("status = 'processing'", None).await,
            Staleness::Before(cutoff) => {
                self.list(
                    "status = 'processing' AND updated_at < ?1",
                    Some(encode_ts(cutoff)),
                )
                .await
            }
            Staleness::Never => Ok(Vec::new()),
        }
    }

    async fn claim_task(&self, id: TaskId) -> Result<ClaimOutcome, StoreError> {
        let key = id.to_key();
        let now = self.now();

        let (changed, row) = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let changed = tx.execute(
                    "UPDATE tasks
                     SET status = 'processing', attempts = attempts + 1, error_message = NULL,
                         updated_at = MAX(updated_at, ?2)
                     WHERE id = ?1 AND status = 'pending'",
                    params![key, now],
                )?;
                let row = fetch_row(&tx, &key)?;
                tx.commit()?;
                Ok((changed, row))
            })
            .await
            .map_err(db_err)?;

        let Some(row) = row else {
            return Ok(ClaimOutcome::NotFound);
        };
        let record = TaskRecord::try_from(row)?;
        if changed == 1 {
            Ok(ClaimOutcome::Claimed(record))
        } else {
            debug!(task_id = %id, current = %record.status, "claim lost");
            Ok(ClaimOutcome::AlreadyTaken {
                current: record.status,
            })
        }
    }

    async fn reclaim_task(
        &self,
        id: TaskId,
        seen_updated_at: DateTime<Utc>,
        max_attempts: Option<u32>,
    ) -> Result<ReclaimOutcome, StoreError> {
        let key = id.to_key();
        let seen = encode_ts(seen_updated_at);
        let now = self.now();

        let result = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let Some(row) = fetch_row(&tx, &key)? else {
                    return Ok(None);
                };
                if row.status != TaskStatus::Processing.as_str() || row.updated_at != seen {
                    return Ok(None);
                }

                let attempts = u32::try_from(row.attempts).unwrap_or(u32::MAX);
                let exhausted = attempts_exhausted(attempts, max_attempts);
                let (status, message) = if exhausted {
                    (TaskStatus::Failed, Some(exhausted_message(attempts)))
                } else {
                    (TaskStatus::Pending, None)
                };
                tx.execute(
                    "UPDATE tasks
                     SET status = ?2, error_message = ?3, updated_at = MAX(updated_at, ?4)
                     WHERE id = ?1",
                    params![key, status.as_str(), message, now],
                )?;
                let row = fetch_row(&tx, &key)?;
                tx.commit()?;
                Ok(row.map(|row| (exhausted, row)))
            })
            .await
            .map_err(db_err)?;

        match result {
            None => Ok(ReclaimOutcome::Skipped),
            Some((true, row)) => Ok(ReclaimOutcome::Exhausted(TaskRecord::try_from(row)?)),
            Some((false, row)) => Ok(ReclaimOutcome::Requeued(TaskRecord::try_from(row)?)),
        }
    }

    async fn count_by_status(&self) -> Result<QueueCounts, StoreError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(db_err)?;

        let mut counts = QueueCounts::default();
        for (status, n) in rows {
            let status = TaskStatus::from_str(&status).map_err(|e| StoreError::CorruptRecord {
                id: "*".to_string(),
                reason: e.to_string(),
            })?;
            counts.add(status, usize::try_from(n).unwrap_or(0));
        }
        Ok(counts)
    }
}

/// A row as stored, before validation.
struct RawRow {
    id: String,
    task_type: String,
    payload: Vec<u8>,
    status: String,
    error_message: Option<String>,
    attempts: i64,
    created_at: String,
    updated_at: String,
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        id: row.get(0)?,
        task_type: row.get(1)?,
        payload: row.get(2)?,
        status: row.get(3)?,
        error_message: row.get(4)?,
        attempts: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn fetch_row(conn: &rusqlite::Connection, key: &str) -> rusqlite::Result<Option<RawRow>> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM tasks WHERE id = ?1"),
        [key],
        read_row,
    )
    .optional()
}

impl TryFrom<RawRow> for TaskRecord {
    type Error = StoreError;

    fn try_from(row: RawRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| StoreError::CorruptRecord {
            id: row.id.clone(),
            reason,
        };

        let id = TaskId::from_str(&row.id).map_err(|e| corrupt(e.to_string()))?;
        let status = TaskStatus::from_str(&row.status).map_err(|e| corrupt(e.to_string()))?;
        let attempts = u32::try_from(row.attempts)
            .map_err(|_| corrupt(format!("attempts out of range: {}", row.attempts)))?;
        let created_at = decode_ts(&row.created_at).map_err(&corrupt)?;
        let updated_at = decode_ts(&row.updated_at).map_err(&corrupt)?;

        Ok(TaskRecord {
            envelope: TaskEnvelope::new(id, TaskType::new(row.task_type.clone()), row.payload.clone()),
            status,
            error_message: row.error_message.clone(),
            attempts,
            created_at,
            updated_at,
        })
    }
}

/// Fixed-width RFC 3339 with microseconds, so text order is time order.
fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_ts(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("bad timestamp '{s}': {e}"))
}

fn db_err(e: tokio_rusqlite::Error) -> StoreError {
    StoreError::Database(e.to_string())
}
