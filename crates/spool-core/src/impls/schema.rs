//! Database schema for the SQLite task store.

use rusqlite::Connection;
use tokio_rusqlite::Error;

pub fn init_schema(conn: &Connection) -> Result<(), Error> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id            TEXT PRIMARY KEY,
    type          TEXT NOT NULL,
    payload       BLOB NOT NULL,
    status        TEXT NOT NULL
                  CHECK (status IN ('pending', 'processing', 'completed', 'failed')),
    error_message TEXT,
    attempts      INTEGER NOT NULL DEFAULT 0,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);

-- Workers poll pending rows oldest first; the reaper scans processing rows by age.
CREATE INDEX IF NOT EXISTS idx_tasks_status_created ON tasks(status, created_at);
CREATE INDEX IF NOT EXISTS idx_tasks_status_updated ON tasks(status, updated_at);
"#;
