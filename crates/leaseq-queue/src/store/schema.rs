//! Database schema management.

use std::time::Duration;

use rusqlite::Connection;
use tokio_rusqlite::Error;

/// How long a writer waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Initialize connection settings and the database schema.
pub fn init_schema(conn: &Connection) -> Result<(), Error> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    // In-memory databases answer "memory"; files switch to WAL so several
    // processes can claim from one queue.
    let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

const SCHEMA: &str = r#"
-- Queue items. status: 0 pending, 1 processing, 2 completed, 3 failed.
-- Timestamps are Unix milliseconds.
CREATE TABLE IF NOT EXISTS queue_items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    priority INTEGER NOT NULL,
    payload BLOB NOT NULL,
    created_at INTEGER NOT NULL,
    processed_at INTEGER,
    status INTEGER NOT NULL DEFAULT 0,
    retry_count INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
    last_error TEXT,
    locked_by TEXT,
    locked_until INTEGER
);

-- Claim order
CREATE INDEX IF NOT EXISTS idx_queue_items_claim
    ON queue_items(status, priority DESC, created_at ASC, id ASC);

-- Stale lease scans
CREATE INDEX IF NOT EXISTS idx_queue_items_lease
    ON queue_items(status, locked_until);

-- Retention
CREATE INDEX IF NOT EXISTS idx_queue_items_processed
    ON queue_items(status, processed_at);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_creation() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name='queue_items'")
            .unwrap();
        assert!(stmt.exists([]).unwrap());
    }

    #[test]
    fn test_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
    }

    #[test]
    fn test_negative_retry_count_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        let result = conn.execute(
            "INSERT INTO queue_items (priority, payload, created_at, retry_count) VALUES (0, x'00', 0, -1)",
            [],
        );
        assert!(result.is_err());
    }
}
