//! SQLite item store.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tokio_rusqlite::Connection;
use tracing::{debug, error};

use crate::error::QueueError;
use crate::item::{IgnoreReason, ItemId, ItemStatus, Lease, NewItem, QueueItem, ReportOutcome};

use super::schema::init_schema;
use super::{ItemStore, QueueStats, Transition};

#[cfg(test)]
#[path = "sqlite_tests.rs"]
mod tests;

const COLUMNS: &str = "id, priority, payload, created_at, processed_at, status, retry_count, \
                       last_error, locked_by, locked_until";

/// SQLite-backed item store.
///
/// Claims are a single conditional `UPDATE ... RETURNING`, so any number of
/// connections (in this or other processes) may share one database file.
pub struct SqliteItemStore {
    conn: Connection,
}

impl SqliteItemStore {
    /// Create a new in-memory database.
    pub async fn in_memory() -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| QueueError::StoreUnavailable(e.to_string()))?;

        conn.call(|conn| init_schema(conn)).await?;

        Ok(Self { conn })
    }

    /// Open (or create) a file-backed database.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let path = path.as_ref().to_path_buf();
        debug!("Opening queue database at {:?}", path);

        let conn = Connection::open(path)
            .await
            .map_err(|e| QueueError::StoreUnavailable(e.to_string()))?;

        conn.call(|conn| init_schema(conn)).await?;

        Ok(Self { conn })
    }
}

/// Raw column values, validated into a [`QueueItem`] outside the connection thread.
struct ItemRow {
    id: i64,
    priority: i32,
    payload: Vec<u8>,
    created_at: i64,
    processed_at: Option<i64>,
    status: i64,
    retry_count: i64,
    last_error: Option<String>,
    locked_by: Option<String>,
    locked_until: Option<i64>,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<ItemRow> {
    Ok(ItemRow {
        id: row.get(0)?,
        priority: row.get(1)?,
        payload: row.get(2)?,
        created_at: row.get(3)?,
        processed_at: row.get(4)?,
        status: row.get(5)?,
        retry_count: row.get(6)?,
        last_error: row.get(7)?,
        locked_by: row.get(8)?,
        locked_until: row.get(9)?,
    })
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(id: i64, column: &str, ms: i64) -> Result<DateTime<Utc>, QueueError> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| {
        QueueError::InvariantViolation(format!("item {}: {} out of range: {}", id, column, ms))
    })
}

fn decode_status(id: i64, code: i64) -> Result<ItemStatus, QueueError> {
    ItemStatus::from_code(code).ok_or_else(|| {
        let err = QueueError::InvariantViolation(format!("item {}: unknown status {}", id, code));
        error!("{}", err);
        err
    })
}

impl TryFrom<ItemRow> for QueueItem {
    type Error = QueueError;

    fn try_from(row: ItemRow) -> Result<Self, Self::Error> {
        let id = row.id;
        let item = QueueItem {
            id,
            priority: row.priority,
            payload: row.payload,
            created_at: from_millis(id, "created_at", row.created_at)?,
            processed_at: row
                .processed_at
                .map(|ms| from_millis(id, "processed_at", ms))
                .transpose()?,
            status: decode_status(id, row.status)?,
            retry_count: u32::try_from(row.retry_count).map_err(|_| {
                QueueError::InvariantViolation(format!(
                    "item {}: retry_count out of range: {}",
                    id, row.retry_count
                ))
            })?,
            last_error: row.last_error,
            locked_by: row.locked_by,
            locked_until: row
                .locked_until
                .map(|ms| from_millis(id, "locked_until", ms))
                .transpose()?,
        };

        if let Err(e) = item.check_invariants() {
            error!("{}", e);
            return Err(e);
        }
        Ok(item)
    }
}

fn load_row(conn: &rusqlite::Connection, id: ItemId) -> rusqlite::Result<Option<ItemRow>> {
    conn.query_row(
        &format!("SELECT {} FROM queue_items WHERE id = ?1", COLUMNS),
        [id],
        read_row,
    )
    .optional()
}

fn collect_items(rows: Vec<ItemRow>) -> Result<Vec<QueueItem>, QueueError> {
    rows.into_iter().map(QueueItem::try_from).collect()
}

/// What a fenced update observed.
enum Reported {
    Applied { retry_count: i64, status: i64 },
    NotApplied(Option<ItemRow>),
}

#[async_trait]
impl ItemStore for SqliteItemStore {
    async fn insert(&self, item: NewItem, now: DateTime<Utc>) -> Result<ItemId, QueueError> {
        let created_at = to_millis(now);
        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO queue_items (priority, payload, created_at, status, retry_count)
                     VALUES (?1, ?2, ?3, ?4, 0)",
                    params![item.priority, item.payload, created_at, ItemStatus::Pending.code()],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        Ok(id)
    }

    async fn get(&self, id: ItemId) -> Result<Option<QueueItem>, QueueError> {
        let row = self.conn.call(move |conn| Ok(load_row(conn, id)?)).await?;
        row.map(QueueItem::try_from).transpose()
    }

    async fn eligible(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueItem>, QueueError> {
        let now = to_millis(now);
        let limit = limit as i64;
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM queue_items
                     WHERE status = ?1 OR (status = ?2 AND locked_until < ?3)
                     ORDER BY priority DESC, created_at ASC, id ASC
                     LIMIT ?4",
                    COLUMNS
                ))?;
                let rows = stmt
                    .query_map(
                        params![
                            ItemStatus::Pending.code(),
                            ItemStatus::Processing.code(),
                            now,
                            limit
                        ],
                        read_row,
                    )?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        collect_items(rows)
    }

    async fn conditional_claim(
        &self,
        candidate: &QueueItem,
        lease: &Lease,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueItem>, QueueError> {
        let id = candidate.id;
        let expected_status = candidate.status.code();
        let expected_until = candidate.locked_until.map(to_millis);
        let holder = lease.holder.clone();
        let expires_at = to_millis(lease.expires_at);
        let now = to_millis(now);

        let row = self
            .conn
            .call(move |conn| {
                let row = conn
                    .query_row(
                        &format!(
                            "UPDATE queue_items
                             SET status = ?1, locked_by = ?2, locked_until = ?3
                             WHERE id = ?4 AND status = ?5 AND locked_until IS ?6
                               AND (status = ?7 OR (status = ?1 AND locked_until < ?8))
                             RETURNING {}",
                            COLUMNS
                        ),
                        params![
                            ItemStatus::Processing.code(),
                            holder,
                            expires_at,
                            id,
                            expected_status,
                            expected_until,
                            ItemStatus::Pending.code(),
                            now
                        ],
                        read_row,
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;
        row.map(QueueItem::try_from).transpose()
    }

    async fn update_status(
        &self,
        id: ItemId,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<ReportOutcome, QueueError> {
        let worker_id = transition.worker_id().to_string();
        let now = to_millis(now);

        let reported = match transition.clone() {
            Transition::Complete { .. } => {
                self.conn
                    .call(move |conn| {
                        let changed = conn.execute(
                            "UPDATE queue_items
                             SET status = ?1, processed_at = ?2, locked_by = NULL, locked_until = NULL
                             WHERE id = ?3 AND status = ?4 AND locked_by = ?5",
                            params![
                                ItemStatus::Completed.code(),
                                now,
                                id,
                                ItemStatus::Processing.code(),
                                worker_id
                            ],
                        )?;
                        if changed == 1 {
                            Ok(Reported::Applied {
                                retry_count: 0,
                                status: ItemStatus::Completed.code(),
                            })
                        } else {
                            Ok(Reported::NotApplied(load_row(conn, id)?))
                        }
                    })
                    .await?
            }
            Transition::Fail { error, policy, .. } => {
                let max_retries = i64::from(policy.max_retries());
                self.conn
                    .call(move |conn| {
                        let applied = conn
                            .query_row(
                                "UPDATE queue_items
                                 SET retry_count = retry_count + 1,
                                     last_error = ?1,
                                     locked_by = NULL,
                                     locked_until = NULL,
                                     status = CASE WHEN retry_count + 1 >= ?2 THEN ?3 ELSE ?4 END
                                 WHERE id = ?5 AND status = ?6 AND locked_by = ?7
                                 RETURNING retry_count, status",
                                params![
                                    error,
                                    max_retries,
                                    ItemStatus::Failed.code(),
                                    ItemStatus::Pending.code(),
                                    id,
                                    ItemStatus::Processing.code(),
                                    worker_id
                                ],
                                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
                            )
                            .optional()?;
                        match applied {
                            Some((retry_count, status)) => {
                                Ok(Reported::Applied { retry_count, status })
                            }
                            None => Ok(Reported::NotApplied(load_row(conn, id)?)),
                        }
                    })
                    .await?
            }
        };

        match reported {
            Reported::Applied { retry_count, status } => {
                let retry_count = u32::try_from(retry_count).map_err(|_| {
                    QueueError::InvariantViolation(format!(
                        "item {}: retry_count out of range: {}",
                        id, retry_count
                    ))
                })?;
                match decode_status(id, status)? {
                    ItemStatus::Completed => Ok(ReportOutcome::Completed),
                    ItemStatus::Pending => Ok(ReportOutcome::Requeued { retry_count }),
                    ItemStatus::Failed => Ok(ReportOutcome::Failed { retry_count }),
                    ItemStatus::Processing => Err(QueueError::InvariantViolation(format!(
                        "item {}: still processing after report",
                        id
                    ))),
                }
            }
            Reported::NotApplied(row) => {
                let item = row.map(QueueItem::try_from).transpose()?;
                Ok(ReportOutcome::Ignored(IgnoreReason::for_refused_report(
                    item.as_ref(),
                    transition.worker_id(),
                )))
            }
        }
    }

    async fn delete_completed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, QueueError> {
        let cutoff = to_millis(cutoff);
        let deleted = self
            .conn
            .call(move |conn| {
                let deleted = conn.execute(
                    "DELETE FROM queue_items WHERE status = ?1 AND processed_at < ?2",
                    params![ItemStatus::Completed.code(), cutoff],
                )?;
                Ok(deleted)
            })
            .await?;
        Ok(deleted as u64)
    }

    async fn aggregate_by_status(&self) -> Result<QueueStats, QueueError> {
        let counts = self
            .conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT status, COUNT(*) FROM queue_items GROUP BY status")?;
                let counts = stmt
                    .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(counts)
            })
            .await?;

        let mut stats = QueueStats::default();
        for (code, count) in counts {
            let status = ItemStatus::from_code(code).ok_or_else(|| {
                let err = QueueError::InvariantViolation(format!(
                    "{} items with unknown status {}",
                    count, code
                ));
                error!("{}", err);
                err
            })?;
            stats.record(status, count as u64);
        }
        Ok(stats)
    }

    async fn list_by_status(
        &self,
        status: ItemStatus,
        limit: usize,
    ) -> Result<Vec<QueueItem>, QueueError> {
        let code = status.code();
        let limit = limit as i64;
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM queue_items
                     WHERE status = ?1
                     ORDER BY priority DESC, created_at ASC, id ASC
                     LIMIT ?2",
                    COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![code, limit], read_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        collect_items(rows)
    }
}
