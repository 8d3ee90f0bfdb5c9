use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{OptionalExtension, ffi};
use tokio_rusqlite::{Connection, params, rusqlite};

use super::{LogStore, StoreError};
use crate::core::{Job, JobId, JobLog, LogLevel};

/// SQLite-backed log store.
#[derive(Clone)]
pub struct SqliteLogStore {
    conn: Connection,
}

impl std::fmt::Debug for SqliteLogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteLogStore").finish_non_exhaustive()
    }
}

fn db_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Database(e.to_string())
}

fn is_primary_key_violation(e: &tokio_rusqlite::Error) -> bool {
    matches!(
        e,
        tokio_rusqlite::Error::Error(rusqlite::Error::SqliteFailure(
            ffi::Error { extended_code, .. },
            _,
        )) if *extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

/// SQLite integers are signed; ids above `i64::MAX` are refused instead of
/// being stored as negative keys.
fn sql_id(id: u64) -> Result<i64, StoreError> {
    i64::try_from(id).map_err(|_| StoreError::IdOutOfRange(id))
}

fn row_id(table: &'static str, raw: i64) -> Result<u64, StoreError> {
    u64::try_from(raw).map_err(|_| StoreError::Corrupt {
        table,
        reason: format!("negative id {raw}"),
    })
}

// Nanosecond precision so history replays the exact timestamps that were
// streamed live.
fn encode_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn decode_ts(table: &'static str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            table,
            reason: format!("bad timestamp {raw:?}: {e}"),
        })
}

fn corrupt(table: &'static str) -> impl Fn(String) -> StoreError {
    move |reason| StoreError::Corrupt { table, reason }
}

impl SqliteLogStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref()).await.map_err(db_err)?;
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await.map_err(db_err)?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|conn| {
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
            conn.execute_batch(include_str!("schema.sql"))?;

            // Enable foreign keys (SQLite disables them by default!)
            conn.execute("PRAGMA foreign_keys = ON;", [])?;

            Ok::<(), rusqlite::Error>(())
        })
        .await
        .map_err(db_err)?;

        Ok(Self { conn })
    }
}

struct JobRow {
    id: i64,
    job_type: String,
    resource: String,
    status: String,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    error_message: Option<String>,
}

impl JobRow {
    fn into_job(self) -> Result<Job, StoreError> {
        Ok(Job {
            id: row_id("jobs", self.id)?,
            job_type: self.job_type.parse().map_err(corrupt("jobs"))?,
            resource: self.resource,
            status: self.status.parse().map_err(corrupt("jobs"))?,
            created_at: decode_ts("jobs", &self.created_at)?,
            started_at: self
                .started_at
                .as_deref()
                .map(|raw| decode_ts("jobs", raw))
                .transpose()?,
            completed_at: self
                .completed_at
                .as_deref()
                .map(|raw| decode_ts("jobs", raw))
                .transpose()?,
            error_message: self.error_message,
        })
    }
}

struct LogRow {
    job_id: i64,
    id: i64,
    timestamp: String,
    level: String,
    message: String,
    details: Option<String>,
}

impl LogRow {
    fn into_log(self) -> Result<JobLog, StoreError> {
        let details = self
            .details
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| StoreError::Corrupt {
                table: "job_logs",
                reason: format!("bad details: {e}"),
            })?;

        Ok(JobLog {
            id: row_id("job_logs", self.id)?,
            job_id: row_id("job_logs", self.job_id)?,
            timestamp: decode_ts("job_logs", &self.timestamp)?,
            level: self.level.parse().map_err(corrupt("job_logs"))?,
            message: self.message,
            details,
        })
    }
}

#[async_trait]
impl LogStore for SqliteLogStore {
    async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        let id = sql_id(job.id)?;
        let job_type = job.job_type.as_str();
        let resource = job.resource.clone();
        let status = job.status.as_str();
        let created_at = encode_ts(&job.created_at);
        let started_at = job.started_at.as_ref().map(encode_ts);
        let completed_at = job.completed_at.as_ref().map(encode_ts);
        let error_message = job.error_message.clone();

        let result = self
            .conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO jobs (id, job_type, resource, status, created_at,
                                       started_at, completed_at, error_message)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        id,
                        job_type,
                        resource,
                        status,
                        created_at,
                        started_at,
                        completed_at,
                        error_message
                    ],
                )?;
                Ok::<(), rusqlite::Error>(())
            })
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if is_primary_key_violation(&e) => Err(StoreError::DuplicateJob(job.id)),
            Err(e) => Err(db_err(e)),
        }
    }

    async fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        let id = sql_id(job.id)?;
        let job_type = job.job_type.as_str();
        let resource = job.resource.clone();
        let status = job.status.as_str();
        let created_at = encode_ts(&job.created_at);
        let started_at = job.started_at.as_ref().map(encode_ts);
        let completed_at = job.completed_at.as_ref().map(encode_ts);
        let error_message = job.error_message.clone();

        self.conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO jobs (id, job_type, resource, status, created_at,
                                       started_at, completed_at, error_message)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(id) DO UPDATE SET
                        status = excluded.status,
                        started_at = excluded.started_at,
                        completed_at = excluded.completed_at,
                        error_message = excluded.error_message",
                    params![
                        id,
                        job_type,
                        resource,
                        status,
                        created_at,
                        started_at,
                        completed_at,
                        error_message
                    ],
                )?;
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .map_err(db_err)
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        let Ok(id) = sql_id(job_id) else {
            return Ok(None);
        };
        let row = self
            .conn
            .call(move |c| {
                c.query_row(
                    "SELECT id, job_type, resource, status, created_at,
                            started_at, completed_at, error_message
                     FROM jobs WHERE id = ?1",
                    params![id],
                    |row| {
                        Ok(JobRow {
                            id: row.get(0)?,
                            job_type: row.get(1)?,
                            resource: row.get(2)?,
                            status: row.get(3)?,
                            created_at: row.get(4)?,
                            started_at: row.get(5)?,
                            completed_at: row.get(6)?,
                            error_message: row.get(7)?,
                        })
                    },
                )
                .optional()
            })
            .await
            .map_err(db_err)?;

        row.map(JobRow::into_job).transpose()
    }

    async fn max_job_id(&self) -> Result<Option<JobId>, StoreError> {
        let max = self
            .conn
            .call(|c| {
                c.query_row("SELECT MAX(id) FROM jobs", [], |row| {
                    row.get::<_, Option<i64>>(0)
                })
            })
            .await
            .map_err(db_err)?;

        max.map(|id| row_id("jobs", id)).transpose()
    }

    async fn append_log(&self, log: &JobLog) -> Result<(), StoreError> {
        let job_id = sql_id(log.job_id)?;
        let id = sql_id(log.id)?;
        let timestamp = encode_ts(&log.timestamp);
        let level = log.level.as_str();
        let message = log.message.clone();
        let details = log
            .details
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(db_err)?;

        let result = self
            .conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO job_logs (job_id, id, timestamp, level, message, details)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![job_id, id, timestamp, level, message, details],
                )?;
                Ok::<(), rusqlite::Error>(())
            })
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if is_primary_key_violation(&e) => {
                Err(StoreError::DuplicateLog {
                    job_id: log.job_id,
                    log_id: log.id,
                })
            }
            Err(e) => Err(db_err(e)),
        }
    }

    async fn list_logs_after(
        &self,
        job_id: JobId,
        level: Option<LogLevel>,
        after_id: u64,
    ) -> Result<Vec<JobLog>, StoreError> {
        let (Ok(job_id), Ok(after_id)) = (sql_id(job_id), sql_id(after_id)) else {
            return Ok(Vec::new());
        };
        let level = level.map(|l| l.as_str());

        let rows = self
            .conn
            .call(move |c| {
                let mut stmt = c.prepare(
                    "SELECT job_id, id, timestamp, level, message, details
                     FROM job_logs
                     WHERE job_id = ?1 AND id > ?3 AND (?2 IS NULL OR level = ?2)
                     ORDER BY id ASC",
                )?;

                let rows = stmt
                    .query_map(params![job_id, level, after_id], |row| {
                        Ok(LogRow {
                            job_id: row.get(0)?,
                            id: row.get(1)?,
                            timestamp: row.get(2)?,
                            level: row.get(3)?,
                            message: row.get(4)?,
                            details: row.get(5)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                Ok::<Vec<LogRow>, rusqlite::Error>(rows)
            })
            .await
            .map_err(db_err)?;

        rows.into_iter().map(LogRow::into_log).collect()
    }
}
