//! Durable store for job records and their append-only logs.
//!
//! The registry writes every job transition and every log line here before
//! publishing it, which is what lets the history endpoint return exactly
//! the stream a live viewer saw.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use thiserror::Error;

use crate::core::{Job, JobId, JobLog, LogLevel};

mod sqlite;

pub use sqlite::SqliteLogStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("corrupt row in {table}: {reason}")]
    Corrupt { table: &'static str, reason: String },

    #[error("log {log_id} for job {job_id} already exists")]
    DuplicateLog { job_id: JobId, log_id: u64 },

    #[error("job {0} already exists")]
    DuplicateJob(JobId),

    #[error("id {0} does not fit the store's key range")]
    IdOutOfRange(u64),
}

#[async_trait]
pub trait LogStore: Send + Sync {
    /// Store a new job record. Fails with `DuplicateJob` if the id is taken.
    async fn insert_job(&self, job: &Job) -> Result<(), StoreError>;

    /// Insert or replace a job record.
    async fn save_job(&self, job: &Job) -> Result<(), StoreError>;

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError>;

    /// Highest job id ever stored, used to continue id allocation.
    async fn max_job_id(&self) -> Result<Option<JobId>, StoreError>;

    async fn append_log(&self, log: &JobLog) -> Result<(), StoreError>;

    /// Logs of a job with an id greater than `after_id`, ordered by id and
    /// optionally restricted to one level.
    async fn list_logs_after(
        &self,
        job_id: JobId,
        level: Option<LogLevel>,
        after_id: u64,
    ) -> Result<Vec<JobLog>, StoreError>;

    /// All logs of a job ordered by id, optionally restricted to one level.
    async fn list_logs(
        &self,
        job_id: JobId,
        level: Option<LogLevel>,
    ) -> Result<Vec<JobLog>, StoreError> {
        self.list_logs_after(job_id, level, 0).await
    }
}

/// Non-durable store for tests and throwaway demo runs.
#[derive(Debug, Default)]
pub struct MemoryLogStore {
    jobs: Mutex<HashMap<JobId, Job>>,
    logs: Mutex<HashMap<JobId, Vec<JobLog>>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        match lock(&self.jobs).entry(job.id) {
            Entry::Occupied(_) => Err(StoreError::DuplicateJob(job.id)),
            Entry::Vacant(slot) => {
                slot.insert(job.clone());
                Ok(())
            }
        }
    }

    async fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        lock(&self.jobs).insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(lock(&self.jobs).get(&job_id).cloned())
    }

    async fn max_job_id(&self) -> Result<Option<JobId>, StoreError> {
        Ok(lock(&self.jobs).keys().max().copied())
    }

    async fn append_log(&self, log: &JobLog) -> Result<(), StoreError> {
        let mut logs = lock(&self.logs);
        let entries = logs.entry(log.job_id).or_default();
        if entries.last().is_some_and(|last| last.id >= log.id) {
            return Err(StoreError::DuplicateLog {
                job_id: log.job_id,
                log_id: log.id,
            });
        }
        entries.push(log.clone());
        Ok(())
    }

    async fn list_logs_after(
        &self,
        job_id: JobId,
        level: Option<LogLevel>,
        after_id: u64,
    ) -> Result<Vec<JobLog>, StoreError> {
        let logs = lock(&self.logs);
        Ok(logs
            .get(&job_id)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|l| l.id > after_id && level.is_none_or(|lvl| l.level == lvl))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
