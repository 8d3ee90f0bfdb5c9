//! Read path for finished (or missed) job logs.

use std::sync::Arc;

use thiserror::Error;

use super::models::{JobId, JobLog, LogLevel};
use crate::db::{LogStore, StoreError};

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Serves the durable log of a job in the order it was streamed.
///
/// The registry persists every line before publishing it, so for any job
/// this returns exactly the `log` messages a viewer attached from the start
/// received: same ids, same order, no gaps, no duplicates.
#[derive(Clone)]
pub struct HistoryService {
    store: Arc<dyn LogStore>,
}

impl std::fmt::Debug for HistoryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryService").finish_non_exhaustive()
    }
}

impl HistoryService {
    pub fn new(store: Arc<dyn LogStore>) -> Self {
        Self { store }
    }

    pub async fn logs(
        &self,
        job_id: JobId,
        level: Option<LogLevel>,
    ) -> Result<Vec<JobLog>, HistoryError> {
        self.logs_after(job_id, level, 0).await
    }

    /// Logs with an id strictly greater than `after_id`; used to fill the
    /// gap left by a dropped live connection. Both filters run in the store.
    pub async fn logs_after(
        &self,
        job_id: JobId,
        level: Option<LogLevel>,
        after_id: u64,
    ) -> Result<Vec<JobLog>, HistoryError> {
        if self.store.get_job(job_id).await?.is_none() {
            return Err(HistoryError::NotFound(job_id));
        }
        Ok(self.store.list_logs_after(job_id, level, after_id).await?)
    }
}
