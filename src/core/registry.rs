//! Authoritative in-memory state for every job that is still streaming.
//!
//! The executor drives jobs exclusively through [`JobRegistry`]. Each
//! mutation takes the job's own async mutex, persists to the [`LogStore`]
//! and then publishes to the job's [`Broadcaster`] before releasing it, so
//! log ids, progress snapshots and status changes reach every viewer in one
//! total order and the durable log never lags the live stream.
//!
//! Entries live in a `job_id → JobEntry` table from `create` until the
//! broadcaster has been drained after the terminal event. After that the
//! job is only reachable through the store.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::broadcaster::{
    BroadcastError, BroadcastSettings, Broadcaster, JobEvent, Replay, Subscription,
};
use super::models::{Job, JobId, JobLog, JobStatus, JobType, LogLevel};
use super::progress::{JobProgress, ProgressError, validate_update};
use crate::db::{LogStore, StoreError};
use crate::logging::LogThrottle;

/// Largest job id the registry hands out or accepts. Stores key jobs by a
/// signed 64-bit integer.
pub const MAX_JOB_ID: JobId = i64::MAX as JobId;

/// Tunables for the registry and the broadcasters it creates.
#[derive(Debug, Clone, Copy)]
pub struct RegistrySettings {
    pub broadcast: BroadcastSettings,
    /// How long a finished job's broadcaster waits for viewers to receive
    /// the terminal event before it is destroyed.
    pub teardown_grace: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            broadcast: BroadcastSettings::default(),
            teardown_grace: Duration::from_secs(5),
        }
    }
}

/// Why a state or progress change was refused.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Transition {
    #[error("status cannot move from {from} to {to}")]
    Status { from: JobStatus, to: JobStatus },

    #[error(transparent)]
    Progress(#[from] ProgressError),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("job {job_id}: invalid transition: {reason}")]
    InvalidTransition { job_id: JobId, reason: Transition },

    #[error("job {job_id} is not active (status {status})")]
    JobNotActive { job_id: JobId, status: JobStatus },

    #[error("job {0} already exists")]
    AlreadyExists(JobId),

    #[error("job id {0} is out of range (max {MAX_JOB_ID})")]
    IdOutOfRange(JobId),

    #[error("job {0} is no longer streaming")]
    NotStreamable(JobId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of [`JobRegistry::cancel_request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The job was running; the executor has been asked to stop and will
    /// report `cancelled` itself.
    Requested,
    /// The job had not started and is now cancelled.
    Cancelled,
    /// Nothing to do, the job had already finished.
    AlreadyTerminal,
}

struct JobState {
    job: Job,
    progress: Option<JobProgress>,
    next_log_id: u64,
    /// Timestamp of the last stored log; later lines never go below it.
    last_log_at: Option<DateTime<Utc>>,
}

struct JobEntry {
    state: tokio::sync::Mutex<JobState>,
    broadcaster: Arc<Broadcaster>,
    cancel: CancellationToken,
    progress_log: LogThrottle,
}

type JobTable = Arc<Mutex<HashMap<JobId, Arc<JobEntry>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Holds a job id between the table check and the store insert. Released on
/// drop, including when the creating future is cancelled.
struct Reservation<'a> {
    ids: &'a Mutex<HashSet<JobId>>,
    id: JobId,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        lock(self.ids).remove(&self.id);
    }
}

pub struct JobRegistry {
    store: Arc<dyn LogStore>,
    settings: RegistrySettings,
    next_job_id: AtomicU64,
    jobs: JobTable,
    /// Ids being created but not yet stored. Always locked after `jobs`.
    reserved: Mutex<HashSet<JobId>>,
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("settings", &self.settings)
            .field("active", &self.active_count())
            .finish()
    }
}

impl JobRegistry {
    /// Create a registry whose job ids continue after the highest id in
    /// `store`.
    pub async fn open(
        store: Arc<dyn LogStore>,
        settings: RegistrySettings,
    ) -> Result<Self, RegistryError> {
        let next = store
            .max_job_id()
            .await?
            .map_or(1, |max| max.saturating_add(1));
        Ok(Self {
            store,
            settings,
            next_job_id: AtomicU64::new(next),
            jobs: Arc::new(Mutex::new(HashMap::new())),
            reserved: Mutex::new(HashSet::new()),
        })
    }

    pub fn store(&self) -> &Arc<dyn LogStore> {
        &self.store
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    fn entry(&self, job_id: JobId) -> Option<Arc<JobEntry>> {
        lock(&self.jobs).get(&job_id).cloned()
    }

    /// Error for a job that is not in the table: either finished and torn
    /// down, or never existed.
    async fn missing(&self, job_id: JobId) -> RegistryError {
        match self.store.get_job(job_id).await {
            Ok(Some(job)) => RegistryError::JobNotActive {
                job_id,
                status: job.status,
            },
            Ok(None) => RegistryError::NotFound(job_id),
            Err(e) => RegistryError::Store(e),
        }
    }

    /// Register a new pending job and open its broadcaster.
    ///
    /// Ids already taken by `create_with_id` are skipped.
    pub async fn create(&self, job_type: JobType, resource: &str) -> Result<Job, RegistryError> {
        loop {
            let id = self.next_job_id.fetch_add(1, Ordering::SeqCst);
            if id > MAX_JOB_ID {
                return Err(RegistryError::IdOutOfRange(id));
            }
            match self.insert(Job::new(id, job_type, resource)).await {
                Err(RegistryError::AlreadyExists(taken)) => {
                    debug!(job_id = taken, "Job id already taken, allocating the next one");
                }
                result => return result,
            }
        }
    }

    /// Register a pending job with a caller-chosen id, for executors that
    /// allocate ids themselves.
    pub async fn create_with_id(
        &self,
        id: JobId,
        job_type: JobType,
        resource: &str,
    ) -> Result<Job, RegistryError> {
        if id > MAX_JOB_ID {
            return Err(RegistryError::IdOutOfRange(id));
        }
        self.next_job_id.fetch_max(id + 1, Ordering::SeqCst);
        self.insert(Job::new(id, job_type, resource)).await
    }

    fn reserve(&self, id: JobId) -> Option<Reservation<'_>> {
        let jobs = lock(&self.jobs);
        let mut reserved = lock(&self.reserved);
        if jobs.contains_key(&id) || !reserved.insert(id) {
            return None;
        }
        Some(Reservation {
            ids: &self.reserved,
            id,
        })
    }

    async fn insert(&self, job: Job) -> Result<Job, RegistryError> {
        let Some(reservation) = self.reserve(job.id) else {
            return Err(RegistryError::AlreadyExists(job.id));
        };

        self.store.insert_job(&job).await.map_err(|e| match e {
            StoreError::DuplicateJob(id) => RegistryError::AlreadyExists(id),
            e => RegistryError::Store(e),
        })?;

        let entry = Arc::new(JobEntry {
            broadcaster: Broadcaster::new(job.id, job.status, self.settings.broadcast),
            cancel: CancellationToken::new(),
            progress_log: LogThrottle::new(Duration::from_secs(2)),
            state: tokio::sync::Mutex::new(JobState {
                job: job.clone(),
                progress: None,
                next_log_id: 1,
                last_log_at: None,
            }),
        });
        lock(&self.jobs).insert(job.id, entry);
        drop(reservation);

        info!(job_id = job.id, job_type = job.job_type.as_str(), resource = %job.resource, "Job created");
        Ok(job)
    }

    /// Move a pending job to running.
    pub async fn start(&self, job_id: JobId) -> Result<Job, RegistryError> {
        let Some(entry) = self.entry(job_id) else {
            return Err(self.missing(job_id).await.into_transition(JobStatus::Running));
        };
        let mut state = entry.state.lock().await;

        if state.job.status != JobStatus::Pending {
            return Err(RegistryError::InvalidTransition {
                job_id,
                reason: Transition::Status {
                    from: state.job.status,
                    to: JobStatus::Running,
                },
            });
        }

        let mut job = state.job.clone();
        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());
        self.store.save_job(&job).await?;
        state.job = job.clone();

        publish(&entry.broadcaster, JobEvent::Status(JobStatus::Running));
        info!(job_id, "Job started");
        Ok(job)
    }

    /// Append a log line, assigning the job's next sequence id.
    ///
    /// Timestamps never decrease along the id order, even if the wall clock
    /// steps backwards.
    ///
    /// The line is persisted before it is published and the id is only
    /// consumed once the store accepted it, so viewers never see a gap.
    pub async fn append_log(
        &self,
        job_id: JobId,
        level: LogLevel,
        message: impl Into<String>,
        details: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<JobLog, RegistryError> {
        let Some(entry) = self.entry(job_id) else {
            return Err(self.missing(job_id).await);
        };
        let mut state = entry.state.lock().await;

        if state.job.status.is_terminal() {
            return Err(RegistryError::JobNotActive {
                job_id,
                status: state.job.status,
            });
        }

        let now = Utc::now();
        let log = JobLog {
            id: state.next_log_id,
            job_id,
            timestamp: state.last_log_at.map_or(now, |last| last.max(now)),
            level,
            message: message.into(),
            details,
        };
        self.store.append_log(&log).await?;
        state.next_log_id += 1;
        state.last_log_at = Some(log.timestamp);

        publish(&entry.broadcaster, JobEvent::Log(log.clone()));
        Ok(log)
    }

    /// Replace the job's progress snapshot after validating it against the
    /// current one. Rejected snapshots leave the canonical state untouched.
    pub async fn update_progress(
        &self,
        job_id: JobId,
        snapshot: JobProgress,
    ) -> Result<(), RegistryError> {
        let Some(entry) = self.entry(job_id) else {
            return Err(self.missing(job_id).await);
        };
        let mut state = entry.state.lock().await;

        if state.job.status.is_terminal() {
            return Err(RegistryError::JobNotActive {
                job_id,
                status: state.job.status,
            });
        }

        if let Err(e) = validate_update(state.progress.as_ref(), &snapshot) {
            warn!(job_id, error = %e, "Rejected progress update");
            return Err(RegistryError::InvalidTransition {
                job_id,
                reason: e.into(),
            });
        }

        if entry.progress_log.should_log() {
            debug!(
                job_id,
                phase = snapshot.overall.current_phase.as_str(),
                percent = snapshot.overall.percent,
                eta = ?snapshot.overall.eta(),
                "Progress"
            );
        }

        state.progress = Some(snapshot.clone());
        publish(&entry.broadcaster, JobEvent::Progress(snapshot));
        Ok(())
    }

    /// Finish a running job.
    ///
    /// `status` must be terminal. Completing a job that is already terminal
    /// is a no-op that returns the stored record and emits nothing.
    pub async fn complete(
        &self,
        job_id: JobId,
        status: JobStatus,
        error_message: Option<String>,
    ) -> Result<Job, RegistryError> {
        let Some(entry) = self.entry(job_id) else {
            return match self.store.get_job(job_id).await? {
                Some(job) if job.status.is_terminal() => Ok(job),
                Some(job) => Err(RegistryError::JobNotActive {
                    job_id,
                    status: job.status,
                }),
                None => Err(RegistryError::NotFound(job_id)),
            };
        };
        let mut state = entry.state.lock().await;

        if state.job.status.is_terminal() {
            debug!(job_id, status = %state.job.status, "Ignoring repeated completion");
            return Ok(state.job.clone());
        }
        if !status.is_terminal() || state.job.status != JobStatus::Running {
            return Err(RegistryError::InvalidTransition {
                job_id,
                reason: Transition::Status {
                    from: state.job.status,
                    to: status,
                },
            });
        }

        self.finish(&entry, &mut state, status, error_message).await
    }

    /// Ask for a job to stop.
    ///
    /// A running job has its cancellation token tripped; the executor is
    /// expected to follow up with `complete(.., Cancelled, ..)`. A pending
    /// job is cancelled on the spot.
    pub async fn cancel_request(&self, job_id: JobId) -> Result<CancelOutcome, RegistryError> {
        let Some(entry) = self.entry(job_id) else {
            return match self.store.get_job(job_id).await? {
                Some(_) => Ok(CancelOutcome::AlreadyTerminal),
                None => Err(RegistryError::NotFound(job_id)),
            };
        };
        let mut state = entry.state.lock().await;

        match state.job.status {
            JobStatus::Running => {
                entry.cancel.cancel();
                info!(job_id, "Cancellation requested");
                Ok(CancelOutcome::Requested)
            }
            JobStatus::Pending => {
                entry.cancel.cancel();
                self.finish(&entry, &mut state, JobStatus::Cancelled, None)
                    .await?;
                Ok(CancelOutcome::Cancelled)
            }
            _ => Ok(CancelOutcome::AlreadyTerminal),
        }
    }

    async fn finish(
        &self,
        entry: &Arc<JobEntry>,
        state: &mut JobState,
        status: JobStatus,
        error_message: Option<String>,
    ) -> Result<Job, RegistryError> {
        let mut job = state.job.clone();
        job.status = status;
        job.completed_at = Some(Utc::now());
        job.error_message = if status == JobStatus::Failed {
            error_message
        } else {
            None
        };
        self.store.save_job(&job).await?;

        state.job = job.clone();
        state.progress = None;
        publish(&entry.broadcaster, JobEvent::Complete { status });

        match &job.error_message {
            Some(reason) => warn!(job_id = job.id, status = %status, error = %reason, "Job finished"),
            None => info!(job_id = job.id, status = %status, "Job finished"),
        }

        self.schedule_teardown(job.id, entry.clone());
        Ok(job)
    }

    fn schedule_teardown(&self, job_id: JobId, entry: Arc<JobEntry>) {
        let jobs = self.jobs.clone();
        let grace = self.settings.teardown_grace;
        tokio::spawn(async move {
            entry.broadcaster.drain(grace).await;
            let mut table = lock(&jobs);
            if table.get(&job_id).is_some_and(|e| Arc::ptr_eq(e, &entry)) {
                table.remove(&job_id);
            }
            debug!(job_id, "Broadcaster torn down");
        });
    }

    /// Attach a live viewer.
    ///
    /// Fails with `NotStreamable` once the job has finished, even while its
    /// broadcaster is still draining.
    pub async fn attach(&self, job_id: JobId) -> Result<(Subscription, Replay), RegistryError> {
        let Some(entry) = self.entry(job_id) else {
            return Err(match self.store.get_job(job_id).await? {
                Some(_) => RegistryError::NotStreamable(job_id),
                None => RegistryError::NotFound(job_id),
            });
        };
        entry.broadcaster.subscribe().map_err(|e| match e {
            BroadcastError::Closed(id) => RegistryError::NotStreamable(id),
        })
    }

    /// Current job record, from memory while active, from the store after.
    pub async fn get(&self, job_id: JobId) -> Result<Job, RegistryError> {
        if let Some(entry) = self.entry(job_id) {
            return Ok(entry.state.lock().await.job.clone());
        }
        self.store
            .get_job(job_id)
            .await?
            .ok_or(RegistryError::NotFound(job_id))
    }

    /// Latest progress snapshot of an active job.
    pub async fn progress(&self, job_id: JobId) -> Option<JobProgress> {
        let entry = self.entry(job_id)?;
        let state = entry.state.lock().await;
        state.progress.clone()
    }

    /// Token the executor watches to learn about cancellation requests.
    pub fn cancellation_token(&self, job_id: JobId) -> Option<CancellationToken> {
        self.entry(job_id).map(|e| e.cancel.clone())
    }

    /// Number of jobs whose broadcaster still exists.
    pub fn active_count(&self) -> usize {
        lock(&self.jobs).len()
    }

    pub fn subscriber_count(&self, job_id: JobId) -> usize {
        self.entry(job_id)
            .map_or(0, |e| e.broadcaster.subscriber_count())
    }
}

fn publish(broadcaster: &Broadcaster, event: JobEvent) {
    // The job mutex is held and the status checked before every publish, so
    // the broadcaster cannot be closed here.
    if let Err(e) = broadcaster.publish(event) {
        warn!(error = %e, "Dropped event for closed broadcaster");
    }
}

impl RegistryError {
    /// `start` reports a job that has already finished as an invalid
    /// transition rather than "not active".
    fn into_transition(self, to: JobStatus) -> Self {
        match self {
            Self::JobNotActive { job_id, status } => Self::InvalidTransition {
                job_id,
                reason: Transition::Status { from: status, to },
            },
            other => other,
        }
    }
}
