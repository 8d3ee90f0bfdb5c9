use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::core::{
    DiskProgress, DiskStatus, JobId, JobProgress, JobRegistry, JobStatus, LogLevel, Phase,
    RegistryError, progress::percent_of,
};

/// A fake disk to "transfer".
#[derive(Debug, Clone)]
pub struct SimulatedDisk {
    pub target: String,
    pub size_bytes: u64,
}

impl SimulatedDisk {
    pub fn new(target: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            target: target.into(),
            size_bytes,
        }
    }
}

/// Walks a job through every phase, reporting logs and progress through
/// the registry the way a real executor would.
pub struct SimulatedExecutor {
    registry: Arc<JobRegistry>,
    pub disks: Vec<SimulatedDisk>,
    pub speed_bytes_per_sec: u64,
    pub tick: Duration,
    /// Disk that fails halfway through its transfer.
    pub fail_disk: Option<String>,
}

impl SimulatedExecutor {
    pub fn new(registry: Arc<JobRegistry>) -> Self {
        Self {
            registry,
            disks: vec![
                SimulatedDisk::new("vda", 1024 * 1024 * 512),
                SimulatedDisk::new("vdb", 1024 * 1024 * 256),
            ],
            speed_bytes_per_sec: 100 * 1024 * 1024,
            tick: Duration::from_millis(500),
            fail_disk: None,
        }
    }

    /// Run the job to a terminal state and return that state.
    ///
    /// If the registry refuses one of the executor's own updates the job
    /// is failed with the refusal as its error message.
    pub async fn run(&self, job_id: JobId) -> Result<JobStatus, RegistryError> {
        match self.execute(job_id).await {
            Ok(status) => Ok(status),
            Err(e) => {
                error!(job_id, error = %e, "Simulated job aborted");
                let _ = self
                    .registry
                    .complete(job_id, JobStatus::Failed, Some(e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    /// Sleep one tick; true when cancellation arrived first.
    async fn pause(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(self.tick) => false,
        }
    }

    async fn cancelled(&self, job_id: JobId) -> Result<JobStatus, RegistryError> {
        self.registry
            .append_log(job_id, LogLevel::Warning, "Cancelled on request", None)
            .await?;
        self.registry
            .complete(job_id, JobStatus::Cancelled, None)
            .await?;
        Ok(JobStatus::Cancelled)
    }

    async fn execute(&self, job_id: JobId) -> Result<JobStatus, RegistryError> {
        let registry = &self.registry;
        let cancel = registry
            .cancellation_token(job_id)
            .ok_or(RegistryError::NotFound(job_id))?;

        let job = registry.start(job_id).await?;
        registry
            .append_log(
                job_id,
                LogLevel::Info,
                format!(
                    "Starting {} of {} ({} disks)",
                    job.job_type.as_str().to_lowercase(),
                    job.resource,
                    self.disks.len()
                ),
                None,
            )
            .await?;

        let mut progress = JobProgress::preparing(
            self.disks
                .iter()
                .map(|d| DiskProgress::new(d.target.clone(), d.size_bytes))
                .collect(),
        );
        registry.update_progress(job_id, progress.clone()).await?;
        if self.pause(&cancel).await {
            return self.cancelled(job_id).await;
        }

        progress.overall.current_phase = Phase::DiskTransfer;
        let chunk = (self.speed_bytes_per_sec as f64 * self.tick.as_secs_f64()).max(1.0) as u64;

        for (index, disk) in self.disks.iter().enumerate() {
            progress.overall.current_disk_index = index as u32;
            registry
                .append_log(
                    job_id,
                    LogLevel::Info,
                    format!("Transferring disk {}", disk.target),
                    None,
                )
                .await?;

            let mut copied = 0u64;
            loop {
                let current = &mut progress.disks[index];
                current.status = DiskStatus::Transferring;
                current.bytes_transferred = copied;
                current.percent = percent_of(copied, disk.size_bytes);
                current.transfer_rate_bps = self.speed_bytes_per_sec;

                if self.fail_disk.as_deref() == Some(disk.target.as_str())
                    && current.percent >= 50.0
                {
                    current.status = DiskStatus::Failed;
                    current.transfer_rate_bps = 0;
                    progress.recompute_overall();
                    registry.update_progress(job_id, progress.clone()).await?;

                    let mut details = serde_json::Map::new();
                    details.insert("disk".into(), disk.target.clone().into());
                    details.insert("offset".into(), copied.into());
                    let reason = format!("disk read error on {}", disk.target);
                    registry
                        .append_log(job_id, LogLevel::Error, reason.clone(), Some(details))
                        .await?;
                    registry
                        .complete(job_id, JobStatus::Failed, Some(reason))
                        .await?;
                    return Ok(JobStatus::Failed);
                }

                if copied >= disk.size_bytes {
                    current.status = DiskStatus::Completed;
                    current.transfer_rate_bps = 0;
                    progress.recompute_overall();
                    registry.update_progress(job_id, progress.clone()).await?;
                    break;
                }

                progress.recompute_overall();
                registry.update_progress(job_id, progress.clone()).await?;
                if self.pause(&cancel).await {
                    return self.cancelled(job_id).await;
                }
                copied = (copied + chunk).min(disk.size_bytes);
            }

            registry
                .append_log(
                    job_id,
                    LogLevel::Info,
                    format!("Disk {} transferred", disk.target),
                    None,
                )
                .await?;
        }

        for phase in [Phase::Archiving, Phase::Encrypting, Phase::Uploading] {
            progress.overall.current_phase = phase;
            progress.overall.eta_seconds = None;
            registry
                .append_log(job_id, LogLevel::Info, format!("Phase {}", phase.as_str()), None)
                .await?;

            for step in 0..=4u32 {
                progress.overall.percent = f64::from(step) * 25.0;
                registry.update_progress(job_id, progress.clone()).await?;
                if step < 4 && self.pause(&cancel).await {
                    return self.cancelled(job_id).await;
                }
            }
        }

        registry
            .append_log(job_id, LogLevel::Info, "Backup finished", None)
            .await?;
        registry
            .complete(job_id, JobStatus::Completed, None)
            .await?;
        info!(job_id, "Simulated job completed");
        Ok(JobStatus::Completed)
    }
}
