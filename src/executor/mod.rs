//! Job executors that drive the registry.
//!
//! Real backup work happens outside this crate; the simulated executor
//! stands in for it in demos and tests by producing a realistic stream of
//! logs and progress snapshots.

mod simulated;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::core::{JobRegistry, JobType};

pub use simulated::{SimulatedDisk, SimulatedExecutor};

/// Start a background loop that launches a simulated backup every
/// `interval`, cycling through a few fake resources.
pub fn spawn_demo_jobs(registry: Arc<JobRegistry>, interval: Duration) -> JoinHandle<()> {
    const RESOURCES: [&str; 3] = ["vm-web-01", "vm-db-01", "ct-cache"];

    tokio::spawn(async move {
        for round in 0usize.. {
            let resource = RESOURCES[round % RESOURCES.len()];
            match registry.create(JobType::Backup, resource).await {
                Ok(job) => {
                    info!(job_id = job.id, resource, "Launching simulated backup");
                    let executor = SimulatedExecutor::new(registry.clone());
                    tokio::spawn(async move {
                        let _ = executor.run(job.id).await;
                    });
                }
                Err(e) => error!(error = %e, "Failed to create demo job"),
            }
            tokio::time::sleep(interval).await;
        }
    })
}
