pub mod broadcaster;
pub mod history;
pub mod models;
pub mod progress;
pub mod registry;

pub use broadcaster::{
    BACKPRESSURE_REASON, BroadcastSettings, Broadcaster, Delivery, JobEvent, Replay, Subscription,
};
pub use history::{HistoryError, HistoryService};
pub use models::{Job, JobId, JobLog, JobStatus, JobType, LogLevel};
pub use progress::{DiskProgress, DiskStatus, JobProgress, OverallProgress, Phase, ProgressError};
pub use registry::{
    CancelOutcome, JobRegistry, MAX_JOB_ID, RegistryError, RegistrySettings, Transition,
};
