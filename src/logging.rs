//! Tracing setup for the jobtail daemon and client.
//!
//! Console output is human readable by default; `json_logs` switches to
//! one JSON object per line for log shippers. `RUST_LOG` overrides the
//! default filter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::AppConfig;

#[derive(Debug, Default, Clone, Copy)]
pub struct LogConfig {
    /// Output logs as JSON (for machine parsing)
    pub json: bool,
    /// Enable verbose logging (sets default level to DEBUG)
    pub verbose: bool,
}

impl From<&AppConfig> for LogConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            json: config.json_logs,
            verbose: config.verbose,
        }
    }
}

/// Install the global subscriber. Call once, early in `main`.
///
/// ```ignore
/// jobtail::logging::init(LogConfig { verbose: true, ..Default::default() });
/// ```
pub fn init(config: LogConfig) {
    let default_level = if config.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("jobtail={}", default_level.as_str().to_lowercase()))
    });
    let registry = tracing_subscriber::registry().with(env_filter);

    if config.json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(false)
                    .with_target(true),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(config.verbose)
                    .with_file(false)
                    .with_line_number(false),
            )
            .init();
    }
}

/// A rate limiter for chatty log sites such as per-tick progress.
///
/// ```ignore
/// let throttle = LogThrottle::new(Duration::from_secs(2));
/// if throttle.should_log() {
///     tracing::debug!(job_id, percent, "Progress");
/// }
/// ```
#[derive(Debug)]
pub struct LogThrottle {
    interval: Duration,
    origin: Instant,
    /// Earliest time, in ms since `origin`, at which the next line may go out.
    next_ms: AtomicU64,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            origin: Instant::now(),
            next_ms: AtomicU64::new(0),
        }
    }

    /// True for at most one caller per interval.
    pub fn should_log(&self) -> bool {
        let now = self.origin.elapsed().as_millis() as u64;
        let step = self.interval.as_millis() as u64;
        self.next_ms
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |next| {
                (now >= next).then(|| now.saturating_add(step.max(1)))
            })
            .is_ok()
    }
}
