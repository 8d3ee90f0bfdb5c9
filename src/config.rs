use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::auth::TokenGrant;
use crate::core::{BroadcastSettings, RegistrySettings};

pub const DEFAULT_CONFIG_PATH: &str = "jobtail.toml";
const ENV_PREFIX: &str = "JOBTAIL_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub http_bind: SocketAddr,
    pub database_path: PathBuf,
    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
    pub stream: StreamConfig,
    pub auth: AuthConfig,
}

/// Buffer sizes and timings for live streaming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Log lines retained per job for replay to late viewers.
    pub backlog_capacity: usize,
    /// Events buffered per viewer before it is dropped as too slow.
    pub subscriber_buffer: usize,
    /// Seconds a finished job keeps streaming so viewers receive `complete`.
    pub teardown_grace_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            backlog_capacity: 500,
            subscriber_buffer: 500,
            teardown_grace_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub tokens: Vec<TokenGrant>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            http_bind: SocketAddr::from(([127, 0, 0, 1], 8750)),
            database_path: PathBuf::from("jobtail.db"),
            simulation: false,
            verbose: false,
            json_logs: false,
            stream: StreamConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl AppConfig {
    /// Layer defaults, the TOML file, `JOBTAIL_*` environment variables and
    /// command line overrides, in that order of precedence.
    ///
    /// Nested keys use a double underscore in the environment, e.g.
    /// `JOBTAIL_STREAM__SUBSCRIBER_BUFFER=1000`.
    pub fn new<T: Serialize>(config_file: Option<&Path>, overrides: Option<&T>) -> Result<Self> {
        let path = config_file.unwrap_or(Path::new(DEFAULT_CONFIG_PATH));

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        let config: AppConfig = figment
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.stream.subscriber_buffer == 0 {
            bail!("stream.subscriber_buffer must be greater than zero");
        }
        if self.stream.backlog_capacity == 0 {
            bail!("stream.backlog_capacity must be greater than zero");
        }
        for grant in &self.auth.tokens {
            if grant.token.is_empty() {
                bail!("auth token for {} is empty", grant.subject);
            }
        }
        Ok(())
    }

    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            broadcast: BroadcastSettings {
                backlog_capacity: self.stream.backlog_capacity,
                subscriber_buffer: self.stream.subscriber_buffer,
            },
            teardown_grace: Duration::from_secs(self.stream.teardown_grace_secs),
        }
    }

    /// Effective configuration rendered as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }
}
