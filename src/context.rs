use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};

use crate::auth::{AuthService, StaticTokenAuth};
use crate::config::AppConfig;
use crate::core::{HistoryService, JobRegistry};
use crate::db::{LogStore, SqliteLogStore};

/// Shared handles for the daemon, cloned into every request handler.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub registry: Arc<JobRegistry>,
    pub history: HistoryService,
    pub auth: Arc<dyn AuthService>,
    pub started_at: Instant,
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl AppContext {
    /// Assemble the context around an already opened store.
    pub async fn new(
        config: AppConfig,
        store: Arc<dyn LogStore>,
        auth: Arc<dyn AuthService>,
    ) -> Result<Self> {
        let registry = JobRegistry::open(store.clone(), config.registry_settings())
            .await
            .context("Failed to initialise job registry")?;

        Ok(Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            history: HistoryService::new(store),
            auth,
            started_at: Instant::now(),
        })
    }

    /// Open the SQLite store named in the config and use its token table
    /// for authentication.
    pub async fn from_config(config: AppConfig) -> Result<Self> {
        let store = SqliteLogStore::open(&config.database_path)
            .await
            .with_context(|| format!("Failed to open {}", config.database_path.display()))?;
        let auth = StaticTokenAuth::new(config.auth.tokens.clone());
        if auth.is_empty() {
            tracing::warn!("No auth tokens configured; every viewer will be rejected");
        }

        Self::new(config, Arc::new(store), Arc::new(auth)).await
    }
}
