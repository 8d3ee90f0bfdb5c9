//! HTTP and WebSocket surface of the daemon.
//!
//! ## Endpoints
//!
//! - `WS /jobs/{id}/stream?token=` - live log/progress stream
//! - `GET /jobs/{id}/logs[?level=][&after=]` - ordered history for a job in any state
//! - `GET /jobs/{id}` - job record
//! - `GET /jobs/{id}/progress` - current progress of an active job
//! - `POST /jobs/{id}/cancel` - request cancellation (operator role)
//! - `GET /health` - daemon status

mod api;
pub mod protocol;
mod stream;

use axum::{
    Router,
    routing::{get, post},
};
use std::net::SocketAddr;
use tokio::sync::broadcast;

use crate::context::AppContext;

pub use api::ApiError;
pub use protocol::{ServerMessage, close_code};

/// Shared state for the web server
#[derive(Clone, Debug)]
pub struct WebState {
    pub ctx: AppContext,
}

/// Build the application router. Exposed so tests can serve it on an
/// ephemeral listener.
pub fn router(ctx: AppContext) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route("/jobs/{id}", get(api::get_job))
        .route("/jobs/{id}/logs", get(api::job_logs))
        .route("/jobs/{id}/progress", get(api::job_progress))
        .route("/jobs/{id}/cancel", post(api::cancel_job))
        .route("/jobs/{id}/stream", get(stream::ws_handler))
        .with_state(WebState { ctx })
}

/// HTTP server for live streaming and history.
pub struct WebServer {
    bind_addr: SocketAddr,
    ctx: AppContext,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebServer {
    pub fn new(ctx: AppContext, bind_addr: SocketAddr) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            bind_addr,
            ctx,
            shutdown_tx,
        }
    }

    /// Start the web server. Runs until shutdown() is called.
    pub async fn start(&self) -> anyhow::Result<()> {
        let app = router(self.ctx.clone());

        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;
        tracing::info!(addr = %self.bind_addr, "Job stream server listening");

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await?;

        Ok(())
    }

    /// Signal the server to shut down gracefully.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }
}
