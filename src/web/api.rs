//! REST endpoints: job record, current progress, history and cancellation.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::WebState;
use crate::auth::{AuthError, Identity};
use crate::core::{CancelOutcome, HistoryError, Job, JobId, JobLog, JobProgress, LogLevel, RegistryError};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Unauthorized(#[from] AuthError),

    #[error("insufficient role")]
    Forbidden,

    #[error("job {0} not found")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("internal error")]
    Internal(String),
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(id) => Self::NotFound(id.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<HistoryError> for ApiError {
    fn from(e: HistoryError) -> Self {
        match e {
            HistoryError::NotFound(id) => Self::NotFound(id.to_string()),
            HistoryError::Store(e) => Self::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(detail) => {
                tracing::error!(error = %detail, "Request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery {
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub level: Option<String>,
    /// Only lines with a larger id.
    #[serde(default)]
    pub after: Option<u64>,
    #[serde(default)]
    pub token: Option<String>,
}

/// Bearer token from the `Authorization` header, falling back to `?token=`.
fn bearer<'a>(headers: &'a HeaderMap, query: Option<&'a str>) -> &'a str {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or(query)
        .unwrap_or_default()
}

fn parse_id(raw: &str) -> Result<JobId, ApiError> {
    raw.parse().map_err(|_| ApiError::NotFound(raw.to_string()))
}

/// Authenticate and load the job, checking read access.
async fn readable_job(
    state: &WebState,
    headers: &HeaderMap,
    token: Option<&str>,
    raw_id: &str,
) -> Result<(Identity, Job), ApiError> {
    let identity = state.ctx.auth.validate(bearer(headers, token)).await?;
    let job = state.ctx.registry.get(parse_id(raw_id)?).await?;
    if !identity.can_read(&job) {
        return Err(ApiError::Forbidden);
    }
    Ok((identity, job))
}

pub async fn get_job(
    State(state): State<WebState>,
    Path(raw_id): Path<String>,
    Query(q): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<Json<Job>, ApiError> {
    let (_, job) = readable_job(&state, &headers, q.token.as_deref(), &raw_id).await?;
    Ok(Json(job))
}

/// `GET /jobs/{id}/logs[?level=][&after=]`: the ordered log of a job in
/// any state.
pub async fn job_logs(
    State(state): State<WebState>,
    Path(raw_id): Path<String>,
    Query(q): Query<LogsQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<JobLog>>, ApiError> {
    let (_, job) = readable_job(&state, &headers, q.token.as_deref(), &raw_id).await?;
    let level = q
        .level
        .as_deref()
        .map(str::parse::<LogLevel>)
        .transpose()
        .map_err(ApiError::BadRequest)?;

    let logs = state
        .ctx
        .history
        .logs_after(job.id, level, q.after.unwrap_or(0))
        .await?;
    Ok(Json(logs))
}

pub async fn job_progress(
    State(state): State<WebState>,
    Path(raw_id): Path<String>,
    Query(q): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<Json<JobProgress>, ApiError> {
    let (_, job) = readable_job(&state, &headers, q.token.as_deref(), &raw_id).await?;
    state
        .ctx
        .registry
        .progress(job.id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(raw_id))
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub job_id: JobId,
    pub outcome: CancelOutcome,
}

pub async fn cancel_job(
    State(state): State<WebState>,
    Path(raw_id): Path<String>,
    Query(q): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<Json<CancelResponse>, ApiError> {
    let (identity, job) = readable_job(&state, &headers, q.token.as_deref(), &raw_id).await?;
    if !identity.can_operate(&job) {
        return Err(ApiError::Forbidden);
    }

    let outcome = state.ctx.registry.cancel_request(job.id).await?;
    tracing::info!(job_id = job.id, subject = %identity.subject, ?outcome, "Cancel requested over HTTP");
    Ok(Json(CancelResponse {
        job_id: job.id,
        outcome,
    }))
}

#[derive(Debug, Serialize)]
pub struct Health {
    pub version: &'static str,
    pub uptime_secs: u64,
    pub active_jobs: usize,
    pub simulation: bool,
}

pub async fn health(State(state): State<WebState>) -> Json<Health> {
    Json(Health {
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.ctx.started_at.elapsed().as_secs(),
        active_jobs: state.ctx.registry.active_count(),
        simulation: state.ctx.config.simulation,
    })
}
