//! Client for following a job from the command line.
//!
//! [`WatchClient::watch`] keeps a viewer attached to a job across network
//! hiccups: transient closes are retried with bounded exponential backoff,
//! logs missed while disconnected are fetched over REST, and duplicates
//! delivered by the replay are dropped by log id. Every message reaches the
//! caller at most once and logs arrive in id order.

use std::time::Duration;

use futures_util::StreamExt;
use reqwest::{StatusCode, Url};
use thiserror::Error;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use crate::core::{Job, JobId, JobLog, JobStatus};
use crate::web::protocol::{ServerMessage, close_code};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("gave up after {attempts} reconnect attempts")]
    GaveUp { attempts: u32 },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected response: {0}")]
    Protocol(String),

    #[error("invalid daemon url: {0}")]
    InvalidUrl(String),
}

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (zero based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

/// How one WebSocket session ended.
enum SessionEnd {
    Complete(JobStatus),
    /// Closed with a code that rules out reconnecting.
    Rejected { code: u16, reason: String },
    /// Anything worth retrying. `attached` is true if the server accepted us.
    Dropped { attached: bool },
}

pub struct WatchClient {
    base_url: String,
    token: String,
    policy: ReconnectPolicy,
    http: reqwest::Client,
}

impl WatchClient {
    /// `base_url` is the daemon's HTTP root, e.g. `http://127.0.0.1:8750`.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            policy: ReconnectPolicy::default(),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// WebSocket URL for a job's stream. The token is percent-encoded as a
    /// query value.
    fn stream_url(&self, job_id: JobId) -> Result<String, ClientError> {
        let invalid = |reason: String| ClientError::InvalidUrl(format!("{}: {reason}", self.base_url));

        let mut url = Url::parse(&self.base_url).map_err(|e| invalid(e.to_string()))?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => return Err(invalid(format!("unsupported scheme {other}"))),
        };
        url.set_scheme(scheme)
            .map_err(|()| invalid(format!("cannot switch to {scheme}")))?;

        let id = job_id.to_string();
        url.path_segments_mut()
            .map_err(|()| invalid("not a base url".to_string()))?
            .pop_if_empty()
            .extend(["jobs", id.as_str(), "stream"]);
        url.query_pairs_mut().append_pair("token", &self.token);
        Ok(url.into())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        job_id: JobId,
        path: &str,
    ) -> Result<T, ClientError> {
        let resp = self
            .http
            .get(format!("{}{path}", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await?;

        match resp.status() {
            StatusCode::UNAUTHORIZED => Err(ClientError::Unauthorized(resp.text().await?)),
            StatusCode::FORBIDDEN => Err(ClientError::Forbidden(resp.text().await?)),
            StatusCode::NOT_FOUND => Err(ClientError::NotFound(job_id)),
            s if s.is_success() => Ok(resp.json().await?),
            s => Err(ClientError::Protocol(format!("{path} returned {s}"))),
        }
    }

    /// Full ordered log of a job, whatever its state.
    pub async fn history(&self, job_id: JobId) -> Result<Vec<JobLog>, ClientError> {
        self.get_json(job_id, &format!("/jobs/{job_id}/logs")).await
    }

    /// Log lines with an id greater than `after_id`.
    pub async fn history_after(&self, job_id: JobId, after_id: u64) -> Result<Vec<JobLog>, ClientError> {
        self.get_json(job_id, &format!("/jobs/{job_id}/logs?after={after_id}"))
            .await
    }

    pub async fn job(&self, job_id: JobId) -> Result<Job, ClientError> {
        self.get_json(job_id, &format!("/jobs/{job_id}")).await
    }

    /// Follow a job until it completes, passing every message to
    /// `on_message`, and return its final status.
    ///
    /// A job that already finished (or finishes while we are disconnected)
    /// is served from history, followed by a synthesized `complete`.
    pub async fn watch<F>(&self, job_id: JobId, mut on_message: F) -> Result<JobStatus, ClientError>
    where
        F: FnMut(ServerMessage),
    {
        let mut last_log_id = 0u64;
        let mut attempt = 0u32;

        loop {
            let end = self
                .session(job_id, &mut last_log_id, &mut on_message)
                .await?;

            match end {
                SessionEnd::Complete(status) => return Ok(status),
                SessionEnd::Rejected { code, reason } => match code {
                    close_code::UNAUTHORIZED => return Err(ClientError::Unauthorized(reason)),
                    close_code::FORBIDDEN => return Err(ClientError::Forbidden(reason)),
                    _ => {
                        return self
                            .finish_from_history(job_id, &mut last_log_id, &mut on_message)
                            .await;
                    }
                },
                SessionEnd::Dropped { attached } => {
                    if attached {
                        attempt = 0;
                    }
                    if attempt >= self.policy.max_attempts {
                        return Err(ClientError::GaveUp { attempts: attempt });
                    }
                    let delay = self.policy.delay(attempt);
                    attempt += 1;
                    debug!(job_id, attempt, ?delay, "Reconnecting");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn session<F>(
        &self,
        job_id: JobId,
        last_log_id: &mut u64,
        on_message: &mut F,
    ) -> Result<SessionEnd, ClientError>
    where
        F: FnMut(ServerMessage),
    {
        let (mut socket, _) = match connect_async(self.stream_url(job_id)?).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(job_id, error = %e, "Stream connection failed");
                return Ok(SessionEnd::Dropped { attached: false });
            }
        };

        let mut attached = false;
        while let Some(frame) = socket.next().await {
            let text = match frame {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(frame)) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.as_str().to_owned()))
                        .unwrap_or((close_code::NORMAL, String::new()));
                    if close_code::is_final(code) {
                        return Ok(SessionEnd::Rejected { code, reason });
                    }
                    debug!(job_id, code, %reason, "Stream closed before completion");
                    return Ok(SessionEnd::Dropped { attached });
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!(job_id, error = %e, "Stream read failed");
                    return Ok(SessionEnd::Dropped { attached });
                }
            };

            let msg = ServerMessage::decode(text.as_str())
                .map_err(|e| ClientError::Protocol(e.to_string()))?;

            match msg {
                ServerMessage::Connected { .. } => {
                    attached = true;
                    on_message(msg);
                }
                ServerMessage::Log { data } => {
                    if data.id <= *last_log_id {
                        continue;
                    }
                    if data.id > *last_log_id + 1 {
                        self.fill_gap(job_id, last_log_id, data.id, on_message)
                            .await?;
                    }
                    *last_log_id = data.id;
                    on_message(ServerMessage::Log { data });
                }
                ServerMessage::Complete { status } => {
                    on_message(msg);
                    return Ok(SessionEnd::Complete(status));
                }
                ServerMessage::Error { ref message } => {
                    warn!(job_id, %message, "Server reported a stream error");
                    on_message(msg);
                }
                ServerMessage::Status { .. } | ServerMessage::Progress { .. } => on_message(msg),
            }
        }

        Ok(SessionEnd::Dropped { attached })
    }

    /// Emit logs with ids strictly between `last_log_id` and `before`.
    async fn fill_gap<F>(
        &self,
        job_id: JobId,
        last_log_id: &mut u64,
        before: u64,
        on_message: &mut F,
    ) -> Result<(), ClientError>
    where
        F: FnMut(ServerMessage),
    {
        debug!(job_id, from = *last_log_id, to = before, "Filling log gap from history");
        for data in self.history_after(job_id, *last_log_id).await? {
            if data.id > *last_log_id && data.id < before {
                *last_log_id = data.id;
                on_message(ServerMessage::Log { data });
            }
        }
        Ok(())
    }

    async fn finish_from_history<F>(
        &self,
        job_id: JobId,
        last_log_id: &mut u64,
        on_message: &mut F,
    ) -> Result<JobStatus, ClientError>
    where
        F: FnMut(ServerMessage),
    {
        let job = self.job(job_id).await?;
        self.fill_gap(job_id, last_log_id, u64::MAX, on_message)
            .await?;

        if !job.status.is_terminal() {
            return Err(ClientError::Protocol(format!(
                "job {job_id} is {} but not streamable",
                job.status
            )));
        }
        on_message(ServerMessage::Complete { status: job.status });
        Ok(job.status)
    }
}
