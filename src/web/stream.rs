//! Live job stream over WebSocket.
//!
//! `GET /jobs/{id}/stream?token=…` upgrades to a WebSocket that carries
//! [`ServerMessage`]s. The handshake runs before the upgrade; a rejected
//! viewer still gets a WebSocket, but the first and only frame is a close
//! frame carrying the reason code (4001, 4003, 4004).

use std::time::Duration;

use axum::{
    extract::ws::{CloseFrame, Message, WebSocket},
    extract::{Path, Query, State, WebSocketUpgrade},
    response::Response,
};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::WebState;
use super::protocol::{ServerMessage, close_code};
use crate::core::{
    BACKPRESSURE_REASON, Delivery, JobId, JobStatus, RegistryError, Replay, Subscription,
};

/// A write that takes longer than this means the viewer is gone.
const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Close code for unexpected server-side failures during the handshake.
const INTERNAL_ERROR: u16 = 1011;

#[derive(Debug, Default, Deserialize)]
pub struct StreamParams {
    #[serde(default)]
    pub token: Option<String>,
}

struct Rejection {
    code: u16,
    reason: String,
}

impl Rejection {
    fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

struct Attached {
    subject: String,
    subscription: Subscription,
    replay: Replay,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<WebState>,
    Path(raw_id): Path<String>,
    Query(params): Query<StreamParams>,
) -> Response {
    match handshake(&state, &raw_id, params.token.as_deref()).await {
        Ok(attached) => ws.on_upgrade(move |socket| run_session(socket, attached)),
        Err(rejection) => {
            debug!(job = %raw_id, code = rejection.code, reason = %rejection.reason, "Stream rejected");
            ws.on_upgrade(move |socket| reject(socket, rejection))
        }
    }
}

/// Token, job lookup, permission, then attachment to the broadcaster.
async fn handshake(
    state: &WebState,
    raw_id: &str,
    token: Option<&str>,
) -> Result<Attached, Rejection> {
    let ctx = &state.ctx;

    let identity = ctx
        .auth
        .validate(token.unwrap_or_default())
        .await
        .map_err(|e| Rejection::new(close_code::UNAUTHORIZED, e.to_string()))?;

    let job_id: JobId = raw_id
        .parse()
        .map_err(|_| Rejection::new(close_code::NOT_STREAMABLE, "job not found"))?;

    let job = ctx.registry.get(job_id).await.map_err(attach_rejection)?;
    if !identity.can_read(&job) {
        return Err(Rejection::new(close_code::FORBIDDEN, "insufficient role"));
    }
    if job.status.is_terminal() {
        return Err(Rejection::new(close_code::NOT_STREAMABLE, "job is not streamable"));
    }

    let (subscription, replay) = ctx.registry.attach(job_id).await.map_err(attach_rejection)?;

    Ok(Attached {
        subject: identity.subject,
        subscription,
        replay,
    })
}

fn attach_rejection(e: RegistryError) -> Rejection {
    match e {
        RegistryError::NotFound(_) => Rejection::new(close_code::NOT_STREAMABLE, "job not found"),
        RegistryError::NotStreamable(_) | RegistryError::JobNotActive { .. } => {
            Rejection::new(close_code::NOT_STREAMABLE, "job is not streamable")
        }
        other => {
            warn!(error = %other, "Stream handshake failed");
            Rejection::new(INTERNAL_ERROR, "internal error")
        }
    }
}

async fn reject(mut socket: WebSocket, rejection: Rejection) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: rejection.code,
            reason: rejection.reason.into(),
        })))
        .await;
}

/// How a session ended.
enum SessionEnd {
    /// Terminal event delivered.
    Completed(JobStatus),
    /// Fault local to this viewer, to be reported before closing.
    Fault(String),
    /// Broadcaster went away without a terminal event.
    Closed,
    /// The viewer disconnected or the socket failed.
    ClientGone,
}

enum SendError {
    Encode(serde_json::Error),
    Socket,
}

async fn send(socket: &mut WebSocket, msg: &ServerMessage) -> Result<(), SendError> {
    let text = msg.encode().map_err(SendError::Encode)?;
    match tokio::time::timeout(SEND_TIMEOUT, socket.send(Message::Text(text.into()))).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) | Err(_) => Err(SendError::Socket),
    }
}

/// Turn a send failure into the session outcome it implies.
fn send_failed(e: SendError) -> SessionEnd {
    match e {
        SendError::Encode(e) => SessionEnd::Fault(format!("serialization error: {e}")),
        SendError::Socket => SessionEnd::ClientGone,
    }
}

async fn run_session(mut socket: WebSocket, attached: Attached) {
    let Attached {
        subject,
        mut subscription,
        replay,
    } = attached;
    let job_id = subscription.job_id();
    let subscriber = subscription.id();

    info!(job_id, %subscriber, %subject, backlog = replay.logs.len(), "Viewer attached");

    let end = stream_events(&mut socket, &mut subscription, replay).await;
    drop(subscription);

    match end {
        SessionEnd::Completed(status) => {
            debug!(job_id, %subscriber, %status, "Stream complete");
            close(&mut socket, close_code::NORMAL, "job complete").await;
        }
        SessionEnd::Fault(reason) => {
            warn!(job_id, %subscriber, %reason, "Closing viewer after fault");
            let _ = send(&mut socket, &ServerMessage::Error { message: reason }).await;
            close(&mut socket, close_code::NORMAL, "").await;
        }
        SessionEnd::Closed => close(&mut socket, close_code::NORMAL, "stream closed").await,
        SessionEnd::ClientGone => debug!(job_id, %subscriber, "Viewer disconnected"),
    }
}

async fn close(socket: &mut WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn stream_events(
    socket: &mut WebSocket,
    subscription: &mut Subscription,
    replay: Replay,
) -> SessionEnd {
    let greeting = std::iter::once(ServerMessage::Connected {
        status: replay.status,
    })
    .chain(replay.logs.into_iter().map(|data| ServerMessage::Log { data }))
    .chain(replay.progress.map(|data| ServerMessage::Progress { data }));

    for msg in greeting {
        if let Err(e) = send(socket, &msg).await {
            return send_failed(e);
        }
    }

    loop {
        tokio::select! {
            delivery = subscription.next() => match delivery {
                Delivery::Event(event) => {
                    let msg = ServerMessage::from(event);
                    if let Err(e) = send(socket, &msg).await {
                        return send_failed(e);
                    }
                    if let ServerMessage::Complete { status } = msg {
                        return SessionEnd::Completed(status);
                    }
                }
                Delivery::Evicted => return SessionEnd::Fault(BACKPRESSURE_REASON.to_string()),
                Delivery::Closed => return SessionEnd::Closed,
            },
            incoming = socket.recv() => match incoming {
                // Viewers have nothing to say; anything but a close is ignored.
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return SessionEnd::ClientGone,
                Some(Ok(_)) => {}
            },
        }
    }
}
