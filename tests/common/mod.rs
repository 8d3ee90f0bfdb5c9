#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use futures_util::StreamExt;
use jobtail::auth::{Role, StaticTokenAuth, TokenGrant};
use jobtail::config::AppConfig;
use jobtail::context::AppContext;
use jobtail::core::{DiskProgress, JobId, JobProgress, JobRegistry, Phase};
use jobtail::db::{LogStore, MemoryLogStore};
use jobtail::web::{ServerMessage, router};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

pub const VIEWER: &str = "viewer-token";
pub const OPERATOR: &str = "operator-token";
pub const EXPIRED: &str = "expired-token";
/// Viewer restricted to a resource none of the tests use.
pub const SCOPED: &str = "scoped-token";

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestServer {
    pub addr: SocketAddr,
    pub ctx: AppContext,
    pub store: Arc<dyn LogStore>,
}

impl TestServer {
    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.ctx.registry
    }

    pub fn http(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub async fn connect(&self, job_id: JobId, token: &str) -> Ws {
        self.connect_raw(&job_id.to_string(), token).await
    }

    pub async fn connect_raw(&self, job: &str, token: &str) -> Ws {
        let url = format!("ws://{}/jobs/{job}/stream?token={token}", self.addr);
        let (ws, _) = timeout(RECV_TIMEOUT, connect_async(url))
            .await
            .expect("timeout connecting")
            .expect("websocket handshake failed");
        ws
    }
}

fn grants() -> Vec<TokenGrant> {
    let grant = |token: &str, subject: &str, role: Role| TokenGrant {
        token: token.into(),
        subject: subject.into(),
        role,
        resources: None,
        expires_at: None,
    };

    vec![
        grant(VIEWER, "vera", Role::Viewer),
        grant(OPERATOR, "otto", Role::Operator),
        TokenGrant {
            expires_at: Some(Utc::now() - TimeDelta::hours(1)),
            ..grant(EXPIRED, "eve", Role::Admin)
        },
        TokenGrant {
            resources: Some(vec!["vm-elsewhere".into()]),
            ..grant(SCOPED, "sam", Role::Viewer)
        },
    ]
}

pub async fn spawn_server() -> TestServer {
    spawn_server_with(|_| {}).await
}

/// Serve the router on an ephemeral port over an in-memory store.
pub async fn spawn_server_with(configure: impl FnOnce(&mut AppConfig)) -> TestServer {
    let mut config = AppConfig::default();
    config.stream.teardown_grace_secs = 1;
    configure(&mut config);

    let store: Arc<dyn LogStore> = Arc::new(MemoryLogStore::new());
    let ctx = AppContext::new(
        config,
        store.clone(),
        Arc::new(StaticTokenAuth::new(grants())),
    )
    .await
    .unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(ctx.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer { addr, ctx, store }
}

/// Next data message; panics on close, timeout or garbage.
pub async fn recv(ws: &mut Ws) -> ServerMessage {
    loop {
        let frame = timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream ended")
            .expect("websocket error");
        match frame {
            Message::Text(text) => return ServerMessage::decode(text.as_str()).unwrap(),
            Message::Close(frame) => panic!("unexpected close: {frame:?}"),
            _ => continue,
        }
    }
}

/// Read until the close frame and return its code. Data messages before
/// the close are returned alongside.
pub async fn recv_until_close(ws: &mut Ws) -> (Vec<ServerMessage>, u16) {
    let mut messages = Vec::new();
    loop {
        let frame = timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timeout waiting for close")
            .expect("stream ended without close frame")
            .expect("websocket error");
        match frame {
            Message::Text(text) => messages.push(ServerMessage::decode(text.as_str()).unwrap()),
            Message::Close(frame) => {
                let code = frame.map_or(1005, |f| u16::from(f.code));
                return (messages, code);
            }
            _ => continue,
        }
    }
}

/// Snapshot in the disk transfer phase with one disk at `percent`.
pub fn disk_snapshot(percent: f64) -> JobProgress {
    let mut progress = JobProgress::preparing(vec![DiskProgress::new("vda", 100)]);
    progress.overall.current_phase = Phase::DiskTransfer;
    let disk = &mut progress.disks[0];
    disk.status = jobtail::core::DiskStatus::Transferring;
    disk.bytes_transferred = percent as u64;
    disk.percent = percent;
    disk.transfer_rate_bps = 10;
    progress.recompute_overall();
    progress
}

/// Wait until `job_id` has `count` live viewers.
pub async fn wait_for_viewers(registry: &JobRegistry, job_id: JobId, count: usize) {
    timeout(RECV_TIMEOUT, async {
        while registry.subscriber_count(job_id) != count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timeout waiting for viewers");
}
