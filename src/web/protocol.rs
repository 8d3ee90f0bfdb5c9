//! Messages exchanged on the job stream WebSocket.
//!
//! Every frame is a JSON text message with a `type` discriminator. The same
//! enum is used by the server session and by the `watch` client, so a new
//! message kind is a compile error on both sides until it is handled.

use serde::{Deserialize, Serialize};

use crate::core::{JobEvent, JobLog, JobProgress, JobStatus};

/// Close codes sent by the server.
pub mod close_code {
    /// Normal completion, or a per-connection fault already reported with
    /// an `error` message.
    pub const NORMAL: u16 = 1000;
    /// Missing, invalid or expired token.
    pub const UNAUTHORIZED: u16 = 4001;
    /// Authenticated but not allowed to read the job.
    pub const FORBIDDEN: u16 = 4003;
    /// Unknown job, or a job that is no longer streaming.
    pub const NOT_STREAMABLE: u16 = 4004;

    /// Codes after which reconnecting to the live endpoint is pointless.
    pub fn is_final(code: u16) -> bool {
        matches!(code, UNAUTHORIZED | FORBIDDEN | NOT_STREAMABLE)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected { status: JobStatus },
    Log { data: JobLog },
    Status { status: JobStatus },
    Progress { data: JobProgress },
    Complete { status: JobStatus },
    Error { message: String },
}

impl ServerMessage {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

impl From<JobEvent> for ServerMessage {
    fn from(event: JobEvent) -> Self {
        match event {
            JobEvent::Log(data) => Self::Log { data },
            JobEvent::Progress(data) => Self::Progress { data },
            JobEvent::Status(status) => Self::Status { status },
            JobEvent::Complete { status } => Self::Complete { status },
        }
    }
}
