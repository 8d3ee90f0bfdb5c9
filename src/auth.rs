//! Bearer token validation for viewers.
//!
//! Token issuance lives elsewhere; this crate only consumes a validated
//! identity through [`AuthService`]. [`StaticTokenAuth`] is the
//! config-driven implementation used by the daemon.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::Job;

/// Access level, ordered from least to most privileged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Operator,
    Admin,
}

/// A validated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub subject: String,
    pub role: Role,
    /// Resources this identity may see. `None` means all of them.
    pub resources: Option<Vec<String>>,
}

impl Identity {
    fn covers(&self, job: &Job) -> bool {
        self.resources
            .as_ref()
            .is_none_or(|allowed| allowed.iter().any(|r| r == &job.resource))
    }

    /// Read access to the job's logs, progress and live stream.
    pub fn can_read(&self, job: &Job) -> bool {
        self.role >= Role::Viewer && self.covers(job)
    }

    /// Permission to cancel the job.
    pub fn can_operate(&self, job: &Job) -> bool {
        self.role >= Role::Operator && self.covers(job)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    Missing,

    #[error("invalid bearer token")]
    Invalid,

    #[error("bearer token expired at {0}")]
    Expired(DateTime<Utc>),
}

#[async_trait]
pub trait AuthService: Send + Sync {
    async fn validate(&self, token: &str) -> Result<Identity, AuthError>;
}

/// One configured token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenGrant {
    pub token: String,
    pub subject: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Validates tokens against a fixed table from the configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenAuth {
    grants: HashMap<String, TokenGrant>,
}

impl StaticTokenAuth {
    pub fn new(grants: impl IntoIterator<Item = TokenGrant>) -> Self {
        Self {
            grants: grants
                .into_iter()
                .map(|grant| (grant.token.clone(), grant))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}

#[async_trait]
impl AuthService for StaticTokenAuth {
    async fn validate(&self, token: &str) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Missing);
        }
        let grant = self.grants.get(token).ok_or(AuthError::Invalid)?;

        if let Some(expires_at) = grant.expires_at
            && expires_at <= Utc::now()
        {
            return Err(AuthError::Expired(expires_at));
        }

        Ok(Identity {
            subject: grant.subject.clone(),
            role: grant.role,
            resources: grant.resources.clone(),
        })
    }
}
