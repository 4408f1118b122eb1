//! Typed error kinds crossing component and process boundaries.
//!
//! The grid distinguishes terminal failures (`SessionNotCreated`) from
//! transient ones (`RetrySessionRequest`) so the scheduler can convert the
//! latter into a head-retry instead of a user-visible error. Transport
//! failures at the intra-cluster boundary are their own kind; during
//! `newSession` they are treated as retryable.

use crate::ids::{NodeId, SessionId};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum GridError {
    /// Terminal: the request ends with this.
    #[error("session not created: {0}")]
    SessionNotCreated(String),

    /// Transient cause; the scheduler re-inserts the request at the queue head.
    #[error("session not created, retry is possible: {0}")]
    RetrySessionRequest(String),

    /// Request expired while waiting in the queue.
    #[error("new session request timed out: {0}")]
    Timeout(String),

    #[error("no such session: {0}")]
    NoSuchSession(SessionId),

    #[error("no such node: {0}")]
    NoSuchNode(NodeId),

    #[error("session already exists: {0}")]
    SessionExists(SessionId),

    /// Intra-cluster mutation without a matching registration secret.
    #[error("registration secret missing or does not match")]
    UnauthorizedSecret,

    /// Bad configuration at start-up; the process exits.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O failure at the intra-cluster boundary.
    #[error("transport failure: {0}")]
    Transport(String),
}

impl GridError {
    /// Whether the scheduler may retry the request instead of rejecting it.
    /// Transport failures count: a node that dropped the connection mid
    /// `newSession` may be healthy again on the next tick.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GridError::RetrySessionRequest(_) | GridError::Transport(_)
        )
    }

    /// Wire discriminator carried in error bodies so remote handles can
    /// reconstruct the kind.
    pub fn code(&self) -> &'static str {
        match self {
            GridError::SessionNotCreated(_) => "session-not-created",
            GridError::RetrySessionRequest(_) => "retry-session-request",
            GridError::Timeout(_) => "timeout",
            GridError::NoSuchSession(_) => "no-such-session",
            GridError::NoSuchNode(_) => "no-such-node",
            GridError::SessionExists(_) => "session-exists",
            GridError::UnauthorizedSecret => "unauthorized-secret",
            GridError::Config(_) => "config",
            GridError::Transport(_) => "transport",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GridError::SessionNotCreated(_)
            | GridError::RetrySessionRequest(_)
            | GridError::Timeout(_)
            | GridError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GridError::NoSuchSession(_) | GridError::NoSuchNode(_) => StatusCode::NOT_FOUND,
            GridError::SessionExists(_) => StatusCode::CONFLICT,
            GridError::UnauthorizedSecret => StatusCode::UNAUTHORIZED,
            GridError::Transport(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Rebuild a kind from a wire discriminator + message. Unknown codes
    /// collapse to `SessionNotCreated` — a terminal default keeps a confused
    /// peer from retrying forever.
    pub fn from_wire(code: &str, message: &str) -> Self {
        match code {
            "retry-session-request" => GridError::RetrySessionRequest(message.to_string()),
            "timeout" => GridError::Timeout(message.to_string()),
            "no-such-session" => match message.parse() {
                Ok(id) => GridError::NoSuchSession(id),
                Err(_) => GridError::SessionNotCreated(message.to_string()),
            },
            "unauthorized-secret" => GridError::UnauthorizedSecret,
            "transport" => GridError::Transport(message.to_string()),
            _ => GridError::SessionNotCreated(message.to_string()),
        }
    }

    /// JSON body used on every error response.
    pub fn to_wire(&self) -> serde_json::Value {
        let message = match self {
            GridError::NoSuchSession(id) => id.to_string(),
            GridError::NoSuchNode(id) => id.to_string(),
            other => other.to_string(),
        };
        json!({ "error": { "code": self.code(), "message": message } })
    }
}

impl From<reqwest::Error> for GridError {
    fn from(err: reqwest::Error) -> Self {
        GridError::Transport(err.to_string())
    }
}

impl IntoResponse for GridError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.to_wire())).into_response()
    }
}
