// SPDX-License-Identifier: MIT
//! Registration secret — the shared token proving a caller belongs to the
//! cluster. Mutating intra-cluster endpoints mount [`require_secret`] and
//! answer 401 without it; public client-facing operations never do.

use crate::error::GridError;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::warn;

/// Header carrying the secret on intra-cluster requests.
pub const SECRET_HEADER: &str = "x-registration-secret";

/// Environment variable consulted when the config file sets no secret.
pub const SECRET_ENV: &str = "GRID_REGISTRATION_SECRET";

/// `None` disables the filter entirely — a single-process grid needs no
/// cluster identity.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RegistrationSecret(Option<String>);

impl RegistrationSecret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Some(value.into()))
    }

    pub fn none() -> Self {
        Self(None)
    }

    /// Config value wins; otherwise the environment is consulted.
    pub fn from_config(configured: Option<String>) -> Self {
        Self(
            configured
                .or_else(|| std::env::var(SECRET_ENV).ok())
                .filter(|s| !s.is_empty()),
        )
    }

    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }

    /// Value to attach to outgoing intra-cluster requests.
    pub fn header_value(&self) -> Option<&str> {
        self.0.as_deref()
    }

    /// Whether a presented header value is acceptable. Comparison touches
    /// every byte of both strings so timing reveals nothing beyond length.
    pub fn matches(&self, presented: Option<&str>) -> bool {
        match (&self.0, presented) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(expected), Some(given)) => {
                let a = expected.as_bytes();
                let b = given.as_bytes();
                if a.len() != b.len() {
                    return false;
                }
                a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
            }
        }
    }
}

impl std::fmt::Debug for RegistrationSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the value.
        match self.0 {
            Some(_) => write!(f, "RegistrationSecret(set)"),
            None => write!(f, "RegistrationSecret(unset)"),
        }
    }
}

/// Axum middleware rejecting requests whose secret header does not match.
pub async fn require_secret(
    State(secret): State<RegistrationSecret>,
    request: Request,
    next: Next,
) -> Response {
    let presented = request
        .headers()
        .get(SECRET_HEADER)
        .and_then(|v| v.to_str().ok());
    if secret.matches(presented) {
        next.run(request).await
    } else {
        warn!(
            path = %request.uri().path(),
            "intra-cluster request rejected: bad registration secret"
        );
        GridError::UnauthorizedSecret.into_response()
    }
}
