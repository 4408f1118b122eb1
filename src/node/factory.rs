// SPDX-License-Identifier: MIT
//! Session factories and the registry that names them.
//!
//! The node never discovers drivers at runtime: configuration lists driver
//! descriptors and each names a factory. Constructors are registered once at
//! program start; configuration selects by name.
//!
//! Built-ins:
//! - `relay` — forwards session creation to an already-running driver
//!   service and relays in-session commands to it.
//! - `stub` — mints sessions locally with no driver behind them; development
//!   and test deployments.

use crate::capabilities::Capabilities;
use crate::config::DriverDescriptor;
use crate::error::GridError;
use crate::ids::SessionId;
use crate::session::CreateSessionRequest;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// What a factory hands back: the minted session id, the capabilities the
/// driver actually granted, and the session's upstream base URL — the
/// address in-session commands forward to (when one exists).
#[derive(Debug, Clone)]
pub struct CreatedSession {
    pub id: SessionId,
    pub capabilities: Capabilities,
    pub upstream: Option<String>,
}

/// Black box turning capabilities into a running session. Errors must be
/// typed: `RetrySessionRequest`/`Transport` for transient causes, anything
/// else is terminal for the request.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self, request: &CreateSessionRequest) -> Result<CreatedSession, GridError>;

    /// Best-effort teardown of a session this factory created.
    async fn stop(&self, _session: &crate::session::ActiveSession) {}
}

type Constructor =
    dyn Fn(&DriverDescriptor) -> Result<Arc<dyn SessionFactory>, GridError> + Send + Sync;

/// Named factory constructors wired at program start.
pub struct FactoryRegistry {
    constructors: HashMap<String, Box<Constructor>>,
}

impl FactoryRegistry {
    /// Registry with the built-in factories.
    pub fn builtin() -> Self {
        let mut registry = Self {
            constructors: HashMap::new(),
        };
        registry.register("relay", |descriptor| {
            let endpoint = descriptor.endpoint.clone().ok_or_else(|| {
                GridError::Config(format!(
                    "driver '{}' uses the relay factory but has no endpoint",
                    descriptor.display_name
                ))
            })?;
            Ok(Arc::new(RelayFactory::new(endpoint)) as Arc<dyn SessionFactory>)
        });
        registry.register("stub", |_| {
            Ok(Arc::new(StubFactory) as Arc<dyn SessionFactory>)
        });
        registry
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        constructor: impl Fn(&DriverDescriptor) -> Result<Arc<dyn SessionFactory>, GridError>
            + Send
            + Sync
            + 'static,
    ) {
        self.constructors.insert(name.into(), Box::new(constructor));
    }

    pub fn build(&self, descriptor: &DriverDescriptor) -> Result<Arc<dyn SessionFactory>, GridError> {
        let constructor = self.constructors.get(&descriptor.factory).ok_or_else(|| {
            GridError::Config(format!(
                "driver '{}' names unknown factory '{}'",
                descriptor.display_name, descriptor.factory
            ))
        })?;
        constructor(descriptor)
    }
}

// ─── Relay ───────────────────────────────────────────────────────────────────

/// Creates sessions against a driver service that is already listening
/// (a webdriver-compatible endpoint). Connection-level failures are
/// retryable; the driver may just be busy restarting.
pub struct RelayFactory {
    endpoint: String,
    client: reqwest::Client,
}

impl RelayFactory {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl SessionFactory for RelayFactory {
    async fn create(&self, request: &CreateSessionRequest) -> Result<CreatedSession, GridError> {
        let body = json!({
            "capabilities": { "alwaysMatch": request.capabilities.as_value() }
        });
        let url = format!("{}/session", self.endpoint);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| GridError::RetrySessionRequest(format!("driver unreachable: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let detail: Value = response.json().await.unwrap_or_default();
            let message = detail["value"]["message"]
                .as_str()
                .unwrap_or("driver refused the session")
                .to_string();
            return Err(if status.is_server_error() {
                GridError::RetrySessionRequest(message)
            } else {
                GridError::SessionNotCreated(message)
            });
        }

        let body: Value = response.json().await?;
        // W3C answers nest under "value"; legacy drivers answer flat.
        let value = if body.get("value").map_or(false, Value::is_object) {
            &body["value"]
        } else {
            &body
        };
        let raw_id = value["sessionId"]
            .as_str()
            .or_else(|| body["sessionId"].as_str())
            .ok_or_else(|| {
                GridError::SessionNotCreated("driver answered without a session id".to_string())
            })?;
        // The grid id and the driver's id need not coincide; the upstream URL
        // carries the driver's own id so forwarding never has to translate.
        let id = raw_id.parse().unwrap_or_else(|_| SessionId::new());
        let capabilities = value
            .get("capabilities")
            .and_then(Capabilities::from_value)
            .unwrap_or_else(|| request.capabilities.clone());

        debug!(session = %id, endpoint = %self.endpoint, "relay session created");
        Ok(CreatedSession {
            id,
            capabilities,
            upstream: Some(format!("{}/session/{raw_id}", self.endpoint)),
        })
    }

    async fn stop(&self, session: &crate::session::ActiveSession) {
        let Some(upstream) = &session.upstream else {
            return;
        };
        if let Err(err) = self.client.delete(upstream).send().await {
            debug!(session = %session.id, err = %err, "relay teardown failed");
        }
    }
}

// ─── Stub ────────────────────────────────────────────────────────────────────

/// Mints sessions with nothing behind them. In-session commands answer
/// locally with an empty value.
pub struct StubFactory;

#[async_trait]
impl SessionFactory for StubFactory {
    async fn create(&self, request: &CreateSessionRequest) -> Result<CreatedSession, GridError> {
        Ok(CreatedSession {
            id: SessionId::new(),
            capabilities: request.capabilities.clone(),
            upstream: None,
        })
    }
}
