//! HTTP handle for a node living in another process. Built by the
//! distributor from the URI in a status snapshot; every mutation carries the
//! registration secret. Transport failures during `newSession` surface as
//! retryable, everywhere else they propagate as-is.

use super::status::{Availability, NodeStatus};
use super::{CommandRequest, CommandResponse, HealthReport, Node};
use crate::error::GridError;
use crate::ids::{NodeId, SessionId};
use crate::secret::{RegistrationSecret, SECRET_HEADER};
use crate::session::{CreateSessionRequest, CreateSessionResponse};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

pub struct RemoteNode {
    id: NodeId,
    uri: String,
    client: reqwest::Client,
    secret: RegistrationSecret,
}

impl RemoteNode {
    pub fn new(status: &NodeStatus, secret: RegistrationSecret) -> Self {
        Self {
            id: status.node_id,
            uri: status.uri.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            secret,
        }
    }

    fn with_secret(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.secret.header_value() {
            Some(value) => req.header(SECRET_HEADER, value),
            None => req,
        }
    }

    async fn error_from(response: reqwest::Response) -> GridError {
        let status = response.status();
        let body: Value = response.json().await.unwrap_or_default();
        let code = body["error"]["code"].as_str().unwrap_or("transport");
        let message = body["error"]["message"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| format!("node answered {status}"));
        GridError::from_wire(code, &message)
    }
}

#[async_trait]
impl Node for RemoteNode {
    fn id(&self) -> NodeId {
        self.id
    }

    fn uri(&self) -> String {
        self.uri.clone()
    }

    async fn new_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<CreateSessionResponse, GridError> {
        let url = format!("{}/session", self.uri);
        let response = self
            .with_secret(self.client.post(&url).json(&request))
            .send()
            .await
            // The node may be mid-restart; the request can be retried.
            .map_err(|e| GridError::RetrySessionRequest(format!("node unreachable: {e}")))?;
        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }
        Ok(response.json().await?)
    }

    async fn execute_webdriver_command(
        &self,
        session_id: SessionId,
        command: CommandRequest,
    ) -> Result<CommandResponse, GridError> {
        let method = reqwest::Method::from_bytes(command.method.as_bytes())
            .map_err(|_| GridError::Transport(format!("bad method {}", command.method)))?;
        let url = format!("{}/session/{session_id}{}", self.uri, command.path);
        let mut req = self.client.request(method, &url);
        if let Some(body) = &command.body {
            req = req.json(body);
        }
        let response = req.send().await?;
        let status = response.status().as_u16();
        let body = response.json().await.unwrap_or(json!({ "value": null }));
        Ok(CommandResponse { status, body })
    }

    async fn stop_session(&self, session_id: SessionId) -> Result<(), GridError> {
        let url = format!("{}/se/grid/node/session/{session_id}", self.uri);
        let response = self.with_secret(self.client.delete(&url)).send().await?;
        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }
        Ok(())
    }

    async fn status(&self) -> Result<NodeStatus, GridError> {
        let url = format!("{}/se/grid/node/status", self.uri);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }
        Ok(response.json().await?)
    }

    async fn health_check(&self) -> HealthReport {
        let url = format!("{}/se/grid/node/health", self.uri);
        let result = async {
            let response = self.client.get(&url).send().await?;
            if !response.status().is_success() {
                return Err(GridError::Transport(format!(
                    "health probe answered {}",
                    response.status()
                )));
            }
            Ok::<HealthReport, GridError>(response.json().await?)
        }
        .await;
        // A node that cannot answer its own health probe is down.
        result.unwrap_or_else(|err| HealthReport {
            availability: Availability::Down,
            message: format!("health probe failed: {err}"),
        })
    }

    async fn drain(&self) {
        let url = format!("{}/se/grid/node/drain", self.uri);
        match self.with_secret(self.client.post(&url)).send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => warn!(node = %self.id, status = %response.status(), "drain refused"),
            Err(err) => warn!(node = %self.id, err = %err, "drain request failed"),
        }
    }

    async fn is_draining(&self) -> bool {
        matches!(
            self.status().await,
            Ok(status) if status.availability == Availability::Draining
        )
    }
}
