//! Client for a session-map service running in another process.

use super::SessionMap;
use crate::error::GridError;
use crate::ids::SessionId;
use crate::secret::{RegistrationSecret, SECRET_HEADER};
use crate::session::ActiveSession;
use async_trait::async_trait;
use serde_json::Value;

pub struct RemoteSessionMap {
    base: String,
    client: reqwest::Client,
    secret: RegistrationSecret,
}

impl RemoteSessionMap {
    pub fn new(base_url: impl Into<String>, secret: RegistrationSecret) -> Self {
        Self {
            base: base_url.into().trim_end_matches('/').to_string(),
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

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, GridError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body: Value = response.json().await.unwrap_or_default();
        let code = body["error"]["code"].as_str().unwrap_or("transport");
        let message = body["error"]["message"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| format!("session map answered {status}"));
        Err(GridError::from_wire(code, &message))
    }
}

#[async_trait]
impl SessionMap for RemoteSessionMap {
    async fn add(&self, session: ActiveSession) -> Result<(), GridError> {
        let url = format!("{}/se/grid/sessions", self.base);
        let response = self
            .with_secret(self.client.post(&url).json(&session))
            .send()
            .await?;
        Self::check(response).await.map(|_| ())
    }

    async fn uri_for(&self, id: SessionId) -> Result<String, GridError> {
        let url = format!("{}/se/grid/sessions/{id}", self.base);
        let response = self.client.get(&url).send().await?;
        let body: Value = Self::check(response).await?.json().await?;
        body["value"]
            .as_str()
            .map(str::to_string)
            .ok_or(GridError::NoSuchSession(id))
    }

    async fn remove(&self, id: SessionId) -> Result<(), GridError> {
        let url = format!("{}/se/grid/sessions/{id}", self.base);
        let response = self.with_secret(self.client.delete(&url)).send().await?;
        Self::check(response).await.map(|_| ())
    }

    async fn ready(&self) -> bool {
        let url = format!("{}/readyz", self.base);
        matches!(self.client.get(&url).send().await, Ok(r) if r.status().is_success())
    }
}
