//! Client for a queue service running in another process. Only the
//! distributor-facing operations cross this boundary; `add` stays with the
//! queue's own HTTP surface.

use super::{SessionQueuer, SessionRequest};
use crate::error::GridError;
use crate::ids::RequestId;
use crate::secret::{RegistrationSecret, SECRET_HEADER};
use async_trait::async_trait;

pub struct RemoteQueue {
    base: String,
    client: reqwest::Client,
    secret: RegistrationSecret,
}

impl RemoteQueue {
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
}

#[async_trait]
impl SessionQueuer for RemoteQueue {
    async fn remove(&self, id: RequestId) -> Result<Option<SessionRequest>, GridError> {
        let url = format!("{}/se/grid/newsessionqueuer/session/{id}", self.base);
        let response = self.with_secret(self.client.get(&url)).send().await?;
        if !response.status().is_success() {
            return Err(GridError::Transport(format!(
                "queue answered {} to dequeue",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    async fn retry_add(&self, request: SessionRequest) -> Result<bool, GridError> {
        let url = format!(
            "{}/se/grid/newsessionqueuer/session/retry/{}",
            self.base, request.request_id
        );
        let response = self
            .with_secret(self.client.post(&url).json(&request))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(GridError::Transport(format!(
                "queue answered {} to retry",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    async fn next(&self) -> Result<Option<RequestId>, GridError> {
        let url = format!("{}/se/grid/newsessionqueuer/session/next", self.base);
        let response = self.with_secret(self.client.get(&url)).send().await?;
        if !response.status().is_success() {
            return Err(GridError::Transport(format!(
                "queue answered {} to head peek",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }
}
