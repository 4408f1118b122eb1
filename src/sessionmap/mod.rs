//! Session map — the authoritative binding from session ID to the URI of the
//! node hosting it. The router resolves every in-session command through this
//! map; everything else about it is replaceable, so the core depends only on
//! the trait.

pub mod remote;
pub mod routes;

use crate::error::GridError;
use crate::ids::SessionId;
use crate::session::ActiveSession;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

#[async_trait]
pub trait SessionMap: Send + Sync {
    /// Bind a session. Fails with `SessionExists` when the id is taken.
    async fn add(&self, session: ActiveSession) -> Result<(), GridError>;

    /// URI of the node hosting the session. Fails with `NoSuchSession`.
    async fn uri_for(&self, id: SessionId) -> Result<String, GridError>;

    /// Drop a binding. Idempotent; removing an unknown id is not an error.
    async fn remove(&self, id: SessionId) -> Result<(), GridError>;

    async fn ready(&self) -> bool;
}

/// Process-wide in-memory store; the default backing for standalone grids.
#[derive(Default)]
pub struct InMemorySessionMap {
    sessions: RwLock<HashMap<SessionId, ActiveSession>>,
}

impl InMemorySessionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait]
impl SessionMap for InMemorySessionMap {
    async fn add(&self, session: ActiveSession) -> Result<(), GridError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Err(GridError::SessionExists(session.id));
        }
        debug!(id = %session.id, uri = %session.node_uri, "session bound");
        sessions.insert(session.id, session);
        Ok(())
    }

    async fn uri_for(&self, id: SessionId) -> Result<String, GridError> {
        self.sessions
            .read()
            .await
            .get(&id)
            .map(|s| s.node_uri.clone())
            .ok_or(GridError::NoSuchSession(id))
    }

    async fn remove(&self, id: SessionId) -> Result<(), GridError> {
        if self.sessions.write().await.remove(&id).is_some() {
            debug!(id = %id, "session unbound");
        }
        Ok(())
    }

    async fn ready(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::Capabilities;
    use crate::session::Dialect;
    use chrono::Utc;

    fn session(uri: &str) -> ActiveSession {
        ActiveSession {
            id: SessionId::new(),
            node_uri: uri.to_string(),
            stereotype: Capabilities::new(),
            capabilities: Capabilities::new(),
            dialect: Dialect::W3c,
            started_at: Utc::now(),
            upstream: None,
        }
    }

    #[tokio::test]
    async fn test_add_then_lookup() {
        let map = InMemorySessionMap::new();
        let s = session("http://node-a:5555");
        let id = s.id;
        map.add(s).await.unwrap();
        assert_eq!(map.uri_for(id).await.unwrap(), "http://node-a:5555");
    }

    #[tokio::test]
    async fn test_double_add_fails_with_session_exists() {
        let map = InMemorySessionMap::new();
        let s = session("http://node-a:5555");
        map.add(s.clone()).await.unwrap();
        let err = map.add(s).await.unwrap_err();
        assert!(matches!(err, GridError::SessionExists(_)));
    }

    #[tokio::test]
    async fn test_lookup_of_unknown_session_fails() {
        let map = InMemorySessionMap::new();
        let err = map.uri_for(SessionId::new()).await.unwrap_err();
        assert!(matches!(err, GridError::NoSuchSession(_)));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let map = InMemorySessionMap::new();
        let s = session("http://node-a:5555");
        let id = s.id;
        map.add(s).await.unwrap();
        map.remove(id).await.unwrap();
        map.remove(id).await.unwrap();
        assert!(map.is_empty().await);
    }
}
