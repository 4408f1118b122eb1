//! Node — owner of a fixed set of slots, each advertising a stereotype and
//! hosting at most one session.
//!
//! [`Node`] is the seam the distributor schedules against; [`LocalNode`] is
//! the in-process implementation backed by configured session factories, and
//! [`remote::RemoteNode`] is the HTTP handle the distributor builds for
//! nodes living in other processes. Slot-set operations are serialized per
//! node; individual sessions are independent of each other.

pub mod factory;
pub mod remote;
pub mod routes;
pub mod slot;
pub mod status;

use crate::config::NodeConfig;
use crate::error::GridError;
use crate::events::{EventBus, GridEvent};
use crate::ids::{NodeId, SessionId, SlotId};
use crate::secret::{RegistrationSecret, SECRET_HEADER};
use crate::session::{ActiveSession, CreateSessionRequest, CreateSessionResponse, Dialect};
use async_trait::async_trait;
use chrono::Utc;
use factory::{FactoryRegistry, SessionFactory};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use slot::Slot;
use status::{Availability, NodeStatus, OsInfo};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Result of a node's self-probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub availability: Availability,
    pub message: String,
}

/// An in-session command to forward: everything after `/session/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    pub method: String,
    /// Path suffix including its leading slash; empty for the session root.
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    pub status: u16,
    pub body: Value,
}

#[async_trait]
pub trait Node: Send + Sync {
    fn id(&self) -> NodeId;
    fn uri(&self) -> String;

    /// Atomically pick a free matching slot, run the factory, record the
    /// session. Transient causes come back as `RetrySessionRequest`.
    async fn new_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<CreateSessionResponse, GridError>;

    async fn execute_webdriver_command(
        &self,
        session_id: SessionId,
        command: CommandRequest,
    ) -> Result<CommandResponse, GridError>;

    /// Release the slot hosting the session.
    async fn stop_session(&self, session_id: SessionId) -> Result<(), GridError>;

    async fn status(&self) -> Result<NodeStatus, GridError>;

    async fn health_check(&self) -> HealthReport;

    /// Refuse further sessions; `NodeDrainComplete` fires once the last one
    /// ends (immediately when idle).
    async fn drain(&self);

    async fn is_draining(&self) -> bool;
}

// ─── LocalNode ───────────────────────────────────────────────────────────────

struct LocalSlot {
    slot: Slot,
    factory: Arc<dyn SessionFactory>,
}

struct NodeState {
    slots: Vec<LocalSlot>,
    draining: bool,
}

impl NodeState {
    fn idle(&self) -> bool {
        self.slots.iter().all(|ls| ls.slot.is_free())
    }
}

/// The in-process node: slots built from configured driver descriptors.
pub struct LocalNode {
    id: NodeId,
    uri: String,
    bus: EventBus,
    max_sessions: usize,
    os_info: OsInfo,
    state: Mutex<NodeState>,
    client: reqwest::Client,
}

impl LocalNode {
    pub fn new(
        config: &NodeConfig,
        registry: &FactoryRegistry,
        bus: EventBus,
        uri: String,
    ) -> Result<Arc<Self>, GridError> {
        if config.drivers.is_empty() {
            return Err(GridError::Config(
                "node has no drivers configured".to_string(),
            ));
        }
        let id = NodeId::new();
        let mut slots = Vec::new();
        for descriptor in &config.drivers {
            let factory = registry.build(descriptor)?;
            for _ in 0..descriptor.max_sessions {
                slots.push(LocalSlot {
                    slot: Slot::new(
                        SlotId::new(id, slots.len() as u32),
                        descriptor.stereotype.clone(),
                    ),
                    factory: factory.clone(),
                });
            }
        }
        if let Some(cap) = config.max_sessions {
            if cap < slots.len() {
                warn!(
                    configured = slots.len(),
                    cap, "max_sessions caps the configured slots"
                );
                slots.truncate(cap);
            }
        }
        let max_sessions = slots.len();
        info!(node = %id, uri = %uri, slots = max_sessions, "node starting");
        Ok(Arc::new(Self {
            id,
            uri,
            bus,
            max_sessions,
            os_info: OsInfo::sample(),
            state: Mutex::new(NodeState {
                slots,
                draining: false,
            }),
            client: reqwest::Client::new(),
        }))
    }

    /// Publish status then heartbeats on the bus until the node is dropped
    /// or retired by a completed drain.
    pub fn spawn_heartbeat(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let node = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut first = true;
            loop {
                ticker.tick().await;
                let Some(node) = node.upgrade() else { break };
                let status = node.snapshot().await;
                if status.availability == Availability::Draining && status.session_count() == 0 {
                    debug!(node = %status.node_id, "drain complete; heartbeat retired");
                    break;
                }
                let at = Utc::now();
                if first {
                    node.bus.publish(GridEvent::NodeStatus { status, at });
                    first = false;
                } else {
                    node.bus.publish(GridEvent::NodeHeartbeat { status, at });
                }
            }
        })
    }

    /// POST the status snapshot to a distributor on the heartbeat period —
    /// the registration path for split-role deployments where the bus does
    /// not span processes. Registration is idempotent on the far side.
    pub fn spawn_registration(
        self: &Arc<Self>,
        distributor_url: String,
        secret: RegistrationSecret,
        interval: Duration,
    ) -> JoinHandle<()> {
        let node = Arc::downgrade(self);
        let client = reqwest::Client::new();
        let url = format!(
            "{}/se/grid/distributor/node",
            distributor_url.trim_end_matches('/')
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(node) = node.upgrade() else { break };
                let status = node.snapshot().await;
                if status.availability == Availability::Draining && status.session_count() == 0 {
                    break;
                }
                let mut req = client.post(&url).json(&status);
                if let Some(value) = secret.header_value() {
                    req = req.header(SECRET_HEADER, value);
                }
                match req.send().await {
                    Ok(resp) if resp.status().is_success() => {}
                    Ok(resp) => {
                        warn!(status = %resp.status(), "distributor refused status publication")
                    }
                    Err(err) => warn!(err = %err, "status publication failed"),
                }
            }
        })
    }

    async fn snapshot(&self) -> NodeStatus {
        let state = self.state.lock().await;
        NodeStatus {
            node_id: self.id,
            uri: self.uri.clone(),
            availability: if state.draining {
                Availability::Draining
            } else {
                Availability::Up
            },
            max_concurrent_sessions: self.max_sessions,
            slots: state.slots.iter().map(|ls| ls.slot.snapshot()).collect(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            os_info: self.os_info.clone(),
        }
    }

    /// Release a slot and fire `NodeDrainComplete` if that made a draining
    /// node idle.
    async fn release_slot(&self, index: usize) {
        let drained = {
            let mut state = self.state.lock().await;
            state.slots[index].slot.release();
            state.draining && state.idle()
        };
        if drained {
            self.announce_drained();
        }
    }

    fn announce_drained(&self) {
        info!(node = %self.id, "drain complete");
        self.bus
            .publish(GridEvent::NodeDrainComplete { node_id: self.id });
    }
}

#[async_trait]
impl Node for LocalNode {
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
        // Select and reserve under the node lock; the factory call happens
        // outside it so one slow driver does not serialize the whole node.
        let (index, factory, stereotype) = {
            let mut state = self.state.lock().await;
            if state.draining {
                return Err(GridError::SessionNotCreated(
                    "node is draining and refuses new sessions".to_string(),
                ));
            }
            let mut compatible = false;
            let mut chosen = None;
            for (i, ls) in state.slots.iter().enumerate() {
                if ls.slot.is_compatible(&request.capabilities) {
                    compatible = true;
                    if ls.slot.is_free() {
                        chosen = Some(i);
                        break;
                    }
                }
            }
            match chosen {
                Some(i) => {
                    state.slots[i].slot.reserve();
                    (
                        i,
                        state.slots[i].factory.clone(),
                        state.slots[i].slot.stereotype.clone(),
                    )
                }
                None if compatible => {
                    return Err(GridError::RetrySessionRequest(
                        "all compatible slots are busy".to_string(),
                    ))
                }
                None => {
                    return Err(GridError::SessionNotCreated(
                        "no slot stereotype matches the requested capabilities".to_string(),
                    ))
                }
            }
        };

        let created = match factory.create(&request).await {
            Ok(created) => created,
            Err(err) => {
                warn!(node = %self.id, err = %err, "session factory failed");
                self.release_slot(index).await;
                return Err(err);
            }
        };

        let session = ActiveSession {
            id: created.id,
            node_uri: self.uri.clone(),
            stereotype,
            capabilities: created.capabilities,
            dialect: *request.dialects.first().unwrap_or(&Dialect::W3c),
            started_at: Utc::now(),
            upstream: created.upstream,
        };
        self.state.lock().await.slots[index]
            .slot
            .start(session.clone());
        info!(node = %self.id, session = %session.id, "session started");
        Ok(CreateSessionResponse::encode(session))
    }

    async fn execute_webdriver_command(
        &self,
        session_id: SessionId,
        command: CommandRequest,
    ) -> Result<CommandResponse, GridError> {
        // Deleting the session root ends it.
        if command.method.eq_ignore_ascii_case("DELETE") && command.path.is_empty() {
            self.stop_session(session_id).await?;
            return Ok(CommandResponse {
                status: 200,
                body: json!({ "value": null }),
            });
        }

        let upstream = {
            let state = self.state.lock().await;
            let slot = state
                .slots
                .iter()
                .find(|ls| ls.slot.session().map(|s| s.id) == Some(session_id))
                .ok_or(GridError::NoSuchSession(session_id))?;
            slot.slot.session().and_then(|s| s.upstream.clone())
        };

        let Some(upstream) = upstream else {
            // Stub sessions answer locally.
            return Ok(CommandResponse {
                status: 200,
                body: json!({ "value": null }),
            });
        };

        let method = reqwest::Method::from_bytes(command.method.as_bytes())
            .map_err(|_| GridError::Transport(format!("bad method {}", command.method)))?;
        let url = format!("{upstream}{}", command.path);
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
        let (index, factory, session) = {
            let state = self.state.lock().await;
            let index = state
                .slots
                .iter()
                .position(|ls| ls.slot.session().map(|s| s.id) == Some(session_id))
                .ok_or(GridError::NoSuchSession(session_id))?;
            let session = state.slots[index]
                .slot
                .session()
                .cloned()
                .expect("position matched on session");
            (index, state.slots[index].factory.clone(), session)
        };
        factory.stop(&session).await;
        self.release_slot(index).await;
        info!(node = %self.id, session = %session_id, "session stopped");
        Ok(())
    }

    async fn status(&self) -> Result<NodeStatus, GridError> {
        Ok(self.snapshot().await)
    }

    async fn health_check(&self) -> HealthReport {
        let state = self.state.lock().await;
        if state.draining {
            HealthReport {
                availability: Availability::Draining,
                message: format!("node {} is draining", self.id),
            }
        } else {
            HealthReport {
                availability: Availability::Up,
                message: format!("node {} is up", self.id),
            }
        }
    }

    async fn drain(&self) {
        let already_idle = {
            let mut state = self.state.lock().await;
            if state.draining {
                debug!(node = %self.id, "drain requested twice");
                return;
            }
            state.draining = true;
            state.idle()
        };
        info!(node = %self.id, "node draining");
        if already_idle {
            self.announce_drained();
        }
    }

    async fn is_draining(&self) -> bool {
        self.state.lock().await.draining
    }
}
