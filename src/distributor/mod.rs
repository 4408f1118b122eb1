// SPDX-License-Identifier: MIT
//! The distributor — the scheduling core of the grid.
//!
//! Owns the authoritative view of all nodes and their slots (the grid
//! model), registers nodes (directly or from bus events), probes their
//! health, purges the silently dead, and runs the scheduling loop that pairs
//! queued requests with free slots. Grid state lives behind one
//! write-preferring read-write lock: the scheduler is the single writer for
//! the duration of a tick, readers observe consistent snapshots.

pub mod model;
pub mod routes;
pub mod selector;

use crate::error::GridError;
use crate::events::{EventBus, GridEvent};
use crate::ids::{NodeId, RequestId};
use crate::node::remote::RemoteNode;
use crate::node::status::{Availability, NodeStatus};
use crate::node::{HealthReport, Node};
use crate::queue::{SessionQueuer, SessionRequest};
use crate::secret::RegistrationSecret;
use crate::session::{parse_new_session_payload, CreateSessionRequest, CreateSessionResponse};
use crate::sessionmap::SessionMap;
use chrono::{DateTime, Utc};
use model::GridModel;
use selector::SlotSelector;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The scheduler wakes at least this often even without events.
const SCHEDULER_TICK: Duration = Duration::from_secs(1);

/// Knobs the distributor needs; carved out of the full grid config so tests
/// can construct one directly.
#[derive(Debug, Clone)]
pub struct DistributorSettings {
    pub healthcheck_interval: Duration,
    pub purge_interval: Duration,
    pub node_lost_timeout: Duration,
    /// How often an unmatched queue head is re-examined when no request
    /// events arrived (the bounded-loss recovery path).
    pub retry_interval: Duration,
}

impl Default for DistributorSettings {
    fn default() -> Self {
        Self {
            healthcheck_interval: Duration::from_secs(300),
            purge_interval: Duration::from_secs(30),
            node_lost_timeout: Duration::from_secs(120),
            retry_interval: Duration::from_secs(5),
        }
    }
}

/// Everything guarded by the grid lock. `nodes` and `model` move together:
/// a node present in one is present in the other.
struct GridState {
    nodes: HashMap<NodeId, Arc<dyn Node>>,
    model: GridModel,
}

enum Assignment {
    Created(CreateSessionResponse),
    /// Transient failure; the request goes back to the head of the queue.
    RetryLater(String),
    /// No free matching slot right now; also a retry.
    NoCandidates,
    Rejected(GridError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributorStatus {
    pub ready: bool,
    pub nodes: Vec<NodeStatus>,
}

pub struct Distributor {
    bus: EventBus,
    session_map: Arc<dyn SessionMap>,
    queue: Arc<dyn SessionQueuer>,
    selector: Box<dyn SlotSelector>,
    settings: DistributorSettings,
    secret: RegistrationSecret,
    state: RwLock<GridState>,
    pending: Mutex<VecDeque<RequestId>>,
    health_checks: Mutex<HashMap<NodeId, JoinHandle<()>>>,
    /// Requests sent back to the queue head and when; they are not looked at
    /// again until the retry period elapsed, otherwise the retry event would
    /// immediately re-trigger the tick that just failed them.
    deferred: Mutex<HashMap<RequestId, tokio::time::Instant>>,
    last_head_peek: Mutex<tokio::time::Instant>,
    wakeup: Notify,
}

impl Distributor {
    pub fn new(
        bus: EventBus,
        session_map: Arc<dyn SessionMap>,
        queue: Arc<dyn SessionQueuer>,
        selector: Box<dyn SlotSelector>,
        settings: DistributorSettings,
        secret: RegistrationSecret,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            session_map,
            queue,
            selector,
            settings,
            secret,
            state: RwLock::new(GridState {
                nodes: HashMap::new(),
                model: GridModel::new(),
            }),
            pending: Mutex::new(VecDeque::new()),
            health_checks: Mutex::new(HashMap::new()),
            deferred: Mutex::new(HashMap::new()),
            last_head_peek: Mutex::new(tokio::time::Instant::now()),
            wakeup: Notify::new(),
        })
    }

    /// Spawn the event listener, the scheduler, and the stale-node purge.
    /// The returned handles are aborted on shutdown; the current tick always
    /// finishes because aborts only land at await points outside it.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let listener = {
            let distributor = self.clone();
            tokio::spawn(async move { distributor.listen().await })
        };
        let scheduler = {
            let distributor = self.clone();
            tokio::spawn(async move { distributor.run_scheduler().await })
        };
        let purge = {
            let distributor = self.clone();
            tokio::spawn(async move { distributor.run_purge().await })
        };
        vec![listener, scheduler, purge]
    }

    // ─── Registration ─────────────────────────────────────────────────────────

    /// Directly add a node handle (the embedded-node path). Re-registering a
    /// known NodeId refreshes the model and is otherwise a no-op.
    pub async fn add_node(self: &Arc<Self>, node: Arc<dyn Node>, status: NodeStatus) {
        let node_id = status.node_id;
        let already_known = {
            let mut state = self.state.write().await;
            let known = state.model.contains(node_id);
            state.model.upsert(status, Utc::now());
            if !known {
                state.nodes.insert(node_id, node.clone());
            }
            known
        };
        if already_known {
            debug!(node = %node_id, "re-registration is a no-op");
            return;
        }
        self.install_health_check(node_id, node).await;
        info!(node = %node_id, "node added to the grid");
        self.bus.publish(GridEvent::NodeAdded { node_id });
        self.wakeup.notify_one();
    }

    /// Register from a status snapshot (event or HTTP publication). Unknown
    /// nodes get a remote handle built from the URI in the status; known
    /// nodes are refreshed, and bindings for sessions the node no longer
    /// reports are dropped from the session map.
    pub async fn register_from_status(self: &Arc<Self>, status: NodeStatus, at: DateTime<Utc>) {
        let node_id = status.node_id;
        let known = self.state.read().await.model.contains(node_id);
        if !known {
            // Only UP nodes join; a draining or down stranger is a node on
            // its way out (or one we just removed) and must not come back.
            if status.availability != Availability::Up {
                debug!(node = %node_id, availability = %status.availability, "ignoring snapshot from unregistered node");
                return;
            }
            let handle: Arc<dyn Node> = Arc::new(RemoteNode::new(&status, self.secret.clone()));
            self.add_node(handle, status).await;
            return;
        }

        // Reconcile the session map against what the node reports: bindings
        // for vanished sessions go, snapshots of sessions we never bound
        // (possible when an older snapshot raced a creation) are re-bound.
        let (ended, appeared) = {
            let mut state = self.state.write().await;
            let before = state.model.sessions_on(node_id);
            if !state.model.upsert(status, at) {
                (Vec::new(), Vec::new())
            } else {
                let after = state.model.sessions_on(node_id);
                let ended = before
                    .iter()
                    .filter(|s| after.iter().all(|a| a.id != s.id))
                    .map(|s| s.id)
                    .collect::<Vec<_>>();
                let appeared = after
                    .into_iter()
                    .filter(|s| before.iter().all(|b| b.id != s.id))
                    .collect::<Vec<_>>();
                (ended, appeared)
            }
        };
        for session_id in ended {
            debug!(session = %session_id, node = %node_id, "session ended; unbinding");
            let _ = self.session_map.remove(session_id).await;
        }
        for session in appeared {
            match self.session_map.add(session).await {
                // Already bound on the scheduling path.
                Ok(()) | Err(GridError::SessionExists(_)) => {}
                Err(err) => {
                    warn!(node = %node_id, err = %err, "session map rejected a reconciled binding")
                }
            }
        }
    }

    async fn install_health_check(self: &Arc<Self>, node_id: NodeId, node: Arc<dyn Node>) {
        let interval = self.settings.healthcheck_interval;
        let distributor = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                // Probe outside the grid lock; only the result application
                // takes it. A probe that misses its interval counts as DOWN.
                let report = match tokio::time::timeout(interval, node.health_check()).await {
                    Ok(report) => report,
                    Err(_) => HealthReport {
                        availability: Availability::Down,
                        message: "health check timed out".to_string(),
                    },
                };
                let Some(distributor) = distributor.upgrade() else {
                    break;
                };
                if report.availability == Availability::Down {
                    warn!(node = %node_id, message = %report.message, "node is down");
                }
                let mut state = distributor.state.write().await;
                if !state.model.contains(node_id) {
                    break;
                }
                state.model.set_availability(node_id, report.availability);
            }
        });
        if let Some(previous) = self.health_checks.lock().await.insert(node_id, task) {
            previous.abort();
        }
    }

    pub async fn remove_node(&self, node_id: NodeId) {
        let removed = {
            let mut state = self.state.write().await;
            state.nodes.remove(&node_id);
            state.model.remove(node_id).is_some()
        };
        if let Some(task) = self.health_checks.lock().await.remove(&node_id) {
            task.abort();
        }
        if removed {
            info!(node = %node_id, "node removed from the grid");
        }
    }

    pub async fn drain_node(&self, node_id: NodeId) -> Result<(), GridError> {
        let node = {
            let mut state = self.state.write().await;
            if !state.model.contains(node_id) {
                return Err(GridError::NoSuchNode(node_id));
            }
            // DRAINING lands in the model before the lock is released, so no
            // scheduler tick can reserve on this node afterwards.
            state.model.set_availability(node_id, Availability::Draining);
            state.nodes.get(&node_id).cloned()
        };
        info!(node = %node_id, "draining node");
        if let Some(node) = node {
            node.drain().await;
        }
        Ok(())
    }

    // ─── Background loops ─────────────────────────────────────────────────────

    async fn listen(self: Arc<Self>) {
        let mut rx = self.bus.subscribe();
        loop {
            let envelope = match rx.recv().await {
                Ok(envelope) => envelope,
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "distributor lagged on the bus; relying on heartbeats");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            match envelope.event {
                GridEvent::NodeStatus { status, at }
                | GridEvent::NodeHeartbeat { status, at } => {
                    self.register_from_status(status, at).await;
                }
                GridEvent::NodeDrainComplete { node_id } => {
                    self.remove_node(node_id).await;
                }
                GridEvent::NewSessionRequest { request_id } => {
                    self.pending.lock().await.push_back(request_id);
                    self.wakeup.notify_one();
                }
                _ => {}
            }
        }
    }

    async fn run_scheduler(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(SCHEDULER_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.wakeup.notified() => {}
            }
            self.schedule_tick().await;
        }
    }

    async fn run_purge(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.settings.purge_interval);
        loop {
            ticker.tick().await;
            let cutoff = Utc::now()
                - chrono::Duration::from_std(self.settings.node_lost_timeout)
                    .unwrap_or_else(|_| chrono::Duration::seconds(120));
            let stale = self.state.read().await.model.stale(cutoff);
            for node_id in stale {
                warn!(node = %node_id, "no heartbeat within the purge window");
                self.remove_node(node_id).await;
            }
            // Deferral entries for requests that never came back (timed out
            // or cleared remotely) have nothing left to clean them up.
            self.deferred
                .lock()
                .await
                .retain(|_, since| since.elapsed() < Duration::from_secs(600));
        }
    }

    // ─── Scheduling ───────────────────────────────────────────────────────────

    /// One request id to work on: the pending FIFO first, then — on the
    /// retry period — the queue head, which covers request events the bus
    /// dropped.
    async fn next_pending(&self) -> Option<RequestId> {
        loop {
            // Pop under a short-lived guard; the deferral check below takes
            // the pending lock again.
            let popped = self.pending.lock().await.pop_front();
            let Some(id) = popped else { break };
            let mut deferred = self.deferred.lock().await;
            match deferred.get(&id) {
                Some(since) if since.elapsed() < self.settings.retry_interval => {
                    // Too soon after its last failed attempt; park it again.
                    drop(deferred);
                    self.pending.lock().await.push_back(id);
                    return None;
                }
                Some(_) => {
                    deferred.remove(&id);
                    return Some(id);
                }
                None => return Some(id),
            }
        }
        let mut last = self.last_head_peek.lock().await;
        if last.elapsed() < self.settings.retry_interval {
            return None;
        }
        *last = tokio::time::Instant::now();
        drop(last);
        match self.queue.next().await {
            Ok(head) => head,
            Err(err) => {
                debug!(err = %err, "queue head peek failed");
                None
            }
        }
    }

    async fn schedule_tick(&self) {
        let Some(request_id) = self.next_pending().await else {
            return;
        };

        let mut state = self.state.write().await;
        if !state.model.has_capacity() {
            // Nothing can host anything right now; keep the id for later.
            drop(state);
            self.pending.lock().await.push_front(request_id);
            return;
        }

        let request = match self.queue.remove(request_id).await {
            Ok(Some(request)) => request,
            Ok(None) => {
                // Timed out, or another scheduler claimed it.
                return;
            }
            Err(err) => {
                warn!(request = %request_id, err = %err, "queue dequeue failed");
                return;
            }
        };

        let outcome = self.try_assign(&mut state, &request).await;
        drop(state);

        match outcome {
            Assignment::Created(response) => {
                info!(
                    request = %request_id,
                    session = %response.session.id,
                    node = %response.session.node_uri,
                    "session assigned"
                );
                self.bus.publish(GridEvent::NewSessionResponse {
                    request_id,
                    session: response.session,
                    payload: response.payload,
                });
            }
            Assignment::RetryLater(reason) => {
                debug!(request = %request_id, reason = %reason, "retrying at queue head");
                self.retry_or_reject(request).await;
            }
            Assignment::NoCandidates => {
                debug!(request = %request_id, "no free matching slot; retrying at queue head");
                self.retry_or_reject(request).await;
            }
            Assignment::Rejected(err) => self.reject(request_id, err),
        }

        // One request per tick; nudge the scheduler again while work remains.
        if !self.pending.lock().await.is_empty() {
            self.wakeup.notify_one();
        }
    }

    /// Work through the request's capability choices in order, reserving
    /// candidate slots top-down until a node accepts.
    async fn try_assign(&self, state: &mut GridState, request: &SessionRequest) -> Assignment {
        for choice in &request.capabilities_choices {
            for slot_id in self.selector.select(choice, &state.model) {
                if !state.model.reserve(&slot_id) {
                    continue;
                }
                let Some(node) = state.nodes.get(&slot_id.node_id).cloned() else {
                    state.model.release(&slot_id);
                    continue;
                };
                let create = CreateSessionRequest {
                    request_id: request.request_id,
                    dialects: request.dialects.clone(),
                    capabilities: choice.clone(),
                };
                match node.new_session(create).await {
                    Ok(response) => {
                        state.model.set_session(&slot_id, Some(response.session.clone()));
                        if let Err(err) = self.session_map.add(response.session.clone()).await {
                            // Without the binding the router could never
                            // reach the session; undo and reject.
                            state.model.set_session(&slot_id, None);
                            let _ = node.stop_session(response.session.id).await;
                            return Assignment::Rejected(GridError::SessionNotCreated(format!(
                                "session map refused the binding: {err}"
                            )));
                        }
                        return Assignment::Created(response);
                    }
                    Err(err) if err.is_retryable() => {
                        state.model.release(&slot_id);
                        return Assignment::RetryLater(err.to_string());
                    }
                    Err(err) => {
                        state.model.release(&slot_id);
                        return Assignment::Rejected(err);
                    }
                }
            }
        }
        Assignment::NoCandidates
    }

    async fn retry_or_reject(&self, request: SessionRequest) {
        let request_id = request.request_id;
        // Defer before the retry lands so the request event it fires cannot
        // race past the deferral.
        self.deferred
            .lock()
            .await
            .insert(request_id, tokio::time::Instant::now());
        match self.queue.retry_add(request).await {
            Ok(true) => {}
            Ok(false) => self.reject(
                request_id,
                GridError::Timeout(
                    "request deadline elapsed before a retry could be queued".to_string(),
                ),
            ),
            Err(err) => self.reject(request_id, err),
        }
    }

    fn reject(&self, request_id: RequestId, err: GridError) {
        info!(request = %request_id, err = %err, "session request rejected");
        self.bus.publish(GridEvent::NewSessionRejected {
            request_id,
            code: err.code().to_string(),
            message: err.to_string(),
        });
    }

    /// Synchronous creation path for the distributor's own HTTP surface:
    /// one assignment attempt, no queueing, errors surface to the caller.
    pub async fn create_session(&self, payload: &Value) -> Result<Value, GridError> {
        let parsed = parse_new_session_payload(payload)?;
        let request = SessionRequest::new(parsed);
        let mut state = self.state.write().await;
        match self.try_assign(&mut state, &request).await {
            Assignment::Created(response) => Ok(response.payload),
            Assignment::RetryLater(reason) => Err(GridError::RetrySessionRequest(reason)),
            Assignment::NoCandidates => Err(GridError::RetrySessionRequest(
                "no free slot matches the requested capabilities".to_string(),
            )),
            Assignment::Rejected(err) => Err(err),
        }
    }

    // ─── Introspection ────────────────────────────────────────────────────────

    /// Ready iff the bus and the session map are, probed in parallel.
    pub async fn ready(&self) -> bool {
        let (bus_ready, map_ready) =
            futures_util::join!(self.bus.ready(), self.session_map.ready());
        bus_ready && map_ready
    }

    pub async fn status(&self) -> DistributorStatus {
        let nodes = self.state.read().await.model.snapshot();
        DistributorStatus {
            ready: self.ready().await,
            nodes,
        }
    }

    /// Nodes known to the model.
    pub async fn node_count(&self) -> usize {
        self.state.read().await.model.len()
    }

    /// Node handles held; equals `node_count` whenever the grid is quiescent.
    pub async fn handle_count(&self) -> usize {
        self.state.read().await.nodes.len()
    }

    /// Scheduled health checks; equals `node_count` whenever quiescent.
    pub async fn health_check_count(&self) -> usize {
        self.health_checks.lock().await.len()
    }

    /// Total sessions recorded across the model.
    pub async fn session_count(&self) -> usize {
        self.state.read().await.model.session_count()
    }
}
