// SPDX-License-Identifier: MIT
//! New-session queue.
//!
//! Strict FIFO of pending session requests with one exception: a retried
//! request re-enters at the head. `add` parks the caller on a promise keyed
//! by RequestId until a terminal event arrives or the per-request deadline
//! elapses. The queue completes promises by listening to the bus — it never
//! holds a reference to the distributor.

pub mod remote;
pub mod routes;

use crate::capabilities::Capabilities;
use crate::error::GridError;
use crate::events::{EventBus, GridEvent};
use crate::ids::RequestId;
use crate::session::{Dialect, NewSessionPayload};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// A queued request: when it arrived, which dialects the client speaks, and
/// the capability alternatives it will accept, in the client's order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequest {
    pub request_id: RequestId,
    pub enqueued_at: DateTime<Utc>,
    pub dialects: Vec<Dialect>,
    pub capabilities_choices: Vec<Capabilities>,
}

impl SessionRequest {
    pub fn new(payload: NewSessionPayload) -> Self {
        Self {
            request_id: RequestId::new(),
            enqueued_at: Utc::now(),
            dialects: payload.dialects,
            capabilities_choices: payload.choices,
        }
    }

    fn age(&self) -> Duration {
        (Utc::now() - self.enqueued_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

type Waiter = oneshot::Sender<Result<Value, GridError>>;

/// Operations the distributor needs from a queue, local or remote.
#[async_trait]
pub trait SessionQueuer: Send + Sync {
    /// Dequeue a specific request. `None` when it already timed out or
    /// another scheduler claimed it.
    async fn remove(&self, id: RequestId) -> Result<Option<SessionRequest>, GridError>;

    /// Re-insert at the head. `false` once the request's deadline elapsed or
    /// its caller is gone.
    async fn retry_add(&self, request: SessionRequest) -> Result<bool, GridError>;

    /// RequestId at the head without removing it.
    async fn next(&self) -> Result<Option<RequestId>, GridError>;
}

pub struct SessionQueue {
    bus: EventBus,
    request_timeout: Duration,
    inner: Mutex<VecDeque<SessionRequest>>,
    waiters: Mutex<HashMap<RequestId, Waiter>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl SessionQueue {
    pub fn new(bus: EventBus, request_timeout: Duration) -> Arc<Self> {
        let queue = Arc::new(Self {
            bus: bus.clone(),
            request_timeout,
            inner: Mutex::new(VecDeque::new()),
            waiters: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
        });
        let handle = tokio::spawn(Self::listen(Arc::downgrade(&queue), bus));
        *queue.listener.try_lock().expect("queue just constructed") = Some(handle);
        queue
    }

    /// Complete waiters from terminal events. Holds only a weak reference so
    /// dropping the last queue handle tears the task down.
    async fn listen(queue: Weak<Self>, bus: EventBus) {
        let mut rx = bus.subscribe();
        loop {
            let envelope = match rx.recv().await {
                Ok(envelope) => envelope,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            };
            let Some(queue) = queue.upgrade() else { break };
            match envelope.event {
                GridEvent::NewSessionResponse {
                    request_id,
                    payload,
                    ..
                } => queue.complete(request_id, Ok(payload)).await,
                GridEvent::NewSessionRejected {
                    request_id,
                    code,
                    message,
                } => {
                    queue
                        .complete(request_id, Err(GridError::from_wire(&code, &message)))
                        .await
                }
                _ => {}
            }
        }
    }

    async fn complete(&self, id: RequestId, result: Result<Value, GridError>) {
        // The request must not linger in the deque once a terminal event
        // exists for it.
        self.inner.lock().await.retain(|r| r.request_id != id);
        if let Some(tx) = self.waiters.lock().await.remove(&id) {
            let _ = tx.send(result);
        }
    }

    fn is_expired(&self, request: &SessionRequest) -> bool {
        request.age() >= self.request_timeout
    }

    fn reject_expired(&self, request: &SessionRequest) {
        self.bus.publish(GridEvent::NewSessionRejected {
            request_id: request.request_id,
            code: "timeout".to_string(),
            message: format!(
                "request spent longer than {:?} in the session queue",
                self.request_timeout
            ),
        });
    }

    // ─── Operations ──────────────────────────────────────────────────────────

    /// Enqueue and block the caller until the request is matched or its
    /// deadline elapses. Fires `NewSessionRequest` so any distributor in the
    /// cluster wakes up.
    pub async fn add(&self, request: SessionRequest) -> Result<Value, GridError> {
        let id = request.request_id;
        let remaining = self.request_timeout.saturating_sub(request.age());

        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.insert(id, tx);
        self.inner.lock().await.push_back(request);
        info!(request = %id, "new session request queued");
        self.bus.publish(GridEvent::NewSessionRequest { request_id: id });

        match tokio::time::timeout(remaining, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GridError::SessionNotCreated(
                "session queue closed before the request completed".to_string(),
            )),
            Err(_) => {
                // Deadline elapsed. Only emit the terminal rejection if no
                // terminal event beat us to the waiter.
                self.inner.lock().await.retain(|r| r.request_id != id);
                let raced = self.waiters.lock().await.remove(&id).is_none();
                if !raced {
                    self.bus.publish(GridEvent::NewSessionRejected {
                        request_id: id,
                        code: "timeout".to_string(),
                        message: format!(
                            "request spent longer than {:?} in the session queue",
                            self.request_timeout
                        ),
                    });
                }
                Err(GridError::Timeout(format!(
                    "no session matched within {:?}",
                    self.request_timeout
                )))
            }
        }
    }

    /// Head-insert a request the scheduler failed transiently. Refused once
    /// the deadline elapsed or the original caller stopped waiting.
    pub async fn retry_add(&self, request: SessionRequest) -> bool {
        let id = request.request_id;
        if self.is_expired(&request) {
            debug!(request = %id, "retry refused: deadline elapsed");
            return false;
        }
        if !self.waiters.lock().await.contains_key(&id) {
            debug!(request = %id, "retry refused: caller no longer waiting");
            return false;
        }
        self.inner.lock().await.push_front(request);
        info!(request = %id, "session request re-queued at head");
        self.bus.publish(GridEvent::NewSessionRequest { request_id: id });
        true
    }

    /// Dequeue a specific request by id. Expired entries are discarded (and
    /// rejected) instead of being handed out.
    pub async fn remove(&self, id: RequestId) -> Option<SessionRequest> {
        let removed = {
            let mut inner = self.inner.lock().await;
            match inner.iter().position(|r| r.request_id == id) {
                Some(pos) => inner.remove(pos),
                None => None,
            }
        };
        match removed {
            Some(request) if self.is_expired(&request) => {
                self.reject_expired(&request);
                None
            }
            other => other,
        }
    }

    /// Drop everything, returning how many were dropped. Each dropped
    /// request is rejected so its caller unblocks.
    pub async fn clear(&self) -> usize {
        let drained: Vec<SessionRequest> = {
            let mut inner = self.inner.lock().await;
            inner.drain(..).collect()
        };
        for request in &drained {
            self.bus.publish(GridEvent::NewSessionRejected {
                request_id: request.request_id,
                code: "session-not-created".to_string(),
                message: "session request queue was cleared".to_string(),
            });
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "session queue cleared");
        }
        drained.len()
    }

    /// Capability alternatives of every queued request, oldest first. All
    /// alternatives are reported, in the order each client gave them.
    pub async fn contents(&self) -> Vec<Vec<Capabilities>> {
        self.inner
            .lock()
            .await
            .iter()
            .map(|r| r.capabilities_choices.clone())
            .collect()
    }

    /// Head of the queue without removing it; expired entries ahead of the
    /// head are discarded and rejected on the way.
    pub async fn next(&self) -> Option<RequestId> {
        let mut expired = Vec::new();
        let head = {
            let mut inner = self.inner.lock().await;
            loop {
                match inner.front() {
                    Some(front) if self.is_expired(front) => {
                        expired.push(inner.pop_front().expect("front checked"));
                    }
                    Some(front) => break Some(front.request_id),
                    None => break None,
                }
            }
        };
        for request in &expired {
            self.reject_expired(request);
        }
        head
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    pub async fn ready(&self) -> bool {
        true
    }
}

impl Drop for SessionQueue {
    fn drop(&mut self) {
        if let Ok(mut listener) = self.listener.try_lock() {
            if let Some(handle) = listener.take() {
                handle.abort();
            }
        }
    }
}

#[async_trait]
impl SessionQueuer for SessionQueue {
    async fn remove(&self, id: RequestId) -> Result<Option<SessionRequest>, GridError> {
        Ok(SessionQueue::remove(self, id).await)
    }

    async fn retry_add(&self, request: SessionRequest) -> Result<bool, GridError> {
        Ok(SessionQueue::retry_add(self, request).await)
    }

    async fn next(&self) -> Result<Option<RequestId>, GridError> {
        Ok(SessionQueue::next(self).await)
    }
}
