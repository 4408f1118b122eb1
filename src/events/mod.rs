//! Grid event bus.
//!
//! Lifecycle events flow through a bounded in-process broadcast channel;
//! publishing never blocks and lagging subscribers lose messages rather than
//! back-pressuring the publisher. Components therefore never rely on the bus
//! alone — membership is re-derivable from heartbeats and the direct
//! registration API. The [`remote`] module bridges the channel across
//! processes for split-role deployments.

pub mod remote;

use crate::ids::{NodeId, RequestId};
use crate::node::status::NodeStatus;
use crate::session::ActiveSession;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// Buffer size of the broadcast channel; slow subscribers past this lag
/// observe `RecvError::Lagged` and miss events.
const BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum GridEvent {
    NodeStatus {
        status: NodeStatus,
        at: DateTime<Utc>,
    },
    NodeHeartbeat {
        status: NodeStatus,
        at: DateTime<Utc>,
    },
    NodeDrainComplete {
        node_id: NodeId,
    },
    NodeAdded {
        node_id: NodeId,
    },
    NewSessionRequest {
        request_id: RequestId,
    },
    NewSessionResponse {
        request_id: RequestId,
        session: ActiveSession,
        payload: Value,
    },
    NewSessionRejected {
        request_id: RequestId,
        code: String,
        message: String,
    },
}

impl GridEvent {
    /// Topic name, for logs and the wire envelope.
    pub fn topic(&self) -> &'static str {
        match self {
            GridEvent::NodeStatus { .. } => "node-status",
            GridEvent::NodeHeartbeat { .. } => "node-heartbeat",
            GridEvent::NodeDrainComplete { .. } => "node-drain-complete",
            GridEvent::NodeAdded { .. } => "node-added",
            GridEvent::NewSessionRequest { .. } => "new-session-request",
            GridEvent::NewSessionResponse { .. } => "new-session-response",
            GridEvent::NewSessionRejected { .. } => "new-session-rejected",
        }
    }
}

/// An event plus the bus instance that first published it. The origin lets
/// the HTTP bridge forward local events to peers without echoing remote ones
/// back where they came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub origin: Uuid,
    pub event: GridEvent,
}

#[derive(Clone)]
pub struct EventBus {
    instance: Uuid,
    tx: broadcast::Sender<Envelope>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            instance: Uuid::new_v4(),
            tx,
        }
    }

    /// Identity of this bus instance; the origin stamped on local publishes.
    pub fn instance(&self) -> Uuid {
        self.instance
    }

    /// Publish a locally-originated event. Never blocks; no subscribers is fine.
    pub fn publish(&self, event: GridEvent) {
        debug!(topic = event.topic(), "event published");
        let _ = self.tx.send(Envelope {
            origin: self.instance,
            event,
        });
    }

    /// Re-publish an envelope received from a peer, origin preserved.
    pub fn publish_remote(&self, envelope: Envelope) {
        debug!(topic = envelope.event.topic(), origin = %envelope.origin, "remote event published");
        let _ = self.tx.send(envelope);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    /// Readiness probe. The in-process channel cannot fail once constructed.
    pub async fn ready(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let first = RequestId::new();
        let second = RequestId::new();
        bus.publish(GridEvent::NewSessionRequest { request_id: first });
        bus.publish(GridEvent::NewSessionRequest { request_id: second });

        for expected in [first, second] {
            match rx.recv().await.unwrap().event {
                GridEvent::NewSessionRequest { request_id } => assert_eq!(request_id, expected),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_does_not_block() {
        let bus = EventBus::new();
        bus.publish(GridEvent::NodeAdded {
            node_id: NodeId::new(),
        });
    }

    #[tokio::test]
    async fn test_remote_envelope_keeps_origin() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let foreign = Uuid::new_v4();
        bus.publish_remote(Envelope {
            origin: foreign,
            event: GridEvent::NodeAdded {
                node_id: NodeId::new(),
            },
        });
        assert_eq!(rx.recv().await.unwrap().origin, foreign);
    }
}
