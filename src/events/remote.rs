//! HTTP bridge making the in-process bus span a cluster.
//!
//! Each role mounts an authenticated ingress route and runs a forwarder task
//! that POSTs locally-originated envelopes to every configured peer. Origins
//! keep a two-peer topology from echoing events back and forth. Delivery is
//! best-effort; a peer that is down simply misses events and recovers from
//! heartbeats.

use super::{Envelope, EventBus};
use crate::secret::{self, RegistrationSecret, SECRET_HEADER};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{middleware, Json, Router};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const EVENTS_PATH: &str = "/se/grid/events";

/// Router exposing the event ingress endpoint, secret-protected.
pub fn router(bus: EventBus, secret: RegistrationSecret) -> Router {
    Router::new()
        .route(EVENTS_PATH, post(ingress))
        .route_layer(middleware::from_fn_with_state(
            secret,
            secret::require_secret,
        ))
        .with_state(bus)
}

async fn ingress(State(bus): State<EventBus>, Json(envelope): Json<Envelope>) -> StatusCode {
    bus.publish_remote(envelope);
    StatusCode::OK
}

/// Forward locally-originated events to `peers` until the bus closes.
pub fn spawn_forwarder(
    bus: EventBus,
    peers: Vec<String>,
    secret: RegistrationSecret,
) -> JoinHandle<()> {
    let client = reqwest::Client::new();
    let mut rx = bus.subscribe();
    let local = bus.instance();
    tokio::spawn(async move {
        loop {
            let envelope = match rx.recv().await {
                Ok(envelope) => envelope,
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "event forwarder lagged; peers will recover from heartbeats");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            if envelope.origin != local {
                continue;
            }
            for peer in &peers {
                let url = format!("{}{}", peer.trim_end_matches('/'), EVENTS_PATH);
                let mut req = client.post(&url).json(&envelope);
                if let Some(value) = secret.header_value() {
                    req = req.header(SECRET_HEADER, value);
                }
                match req.send().await {
                    Ok(resp) if resp.status().is_success() => {}
                    Ok(resp) => {
                        debug!(peer = %peer, status = %resp.status(), "peer refused event")
                    }
                    Err(err) => debug!(peer = %peer, err = %err, "event delivery failed"),
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::GridEvent;
    use crate::ids::NodeId;

    #[tokio::test]
    async fn test_ingress_republishes_on_local_bus() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let foreign = uuid::Uuid::new_v4();
        let node_id = NodeId::new();

        ingress(
            State(bus.clone()),
            Json(Envelope {
                origin: foreign,
                event: GridEvent::NodeAdded { node_id },
            }),
        )
        .await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received.origin, foreign);
        assert!(matches!(
            received.event,
            GridEvent::NodeAdded { node_id: n } if n == node_id
        ));
    }
}
