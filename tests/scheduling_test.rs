//! End-to-end scheduling: queued requests matched onto slots, retry-to-head
//! on transient failures, session-map bindings, and concurrent session
//! creation over the node's HTTP surface.

use async_trait::async_trait;
use gridd::capabilities::Capabilities;
use gridd::config::{DriverDescriptor, GridConfig, NodeConfig};
use gridd::error::GridError;
use gridd::events::{EventBus, GridEvent};
use gridd::ids::SessionId;
use gridd::node::factory::{CreatedSession, FactoryRegistry, SessionFactory};
use gridd::node::{routes as node_routes, LocalNode, Node as _};
use gridd::secret::RegistrationSecret;
use gridd::sessionmap::SessionMap as _;
use gridd::session::CreateSessionRequest;
use gridd::GridContext;
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn cheese_driver(max_sessions: usize, factory: &str) -> DriverDescriptor {
    DriverDescriptor {
        display_name: "cheese".into(),
        stereotype: Capabilities::new().with("browserName", "cheese"),
        max_sessions,
        factory: factory.into(),
        endpoint: None,
    }
}

fn standalone_config(max_sessions: usize, factory: &str) -> GridConfig {
    let mut config = GridConfig::new(None, None, None, None, None).unwrap();
    config.node.drivers = vec![cheese_driver(max_sessions, factory)];
    config.queue.request_timeout = Duration::from_secs(10);
    config.queue.retry_interval = Duration::from_millis(50);
    config
}

fn cheese_payload() -> serde_json::Value {
    json!({ "capabilities": { "alwaysMatch": { "browserName": "cheese" } } })
}

/// Fails the first `failures` creations retryably, then succeeds.
struct FlakyFactory {
    remaining: AtomicUsize,
}

impl FlakyFactory {
    fn new(failures: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl SessionFactory for FlakyFactory {
    async fn create(&self, request: &CreateSessionRequest) -> Result<CreatedSession, GridError> {
        let before = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .unwrap_or(0);
        if before > 0 {
            return Err(GridError::RetrySessionRequest(
                "driver briefly unavailable".to_string(),
            ));
        }
        Ok(CreatedSession {
            id: SessionId::new(),
            capabilities: request.capabilities.clone(),
            upstream: None,
        })
    }
}

#[tokio::test]
async fn test_queued_request_is_matched_and_bound() {
    let registry = FactoryRegistry::builtin();
    let ctx = GridContext::standalone(standalone_config(1, "stub"), &registry)
        .await
        .unwrap();
    let queue = ctx.queue.clone().unwrap();

    let payload = gridd::session::parse_new_session_payload(&cheese_payload()).unwrap();
    let request = gridd::queue::SessionRequest::new(payload);
    let response = queue.add(request).await.unwrap();

    let session_id: SessionId = response["value"]["sessionId"]
        .as_str()
        .unwrap()
        .parse()
        .unwrap();

    // Invariant: the occupied slot's session is bound in the session map to
    // the hosting node's URI.
    let distributor = ctx.distributor.clone().unwrap();
    assert_eq!(distributor.session_count().await, 1);
    let grid = distributor.status().await;
    let slot_session = grid.nodes[0]
        .slots
        .iter()
        .find_map(|s| s.session.as_ref())
        .expect("one slot busy");
    assert_eq!(slot_session.id, session_id);
    let bound_uri = ctx.session_map.uri_for(session_id).await.unwrap();
    assert_eq!(bound_uri, grid.nodes[0].uri);

    ctx.close().await;
}

#[tokio::test]
async fn test_retryable_failure_goes_back_to_head_and_succeeds() {
    let mut registry = FactoryRegistry::builtin();
    registry.register("flaky", |_| {
        Ok(Arc::new(FlakyFactory::new(1)) as Arc<dyn SessionFactory>)
    });
    let ctx = GridContext::standalone(standalone_config(1, "flaky"), &registry)
        .await
        .unwrap();
    let queue = ctx.queue.clone().unwrap();
    let bus = ctx.bus.clone();
    let mut rx = bus.subscribe();

    let payload = gridd::session::parse_new_session_payload(&cheese_payload()).unwrap();
    let request = gridd::queue::SessionRequest::new(payload);
    let request_id = request.request_id;
    let response = queue.add(request).await.unwrap();
    assert!(response["value"]["sessionId"].is_string());

    // The request went through the retry path: at least two request events
    // (the original add and the head retry) and exactly one terminal event.
    let mut request_events = 0;
    let mut terminal_events = 0;
    while let Ok(envelope) = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
        match envelope.unwrap().event {
            GridEvent::NewSessionRequest { request_id: id } if id == request_id => {
                request_events += 1
            }
            GridEvent::NewSessionResponse { request_id: id, .. } if id == request_id => {
                terminal_events += 1
            }
            GridEvent::NewSessionRejected { request_id: id, .. } if id == request_id => {
                terminal_events += 10
            }
            _ => {}
        }
    }
    assert!(request_events >= 2, "expected a head retry, saw {request_events}");
    assert_eq!(terminal_events, 1);

    ctx.close().await;
}

#[tokio::test]
async fn test_request_with_no_matching_stereotype_waits_then_times_out() {
    let registry = FactoryRegistry::builtin();
    let mut config = standalone_config(1, "stub");
    config.queue.request_timeout = Duration::from_millis(300);
    let ctx = GridContext::standalone(config, &registry).await.unwrap();
    let queue = ctx.queue.clone().unwrap();

    let payload = gridd::session::parse_new_session_payload(&json!({
        "capabilities": { "alwaysMatch": { "browserName": "peas" } }
    }))
    .unwrap();
    let err = queue
        .add(gridd::queue::SessionRequest::new(payload))
        .await
        .unwrap_err();
    assert!(matches!(err, GridError::Timeout(_)));

    ctx.close().await;
}

#[tokio::test]
async fn test_capability_alternatives_are_tried_in_order() {
    let registry = FactoryRegistry::builtin();
    let ctx = GridContext::standalone(standalone_config(1, "stub"), &registry)
        .await
        .unwrap();
    let queue = ctx.queue.clone().unwrap();

    // First choice can never match; the second can.
    let payload = gridd::session::parse_new_session_payload(&json!({
        "capabilities": {
            "firstMatch": [
                { "browserName": "peas" },
                { "browserName": "cheese" }
            ]
        }
    }))
    .unwrap();
    let response = queue
        .add(gridd::queue::SessionRequest::new(payload))
        .await
        .unwrap();
    assert_eq!(
        response["value"]["capabilities"]["browserName"],
        json!("cheese")
    );

    ctx.close().await;
}

#[tokio::test]
async fn test_standalone_drain_removes_node_and_it_stays_removed() {
    let registry = FactoryRegistry::builtin();
    let mut config = standalone_config(1, "stub");
    config.node.heartbeat_interval = Duration::from_millis(30);
    let ctx = GridContext::standalone(config, &registry).await.unwrap();
    let distributor = ctx.distributor.clone().unwrap();
    let node_id = ctx.node.as_ref().unwrap().id();

    distributor.drain_node(node_id).await.unwrap();
    let mut removed = false;
    for _ in 0..100 {
        if distributor.node_count().await == 0 {
            removed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(removed, "drained idle node should leave the grid");

    // The retired node's heartbeats must not resurrect it.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(distributor.node_count().await, 0);

    ctx.close().await;
}

#[tokio::test]
async fn test_ended_session_is_unbound_on_the_next_heartbeat() {
    let registry = FactoryRegistry::builtin();
    let mut config = standalone_config(1, "stub");
    config.node.heartbeat_interval = Duration::from_millis(50);
    let ctx = GridContext::standalone(config, &registry).await.unwrap();
    let queue = ctx.queue.clone().unwrap();

    let payload = gridd::session::parse_new_session_payload(&cheese_payload()).unwrap();
    let response = queue
        .add(gridd::queue::SessionRequest::new(payload))
        .await
        .unwrap();
    let session_id: SessionId = response["value"]["sessionId"]
        .as_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(ctx.session_map.uri_for(session_id).await.is_ok());

    // End the session on the node; the next status publication drops the
    // binding.
    ctx.node
        .as_ref()
        .unwrap()
        .stop_session(session_id)
        .await
        .unwrap();
    let mut unbound = false;
    for _ in 0..100 {
        if ctx.session_map.uri_for(session_id).await.is_err() {
            unbound = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(unbound, "session map binding should disappear after heartbeat");

    ctx.close().await;
}

#[tokio::test]
async fn test_three_concurrent_sessions_over_the_node_http_surface() {
    let bus = EventBus::new();
    let config = NodeConfig {
        uri: None,
        heartbeat_interval: Duration::from_secs(10),
        distributor_url: None,
        max_sessions: None,
        drivers: vec![cheese_driver(3, "stub")],
    };
    let node = LocalNode::new(
        &config,
        &FactoryRegistry::builtin(),
        bus,
        "http://127.0.0.1:0".into(),
    )
    .unwrap();
    let router = node_routes::router(node, RegistrationSecret::none());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    let client = reqwest::Client::new();
    let mut creations = Vec::new();
    for _ in 0..3 {
        let client = client.clone();
        let url = format!("{base}/session");
        creations.push(tokio::spawn(async move {
            let body = json!({
                "requestId": gridd::ids::RequestId::new(),
                "dialects": ["W3C"],
                "capabilities": { "browserName": "cheese" }
            });
            let response = client.post(&url).json(&body).send().await.unwrap();
            assert!(response.status().is_success());
            let body: serde_json::Value = response.json().await.unwrap();
            body["session"]["id"].as_str().unwrap().to_string()
        }));
    }

    let mut ids = HashSet::new();
    for creation in creations {
        ids.insert(creation.await.unwrap());
    }
    assert_eq!(ids.len(), 3, "session ids must be distinct");

    for id in &ids {
        let response = client
            .get(format!("{base}/session/{id}/url"))
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success(), "GET /session/{id}/url");
    }
}
