//! Distributor lifecycle tests: registration, duplicate registration,
//! removal, drain, and the node/model/health-check bookkeeping invariant.

use gridd::capabilities::Capabilities;
use gridd::config::{DriverDescriptor, NodeConfig};
use gridd::distributor::selector::DefaultSlotSelector;
use gridd::distributor::{Distributor, DistributorSettings};
use gridd::error::GridError;
use gridd::events::EventBus;
use gridd::node::factory::FactoryRegistry;
use gridd::node::{LocalNode, Node};
use gridd::queue::{SessionQueue, SessionQueuer};
use gridd::secret::RegistrationSecret;
use gridd::sessionmap::InMemorySessionMap;
use std::sync::Arc;
use std::time::Duration;

fn cheese_node_config() -> NodeConfig {
    NodeConfig {
        uri: None,
        heartbeat_interval: Duration::from_secs(10),
        distributor_url: None,
        max_sessions: None,
        drivers: vec![DriverDescriptor {
            display_name: "cheese".into(),
            stereotype: Capabilities::new().with("browserName", "cheese"),
            max_sessions: 1,
            factory: "stub".into(),
            endpoint: None,
        }],
    }
}

struct Fixture {
    bus: EventBus,
    distributor: Arc<Distributor>,
    _tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Drop for Fixture {
    fn drop(&mut self) {
        for task in &self._tasks {
            task.abort();
        }
    }
}

fn fixture() -> Fixture {
    let bus = EventBus::new();
    let queue = SessionQueue::new(bus.clone(), Duration::from_secs(60));
    let distributor = Distributor::new(
        bus.clone(),
        Arc::new(InMemorySessionMap::new()),
        queue as Arc<dyn SessionQueuer>,
        Box::new(DefaultSlotSelector),
        DistributorSettings::default(),
        RegistrationSecret::none(),
    );
    let tasks = distributor.start();
    Fixture {
        bus,
        distributor,
        _tasks: tasks,
    }
}

fn make_node(bus: &EventBus, uri: &str) -> Arc<LocalNode> {
    LocalNode::new(
        &cheese_node_config(),
        &FactoryRegistry::builtin(),
        bus.clone(),
        uri.to_string(),
    )
    .unwrap()
}

async fn wait_for<F, Fut>(mut probe: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if probe().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached within 2s");
}

#[tokio::test]
async fn test_add_node_shows_up_in_status() {
    let fx = fixture();
    let node = make_node(&fx.bus, "http://127.0.0.1:5555");
    let status = node.status().await.unwrap();
    fx.distributor.add_node(node.clone(), status).await;

    let grid = fx.distributor.status().await;
    assert_eq!(grid.nodes.len(), 1);
    assert_eq!(grid.nodes[0].uri, "http://127.0.0.1:5555");
}

#[tokio::test]
async fn test_duplicate_registration_is_idempotent() {
    let fx = fixture();
    let node = make_node(&fx.bus, "http://127.0.0.1:5555");
    let status = node.status().await.unwrap();
    fx.distributor.add_node(node.clone(), status.clone()).await;
    fx.distributor.add_node(node.clone(), status).await;

    assert_eq!(fx.distributor.node_count().await, 1);
    assert_eq!(fx.distributor.handle_count().await, 1);
    assert_eq!(fx.distributor.health_check_count().await, 1);
}

#[tokio::test]
async fn test_remove_node_empties_the_grid() {
    let fx = fixture();
    let node = make_node(&fx.bus, "http://127.0.0.1:5555");
    let status = node.status().await.unwrap();
    let node_id = status.node_id;
    fx.distributor.add_node(node.clone(), status).await;

    fx.distributor.remove_node(node_id).await;
    assert_eq!(fx.distributor.status().await.nodes.len(), 0);
    assert_eq!(fx.distributor.node_count().await, 0);
    assert_eq!(fx.distributor.handle_count().await, 0);
    assert_eq!(fx.distributor.health_check_count().await, 0);
}

#[tokio::test]
async fn test_bookkeeping_stays_consistent_through_lifecycle() {
    let fx = fixture();
    for i in 0..3 {
        let node = make_node(&fx.bus, &format!("http://127.0.0.1:55{i:02}"));
        let status = node.status().await.unwrap();
        fx.distributor.add_node(node, status).await;
    }
    // model ↔ handles ↔ health checks agree at every step.
    assert_eq!(fx.distributor.node_count().await, 3);
    assert_eq!(fx.distributor.handle_count().await, 3);
    assert_eq!(fx.distributor.health_check_count().await, 3);

    let grid = fx.distributor.status().await;
    let victim = grid.nodes[1].node_id;
    fx.distributor.remove_node(victim).await;
    assert_eq!(fx.distributor.node_count().await, 2);
    assert_eq!(fx.distributor.handle_count().await, 2);
    assert_eq!(fx.distributor.health_check_count().await, 2);
}

#[tokio::test]
async fn test_drain_of_idle_node_removes_it_from_the_grid() {
    let fx = fixture();
    let node = make_node(&fx.bus, "http://127.0.0.1:5555");
    let status = node.status().await.unwrap();
    let node_id = status.node_id;
    fx.distributor.add_node(node.clone(), status).await;

    fx.distributor.drain_node(node_id).await.unwrap();
    assert!(node.is_draining().await);

    // The idle node announces completion immediately and the distributor
    // drops it on the event.
    let distributor = fx.distributor.clone();
    wait_for(|| {
        let distributor = distributor.clone();
        async move { distributor.node_count().await == 0 }
    })
    .await;

    // Once draining, the node itself refuses new sessions.
    let err = node
        .new_session(gridd::session::CreateSessionRequest {
            request_id: gridd::ids::RequestId::new(),
            dialects: vec![gridd::session::Dialect::W3c],
            capabilities: Capabilities::new().with("browserName", "cheese"),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, GridError::SessionNotCreated(_)));
}

#[tokio::test]
async fn test_drain_of_unknown_node_is_an_error() {
    let fx = fixture();
    let err = fx
        .distributor
        .drain_node(gridd::ids::NodeId::new())
        .await
        .unwrap_err();
    assert!(matches!(err, GridError::NoSuchNode(_)));
}

#[tokio::test]
async fn test_node_registers_itself_through_heartbeat_events() {
    let fx = fixture();
    let node = make_node(&fx.bus, "http://127.0.0.1:5555");
    // No direct add: the first status publication on the bus registers it.
    let _heartbeat = node.spawn_heartbeat(Duration::from_millis(50));

    let distributor = fx.distributor.clone();
    wait_for(|| {
        let distributor = distributor.clone();
        async move { distributor.node_count().await == 1 }
    })
    .await;
    assert_eq!(fx.distributor.health_check_count().await, 1);
}

#[tokio::test]
async fn test_readiness_combines_bus_and_session_map() {
    let fx = fixture();
    assert!(fx.distributor.ready().await);
    let status = fx.distributor.status().await;
    assert!(status.ready);
}
