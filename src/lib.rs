pub mod capabilities;
pub mod config;
pub mod distributor;
pub mod error;
pub mod events;
pub mod ids;
pub mod node;
pub mod queue;
pub mod secret;
pub mod session;
pub mod sessionmap;

// Re-export the error type; nearly every caller needs it.
pub use error::GridError;

use config::GridConfig;
use distributor::selector::DefaultSlotSelector;
use distributor::{Distributor, DistributorSettings};
use events::EventBus;
use node::factory::FactoryRegistry;
use node::{LocalNode, Node as _};
use queue::{SessionQueue, SessionQueuer};
use sessionmap::{InMemorySessionMap, SessionMap};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Shared wiring for one grid process: the components a role constructed and
/// the background tasks keeping them alive. Components are built in
/// dependency order and torn down in reverse.
pub struct GridContext {
    pub config: Arc<GridConfig>,
    pub bus: EventBus,
    pub session_map: Arc<dyn SessionMap>,
    pub queue: Option<Arc<SessionQueue>>,
    pub distributor: Option<Arc<Distributor>>,
    pub node: Option<Arc<LocalNode>>,
    background: Vec<JoinHandle<()>>,
}

impl GridContext {
    /// Wire every component into one process: local bus, in-memory session
    /// map, in-process queue, distributor, and — when drivers are
    /// configured — an embedded node registered directly.
    pub async fn standalone(
        config: GridConfig,
        registry: &FactoryRegistry,
    ) -> Result<Self, GridError> {
        let config = Arc::new(config);
        let bus = EventBus::new();
        let session_map: Arc<dyn SessionMap> = Arc::new(InMemorySessionMap::new());
        let queue = SessionQueue::new(bus.clone(), config.queue.request_timeout);
        let distributor = Distributor::new(
            bus.clone(),
            session_map.clone(),
            queue.clone() as Arc<dyn SessionQueuer>,
            Box::new(DefaultSlotSelector),
            DistributorSettings {
                healthcheck_interval: config.distributor.healthcheck_interval,
                purge_interval: config.distributor.purge_interval,
                node_lost_timeout: config.distributor.node_lost_timeout,
                retry_interval: config.queue.retry_interval,
            },
            config.secret.clone(),
        );
        let mut background = distributor.start();

        let node = if config.node.drivers.is_empty() {
            None
        } else {
            let uri = config
                .node
                .uri
                .clone()
                .unwrap_or_else(|| config.server.external_uri());
            let node = LocalNode::new(&config.node, registry, bus.clone(), uri)?;
            let status = node.status().await?;
            distributor.add_node(node.clone(), status).await;
            background.push(node.spawn_heartbeat(config.node.heartbeat_interval));
            Some(node)
        };

        info!("standalone grid wired");
        Ok(Self {
            config,
            bus,
            session_map,
            queue: Some(queue),
            distributor: Some(distributor),
            node,
            background,
        })
    }

    /// Keep a background task alive for the context's lifetime.
    pub fn track(&mut self, handle: JoinHandle<()>) {
        self.background.push(handle);
    }

    /// The merged HTTP surface of a standalone grid: queue + distributor +
    /// session map + event ingress.
    pub fn standalone_router(&self) -> axum::Router {
        let secret = self.config.secret.clone();
        let mut router = axum::Router::new();
        if let Some(queue) = &self.queue {
            router = router.merge(queue::routes::router(queue.clone(), secret.clone()));
        }
        if let Some(distributor) = &self.distributor {
            router = router.merge(distributor::routes::router(
                distributor.clone(),
                secret.clone(),
            ));
        }
        router = router.merge(sessionmap::routes::router(
            self.session_map.clone(),
            secret.clone(),
        ));
        router.merge(events::remote::router(self.bus.clone(), secret))
    }

    /// Stop background work in reverse construction order.
    pub async fn close(mut self) {
        while let Some(handle) = self.background.pop() {
            handle.abort();
        }
        info!("grid context closed");
    }
}
