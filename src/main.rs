use anyhow::{Context as _, Result};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use clap::{Parser, Subcommand};
use gridd::config::GridConfig;
use gridd::distributor::selector::DefaultSlotSelector;
use gridd::distributor::{Distributor, DistributorSettings};
use gridd::events::{remote as events_remote, EventBus};
use gridd::node::factory::FactoryRegistry;
use gridd::node::{LocalNode, Node as _};
use gridd::queue::remote::RemoteQueue;
use gridd::queue::{SessionQueue, SessionQueuer};
use gridd::sessionmap::remote::RemoteSessionMap;
use gridd::sessionmap::{InMemorySessionMap, SessionMap};
use gridd::GridContext;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(
    name = "gridd",
    about = "gridd — browser-automation grid, session distribution daemon",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to a TOML config file
    #[arg(long, env = "GRID_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Bind host for the HTTP surface
    #[arg(long, env = "GRID_HOST")]
    host: Option<String>,

    /// Bind port for the HTTP surface
    #[arg(long, env = "GRID_PORT")]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "GRID_LOG")]
    log: Option<String>,

    /// Registration secret for intra-cluster mutations
    #[arg(long, env = "GRID_SECRET")]
    secret: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Run every component in one process (default when no subcommand given).
    ///
    /// Local event bus, in-memory session map, in-process queue and
    /// distributor, plus an embedded node when drivers are configured.
    ///
    /// Examples:
    ///   gridd standalone
    ///   gridd
    Standalone,
    /// Run the distributor service.
    ///
    /// Maintains the grid model, schedules queued requests onto nodes, and
    /// accepts node registrations. Point it at remote queue / session-map
    /// services via [distributor] queue_url and session_map_url; without
    /// them it embeds both in-process.
    Distributor,
    /// Run the new-session queue service.
    ///
    /// Accepts client session requests, holds them FIFO, and blocks each
    /// caller until a distributor matches it or the request times out.
    Queue,
    /// Run the session-map service.
    ///
    /// Serves the session-id → node-URI binding used to route in-session
    /// commands.
    Sessions,
    /// Run a node.
    ///
    /// Hosts the configured driver slots and answers session creation,
    /// in-session commands, status, health, and drain. Publishes its status
    /// snapshot to [node] distributor_url on the heartbeat period.
    Node,
}

fn init_tracing(filter: &str) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = GridConfig::new(
        args.config.as_deref(),
        args.host,
        args.port,
        args.log,
        args.secret,
    )
    .context("bad configuration")?;
    init_tracing(&config.log);

    match args.command.unwrap_or(Command::Standalone) {
        Command::Standalone => run_standalone(config).await,
        Command::Distributor => run_distributor(config).await,
        Command::Queue => run_queue(config).await,
        Command::Sessions => run_sessions(config).await,
        Command::Node => run_node(config).await,
    }
}

async fn serve(bind: &str, router: Router) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("cannot bind {bind}"))?;
    info!("listening on http://{bind}");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
}

async fn run_standalone(config: GridConfig) -> Result<()> {
    let bind = config.server.bind_addr();
    let registry = FactoryRegistry::builtin();
    let ctx = GridContext::standalone(config, &registry).await?;
    let router = ctx.standalone_router();
    serve(&bind, router).await?;
    ctx.close().await;
    Ok(())
}

async fn run_distributor(config: GridConfig) -> Result<()> {
    let bind = config.server.bind_addr();
    let secret = config.secret.clone();
    let bus = EventBus::new();

    let session_map: Arc<dyn SessionMap> = match &config.distributor.session_map_url {
        Some(url) => Arc::new(RemoteSessionMap::new(url.clone(), secret.clone())),
        None => Arc::new(InMemorySessionMap::new()),
    };

    // Without a remote queue the distributor embeds one and serves its
    // endpoints itself.
    let local_queue = match &config.distributor.queue_url {
        Some(_) => None,
        None => Some(SessionQueue::new(bus.clone(), config.queue.request_timeout)),
    };
    let queue: Arc<dyn SessionQueuer> = match (&config.distributor.queue_url, &local_queue) {
        (Some(url), _) => Arc::new(RemoteQueue::new(url.clone(), secret.clone())),
        (None, Some(queue)) => queue.clone() as Arc<dyn SessionQueuer>,
        (None, None) => unreachable!("local queue built when no queue_url is set"),
    };

    let distributor = Distributor::new(
        bus.clone(),
        session_map.clone(),
        queue,
        Box::new(DefaultSlotSelector),
        DistributorSettings {
            healthcheck_interval: config.distributor.healthcheck_interval,
            purge_interval: config.distributor.purge_interval,
            node_lost_timeout: config.distributor.node_lost_timeout,
            retry_interval: config.queue.retry_interval,
        },
        secret.clone(),
    );
    let mut background = distributor.start();
    if !config.event_peers.is_empty() {
        background.push(events_remote::spawn_forwarder(
            bus.clone(),
            config.event_peers.clone(),
            secret.clone(),
        ));
    }

    let mut router = gridd::distributor::routes::router(distributor, secret.clone())
        .merge(events_remote::router(bus, secret.clone()));
    if let Some(queue) = &local_queue {
        router = router.merge(gridd::queue::routes::router(queue.clone(), secret.clone()));
    }

    serve(&bind, router).await?;
    while let Some(handle) = background.pop() {
        handle.abort();
    }
    Ok(())
}

async fn run_queue(config: GridConfig) -> Result<()> {
    let bind = config.server.bind_addr();
    let secret = config.secret.clone();
    let bus = EventBus::new();
    let queue = SessionQueue::new(bus.clone(), config.queue.request_timeout);

    let mut background = Vec::new();
    if !config.event_peers.is_empty() {
        background.push(events_remote::spawn_forwarder(
            bus.clone(),
            config.event_peers.clone(),
            secret.clone(),
        ));
    }

    let ready = queue.clone();
    let router = gridd::queue::routes::router(queue, secret.clone())
        .merge(events_remote::router(bus, secret))
        .route(
            "/readyz",
            get(move || {
                let ready = ready.clone();
                async move {
                    if ready.ready().await {
                        StatusCode::NO_CONTENT
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                }
            }),
        );

    serve(&bind, router).await?;
    while let Some(handle) = background.pop() {
        handle.abort();
    }
    Ok(())
}

async fn run_sessions(config: GridConfig) -> Result<()> {
    let bind = config.server.bind_addr();
    let secret = config.secret.clone();
    let map: Arc<dyn SessionMap> = Arc::new(InMemorySessionMap::new());

    let ready = map.clone();
    let router = gridd::sessionmap::routes::router(map, secret).route(
        "/readyz",
        get(move || {
            let ready = ready.clone();
            async move {
                if ready.ready().await {
                    StatusCode::NO_CONTENT
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                }
            }
        }),
    );

    serve(&bind, router).await
}

async fn run_node(config: GridConfig) -> Result<()> {
    let bind = config.server.bind_addr();
    let secret = config.secret.clone();
    let bus = EventBus::new();
    let registry = FactoryRegistry::builtin();
    let uri = config
        .node
        .uri
        .clone()
        .unwrap_or_else(|| config.server.external_uri());
    let node = LocalNode::new(&config.node, &registry, bus.clone(), uri)?;

    let mut background = vec![node.spawn_heartbeat(config.node.heartbeat_interval)];
    if let Some(distributor_url) = &config.node.distributor_url {
        background.push(node.spawn_registration(
            distributor_url.clone(),
            secret.clone(),
            config.node.heartbeat_interval,
        ));
    }
    if !config.event_peers.is_empty() {
        background.push(events_remote::spawn_forwarder(
            bus.clone(),
            config.event_peers.clone(),
            secret.clone(),
        ));
    }

    let ready = node.clone();
    let router = gridd::node::routes::router(node, secret.clone())
        .merge(events_remote::router(bus, secret))
        .route(
            "/readyz",
            get(move || {
                let ready = ready.clone();
                async move {
                    match ready.status().await {
                        Ok(_) => StatusCode::NO_CONTENT,
                        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
                    }
                }
            }),
        );

    serve(&bind, router).await?;
    while let Some(handle) = background.pop() {
        handle.abort();
    }
    Ok(())
}
