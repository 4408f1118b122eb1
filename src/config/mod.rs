use crate::capabilities::Capabilities;
use crate::error::GridError;
use crate::secret::RegistrationSecret;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 4444;
const DEFAULT_HEALTHCHECK_INTERVAL_SECS: u64 = 300;
const MIN_HEALTHCHECK_INTERVAL_SECS: u64 = 10;
const DEFAULT_PURGE_INTERVAL_SECS: u64 = 30;
const DEFAULT_NODE_LOST_TIMEOUT_SECS: u64 = 120;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;
const DEFAULT_RETRY_INTERVAL_SECS: u64 = 5;
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 10;
const DEFAULT_DRIVER_MAX_SESSIONS: usize = 1;

// ─── TOML config file ─────────────────────────────────────────────────────────

/// All fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    server: Option<ServerToml>,
    distributor: Option<DistributorToml>,
    queue: Option<QueueToml>,
    node: Option<NodeToml>,
    events: Option<EventsToml>,
    secret: Option<SecretToml>,
    /// Log level filter string, e.g. "debug", "info,gridd=trace" (default: "info").
    log: Option<String>,
}

#[derive(Deserialize, Default)]
struct ServerToml {
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Deserialize, Default)]
struct DistributorToml {
    /// Seconds between node health probes (floor 10, default 300).
    healthcheck_interval: Option<i64>,
    /// Seconds between scans for nodes with stale heartbeats (default 30).
    purge_interval: Option<u64>,
    /// Seconds without a heartbeat before a node is dropped (default 120).
    node_lost_timeout: Option<u64>,
    /// Base URL of a remote session-map service; in-memory when unset.
    session_map_url: Option<String>,
    /// Base URL of a remote queue service; in-process when unset.
    queue_url: Option<String>,
}

#[derive(Deserialize, Default)]
struct QueueToml {
    /// Maximum seconds a request may spend in the queue (default 300).
    request_timeout: Option<u64>,
    /// Seconds between re-examinations of an unmatched queue head (default 5).
    retry_interval: Option<u64>,
}

#[derive(Deserialize, Default)]
struct NodeToml {
    /// Externally-reachable URI this node advertises; derived from
    /// server.host/port when unset.
    uri: Option<String>,
    /// Seconds between status publications (default 10).
    heartbeat_interval: Option<u64>,
    /// Distributor base URL to publish status snapshots to directly.
    distributor_url: Option<String>,
    /// Hard cap on concurrent sessions across all slots (default: sum of
    /// driver max_sessions).
    max_sessions: Option<usize>,
    #[serde(default)]
    driver: Vec<DriverDescriptor>,
}

#[derive(Deserialize, Default)]
struct EventsToml {
    /// Peer base URLs that locally-published events are forwarded to.
    peers: Option<Vec<String>>,
}

#[derive(Deserialize, Default)]
struct SecretToml {
    value: Option<String>,
}

/// One configured driver: a display name, the stereotype its slots
/// advertise, how many concurrent sessions it supports, and which named
/// factory builds its sessions.
#[derive(Debug, Clone, Deserialize)]
pub struct DriverDescriptor {
    pub display_name: String,
    pub stereotype: Capabilities,
    #[serde(default = "default_driver_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_factory_name")]
    pub factory: String,
    /// Driver endpoint for factories that forward to a running service.
    pub endpoint: Option<String>,
}

fn default_driver_max_sessions() -> usize {
    DEFAULT_DRIVER_MAX_SESSIONS
}

fn default_factory_name() -> String {
    "stub".to_string()
}

fn load_toml(path: &Path) -> Result<TomlConfig, GridError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| GridError::Config(format!("cannot read {}: {e}", path.display())))?;
    toml::from_str(&contents)
        .map_err(|e| GridError::Config(format!("cannot parse {}: {e}", path.display())))
}

// ─── GridConfig ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn external_uri(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct DistributorConfig {
    pub healthcheck_interval: Duration,
    pub purge_interval: Duration,
    pub node_lost_timeout: Duration,
    pub session_map_url: Option<String>,
    pub queue_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub request_timeout: Duration,
    pub retry_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub uri: Option<String>,
    pub heartbeat_interval: Duration,
    pub distributor_url: Option<String>,
    pub max_sessions: Option<usize>,
    pub drivers: Vec<DriverDescriptor>,
}

#[derive(Debug, Clone)]
pub struct GridConfig {
    pub server: ServerConfig,
    pub log: String,
    pub distributor: DistributorConfig,
    pub queue: QueueConfig,
    pub node: NodeConfig,
    pub event_peers: Vec<String>,
    pub secret: RegistrationSecret,
}

impl GridConfig {
    /// Build config from CLI/env args + optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env — passed as `Some(value)` from clap
    ///   2. TOML file at `config_path`
    ///   3. Built-in defaults
    pub fn new(
        config_path: Option<&Path>,
        host: Option<String>,
        port: Option<u16>,
        log: Option<String>,
        secret: Option<String>,
    ) -> Result<Self, GridError> {
        let toml = match config_path {
            Some(path) => load_toml(path)?,
            None => TomlConfig::default(),
        };
        let server_toml = toml.server.unwrap_or_default();
        let distributor_toml = toml.distributor.unwrap_or_default();
        let queue_toml = toml.queue.unwrap_or_default();
        let node_toml = toml.node.unwrap_or_default();

        let server = ServerConfig {
            host: host
                .or(server_toml.host)
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: port.or(server_toml.port).unwrap_or(DEFAULT_PORT),
        };
        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());

        let distributor = DistributorConfig {
            healthcheck_interval: clamp_healthcheck_interval(
                distributor_toml
                    .healthcheck_interval
                    .unwrap_or(DEFAULT_HEALTHCHECK_INTERVAL_SECS as i64),
            ),
            purge_interval: Duration::from_secs(
                distributor_toml
                    .purge_interval
                    .unwrap_or(DEFAULT_PURGE_INTERVAL_SECS),
            ),
            node_lost_timeout: Duration::from_secs(
                distributor_toml
                    .node_lost_timeout
                    .unwrap_or(DEFAULT_NODE_LOST_TIMEOUT_SECS),
            ),
            session_map_url: distributor_toml.session_map_url,
            queue_url: distributor_toml.queue_url,
        };

        let queue = QueueConfig {
            request_timeout: Duration::from_secs(
                queue_toml
                    .request_timeout
                    .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
            ),
            retry_interval: Duration::from_secs(
                queue_toml
                    .retry_interval
                    .unwrap_or(DEFAULT_RETRY_INTERVAL_SECS),
            ),
        };

        let node = NodeConfig {
            uri: node_toml.uri,
            heartbeat_interval: Duration::from_secs(
                node_toml
                    .heartbeat_interval
                    .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            ),
            distributor_url: node_toml.distributor_url,
            max_sessions: node_toml.max_sessions,
            drivers: node_toml.driver,
        };

        let event_peers = toml.events.unwrap_or_default().peers.unwrap_or_default();

        let secret =
            RegistrationSecret::from_config(secret.or(toml.secret.unwrap_or_default().value));

        Ok(Self {
            server,
            log,
            distributor,
            queue,
            node,
            event_peers,
            secret,
        })
    }
}

/// Intervals at or below zero use the floor rather than disabling the probe;
/// an unprobed node could stay UP forever after silent death.
fn clamp_healthcheck_interval(secs: i64) -> Duration {
    if secs < MIN_HEALTHCHECK_INTERVAL_SECS as i64 {
        warn!(
            requested = secs,
            floor = MIN_HEALTHCHECK_INTERVAL_SECS,
            "healthcheck_interval below floor; clamping"
        );
        Duration::from_secs(MIN_HEALTHCHECK_INTERVAL_SECS)
    } else {
        Duration::from_secs(secs as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_without_file() {
        let cfg = GridConfig::new(None, None, None, None, None).unwrap();
        assert_eq!(cfg.server.port, DEFAULT_PORT);
        assert_eq!(cfg.queue.request_timeout, Duration::from_secs(300));
        assert_eq!(cfg.queue.retry_interval, Duration::from_secs(5));
        assert_eq!(
            cfg.distributor.healthcheck_interval,
            Duration::from_secs(300)
        );
        assert!(cfg.node.drivers.is_empty());
    }

    #[test]
    fn test_healthcheck_interval_is_clamped_to_floor() {
        assert_eq!(clamp_healthcheck_interval(0), Duration::from_secs(10));
        assert_eq!(clamp_healthcheck_interval(-5), Duration::from_secs(10));
        assert_eq!(clamp_healthcheck_interval(7), Duration::from_secs(10));
        assert_eq!(clamp_healthcheck_interval(60), Duration::from_secs(60));
    }

    #[test]
    fn test_cli_wins_over_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[server]
port = 5000

[queue]
request_timeout = 60
"#
        )
        .unwrap();
        let cfg = GridConfig::new(Some(file.path()), None, Some(6000), None, None).unwrap();
        assert_eq!(cfg.server.port, 6000);
        assert_eq!(cfg.queue.request_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_driver_descriptors_parse_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[[node.driver]]
display_name = "cheese"
max_sessions = 3

[node.driver.stereotype]
browserName = "cheese"

[[node.driver]]
display_name = "peas relay"
factory = "relay"
endpoint = "http://127.0.0.1:9515"

[node.driver.stereotype]
browserName = "peas"
"#
        )
        .unwrap();
        let cfg = GridConfig::new(Some(file.path()), None, None, None, None).unwrap();
        assert_eq!(cfg.node.drivers.len(), 2);
        let cheese = &cfg.node.drivers[0];
        assert_eq!(cheese.max_sessions, 3);
        assert_eq!(cheese.factory, "stub");
        assert_eq!(
            cheese.stereotype.get("browserName"),
            Some(&serde_json::json!("cheese"))
        );
        let peas = &cfg.node.drivers[1];
        assert_eq!(peas.factory, "relay");
        assert_eq!(peas.endpoint.as_deref(), Some("http://127.0.0.1:9515"));
    }

    #[test]
    fn test_bad_toml_is_a_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not = [valid").unwrap();
        let err = GridConfig::new(Some(file.path()), None, None, None, None).unwrap_err();
        assert!(matches!(err, GridError::Config(_)));
    }
}
