//! Configuration management for Turnstile.
//!
//! Values come from an optional YAML file, then `TURNSTILE__`-prefixed
//! environment variables (`TURNSTILE__RATE_LIMITING__MAX_REQUESTS=50`).

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TurnstileError};
use crate::mesh::ClusterConfig;
use crate::middleware::StoreFailurePolicy;
use crate::ratelimit::{RateLimitPolicy, DEFAULT_MAX_REQUESTS, DEFAULT_WINDOW_SECS};

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Cluster configuration, used by the `cluster` store
    #[serde(default)]
    pub cluster: ClusterSettings,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Admission service address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8090))
}

/// Which store backend holds the buckets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Memory,
    Cluster,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Requests admitted per window; non-positive values mean 1
    #[serde(default = "default_max_requests")]
    pub max_requests: i64,

    /// Window length in seconds; non-positive values mean 1
    #[serde(default = "default_window_secs")]
    pub window_secs: i64,

    /// Store backend
    #[serde(default)]
    pub store: StoreKind,

    /// Use the store's atomic increment when available
    #[serde(default)]
    pub atomic_increment: bool,

    /// Per-call store timeout in milliseconds
    #[serde(default)]
    pub store_timeout_ms: Option<u64>,

    /// Reaction to store failures
    #[serde(default)]
    pub on_store_failure: StoreFailurePolicy,

    /// How often expired buckets are dropped (memory) or retracted (cluster)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_secs: default_window_secs(),
            store: StoreKind::default(),
            atomic_increment: false,
            store_timeout_ms: None,
            on_store_failure: StoreFailurePolicy::default(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_max_requests() -> i64 {
    DEFAULT_MAX_REQUESTS as i64
}

fn default_window_secs() -> i64 {
    DEFAULT_WINDOW_SECS as i64
}

fn default_sweep_interval() -> u64 {
    30
}

impl RateLimitingConfig {
    /// The clamped limit/window pair.
    pub fn policy(&self) -> RateLimitPolicy {
        RateLimitPolicy::new(self.max_requests, self.window_secs)
    }

    pub fn store_timeout(&self) -> Option<Duration> {
        self.store_timeout_ms.map(Duration::from_millis)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Cluster membership settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSettings {
    /// Node id; a random UUID when unset
    #[serde(default)]
    pub node_id: Option<String>,

    /// Gossip listen address
    #[serde(default = "default_gossip_addr")]
    pub listen_addr: SocketAddr,

    /// Address advertised to peers; defaults to `listen_addr`
    #[serde(default)]
    pub advertise_addr: Option<SocketAddr>,

    /// Seed node addresses
    #[serde(default)]
    pub seed_nodes: Vec<String>,

    /// Nodes only gossip with peers sharing this id
    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,

    #[serde(default = "default_gossip_interval")]
    pub gossip_interval_ms: u64,

    #[serde(default = "default_dead_node_grace_period")]
    pub dead_node_grace_period_secs: u64,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            node_id: None,
            listen_addr: default_gossip_addr(),
            advertise_addr: None,
            seed_nodes: Vec::new(),
            cluster_id: default_cluster_id(),
            gossip_interval_ms: default_gossip_interval(),
            dead_node_grace_period_secs: default_dead_node_grace_period(),
        }
    }
}

fn default_gossip_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7946))
}

fn default_cluster_id() -> String {
    "turnstile".to_string()
}

fn default_gossip_interval() -> u64 {
    100
}

fn default_dead_node_grace_period() -> u64 {
    3600
}

impl ClusterSettings {
    pub fn to_cluster_config(&self) -> ClusterConfig {
        ClusterConfig {
            node_id: self
                .node_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            listen_addr: self.listen_addr,
            advertise_addr: self.advertise_addr.unwrap_or(self.listen_addr),
            seed_nodes: self.seed_nodes.clone(),
            cluster_id: self.cluster_id.clone(),
            gossip_interval: Duration::from_millis(self.gossip_interval_ms),
            dead_node_grace_period: Duration::from_secs(self.dead_node_grace_period_secs),
        }
    }
}

impl TurnstileConfig {
    /// Load configuration from an optional YAML file and the environment.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::new(path, ::config::FileFormat::Yaml));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix("TURNSTILE")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("cluster.seed_nodes"),
        );

        builder
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| TurnstileError::Config(e.to_string()))
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse configuration: {}", e)))
    }
}
