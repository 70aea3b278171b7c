//! Configuration management for Tokenhive.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{Result, TokenhiveError};
use crate::mesh::ClusterConfig;
use crate::ratelimit::RuleConfig;
use crate::store::{EvictionPolicy, MaxSizePolicy, MergePolicy};

/// Main configuration for a Tokenhive node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenhiveConfig {
    /// Node identity and request-path settings
    #[serde(default)]
    pub node: NodeConfig,

    /// Gossip cluster settings; absent means single-node operation
    #[serde(default)]
    pub cluster: Option<ClusterSettings>,

    /// Bucket map settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Upper bound on any single store call made while serving a request
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    /// Address the node accepts admission and forwarded bucket requests on
    #[serde(default = "default_request_addr")]
    pub listen_addr: SocketAddr,

    /// Request address advertised to peers (defaults to `listen_addr`)
    #[serde(default)]
    pub advertise_addr: Option<SocketAddr>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            operation_timeout_ms: default_operation_timeout_ms(),
            listen_addr: default_request_addr(),
            advertise_addr: None,
        }
    }
}

impl NodeConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn request_advertise_addr(&self) -> SocketAddr {
        self.advertise_addr.unwrap_or(self.listen_addr)
    }
}

fn default_request_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7947))
}

fn default_node_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_operation_timeout_ms() -> u64 {
    500
}

/// Gossip cluster configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSettings {
    /// Address to listen on for gossip
    #[serde(default = "default_gossip_addr")]
    pub listen_addr: SocketAddr,

    /// Address advertised to peers (defaults to `listen_addr`)
    #[serde(default)]
    pub advertise_addr: Option<SocketAddr>,

    /// Seed nodes to bootstrap membership
    #[serde(default)]
    pub seed_nodes: Vec<String>,

    /// Nodes only gossip with peers sharing this identifier
    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,

    #[serde(default = "default_gossip_interval_ms")]
    pub gossip_interval_ms: u64,

    #[serde(default = "default_dead_node_grace_period_secs")]
    pub dead_node_grace_period_secs: u64,

    /// How often local changes are pushed to, and peer state pulled from, gossip
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            listen_addr: default_gossip_addr(),
            advertise_addr: None,
            seed_nodes: Vec::new(),
            cluster_id: default_cluster_id(),
            gossip_interval_ms: default_gossip_interval_ms(),
            dead_node_grace_period_secs: default_dead_node_grace_period_secs(),
            sync_interval_ms: default_sync_interval_ms(),
        }
    }
}

impl ClusterSettings {
    /// Build the mesh configuration for `node`.
    pub fn to_cluster_config(&self, node: &NodeConfig) -> ClusterConfig {
        ClusterConfig {
            node_id: node.node_id.clone(),
            request_addr: Some(node.request_advertise_addr()),
            listen_addr: self.listen_addr,
            advertise_addr: self.advertise_addr.unwrap_or(self.listen_addr),
            seed_nodes: self.seed_nodes.clone(),
            cluster_id: self.cluster_id.clone(),
            gossip_interval: Duration::from_millis(self.gossip_interval_ms),
            dead_node_grace_period: Duration::from_secs(self.dead_node_grace_period_secs),
        }
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }
}

fn default_gossip_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7946))
}

fn default_cluster_id() -> String {
    "tokenhive".to_string()
}

fn default_gossip_interval_ms() -> u64 {
    100
}

fn default_dead_node_grace_period_secs() -> u64 {
    3600
}

fn default_sync_interval_ms() -> u64 {
    250
}

/// Configuration of the map holding bucket state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Logical namespace for bucket keys
    #[serde(default = "default_map_name")]
    pub name: String,

    /// Entry time-to-live since last update; 0 disables expiry
    #[serde(default)]
    pub ttl_seconds: u64,

    /// Number of peers holding a backup of each entry
    #[serde(default = "default_backup_count")]
    pub backup_count: usize,

    #[serde(default)]
    pub eviction_policy: EvictionPolicy,

    #[serde(default)]
    pub max_size_policy: MaxSizePolicy,

    /// Size threshold, interpreted according to `max_size_policy`
    #[serde(default = "default_eviction_size")]
    pub eviction_size: u64,

    /// Percentage of `eviction_size` to shrink to once the threshold is crossed
    #[serde(default = "default_eviction_target_percentage")]
    pub eviction_target_percentage: u8,

    #[serde(default)]
    pub merge_policy: MergePolicy,

    /// Number of independently locked partitions
    #[serde(default = "default_partition_count")]
    pub partition_count: usize,

    /// Denominator for `USED_HEAP_PERCENTAGE`
    #[serde(default = "default_heap_budget_bytes")]
    pub heap_budget_bytes: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: default_map_name(),
            ttl_seconds: 0,
            backup_count: default_backup_count(),
            eviction_policy: EvictionPolicy::default(),
            max_size_policy: MaxSizePolicy::default(),
            eviction_size: default_eviction_size(),
            eviction_target_percentage: default_eviction_target_percentage(),
            merge_policy: MergePolicy::default(),
            partition_count: default_partition_count(),
            heap_budget_bytes: default_heap_budget_bytes(),
        }
    }
}

impl StoreConfig {
    /// Size to shrink to once `eviction_size` is exceeded.
    pub fn eviction_target(&self) -> u64 {
        self.eviction_size * u64::from(self.eviction_target_percentage.min(100)) / 100
    }

    /// Log the map configuration.
    pub fn log_summary(&self) {
        info!(
            name = %self.name,
            ttl_seconds = self.ttl_seconds,
            backup_count = self.backup_count,
            eviction_policy = ?self.eviction_policy,
            max_size_policy = ?self.max_size_policy,
            eviction_size = self.eviction_size,
            merge_policy = %self.merge_policy,
            partitions = self.partition_count,
            "Bucket map configuration"
        );
        if self.eviction_policy == EvictionPolicy::Random {
            warn!(
                name = %self.name,
                "RANDOM eviction evicts active clients as readily as idle ones; prefer LRU or LFU"
            );
        }
    }
}

fn default_map_name() -> String {
    "rate-limit-map".to_string()
}

fn default_backup_count() -> usize {
    1
}

fn default_eviction_size() -> u64 {
    100_000
}

fn default_eviction_target_percentage() -> u8 {
    90
}

fn default_partition_count() -> usize {
    271
}

fn default_heap_budget_bytes() -> u64 {
    256 * 1024 * 1024
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Namespace prepended to every bucket key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Rule applied to operations without an explicit entry
    #[serde(default)]
    pub default_rule: RuleConfig,

    /// Per-operation rules keyed by operation name
    #[serde(default)]
    pub operations: HashMap<String, RuleConfig>,

    /// Upper bound of the random offset added to each bucket's idle expiry
    #[serde(default = "default_eviction_jitter_seconds")]
    pub eviction_jitter_seconds: u64,

    /// How often the eviction coordinator sweeps the store
    #[serde(default = "default_eviction_interval_ms")]
    pub eviction_interval_ms: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            default_rule: RuleConfig::default(),
            operations: HashMap::new(),
            eviction_jitter_seconds: default_eviction_jitter_seconds(),
            eviction_interval_ms: default_eviction_interval_ms(),
        }
    }
}

impl RateLimitingConfig {
    pub fn eviction_jitter(&self) -> Duration {
        Duration::from_secs(self.eviction_jitter_seconds)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_millis(self.eviction_interval_ms)
    }
}

fn default_key_prefix() -> String {
    "rate-limit:".to_string()
}

fn default_eviction_jitter_seconds() -> u64 {
    30
}

fn default_eviction_interval_ms() -> u64 {
    5000
}

impl TokenhiveConfig {
    /// Load configuration from a file, with `TOKENHIVE_*` environment overrides.
    ///
    /// Nested keys use a double underscore, e.g. `TOKENHIVE_STORE__BACKUP_COUNT=2`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix("TOKENHIVE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| TokenhiveError::Config(e.to_string()))?;

        let config: TokenhiveConfig = settings
            .try_deserialize()
            .map_err(|e| TokenhiveError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TokenhiveConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TokenhiveError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the limiter cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.node.operation_timeout_ms == 0 {
            return Err(TokenhiveError::Config(
                "node.operation_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.store.partition_count == 0 {
            return Err(TokenhiveError::Config(
                "store.partition_count must be greater than zero".to_string(),
            ));
        }
        if self.store.eviction_target_percentage > 100 {
            return Err(TokenhiveError::Config(
                "store.eviction_target_percentage must be at most 100".to_string(),
            ));
        }
        self.rate_limiting.default_rule.to_rule()?;
        for (operation, rule) in &self.rate_limiting.operations {
            rule.to_rule().map_err(|e| {
                TokenhiveError::Config(format!("operation {}: {}", operation, e))
            })?;
        }
        Ok(())
    }
}
