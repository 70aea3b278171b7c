//! Cluster management using Chitchat.
//!
//! This module wraps the chitchat library to provide cluster membership,
//! failure detection, and gossip of bucket backups between nodes.
//!
//! A node can be fenced off with [`Cluster::isolate`]. While isolated it sees
//! no peers and refuses bucket operations forwarded to it, exactly as if the
//! network between it and the rest of the cluster were cut.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chitchat::transport::UdpTransport;
use chitchat::{
    spawn_chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::store::EntryView;

/// Errors that can occur in cluster operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Failed to start cluster: {0}")]
    StartError(String),
    #[error("Failed to shut down cluster: {0}")]
    ShutdownError(String),
    #[error("Failed to encode replica record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Gossip key under which a node advertises its request address.
const REQUEST_ADDR_KEY: &str = "request_addr";

/// Configuration for the cluster.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Unique node identifier.
    pub node_id: String,
    /// Address peers use to forward bucket operations to this node.
    pub request_addr: Option<SocketAddr>,
    /// The address to listen on for gossip.
    pub listen_addr: SocketAddr,
    /// The address to advertise to other nodes.
    pub advertise_addr: SocketAddr,
    /// Seed nodes to bootstrap cluster membership.
    pub seed_nodes: Vec<String>,
    /// Cluster identifier (nodes must have matching cluster IDs).
    pub cluster_id: String,
    /// How often to gossip with peers.
    pub gossip_interval: Duration,
    /// Grace period before considering a dead node's state deletable.
    pub dead_node_grace_period: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let default_addr = SocketAddr::from(([0, 0, 0, 0], 7946));
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            request_addr: None,
            listen_addr: default_addr,
            advertise_addr: default_addr,
            seed_nodes: Vec::new(),
            cluster_id: "tokenhive".to_string(),
            gossip_interval: Duration::from_millis(100),
            dead_node_grace_period: Duration::from_secs(3600),
        }
    }
}

/// Key identifying a bucket backup in a node's gossip state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackupKey {
    /// The store key of the backed-up entry.
    pub store_key: String,
}

impl BackupKey {
    pub fn new(store_key: &str) -> Self {
        Self {
            store_key: store_key.to_string(),
        }
    }

    /// Convert to a chitchat key string.
    /// Format: "bucket|{store_key}"
    pub fn to_chitchat_key(&self) -> String {
        format!("bucket|{}", self.store_key)
    }

    /// Parse from a chitchat key string.
    pub fn from_chitchat_key(key: &str) -> Option<Self> {
        let store_key = key.strip_prefix("bucket|")?;
        if store_key.is_empty() {
            return None;
        }
        Some(Self::new(store_key))
    }
}

/// Backup records published by one live peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerReplicas {
    pub node_id: String,
    pub entries: Vec<EntryView>,
}

/// The cluster handle for distributed state management.
pub struct Cluster {
    /// Our node ID.
    node_id: String,
    /// Chitchat handle.
    handle: ChitchatHandle,
    config: ClusterConfig,
    /// Set while the node is fenced off from its peers.
    isolated: AtomicBool,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("node_id", &self.node_id)
            .field("config", &self.config)
            .field("isolated", &self.is_isolated())
            .finish()
    }
}

impl Cluster {
    /// Create and start a new cluster node.
    pub async fn start(config: ClusterConfig) -> Result<Self, ClusterError> {
        info!(
            node_id = %config.node_id,
            listen_addr = %config.listen_addr,
            advertise_addr = %config.advertise_addr,
            seed_nodes = ?config.seed_nodes,
            cluster_id = %config.cluster_id,
            "Starting cluster node"
        );

        let chitchat_id = ChitchatId {
            node_id: config.node_id.clone(),
            generation_id: 0,
            gossip_advertise_addr: config.advertise_addr,
        };

        let chitchat_config = ChitchatConfig {
            chitchat_id,
            cluster_id: config.cluster_id.clone(),
            gossip_interval: config.gossip_interval,
            listen_addr: config.listen_addr,
            seed_nodes: config.seed_nodes.clone(),
            failure_detector_config: FailureDetectorConfig {
                initial_interval: config.gossip_interval,
                ..Default::default()
            },
            marked_for_deletion_grace_period: config.dead_node_grace_period,
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let initial_key_values = config
            .request_addr
            .map(|addr| vec![(REQUEST_ADDR_KEY.to_string(), addr.to_string())])
            .unwrap_or_default();

        let transport = UdpTransport;
        let handle = spawn_chitchat(chitchat_config, initial_key_values, &transport)
            .await
            .map_err(|e| ClusterError::StartError(e.to_string()))?;

        info!("Cluster node started successfully");

        Ok(Self {
            node_id: config.node_id.clone(),
            handle,
            config,
            isolated: AtomicBool::new(false),
        })
    }

    /// Get our node ID.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Fence this node off: peers disappear from its view and forwarded
    /// bucket operations are refused until [`Cluster::rejoin`].
    pub fn isolate(&self) {
        if !self.isolated.swap(true, Ordering::SeqCst) {
            warn!(node_id = %self.node_id, "Node isolated from the cluster");
        }
    }

    /// Lift an isolation started by [`Cluster::isolate`].
    pub fn rejoin(&self) {
        if self.isolated.swap(false, Ordering::SeqCst) {
            info!(node_id = %self.node_id, "Node rejoined the cluster");
        }
    }

    pub fn is_isolated(&self) -> bool {
        self.isolated.load(Ordering::SeqCst)
    }

    /// Publish (or refresh) the backup of one of our entries.
    pub async fn publish_replica(&self, entry: &EntryView) -> Result<(), ClusterError> {
        let chitchat_key = BackupKey::new(&entry.key).to_chitchat_key();
        let value = serde_json::to_string(entry)?;

        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;
        chitchat.self_node_state().set(&chitchat_key, value);

        debug!(key = %chitchat_key, version = entry.version, "Published replica");
        Ok(())
    }

    /// Withdraw the backup of an entry we no longer hold.
    pub async fn retract_replica(&self, store_key: &str) {
        let chitchat_key = BackupKey::new(store_key).to_chitchat_key();
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;
        let node_state = chitchat.self_node_state();
        if node_state.get(&chitchat_key).is_some() {
            node_state.delete(&chitchat_key);
            debug!(key = %chitchat_key, "Retracted replica");
        }
    }

    /// Backups currently published by every live peer.
    pub async fn peer_replicas(&self) -> Vec<PeerReplicas> {
        if self.is_isolated() {
            return Vec::new();
        }
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;

        let mut peers = Vec::new();
        for chitchat_id in chitchat.live_nodes() {
            if chitchat_id.node_id == self.node_id {
                continue;
            }
            let Some(node_state) = chitchat.node_state(chitchat_id) else {
                continue;
            };

            let entries = node_state
                .key_values()
                .filter_map(|(key, value)| {
                    let backup_key = BackupKey::from_chitchat_key(key)?;
                    match serde_json::from_str::<EntryView>(value) {
                        Ok(entry) if entry.key == backup_key.store_key => Some(entry),
                        Ok(_) => {
                            warn!(key = %key, "Replica record key does not match its gossip key");
                            None
                        }
                        Err(e) => {
                            warn!(key = %key, error = %e, "Skipping unreadable replica record");
                            None
                        }
                    }
                })
                .collect();

            peers.push(PeerReplicas {
                node_id: chitchat_id.node_id.clone(),
                entries,
            });
        }

        peers
    }

    /// Get the number of live nodes in the cluster.
    pub async fn live_node_count(&self) -> usize {
        if self.is_isolated() {
            return 1;
        }
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        chitchat.live_nodes().count()
    }

    /// Get the IDs of all live nodes, including ourselves, sorted.
    pub async fn live_nodes(&self) -> Vec<String> {
        if self.is_isolated() {
            return vec![self.node_id.clone()];
        }
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        let mut nodes: Vec<String> = chitchat
            .live_nodes()
            .map(|id| id.node_id.clone())
            .collect();
        nodes.sort();
        nodes
    }

    /// Request address advertised by the live node `node_id`.
    pub async fn request_addr_of(&self, node_id: &str) -> Option<SocketAddr> {
        if node_id == self.node_id {
            return self.config.request_addr;
        }
        if self.is_isolated() {
            return None;
        }
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        let chitchat_id = chitchat.live_nodes().find(|id| id.node_id == node_id)?;
        let value = chitchat.node_state(chitchat_id)?.get(REQUEST_ADDR_KEY)?;
        match value.parse() {
            Ok(addr) => Some(addr),
            Err(e) => {
                warn!(node_id = %node_id, value = %value, error = %e, "Ignoring malformed request address");
                None
            }
        }
    }

    /// Shutdown the cluster node gracefully.
    pub async fn shutdown(self) -> Result<(), ClusterError> {
        info!(node_id = %self.node_id, "Shutting down cluster node");
        self.handle
            .shutdown()
            .await
            .map_err(|e| ClusterError::ShutdownError(format!("{:?}", e)))?;
        Ok(())
    }
}
