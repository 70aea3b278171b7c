//! Peer mesh networking using Chitchat.
//!
//! Nodes discover each other and detect failures through gossip. Every
//! bucket key has one owner among the live nodes; other nodes forward
//! operations on it to the owner's request endpoint. Owners publish backups
//! of their entries to gossip, and the [`Replicator`] turns peers' gossip
//! state into backups, failover and partition healing.

mod cluster;
mod placement;
mod replication;
mod router;
mod rpc;

pub use cluster::{Cluster, ClusterConfig, ClusterError, PeerReplicas};
pub use replication::{merge_entries, Replicator, SyncReport};
pub use router::ClusterRouter;
pub use rpc::{NodeClient, NodeRequest, NodeResponse, NodeServer, RemoteError};
