//! Routes bucket operations to the owning node over the request endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use super::cluster::Cluster;
use super::placement::owner_of;
use super::rpc::NodeClient;
use crate::error::LimiterError;
use crate::ratelimit::{BucketCommand, BucketReply, BucketRouter};
use crate::store::StoreError;

/// [`BucketRouter`] over the live membership of a [`Cluster`].
pub struct ClusterRouter {
    cluster: Arc<Cluster>,
    clients: DashMap<SocketAddr, Arc<NodeClient>>,
}

impl std::fmt::Debug for ClusterRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterRouter")
            .field("node_id", &self.cluster.node_id())
            .field("clients", &self.clients.len())
            .finish()
    }
}

impl ClusterRouter {
    pub fn new(cluster: Arc<Cluster>) -> Self {
        Self {
            cluster,
            clients: DashMap::new(),
        }
    }

    fn client(&self, addr: SocketAddr) -> Arc<NodeClient> {
        self.clients
            .entry(addr)
            .or_insert_with(|| Arc::new(NodeClient::new(addr)))
            .value()
            .clone()
    }
}

#[async_trait]
impl BucketRouter for ClusterRouter {
    async fn remote_owner(&self, store_key: &str) -> Option<String> {
        let live = self.cluster.live_nodes().await;
        match owner_of(store_key, &live) {
            Some(owner) if owner != self.cluster.node_id() => Some(owner.to_string()),
            _ => None,
        }
    }

    async fn forward(
        &self,
        node_id: &str,
        command: BucketCommand,
    ) -> Result<BucketReply, LimiterError> {
        let addr = self.cluster.request_addr_of(node_id).await.ok_or_else(|| {
            StoreError::Unavailable(format!("no request address known for node {}", node_id))
        })?;
        self.client(addr).execute(command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::StoreConfig;
    use crate::http::{admit, rate_limit_key, STATUS_INTERNAL_ERROR, STATUS_OK};
    use crate::mesh::{ClusterConfig, NodeServer};
    use crate::ratelimit::{DistributedBucketEngine, RateLimiterService, RefillRule, RuleSet};
    use crate::store::{BucketStore, MemoryStore};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::watch;
    use tokio::task::JoinHandle;

    struct TestNode {
        cluster: Arc<Cluster>,
        service: RateLimiterService,
        store: Arc<MemoryStore>,
        shutdown: watch::Sender<bool>,
        server: JoinHandle<()>,
    }

    impl TestNode {
        async fn start(gossip_port: u16, seed: Option<u16>, clock: Arc<ManualClock>) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let gossip_addr: SocketAddr = ([127, 0, 0, 1], gossip_port).into();
            let cluster = Arc::new(
                Cluster::start(ClusterConfig {
                    node_id: format!("node-{}", gossip_port),
                    request_addr: Some(listener.local_addr().unwrap()),
                    listen_addr: gossip_addr,
                    advertise_addr: gossip_addr,
                    seed_nodes: seed
                        .map(|p| vec![format!("127.0.0.1:{}", p)])
                        .unwrap_or_default(),
                    cluster_id: "router-test".to_string(),
                    gossip_interval: Duration::from_millis(50),
                    dead_node_grace_period: Duration::from_secs(60),
                })
                .await
                .unwrap(),
            );

            let store = Arc::new(MemoryStore::new(&StoreConfig::default(), clock.clone()));
            let engine = DistributedBucketEngine::new(store.clone(), clock, Duration::from_millis(500))
                .with_router(Arc::new(ClusterRouter::new(cluster.clone())));
            let rule = RefillRule::new(5, 5, Duration::from_secs(60)).unwrap();
            let service =
                RateLimiterService::new(Arc::new(engine), RuleSet::uniform(rule), "rate-limit:");

            let (shutdown, shutdown_rx) = watch::channel(false);
            let server = Arc::new(NodeServer::new(service.clone(), Some(cluster.clone())))
                .spawn(listener, shutdown_rx);

            Self {
                cluster,
                service,
                store,
                shutdown,
                server,
            }
        }

        async fn holds(&self, store_key: &str) -> bool {
            self.store.get(store_key).await.unwrap().is_some()
        }

        async fn stop(self) {
            self.shutdown.send(true).unwrap();
            self.server.await.unwrap();
            drop(self.service);
            if let Ok(cluster) = Arc::try_unwrap(self.cluster) {
                cluster.shutdown().await.unwrap();
            }
        }
    }

    async fn start_pair(port_a: u16, port_b: u16) -> (TestNode, TestNode) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000_000_000));
        let a = TestNode::start(port_a, None, clock.clone()).await;
        let b = TestNode::start(port_b, Some(port_a), clock).await;

        // Give them time to discover each other
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(a.cluster.live_node_count().await, 2);
        assert_eq!(b.cluster.live_node_count().await, 2);
        (a, b)
    }

    /// A client address whose bucket for `operation` is owned by `owner`.
    async fn client_owned_by(owner: &TestNode, operation: &str) -> String {
        let live = owner.cluster.live_nodes().await;
        (0..)
            .map(|i| format!("10.0.{}.{}", i / 256, i % 256))
            .find(|client| {
                let store_key = format!("rate-limit:{}", rate_limit_key(client, operation));
                owner_of(&store_key, &live) == Some(owner.cluster.node_id())
            })
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_nodes_never_spend_more_than_capacity() {
        let (a, b) = start_pair(17970, 17971).await;
        let facade_a = a.service.facade("find-all");
        let facade_b = b.service.facade("find-all");

        // Alternating between nodes
        let key = rate_limit_key("10.0.0.1", "find-all");
        let mut consumed = 0;
        for _ in 0..5 {
            if admit(&facade_a, &key).await.is_success() {
                consumed += 1;
            }
            if admit(&facade_b, &key).await.is_success() {
                consumed += 1;
            }
        }
        assert_eq!(consumed, 5);

        let store_key = format!("rate-limit:{}", key);
        assert!(a.holds(&store_key).await != b.holds(&store_key).await);

        // Concurrently on both nodes
        let key = rate_limit_key("10.0.0.2", "find-all");
        let tasks: Vec<_> = (0..40)
            .map(|i| {
                let facade = if i % 2 == 0 { facade_a.clone() } else { facade_b.clone() };
                let key = key.clone();
                tokio::spawn(async move { admit(&facade, &key).await })
            })
            .collect();
        let mut consumed = 0;
        for task in futures::future::join_all(tasks).await {
            let reply = task.unwrap();
            assert_ne!(reply.status, STATUS_INTERNAL_ERROR, "{}", reply.message);
            if reply.is_success() {
                consumed += 1;
            }
        }
        assert_eq!(consumed, 5);

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_isolated_owner_refuses_forwarded_operations() {
        let (a, b) = start_pair(17972, 17973).await;
        let client = client_owned_by(&b, "find-all").await;
        let key = rate_limit_key(&client, "find-all");
        let facade_a = a.service.facade("find-all");
        let facade_b = b.service.facade("find-all");

        assert_eq!(admit(&facade_a, &key).await.status, STATUS_OK);

        b.cluster.isolate();
        let err = facade_a.resolve_bucket(&key).await.unwrap_err();
        assert!(matches!(err, LimiterError::StoreUnavailable(ref msg) if msg.contains("partitioned")));
        assert_eq!(admit(&facade_a, &key).await.status, STATUS_INTERNAL_ERROR);

        // The isolated owner still serves its own clients
        let reply = admit(&facade_b, &key).await;
        assert_eq!(reply.remaining_tokens, Some(3));

        b.cluster.rejoin();
        let reply = admit(&facade_a, &key).await;
        assert_eq!(reply.status, STATUS_OK);
        assert_eq!(reply.remaining_tokens, Some(2));

        a.stop().await;
        b.stop().await;
    }
}
