//! Backup replication of bucket entries over the gossip mesh.
//!
//! Each store key is owned by one live node (see [`super::placement`]). The
//! owner publishes its entries to its gossip state, the key's backup nodes
//! keep copies, and the merge policy reconciles state when an owner
//! disappears or a peer comes back after a partition.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::cluster::{Cluster, PeerReplicas};
use super::placement::{backup_nodes, owner_of};
use crate::config::StoreConfig;
use crate::store::{BucketStore, Change, EntryView, MemoryStore, MergePolicy, StoreError};

/// What one replication round did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub published: usize,
    pub retracted: usize,
    pub backups_held: usize,
    pub promoted: usize,
    pub healed: usize,
}

impl SyncReport {
    fn changed_anything(&self) -> bool {
        self.published + self.retracted + self.promoted + self.healed > 0
    }
}

/// Merge `entries` into `store` under `policy`. Returns how many were applied.
pub async fn merge_entries(
    store: &MemoryStore,
    entries: impl IntoIterator<Item = EntryView>,
    policy: MergePolicy,
) -> Result<usize, StoreError> {
    let mut applied = 0;
    for entry in entries {
        if store.merge(entry, policy).await? {
            applied += 1;
        }
    }
    Ok(applied)
}

/// Keeps the local store and the peers' gossip state in step.
pub struct Replicator {
    cluster: Arc<Cluster>,
    store: Arc<MemoryStore>,
    backup_count: usize,
    merge_policy: MergePolicy,
    /// Publishing node id to the entries of it this node backs up, by store key.
    backups: DashMap<String, HashMap<String, EntryView>>,
    known_peers: Mutex<HashSet<String>>,
}

impl std::fmt::Debug for Replicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replicator")
            .field("node_id", &self.cluster.node_id())
            .field("backup_count", &self.backup_count)
            .field("merge_policy", &self.merge_policy)
            .field("owners_backed_up", &self.backups.len())
            .finish()
    }
}

impl Replicator {
    /// `store` must have change tracking enabled for local writes to be published.
    pub fn new(cluster: Arc<Cluster>, store: Arc<MemoryStore>, config: &StoreConfig) -> Self {
        Self {
            cluster,
            store,
            backup_count: config.backup_count,
            merge_policy: config.merge_policy,
            backups: DashMap::new(),
            known_peers: Mutex::new(HashSet::new()),
        }
    }

    /// Number of backed-up entries held for `owner`.
    pub fn backups_for(&self, owner: &str) -> usize {
        self.backups.get(owner).map(|b| b.len()).unwrap_or(0)
    }

    /// Run one replication round.
    pub async fn sync_once(&self) -> Result<SyncReport, StoreError> {
        let mut report = SyncReport::default();
        self.push_local_changes(&mut report).await?;

        let live = self.cluster.live_nodes().await;
        let peers = self.cluster.peer_replicas().await;

        let current: HashSet<String> = peers.iter().map(|p| p.node_id.clone()).collect();
        let (departed, joined) = {
            let mut known = self.known_peers.lock();
            let departed: Vec<String> = known.difference(&current).cloned().collect();
            let joined: HashSet<String> = current.difference(&known).cloned().collect();
            *known = current;
            (departed, joined)
        };

        for owner in departed {
            report.promoted += self.promote_backups(&owner, &live).await?;
        }

        for peer in peers {
            if joined.contains(&peer.node_id) {
                report.healed += self.heal_from(&peer, &live).await?;
            }
            self.refresh_backups(peer, &live);
        }

        report.backups_held = self.backups.iter().map(|b| b.value().len()).sum();
        Ok(report)
    }

    /// Publish entries written or removed locally since the previous round.
    async fn push_local_changes(&self, report: &mut SyncReport) -> Result<(), StoreError> {
        let changes = self.store.take_changes();
        if self.backup_count == 0 {
            return Ok(());
        }

        for (key, change) in changes {
            let current = match change {
                Change::Upserted => self.store.get(&key).await?,
                Change::Removed => None,
            };
            match current {
                Some(entry) => match self.cluster.publish_replica(&entry).await {
                    Ok(()) => report.published += 1,
                    Err(err) => warn!(key = %key, error = %err, "Failed to publish replica"),
                },
                None => {
                    self.cluster.retract_replica(&key).await;
                    report.retracted += 1;
                }
            }
        }
        Ok(())
    }

    /// Replace the backups held from `peer` with the records this node is a
    /// backup node for.
    fn refresh_backups(&self, peer: PeerReplicas, live: &[String]) {
        let node_id = self.cluster.node_id();
        let entries: HashMap<String, EntryView> = peer
            .entries
            .into_iter()
            .filter(|entry| backup_nodes(&entry.key, live, self.backup_count).contains(&node_id))
            .map(|entry| (entry.key.clone(), entry))
            .collect();

        if entries.is_empty() {
            self.backups.remove(&peer.node_id);
        } else {
            self.backups.insert(peer.node_id, entries);
        }
    }

    /// Take over the backed-up entries of a departed node that this node now owns.
    async fn promote_backups(&self, departed: &str, live: &[String]) -> Result<usize, StoreError> {
        let Some((_, entries)) = self.backups.remove(departed) else {
            return Ok(0);
        };

        let node_id = self.cluster.node_id();
        let total = entries.len();
        let owned = entries
            .into_values()
            .filter(|entry| owner_of(&entry.key, live) == Some(node_id))
            .collect::<Vec<_>>();
        let promoted = merge_entries(&self.store, owned, self.merge_policy).await?;
        info!(
            owner = %departed,
            backups = total,
            promoted = promoted,
            policy = %self.merge_policy,
            "Promoted backups of departed node"
        );
        Ok(promoted)
    }

    /// Merge a newly seen peer's records for keys this node owns.
    ///
    /// This is where divergent state from both sides of a healed partition,
    /// or the state of keys whose owner changed, is reconciled.
    async fn heal_from(&self, peer: &PeerReplicas, live: &[String]) -> Result<usize, StoreError> {
        let node_id = self.cluster.node_id();
        let owned = peer
            .entries
            .iter()
            .filter(|entry| owner_of(&entry.key, live) == Some(node_id))
            .cloned()
            .collect::<Vec<_>>();
        let healed = merge_entries(&self.store, owned, self.merge_policy).await?;
        if healed > 0 {
            info!(peer = %peer.node_id, merged = healed, policy = %self.merge_policy, "Merged entries from rejoined peer");
        }
        Ok(healed)
    }

    /// Run [`Replicator::sync_once`] every `interval` until `shutdown` flips to true.
    pub fn spawn(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.sync_once().await {
                            Ok(report) if report.changed_anything() => {
                                debug!(
                                    published = report.published,
                                    retracted = report.retracted,
                                    backups_held = report.backups_held,
                                    promoted = report.promoted,
                                    healed = report.healed,
                                    "Replication round completed"
                                );
                            }
                            Ok(_) => {}
                            Err(err) => warn!(error = %err, "Replication round failed"),
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Replicator stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}
