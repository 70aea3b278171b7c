//! In-memory partitioned store.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{
    BucketStore, EntryProcessor, EntryView, MaxSizePolicy, MergePolicy, StoreError,
};
use crate::clock::Clock;
use crate::config::StoreConfig;

/// Fixed per-entry bookkeeping cost added to key and value lengths.
const ENTRY_OVERHEAD_BYTES: u64 = 64;
const BYTES_PER_MB: u64 = 1024 * 1024;

#[derive(Debug, Clone)]
struct StoredEntry {
    value: Vec<u8>,
    version: u64,
    hits: u64,
    creation_time: u64,
    last_access_time: u64,
    last_update_time: u64,
}

impl StoredEntry {
    fn view(&self, key: &str) -> EntryView {
        EntryView {
            key: key.to_string(),
            value: self.value.clone(),
            version: self.version,
            hits: self.hits,
            creation_time: self.creation_time,
            last_access_time: self.last_access_time,
            last_update_time: self.last_update_time,
        }
    }

    fn approximate_size(&self, key: &str) -> u64 {
        key.len() as u64 + self.value.len() as u64 + ENTRY_OVERHEAD_BYTES
    }
}

/// A change to a key since the last call to [`MemoryStore::take_changes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Upserted,
    Removed,
}

type Partition = Mutex<HashMap<String, StoredEntry>>;

/// A hash-partitioned in-memory map.
///
/// Each partition sits behind its own lock, so a read-modify-write on one key
/// only blocks operations on keys hashed to the same partition.
pub struct MemoryStore {
    name: String,
    partitions: Vec<Partition>,
    ttl: Option<Duration>,
    heap_budget_bytes: u64,
    clock: Arc<dyn Clock>,
    next_version: AtomicU64,
    changes: Option<Mutex<HashMap<String, Change>>>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("name", &self.name)
            .field("partitions", &self.partitions.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl MemoryStore {
    /// Create a store from its configuration.
    pub fn new(config: &StoreConfig, clock: Arc<dyn Clock>) -> Self {
        let partition_count = config.partition_count.max(1);
        let ttl = match config.ttl_seconds {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        debug!(
            name = %config.name,
            partitions = partition_count,
            ttl_seconds = config.ttl_seconds,
            "Creating memory store"
        );

        Self {
            name: config.name.clone(),
            partitions: (0..partition_count).map(|_| Mutex::new(HashMap::new())).collect(),
            ttl,
            heap_budget_bytes: config.heap_budget_bytes.max(1),
            clock,
            next_version: AtomicU64::new(1),
            changes: None,
        }
    }

    /// Record upserts and removals so a replicator can forward them.
    pub fn with_change_tracking(mut self) -> Self {
        self.changes = Some(Mutex::new(HashMap::new()));
        self
    }

    /// Drain the changes recorded since the previous call.
    pub fn take_changes(&self) -> Vec<(String, Change)> {
        match &self.changes {
            Some(changes) => changes.lock().drain().collect(),
            None => Vec::new(),
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = self.clock.now_nanos();
        self.partitions
            .iter()
            .map(|p| p.lock().values().filter(|e| !self.is_expired(e, now)).count())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Index of the partition that owns `key`.
    pub fn partition_of(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.partitions.len() as u64) as usize
    }

    fn partition(&self, key: &str) -> &Partition {
        &self.partitions[self.partition_of(key)]
    }

    fn is_expired(&self, entry: &StoredEntry, now: u64) -> bool {
        match self.ttl {
            Some(ttl) => now.saturating_sub(entry.last_update_time) >= ttl.as_nanos() as u64,
            None => false,
        }
    }

    fn bump_version(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::SeqCst)
    }

    fn record(&self, key: &str, change: Change) {
        if let Some(changes) = &self.changes {
            changes.lock().insert(key.to_string(), change);
        }
    }

    /// Drop `key` from a locked partition if its time-to-live has passed.
    fn expire_locked(&self, partition: &mut HashMap<String, StoredEntry>, key: &str, now: u64) {
        let expired = partition
            .get(key)
            .map(|e| self.is_expired(e, now))
            .unwrap_or(false);
        if expired {
            partition.remove(key);
            self.record(key, Change::Removed);
            trace!(store = %self.name, key = %key, "Entry expired on access");
        }
    }
}

#[async_trait]
impl BucketStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        key: &str,
        processor: &mut EntryProcessor<'_>,
    ) -> Result<(), StoreError> {
        let now = self.clock.now_nanos();
        let mut partition = self.partition(key).lock();
        self.expire_locked(&mut partition, key, now);

        let written = processor(partition.get(key).map(|e| e.value.as_slice()));

        match written {
            Some(value) => {
                let version = self.bump_version();
                let entry = partition
                    .entry(key.to_string())
                    .or_insert_with(|| StoredEntry {
                        value: Vec::new(),
                        version,
                        hits: 0,
                        creation_time: now,
                        last_access_time: now,
                        last_update_time: now,
                    });
                entry.value = value;
                entry.version = version;
                entry.hits += 1;
                entry.last_access_time = now;
                entry.last_update_time = now;
                self.record(key, Change::Upserted);
            }
            None => {
                if let Some(entry) = partition.get_mut(key) {
                    entry.hits += 1;
                    entry.last_access_time = now;
                }
            }
        }

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<EntryView>, StoreError> {
        let now = self.clock.now_nanos();
        let partition = self.partition(key).lock();
        Ok(partition
            .get(key)
            .filter(|e| !self.is_expired(e, now))
            .map(|e| e.view(key)))
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let removed = self.partition(key).lock().remove(key).is_some();
        if removed {
            self.record(key, Change::Removed);
        }
        Ok(removed)
    }

    async fn remove_if_version(&self, key: &str, version: u64) -> Result<bool, StoreError> {
        let mut partition = self.partition(key).lock();
        let matches = partition
            .get(key)
            .map(|e| e.version == version)
            .unwrap_or(false);
        if matches {
            partition.remove(key);
            self.record(key, Change::Removed);
        }
        Ok(matches)
    }

    async fn entries(&self) -> Result<Vec<EntryView>, StoreError> {
        let now = self.clock.now_nanos();
        let mut views = Vec::new();
        for partition in &self.partitions {
            let partition = partition.lock();
            views.extend(
                partition
                    .iter()
                    .filter(|(_, e)| !self.is_expired(e, now))
                    .map(|(k, e)| e.view(k)),
            );
        }
        Ok(views)
    }

    async fn merge(&self, entry: EntryView, policy: MergePolicy) -> Result<bool, StoreError> {
        let now = self.clock.now_nanos();
        let mut partition = self.partition(&entry.key).lock();
        self.expire_locked(&mut partition, &entry.key, now);

        let existing = partition.get(&entry.key).map(|e| e.view(&entry.key));
        if !policy.accepts(existing.as_ref(), &entry) {
            trace!(store = %self.name, key = %entry.key, policy = %policy, "Merge kept existing value");
            return Ok(false);
        }

        let stored = StoredEntry {
            value: entry.value,
            version: self.bump_version(),
            hits: entry.hits,
            creation_time: entry.creation_time,
            last_access_time: entry.last_access_time,
            last_update_time: entry.last_update_time,
        };
        partition.insert(entry.key.clone(), stored);
        self.record(&entry.key, Change::Upserted);

        debug!(store = %self.name, key = %entry.key, policy = %policy, "Merged replica value");
        Ok(true)
    }

    async fn usage(&self, policy: MaxSizePolicy) -> Result<u64, StoreError> {
        let now = self.clock.now_nanos();
        let (count, bytes) = self.partitions.iter().fold((0u64, 0u64), |acc, partition| {
            let partition = partition.lock();
            partition
                .iter()
                .filter(|(_, e)| !self.is_expired(e, now))
                .fold(acc, |(count, bytes), (k, e)| {
                    (count + 1, bytes + e.approximate_size(k))
                })
        });

        Ok(match policy {
            MaxSizePolicy::EntryCount => count,
            MaxSizePolicy::UsedHeapSize => bytes / BYTES_PER_MB,
            MaxSizePolicy::UsedHeapPercentage => bytes.saturating_mul(100) / self.heap_budget_bytes,
        })
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        if self.ttl.is_none() {
            return Ok(0);
        }

        let now = self.clock.now_nanos();
        let mut purged = 0;
        for partition in &self.partitions {
            let mut partition = partition.lock();
            let expired: Vec<String> = partition
                .iter()
                .filter(|(_, e)| self.is_expired(e, now))
                .map(|(k, _)| k.clone())
                .collect();
            for key in expired {
                partition.remove(&key);
                self.record(&key, Change::Removed);
                purged += 1;
            }
        }

        if purged > 0 {
            debug!(store = %self.name, purged = purged, "Purged expired entries");
        }
        Ok(purged)
    }
}
