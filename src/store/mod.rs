//! Partitioned key-value storage for bucket state.
//!
//! The engine only relies on the [`BucketStore`] contract: a per-key atomic
//! read-modify-write primitive plus the bookkeeping needed by background
//! eviction and replica reconciliation. [`MemoryStore`] is the in-process
//! implementation; gossip replication between nodes lives in [`crate::mesh`].

mod memory;
mod merge;

pub use memory::{Change, MemoryStore};
pub use merge::MergePolicy;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned by store operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("Store node is partitioned from the cluster")]
    Partitioned,
}

/// A per-key atomic update.
///
/// Receives the current value (if any) and returns the value to write, or
/// `None` to leave the entry untouched.
pub type EntryProcessor<'a> = dyn FnMut(Option<&[u8]>) -> Option<Vec<u8>> + Send + 'a;

/// A snapshot of one stored entry and its access statistics.
///
/// Times are nanoseconds since the Unix epoch as reported by the store's clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryView {
    pub key: String,
    pub value: Vec<u8>,
    pub version: u64,
    pub hits: u64,
    pub creation_time: u64,
    pub last_access_time: u64,
    pub last_update_time: u64,
}

/// How entries are chosen when the store grows past its size bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvictionPolicy {
    /// Never evict; the store grows without bound.
    None,
    /// Least recently used first.
    #[default]
    Lru,
    /// Least frequently used first.
    Lfu,
    /// Arbitrary entries. Evicts active clients as readily as idle ones.
    Random,
}

/// How the store's aggregate size is measured against `eviction_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MaxSizePolicy {
    /// Number of entries.
    #[default]
    EntryCount,
    /// Approximate memory used by entries, in megabytes.
    UsedHeapSize,
    /// Approximate memory used by entries as a percentage of the heap budget.
    UsedHeapPercentage,
}

/// Contract the bucket engine requires from a replicated key-value store.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Logical namespace of this store.
    fn name(&self) -> &str;

    /// Run `processor` against `key` atomically with respect to every other
    /// `execute`, `merge` or removal on the same key.
    async fn execute(&self, key: &str, processor: &mut EntryProcessor<'_>)
        -> Result<(), StoreError>;

    /// Read an entry without touching its access statistics.
    async fn get(&self, key: &str) -> Result<Option<EntryView>, StoreError>;

    /// Remove an entry unconditionally.
    async fn remove(&self, key: &str) -> Result<bool, StoreError>;

    /// Remove an entry only if it has not been written since `version` was observed.
    async fn remove_if_version(&self, key: &str, version: u64) -> Result<bool, StoreError>;

    /// Snapshot of all live entries.
    async fn entries(&self) -> Result<Vec<EntryView>, StoreError>;

    /// Reconcile a replica value with the local one. Returns `true` when the
    /// merging value was applied.
    async fn merge(&self, entry: EntryView, policy: MergePolicy) -> Result<bool, StoreError>;

    /// Aggregate size measured according to `policy`.
    async fn usage(&self, policy: MaxSizePolicy) -> Result<u64, StoreError>;

    /// Drop entries past the map-level time-to-live. Returns the number removed.
    async fn purge_expired(&self) -> Result<usize, StoreError>;
}
