//! Background expiry and size-bound eviction of bucket entries.
//!
//! Removing a bucket is always safe: the engine recreates it at full
//! capacity on next access, which can only make limiting more permissive.
//! Idle buckets expire once they would have refilled completely, plus a
//! per-key jitter so that buckets created together do not expire together.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::bucket::BucketState;
use super::codec;
use crate::clock::Clock;
use crate::config::StoreConfig;
use crate::store::{BucketStore, EntryView, EvictionPolicy, MaxSizePolicy, StoreError};

/// What a single sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Entries past the map-level time-to-live
    pub expired: usize,
    /// Buckets idle past their refill horizon plus jitter
    pub idle: usize,
    /// Entries evicted to bring the store under its size bound
    pub evicted: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.expired + self.idle + self.evicted
    }
}

/// Decides when bucket entries may leave the store and removes them.
pub struct EvictionCoordinator {
    store: Arc<dyn BucketStore>,
    clock: Arc<dyn Clock>,
    idle_window: Duration,
    jitter_max: Duration,
    jitter_seed: u64,
    eviction_policy: EvictionPolicy,
    max_size_policy: MaxSizePolicy,
    eviction_size: u64,
    eviction_target: u64,
}

impl EvictionCoordinator {
    /// Create a coordinator.
    ///
    /// `idle_window` is the time an idle bucket needs to refill completely;
    /// jitter is drawn uniformly from `[0, jitter_max]`.
    pub fn new(
        store: Arc<dyn BucketStore>,
        clock: Arc<dyn Clock>,
        store_config: &StoreConfig,
        idle_window: Duration,
        jitter_max: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            idle_window,
            jitter_max,
            jitter_seed: rand::random(),
            eviction_policy: store_config.eviction_policy,
            max_size_policy: store_config.max_size_policy,
            eviction_size: store_config.eviction_size,
            eviction_target: store_config.eviction_target(),
        }
    }

    /// Fix the jitter seed, making per-key jitter reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.jitter_seed = seed;
        self
    }

    /// Jitter for `key`. Stable for the lifetime of the coordinator.
    pub fn jitter_for(&self, key: &str) -> Duration {
        let max = self.jitter_max.as_nanos().min(u128::from(u64::MAX)) as u64;
        if max == 0 {
            return Duration::ZERO;
        }

        let mut hasher = DefaultHasher::new();
        self.jitter_seed.hash(&mut hasher);
        key.hash(&mut hasher);
        let mut rng = StdRng::seed_from_u64(hasher.finish());
        Duration::from_nanos(rng.gen_range(0..=max))
    }

    /// Logical time after which the bucket stored under `key` may expire.
    pub fn idle_deadline(&self, key: &str, state: &BucketState) -> u64 {
        let horizon = self.idle_window.saturating_add(self.jitter_for(key));
        state
            .last_refill_nanos
            .saturating_add(horizon.as_nanos().min(u128::from(u64::MAX)) as u64)
    }

    /// Remove buckets whose idle deadline has passed.
    ///
    /// Entries that cannot be decoded are removed as well; the engine would
    /// reset them to full capacity anyway.
    pub async fn sweep_idle(&self) -> Result<usize, StoreError> {
        let now = self.clock.now_nanos();
        let mut removed = 0;

        for entry in self.store.entries().await? {
            let expired = match codec::decode(&entry.value) {
                Ok(state) => now >= self.idle_deadline(&entry.key, &state),
                Err(err) => {
                    debug!(key = %entry.key, error = %err, "Dropping unreadable entry");
                    true
                }
            };

            // A consumption since the snapshot bumps the version and keeps the entry
            if expired && self.store.remove_if_version(&entry.key, entry.version).await? {
                removed += 1;
            }
        }

        if removed > 0 {
            debug!(removed = removed, "Expired idle buckets");
        }
        Ok(removed)
    }

    /// Evict entries according to the eviction policy while the store is
    /// larger than `eviction_size`, shrinking it to the configured target.
    pub async fn enforce_size_bound(&self) -> Result<usize, StoreError> {
        if self.eviction_policy == EvictionPolicy::None {
            return Ok(0);
        }

        let usage = self.store.usage(self.max_size_policy).await?;
        if usage <= self.eviction_size {
            return Ok(0);
        }

        let mut entries = self.store.entries().await?;
        if entries.is_empty() {
            return Ok(0);
        }

        // Entries are assumed to be of similar size, so the share of entries to
        // drop equals the share of usage to shed.
        let excess = u128::from(usage - self.eviction_target.min(usage));
        let to_remove = (entries.len() as u128 * excess).div_ceil(u128::from(usage)) as usize;

        order_for_eviction(&mut entries, self.eviction_policy);

        let mut evicted = 0;
        for entry in entries.iter().take(to_remove) {
            if self.store.remove_if_version(&entry.key, entry.version).await? {
                evicted += 1;
            }
        }

        info!(
            policy = ?self.eviction_policy,
            usage = usage,
            limit = self.eviction_size,
            evicted = evicted,
            "Store exceeded its size bound"
        );
        Ok(evicted)
    }

    /// Run one full sweep: time-to-live, idle expiry, then size bound.
    pub async fn run_once(&self) -> Result<SweepReport, StoreError> {
        let expired = self.store.purge_expired().await?;
        let idle = self.sweep_idle().await?;
        let evicted = self.enforce_size_bound().await?;
        Ok(SweepReport {
            expired,
            idle,
            evicted,
        })
    }

    /// Sweep every `interval` until `shutdown` flips to `true` or its sender is dropped.
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
                        match self.run_once().await {
                            Ok(report) if report.total() > 0 => {
                                info!(
                                    expired = report.expired,
                                    idle = report.idle,
                                    evicted = report.evicted,
                                    "Eviction sweep completed"
                                );
                            }
                            Ok(_) => {}
                            Err(err) => warn!(error = %err, "Eviction sweep failed"),
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Eviction coordinator stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}

/// Sort entries so that the first ones are the best eviction candidates.
fn order_for_eviction(entries: &mut [EntryView], policy: EvictionPolicy) {
    match policy {
        EvictionPolicy::Lru => entries.sort_by_key(|e| (e.last_access_time, e.hits)),
        EvictionPolicy::Lfu => entries.sort_by_key(|e| (e.hits, e.last_access_time)),
        EvictionPolicy::Random => entries.shuffle(&mut rand::thread_rng()),
        EvictionPolicy::None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::{BucketKey, DistributedBucketEngine, RefillRule};
    use crate::store::MemoryStore;

    const T0: u64 = 1_700_000_000_000_000_000;

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        engine: DistributedBucketEngine,
        rule: RefillRule,
    }

    fn fixture(store_config: StoreConfig) -> Fixture {
        let clock = Arc::new(ManualClock::new(T0));
        let store = Arc::new(MemoryStore::new(&store_config, clock.clone()));
        let engine =
            DistributedBucketEngine::new(store.clone(), clock.clone(), Duration::from_secs(1));
        let rule = RefillRule::new(5, 5, Duration::from_secs(60)).unwrap();
        Fixture {
            store,
            clock,
            engine,
            rule,
        }
    }

    fn coordinator(f: &Fixture, store_config: &StoreConfig, jitter: Duration) -> EvictionCoordinator {
        EvictionCoordinator::new(
            f.store.clone(),
            f.clock.clone(),
            store_config,
            f.rule.time_to_full(),
            jitter,
        )
        .with_seed(7)
    }

    #[tokio::test]
    async fn test_jitter_is_bounded_and_stable() {
        let f = fixture(StoreConfig::default());
        let c = coordinator(&f, &StoreConfig::default(), Duration::from_secs(30));

        let mut distinct = std::collections::HashSet::new();
        for i in 0..100 {
            let key = format!("rate-limit:client-{}", i);
            let jitter = c.jitter_for(&key);
            assert!(jitter <= Duration::from_secs(30));
            assert_eq!(jitter, c.jitter_for(&key));
            distinct.insert(jitter);
        }
        // Keys created together get spread-out deadlines
        assert!(distinct.len() > 90);

        let none = coordinator(&f, &StoreConfig::default(), Duration::ZERO);
        assert_eq!(none.jitter_for("anything"), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_idle_buckets_expire_after_horizon_and_jitter() {
        let f = fixture(StoreConfig::default());
        let c = coordinator(&f, &StoreConfig::default(), Duration::from_secs(30));

        let handle = f
            .engine
            .resolve(BucketKey::new("rate-limit:", "idle"), f.rule)
            .await
            .unwrap();
        let state = BucketState::full(&f.rule, T0);
        let deadline = c.idle_deadline(handle.store_key(), &state);
        assert!(deadline >= T0 + 60_000_000_000);
        assert!(deadline <= T0 + 90_000_000_000);

        f.clock.set(deadline - 1);
        assert_eq!(c.sweep_idle().await.unwrap(), 0);

        f.clock.set(deadline);
        assert_eq!(c.sweep_idle().await.unwrap(), 1);
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_eviction_then_resolve_yields_full_bucket() {
        let f = fixture(StoreConfig::default());
        let c = coordinator(&f, &StoreConfig::default(), Duration::ZERO);

        let handle = f
            .engine
            .resolve(BucketKey::new("rate-limit:", "comeback"), f.rule)
            .await
            .unwrap();
        f.engine.try_consume(&handle, 2).await.unwrap();

        f.clock.advance(Duration::from_secs(61));
        assert_eq!(c.run_once().await.unwrap().idle, 1);

        let handle = f
            .engine
            .resolve(BucketKey::new("rate-limit:", "comeback"), f.rule)
            .await
            .unwrap();
        assert_eq!(f.engine.available_tokens(&handle).await.unwrap(), 5);
        let verdict = f.engine.try_consume(&handle, 1).await.unwrap();
        assert_eq!(verdict.remaining_tokens, 4);
    }

    #[tokio::test]
    async fn test_active_buckets_survive_idle_sweep() {
        let f = fixture(StoreConfig::default());
        let c = coordinator(&f, &StoreConfig::default(), Duration::ZERO);

        let handle = f
            .engine
            .resolve(BucketKey::new("rate-limit:", "busy"), f.rule)
            .await
            .unwrap();
        for _ in 0..5 {
            f.engine.try_consume(&handle, 1).await.unwrap();
        }
        // Refill keeps moving the timestamp forward while the client stays active
        f.clock.advance(Duration::from_secs(50));
        f.engine.try_consume(&handle, 1).await.unwrap();
        f.clock.advance(Duration::from_secs(50));

        assert_eq!(c.sweep_idle().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_lru_size_bound() {
        let config = StoreConfig {
            eviction_policy: EvictionPolicy::Lru,
            max_size_policy: MaxSizePolicy::EntryCount,
            eviction_size: 10,
            eviction_target_percentage: 50,
            ..StoreConfig::default()
        };
        let f = fixture(config.clone());
        let c = coordinator(&f, &config, Duration::ZERO);

        let mut handles = Vec::new();
        for i in 0..12 {
            f.clock.advance(Duration::from_millis(10));
            let handle = f
                .engine
                .resolve(BucketKey::new("rate-limit:", &format!("c{}", i)), f.rule)
                .await
                .unwrap();
            handles.push(handle);
        }
        // The oldest two become the most recently used
        f.clock.advance(Duration::from_millis(10));
        f.engine.try_consume(&handles[0], 1).await.unwrap();
        f.engine.try_consume(&handles[1], 1).await.unwrap();

        assert_eq!(c.enforce_size_bound().await.unwrap(), 7);
        assert_eq!(f.store.len(), 5);
        assert!(f.store.get(handles[0].store_key()).await.unwrap().is_some());
        assert!(f.store.get(handles[1].store_key()).await.unwrap().is_some());
        assert!(f.store.get(handles[2].store_key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lfu_size_bound() {
        let config = StoreConfig {
            eviction_policy: EvictionPolicy::Lfu,
            max_size_policy: MaxSizePolicy::EntryCount,
            eviction_size: 3,
            eviction_target_percentage: 100,
            ..StoreConfig::default()
        };
        let f = fixture(config.clone());
        let c = coordinator(&f, &config, Duration::ZERO);

        let mut handles = Vec::new();
        for i in 0..4 {
            let handle = f
                .engine
                .resolve(BucketKey::new("rate-limit:", &format!("c{}", i)), f.rule)
                .await
                .unwrap();
            handles.push(handle);
        }
        for handle in &handles[1..] {
            f.engine.try_consume(handle, 1).await.unwrap();
        }

        assert_eq!(c.enforce_size_bound().await.unwrap(), 1);
        assert!(f.store.get(handles[0].store_key()).await.unwrap().is_none());
        assert_eq!(f.store.len(), 3);
    }

    #[tokio::test]
    async fn test_no_eviction_policy_never_evicts() {
        let config = StoreConfig {
            eviction_policy: EvictionPolicy::None,
            eviction_size: 1,
            ..StoreConfig::default()
        };
        let f = fixture(config.clone());
        let c = coordinator(&f, &config, Duration::ZERO);
        for i in 0..5 {
            f.engine
                .resolve(BucketKey::new("rate-limit:", &format!("c{}", i)), f.rule)
                .await
                .unwrap();
        }
        assert_eq!(c.enforce_size_bound().await.unwrap(), 0);
        assert_eq!(f.store.len(), 5);
    }

    #[tokio::test]
    async fn test_random_policy_still_meets_target() {
        let config = StoreConfig {
            eviction_policy: EvictionPolicy::Random,
            eviction_size: 4,
            eviction_target_percentage: 50,
            ..StoreConfig::default()
        };
        let f = fixture(config.clone());
        let c = coordinator(&f, &config, Duration::ZERO);
        for i in 0..8 {
            f.engine
                .resolve(BucketKey::new("rate-limit:", &format!("c{}", i)), f.rule)
                .await
                .unwrap();
        }
        assert_eq!(c.enforce_size_bound().await.unwrap(), 6);
        assert_eq!(f.store.len(), 2);
    }

    #[tokio::test]
    async fn test_spawned_coordinator_stops_on_shutdown() {
        let f = fixture(StoreConfig::default());
        let c = Arc::new(coordinator(&f, &StoreConfig::default(), Duration::ZERO));
        f.engine
            .resolve(BucketKey::new("rate-limit:", "bg"), f.rule)
            .await
            .unwrap();
        f.clock.advance(Duration::from_secs(120));

        let (tx, rx) = watch::channel(false);
        let task = c.spawn(Duration::from_millis(10), rx);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(f.store.is_empty());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
