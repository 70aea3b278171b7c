//! Rate-limit facade and the per-operation service built on top of it.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::backend::RateLimiterBackend;
use super::bucket::ConsumptionVerdict;
use super::engine::{BucketHandle, DistributedBucketEngine};
use super::key::BucketKey;
use super::routing::BucketRouter;
use super::rules::{RefillRule, RuleSet};
use crate::clock::Clock;
use crate::config::TokenhiveConfig;
use crate::error::{LimiterError, Result};
use crate::store::BucketStore;

/// Binds one refill rule and key namespace to a shared engine.
#[derive(Debug, Clone)]
pub struct RateLimitFacade {
    engine: Arc<DistributedBucketEngine>,
    rule: RefillRule,
    key_prefix: String,
}

impl RateLimitFacade {
    pub fn new(engine: Arc<DistributedBucketEngine>, rule: RefillRule, key_prefix: &str) -> Self {
        Self {
            engine,
            rule,
            key_prefix: key_prefix.to_string(),
        }
    }

    pub fn rule(&self) -> &RefillRule {
        &self.rule
    }

    /// Resolve the bucket for `key` under this facade's rule.
    pub async fn resolve_bucket(&self, key: &str) -> std::result::Result<BucketHandle, LimiterError> {
        self.engine
            .resolve(BucketKey::new(&self.key_prefix, key), self.rule)
            .await
    }

    /// Spend one token.
    pub async fn consume_one(
        &self,
        handle: &BucketHandle,
    ) -> std::result::Result<ConsumptionVerdict, LimiterError> {
        self.engine.try_consume(handle, 1).await
    }
}

#[async_trait]
impl RateLimiterBackend for RateLimitFacade {
    async fn resolve_bucket(&self, key: &str) -> std::result::Result<BucketHandle, LimiterError> {
        RateLimitFacade::resolve_bucket(self, key).await
    }

    async fn consume_one(
        &self,
        handle: &BucketHandle,
    ) -> std::result::Result<ConsumptionVerdict, LimiterError> {
        RateLimitFacade::consume_one(self, handle).await
    }
}

/// One engine shared by every protected operation, each with its own rule.
#[derive(Debug, Clone)]
pub struct RateLimiterService {
    engine: Arc<DistributedBucketEngine>,
    rules: RuleSet,
    key_prefix: String,
}

impl RateLimiterService {
    pub fn new(engine: Arc<DistributedBucketEngine>, rules: RuleSet, key_prefix: &str) -> Self {
        Self {
            engine,
            rules,
            key_prefix: key_prefix.to_string(),
        }
    }

    /// Build the service over `store` from the node and rate limiting configuration.
    ///
    /// With a `router`, operations on buckets owned by other nodes are
    /// forwarded to them.
    pub fn from_config(
        config: &TokenhiveConfig,
        store: Arc<dyn BucketStore>,
        clock: Arc<dyn Clock>,
        router: Option<Arc<dyn BucketRouter>>,
    ) -> Result<Self> {
        let rules = RuleSet::from_config(&config.rate_limiting)?;
        let mut engine = DistributedBucketEngine::new(store, clock, config.node.operation_timeout());
        if let Some(router) = router {
            engine = engine.with_router(router);
        }
        let engine = Arc::new(engine);

        let default_rule = rules.default_rule();
        info!(
            capacity = default_rule.capacity,
            refill_amount = default_rule.refill_amount,
            refill_period = ?default_rule.refill_period,
            operations = config.rate_limiting.operations.len(),
            "Rate limiter initialized"
        );

        Ok(Self::new(engine, rules, &config.rate_limiting.key_prefix))
    }

    /// Facade for `operation`, using its configured rule or the default one.
    pub fn facade(&self, operation: &str) -> RateLimitFacade {
        let rule = self.rules.rule_for(operation);
        debug!(operation = %operation, capacity = rule.capacity, "Facade requested");
        RateLimitFacade::new(self.engine.clone(), rule, &self.key_prefix)
    }

    pub fn engine(&self) -> &Arc<DistributedBucketEngine> {
        &self.engine
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::StoreConfig;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn test_service(yaml: &str) -> (RateLimiterService, Arc<MemoryStore>, Arc<ManualClock>) {
        let config = TokenhiveConfig::from_yaml(yaml).unwrap();
        let clock = Arc::new(ManualClock::new(1_700_000_000_000_000_000));
        let store = Arc::new(MemoryStore::new(&StoreConfig::default(), clock.clone()));
        let service = RateLimiterService::from_config(&config, store.clone(), clock.clone(), None).unwrap();
        (service, store, clock)
    }

    const RULES: &str = r#"
rate_limiting:
  default_rule:
    capacity: 5
    refill_amount: 5
    refill_period: 1
    unit: minute
  operations:
    find-all-departments:
      capacity: 2
      refill_amount: 1
      refill_period: 10
      unit: second
"#;

    #[tokio::test]
    async fn test_facade_consume_one() {
        let (service, _, _) = test_service(RULES);
        let facade = service.facade("find-department-by-id");

        let handle = facade.resolve_bucket("10.0.0.1.find-department-by-id").await.unwrap();
        assert_eq!(
            handle.key().to_store_key(),
            "rate-limit:10.0.0.1.find-department-by-id"
        );

        let verdicts: Vec<bool> = {
            let mut v = Vec::new();
            for _ in 0..6 {
                v.push(facade.consume_one(&handle).await.unwrap().consumed);
            }
            v
        };
        assert_eq!(verdicts, vec![true, true, true, true, true, false]);
    }

    #[tokio::test]
    async fn test_operations_use_their_own_rules() {
        let (service, _, clock) = test_service(RULES);
        let all = service.facade("find-all-departments");
        assert_eq!(all.rule().capacity, 2);

        let handle = all.resolve_bucket("10.0.0.1.find-all-departments").await.unwrap();
        assert!(all.consume_one(&handle).await.unwrap().consumed);
        assert!(all.consume_one(&handle).await.unwrap().consumed);
        assert!(!all.consume_one(&handle).await.unwrap().consumed);

        clock.advance(Duration::from_secs(10));
        let verdict = all.consume_one(&handle).await.unwrap();
        assert!(verdict.consumed);
        assert_eq!(verdict.remaining_tokens, 0);
    }

    #[tokio::test]
    async fn test_same_client_different_operations_are_independent() {
        let (service, store, _) = test_service(RULES);
        let by_id = service.facade("find-department-by-id");
        let all = service.facade("find-all-departments");

        let h1 = by_id.resolve_bucket("10.0.0.1.find-department-by-id").await.unwrap();
        let h2 = all.resolve_bucket("10.0.0.1.find-all-departments").await.unwrap();
        by_id.consume_one(&h1).await.unwrap();
        all.consume_one(&h2).await.unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(service.engine().available_tokens(&h1).await.unwrap(), 4);
        assert_eq!(service.engine().available_tokens(&h2).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_facade_through_backend_trait() {
        let (service, _, _) = test_service(RULES);
        let backend: Arc<dyn RateLimiterBackend> = Arc::new(service.facade("anything"));

        let handle = backend.resolve_bucket("client.anything").await.unwrap();
        let verdict = backend.consume_one(&handle).await.unwrap();
        assert_eq!(verdict.remaining_tokens, 4);
    }
}
