//! Rate limiter trait consumed by the HTTP layer.

use async_trait::async_trait;

use super::bucket::ConsumptionVerdict;
use super::engine::BucketHandle;
use crate::error::LimiterError;

/// Trait for rate limiter implementations.
///
/// Calling code resolves a bucket for a client key, then spends one token per
/// request. Implementations hide how buckets are stored and configured.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Resolve the bucket for `key`, creating it if needed.
    async fn resolve_bucket(&self, key: &str) -> Result<BucketHandle, LimiterError>;

    /// Try to spend one token from `handle`.
    async fn consume_one(&self, handle: &BucketHandle) -> Result<ConsumptionVerdict, LimiterError>;
}
