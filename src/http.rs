//! Mapping between HTTP requests and rate limiter verdicts.
//!
//! A routing layer derives the key with [`rate_limit_key`], calls [`admit`]
//! and writes the returned status. Nodes also answer admission requests
//! directly over their request endpoint (see [`crate::mesh::NodeServer`]).

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::LimiterError;
use crate::ratelimit::{ConsumptionVerdict, RateLimiterBackend};

pub const STATUS_OK: u16 = 200;
pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;
pub const STATUS_INTERNAL_ERROR: u16 = 500;

/// Rate limit key for one client calling one operation.
pub fn rate_limit_key(client_address: &str, operation: &str) -> String {
    format!("{}.{}", client_address, operation)
}

/// Status code and message a handler should answer with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpReply {
    pub status: u16,
    pub message: String,
    /// Tokens left after an admitted request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_tokens: Option<u64>,
}

impl HttpReply {
    pub fn from_outcome(outcome: Result<ConsumptionVerdict, LimiterError>) -> Self {
        match outcome {
            Ok(verdict) if verdict.consumed => Self {
                status: STATUS_OK,
                message: "OK".to_string(),
                remaining_tokens: Some(verdict.remaining_tokens),
            },
            Ok(_) => Self {
                status: STATUS_TOO_MANY_REQUESTS,
                message: "Too many requests".to_string(),
                remaining_tokens: None,
            },
            Err(err) => Self {
                status: STATUS_INTERNAL_ERROR,
                message: err.to_string(),
                remaining_tokens: None,
            },
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == STATUS_OK
    }
}

/// Resolve the bucket for `key` and spend one token from it.
pub async fn admit<B>(backend: &B, key: &str) -> HttpReply
where
    B: RateLimiterBackend + ?Sized,
{
    let outcome = match backend.resolve_bucket(key).await {
        Ok(handle) => backend.consume_one(&handle).await,
        Err(err) => Err(err),
    };

    let reply = HttpReply::from_outcome(outcome);
    match reply.status {
        STATUS_INTERNAL_ERROR => warn!(key = %key, error = %reply.message, "Rate limiter failed"),
        status => debug!(key = %key, status = status, "Rate limit verdict"),
    }
    reply
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{StoreConfig, TokenhiveConfig};
    use crate::ratelimit::{BucketHandle, RateLimiterService};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    struct UnreachableBackend;

    #[async_trait]
    impl RateLimiterBackend for UnreachableBackend {
        async fn resolve_bucket(&self, _key: &str) -> Result<BucketHandle, LimiterError> {
            Err(LimiterError::timed_out(Duration::from_millis(500)))
        }

        async fn consume_one(
            &self,
            _handle: &BucketHandle,
        ) -> Result<ConsumptionVerdict, LimiterError> {
            Err(LimiterError::StoreUnavailable("unreachable".to_string()))
        }
    }

    #[test]
    fn test_rate_limit_key() {
        assert_eq!(
            rate_limit_key("10.0.0.1", "find-department-by-id"),
            "10.0.0.1.find-department-by-id"
        );
    }

    #[test]
    fn test_from_outcome() {
        let ok = HttpReply::from_outcome(Ok(ConsumptionVerdict {
            consumed: true,
            remaining_tokens: 3,
        }));
        assert_eq!(ok.status, 200);
        assert_eq!(ok.remaining_tokens, Some(3));
        assert!(ok.is_success());

        let rejected = HttpReply::from_outcome(Ok(ConsumptionVerdict {
            consumed: false,
            remaining_tokens: 0,
        }));
        assert_eq!(rejected.status, 429);
        assert_eq!(rejected.message, "Too many requests");

        let failed = HttpReply::from_outcome(Err(LimiterError::InvalidRequest {
            requested: 10,
            capacity: 5,
        }));
        assert_eq!(failed.status, 500);
        assert!(failed.message.contains("capacity 5"));
    }

    #[test]
    fn test_reply_serialization() {
        let rejected = HttpReply::from_outcome(Ok(ConsumptionVerdict {
            consumed: false,
            remaining_tokens: 0,
        }));
        let json = serde_json::to_value(&rejected).unwrap();
        assert_eq!(json, serde_json::json!({"status": 429, "message": "Too many requests"}));
    }

    #[tokio::test]
    async fn test_admit_until_exhausted() {
        let config = TokenhiveConfig::default();
        let clock = Arc::new(ManualClock::new(1_700_000_000_000_000_000));
        let store = Arc::new(MemoryStore::new(&StoreConfig::default(), clock.clone()));
        let service = RateLimiterService::from_config(&config, store, clock.clone(), None).unwrap();
        let facade = service.facade("find-department-by-id");
        let key = rate_limit_key("10.0.0.1", "find-department-by-id");

        let mut statuses = Vec::new();
        for _ in 0..6 {
            statuses.push(admit(&facade, &key).await.status);
        }
        assert_eq!(statuses, vec![200, 200, 200, 200, 200, 429]);

        clock.advance(Duration::from_secs(60));
        assert_eq!(admit(&facade, &key).await.status, 200);
    }

    #[tokio::test]
    async fn test_admit_store_failure_is_internal_error() {
        let backend: Arc<dyn RateLimiterBackend> = Arc::new(UnreachableBackend);
        let reply = admit(backend.as_ref(), "10.0.0.1.find-all-departments").await;

        assert_eq!(reply.status, 500);
        assert!(reply.message.contains("timed out"));
    }
}
