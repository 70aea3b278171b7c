//! Rate limiting logic and state management.

mod backend;
mod bucket;
pub mod codec;
mod engine;
mod eviction;
mod key;
mod limiter;
mod routing;
mod rules;

pub use backend::RateLimiterBackend;
pub use bucket::{BucketState, ConsumptionVerdict};
pub use codec::CorruptStateError;
pub use engine::{BucketHandle, DistributedBucketEngine};
pub use eviction::{EvictionCoordinator, SweepReport};
pub use key::BucketKey;
pub use limiter::{RateLimitFacade, RateLimiterService};
pub use routing::{BucketCommand, BucketReply, BucketRouter};
pub use rules::{RefillRule, RuleConfig, RuleSet, TimeUnit};
