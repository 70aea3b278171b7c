//! Bucket ownership across nodes.
//!
//! Exactly one live node owns each store key. Every other node hands bucket
//! operations for that key to the owner instead of touching its own store, so
//! the owner's per-key lock is the only place a token can be spent.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::bucket::ConsumptionVerdict;
use super::engine::BucketHandle;
use super::key::BucketKey;
use super::rules::RefillRule;
use crate::error::LimiterError;

/// A bucket operation that runs on the node owning the bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BucketCommand {
    Resolve { key: BucketKey, rule: RefillRule },
    Consume { handle: BucketHandle, tokens: u64 },
    Peek { handle: BucketHandle },
}

impl BucketCommand {
    /// The store key the command operates on.
    pub fn store_key(&self) -> String {
        match self {
            BucketCommand::Resolve { key, .. } => key.to_store_key(),
            BucketCommand::Consume { handle, .. } | BucketCommand::Peek { handle } => {
                handle.store_key().to_string()
            }
        }
    }
}

/// Result of a [`BucketCommand`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BucketReply {
    Resolved(BucketHandle),
    Verdict(ConsumptionVerdict),
    Tokens(u64),
}

/// Decides where bucket operations run and carries them there.
#[async_trait]
pub trait BucketRouter: Send + Sync {
    /// The node owning `store_key`, or `None` when it is this node.
    async fn remote_owner(&self, store_key: &str) -> Option<String>;

    /// Run `command` on `node_id` and return its reply.
    async fn forward(&self, node_id: &str, command: BucketCommand)
        -> Result<BucketReply, LimiterError>;
}
