//! Distributed token bucket engine.
//!
//! Every consumption is one atomic read-refill-consume-write cycle executed
//! by the store as an entry processor, so concurrent callers on any node can
//! never both spend the same token. Bucket state lives only in the store;
//! nothing is cached in-process.
//!
//! In a cluster the engine is given a [`BucketRouter`]. Operations on keys
//! owned by another node are forwarded there and never run locally.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace, warn};

use super::bucket::{BucketState, ConsumptionVerdict};
use super::codec;
use super::key::BucketKey;
use super::routing::{BucketCommand, BucketReply, BucketRouter};
use super::rules::RefillRule;
use crate::clock::Clock;
use crate::error::LimiterError;
use crate::store::{BucketStore, EntryProcessor};

/// A resolved bucket: its key and the rule it is governed by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketHandle {
    key: BucketKey,
    store_key: String,
    rule: RefillRule,
}

impl BucketHandle {
    pub fn key(&self) -> &BucketKey {
        &self.key
    }

    pub fn rule(&self) -> &RefillRule {
        &self.rule
    }

    pub fn store_key(&self) -> &str {
        &self.store_key
    }
}

/// Token bucket engine over a [`BucketStore`].
pub struct DistributedBucketEngine {
    store: Arc<dyn BucketStore>,
    clock: Arc<dyn Clock>,
    operation_timeout: Duration,
    router: Option<Arc<dyn BucketRouter>>,
}

impl std::fmt::Debug for DistributedBucketEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedBucketEngine")
            .field("store", &self.store.name())
            .field("operation_timeout", &self.operation_timeout)
            .field("routed", &self.router.is_some())
            .finish()
    }
}

impl DistributedBucketEngine {
    /// Create an engine. Every store call is bounded by `operation_timeout`.
    pub fn new(
        store: Arc<dyn BucketStore>,
        clock: Arc<dyn Clock>,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            operation_timeout,
            router: None,
        }
    }

    /// Send operations on keys owned by other nodes through `router`.
    pub fn with_router(mut self, router: Arc<dyn BucketRouter>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn store(&self) -> &Arc<dyn BucketStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Resolve the bucket for `key`, creating it full if it does not exist
    /// or its stored state is unreadable.
    #[instrument(skip(self, rule), fields(key = %key))]
    pub async fn resolve(
        &self,
        key: BucketKey,
        rule: RefillRule,
    ) -> Result<BucketHandle, LimiterError> {
        let store_key = key.to_store_key();
        if let Some(owner) = self.remote_owner(&store_key).await {
            return match self.forward(&owner, BucketCommand::Resolve { key, rule }).await? {
                BucketReply::Resolved(handle) => Ok(handle),
                other => Err(unexpected_reply(&owner, &other)),
            };
        }
        self.resolve_local(key, rule, store_key).await
    }

    async fn resolve_local(
        &self,
        key: BucketKey,
        rule: RefillRule,
        store_key: String,
    ) -> Result<BucketHandle, LimiterError> {
        let clock = &self.clock;

        let mut processor = |current: Option<&[u8]>| match current.map(codec::decode) {
            Some(Ok(_)) => None,
            Some(Err(err)) => {
                warn!(error = %err, "Discarding unreadable bucket state");
                Some(codec::encode(&BucketState::full(&rule, clock.now_nanos())))
            }
            None => {
                debug!(capacity = rule.capacity, "Creating bucket");
                Some(codec::encode(&BucketState::full(&rule, clock.now_nanos())))
            }
        };
        self.execute(&store_key, &mut processor).await?;

        Ok(BucketHandle {
            key,
            store_key,
            rule,
        })
    }

    /// Refill the bucket and try to take `tokens` from it.
    ///
    /// A bucket that has been evicted since it was resolved is recreated
    /// full. Asking for zero tokens or more than the capacity is rejected.
    #[instrument(skip(self, handle), fields(key = %handle.key))]
    pub async fn try_consume(
        &self,
        handle: &BucketHandle,
        tokens: u64,
    ) -> Result<ConsumptionVerdict, LimiterError> {
        let rule = handle.rule;
        if tokens == 0 || tokens > rule.capacity {
            return Err(LimiterError::InvalidRequest {
                requested: tokens,
                capacity: rule.capacity,
            });
        }

        if let Some(owner) = self.remote_owner(&handle.store_key).await {
            let command = BucketCommand::Consume {
                handle: handle.clone(),
                tokens,
            };
            return match self.forward(&owner, command).await? {
                BucketReply::Verdict(verdict) => Ok(verdict),
                other => Err(unexpected_reply(&owner, &other)),
            };
        }
        self.consume_local(handle, tokens).await
    }

    async fn consume_local(
        &self,
        handle: &BucketHandle,
        tokens: u64,
    ) -> Result<ConsumptionVerdict, LimiterError> {
        let rule = handle.rule;
        let clock = &self.clock;
        let mut verdict = None;
        let mut processor = |current: Option<&[u8]>| {
            let now = clock.now_nanos();
            let mut state = load_or_create(current, &rule, now);
            state.refill(&rule, now);
            let consumed = state.try_consume(tokens);
            verdict = Some(ConsumptionVerdict {
                consumed,
                remaining_tokens: state.available_tokens,
            });
            Some(codec::encode(&state))
        };
        self.execute(&handle.store_key, &mut processor).await?;

        let verdict = verdict.ok_or_else(|| {
            LimiterError::StoreUnavailable("store did not run the entry processor".to_string())
        })?;

        if verdict.consumed {
            trace!(remaining = verdict.remaining_tokens, "Tokens consumed");
        } else {
            debug!(requested = tokens, remaining = verdict.remaining_tokens, "Rate limit exceeded");
        }
        Ok(verdict)
    }

    /// Tokens currently available, including any pending refill, without
    /// writing to the store.
    pub async fn available_tokens(&self, handle: &BucketHandle) -> Result<u64, LimiterError> {
        if let Some(owner) = self.remote_owner(&handle.store_key).await {
            let command = BucketCommand::Peek {
                handle: handle.clone(),
            };
            return match self.forward(&owner, command).await? {
                BucketReply::Tokens(tokens) => Ok(tokens),
                other => Err(unexpected_reply(&owner, &other)),
            };
        }
        self.peek_local(handle).await
    }

    async fn peek_local(&self, handle: &BucketHandle) -> Result<u64, LimiterError> {
        let entry = tokio::time::timeout(self.operation_timeout, self.store.get(&handle.store_key))
            .await
            .map_err(|_| LimiterError::timed_out(self.operation_timeout))??;

        let now = self.clock.now_nanos();
        let mut state = load_or_create(entry.as_ref().map(|e| e.value.as_slice()), &handle.rule, now);
        state.refill(&handle.rule, now);
        Ok(state.available_tokens)
    }

    /// Run a command received from another node against the local store.
    ///
    /// The command is never forwarded again, even if this node's view of
    /// ownership disagrees with the sender's.
    pub async fn apply(&self, command: BucketCommand) -> Result<BucketReply, LimiterError> {
        match command {
            BucketCommand::Resolve { key, rule } => {
                let store_key = key.to_store_key();
                self.resolve_local(key, rule, store_key)
                    .await
                    .map(BucketReply::Resolved)
            }
            BucketCommand::Consume { handle, tokens } => {
                if tokens == 0 || tokens > handle.rule.capacity {
                    return Err(LimiterError::InvalidRequest {
                        requested: tokens,
                        capacity: handle.rule.capacity,
                    });
                }
                self.consume_local(&handle, tokens)
                    .await
                    .map(BucketReply::Verdict)
            }
            BucketCommand::Peek { handle } => {
                self.peek_local(&handle).await.map(BucketReply::Tokens)
            }
        }
    }

    async fn remote_owner(&self, store_key: &str) -> Option<String> {
        match &self.router {
            Some(router) => router.remote_owner(store_key).await,
            None => None,
        }
    }

    /// Hand `command` to `owner` under the operation timeout.
    async fn forward(&self, owner: &str, command: BucketCommand) -> Result<BucketReply, LimiterError> {
        let Some(router) = &self.router else {
            return Err(LimiterError::StoreUnavailable(
                "no router configured".to_string(),
            ));
        };
        trace!(owner = %owner, "Forwarding bucket operation");
        match tokio::time::timeout(self.operation_timeout, router.forward(owner, command)).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(err)) => {
                warn!(owner = %owner, error = %err, "Forwarded operation failed");
                Err(err)
            }
            Err(_) => {
                warn!(owner = %owner, timeout = ?self.operation_timeout, "Forwarded operation timed out");
                Err(LimiterError::timed_out(self.operation_timeout))
            }
        }
    }

    /// Run an entry processor under the operation timeout.
    ///
    /// If the deadline passes before the store applies the processor the
    /// call is abandoned and reported as unavailable, never as consumed.
    async fn execute(
        &self,
        store_key: &str,
        processor: &mut EntryProcessor<'_>,
    ) -> Result<(), LimiterError> {
        match tokio::time::timeout(self.operation_timeout, self.store.execute(store_key, processor))
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                warn!(key = %store_key, error = %err, "Store operation failed");
                Err(err.into())
            }
            Err(_) => {
                warn!(key = %store_key, timeout = ?self.operation_timeout, "Store operation timed out");
                Err(LimiterError::timed_out(self.operation_timeout))
            }
        }
    }
}

fn unexpected_reply(owner: &str, reply: &BucketReply) -> LimiterError {
    LimiterError::StoreUnavailable(format!("node {} sent an unexpected reply: {:?}", owner, reply))
}

/// Decode the stored state, falling back to a full bucket when it is absent
/// or unreadable.
fn load_or_create(current: Option<&[u8]>, rule: &RefillRule, now: u64) -> BucketState {
    match current.map(codec::decode) {
        Some(Ok(state)) => state,
        Some(Err(err)) => {
            warn!(error = %err, "Resetting unreadable bucket state to full capacity");
            BucketState::full(rule, now)
        }
        None => BucketState::full(rule, now),
    }
}
