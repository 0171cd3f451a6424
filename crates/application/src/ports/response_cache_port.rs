//! Command response cache port
//!
//! Defines the contract between a command executor and the cache that
//! deduplicates redelivered requests and reuses idempotent responses.
//!
//! Call order for one request:
//! 1. `retrieve` before running the handler
//! 2. on [`Retrieval::Pending`], await the waiter instead of running the handler
//! 3. on a claimed [`Retrieval::Miss`], run the handler and `store` the response
//!    (or `abandon` the claim if the handler failed)

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use domain::{CacheState, CommandRequest, DedupKey, ResponsePayload, ResponseRecord};
#[cfg(test)]
use mockall::automock;
use tokio::sync::watch;

use crate::error::ApplicationError;

/// Retrieval-time policy, decided per command by the executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetrievalPolicy {
    /// Whether reuse of equivalent responses is allowed
    pub is_cacheable: bool,
    /// Whether responses produced for other invokers may be reused
    pub can_reuse_across_invokers: bool,
}

/// Store-time policy, decided per command by the executor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StorePolicy {
    /// Whether repeated execution yields an equivalent result
    pub is_idempotent: bool,
    /// When the stored response stops being valid
    pub expiration_time: DateTime<Utc>,
    /// How long the handler took to produce the response
    pub execution_duration: Duration,
}

/// Which index produced a hit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitSource {
    /// Same `(topic, correlation id)`: a redelivered request
    Dedup,
    /// Equivalent idempotent request
    Reuse,
}

/// A cached response that can be returned immediately
#[derive(Debug, Clone)]
pub struct CacheHit {
    /// The stored record
    pub record: Arc<ResponseRecord>,
    /// Index that produced the hit
    pub source: HitSource,
}

/// Outcome of [`ResponseCachePort::retrieve`]
#[derive(Debug)]
pub enum Retrieval {
    /// A response is available now
    Hit(CacheHit),
    /// The same request is in flight; await its response
    Pending(PendingResponse),
    /// No cached value; the caller computes the response itself
    Miss {
        /// Whether the caller now owns the pending claim for the request
        /// and must `store` or `abandon` it
        claimed: bool,
    },
}

impl Retrieval {
    /// Check if the retrieval produced an immediate hit
    #[must_use]
    pub const fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }

    /// Check if the retrieval returned a waiter
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }

    /// Check if the retrieval missed
    #[must_use]
    pub const fn is_miss(&self) -> bool {
        matches!(self, Self::Miss { .. })
    }
}

/// Resolution state of a pending claim, broadcast to every waiter
#[derive(Debug, Clone, Default)]
pub enum ClaimOutcome {
    /// The response is still being computed
    #[default]
    InFlight,
    /// The response was stored
    Resolved(Arc<ResponseRecord>),
    /// The claim was released without a response
    Abandoned,
}

impl ClaimOutcome {
    /// Check if the claim has settled
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        !matches!(self, Self::InFlight)
    }
}

/// A waiter on a response that another caller is computing
///
/// Dropping the waiter cancels only this registration; the shared claim and
/// the other waiters are unaffected.
#[derive(Debug)]
pub struct PendingResponse {
    receiver: watch::Receiver<ClaimOutcome>,
}

impl PendingResponse {
    /// Wrap the receiving half of a claim's broadcast channel
    #[must_use]
    pub const fn new(receiver: watch::Receiver<ClaimOutcome>) -> Self {
        Self { receiver }
    }

    /// Wait for the in-flight response
    ///
    /// Returns `None` when the claim is abandoned, discarded as stale, or the
    /// cache stops; the caller should then compute the response itself.
    pub async fn wait(mut self) -> Option<Arc<ResponseRecord>> {
        match self.receiver.wait_for(ClaimOutcome::is_settled).await {
            Ok(outcome) => match &*outcome {
                ClaimOutcome::Resolved(record) => Some(Arc::clone(record)),
                ClaimOutcome::InFlight | ClaimOutcome::Abandoned => None,
            },
            // Sender dropped without resolving
            Err(_) => None,
        }
    }
}

/// Port for the command response cache
///
/// Implementations are internally synchronized and shared by every in-flight
/// command of one or more executors.
#[cfg_attr(test, automock)]
pub trait ResponseCachePort: Send + Sync {
    /// Transition `NotStarted -> Running` and start background expiry
    ///
    /// Fails with [`ApplicationError::StateInvalid`] in any other state.
    fn start(&self) -> Result<(), ApplicationError>;

    /// Transition `Running -> Stopped` and abandon all pending claims
    ///
    /// No-op in any other state.
    fn stop(&self);

    /// Current lifecycle state
    fn state(&self) -> CacheState;

    /// Look up a response for `request`
    ///
    /// Never fails; returns a miss when the cache is not running.
    fn retrieve(&self, request: &CommandRequest, policy: RetrievalPolicy) -> Retrieval;

    /// Store the response computed for `request`
    ///
    /// Fails with [`ApplicationError::StateInvalid`] when not running.
    fn store(
        &self,
        request: &CommandRequest,
        response: ResponsePayload,
        policy: StorePolicy,
    ) -> Result<(), ApplicationError>;

    /// Release the pending claim on `key` without storing a response
    fn abandon(&self, key: &DedupKey);

    /// Get cache statistics
    fn stats(&self) -> CacheStats;
}

/// Cache statistics for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Hits on the dedup index
    pub dedup_hits: u64,
    /// Hits on the reuse index
    pub reuse_hits: u64,
    /// Retrievals that returned no cached value
    pub misses: u64,
    /// Retrievals that returned a waiter
    pub coalesced: u64,
    /// Successful stores
    pub stores: u64,
    /// Records removed by the eviction planner
    pub evictions: u64,
    /// Records removed after expiring
    pub expirations: u64,
    /// Claims released without a response
    pub abandoned_claims: u64,
    /// Current number of stored records
    pub entries: u64,
    /// Current sum of stored payload sizes
    pub aggregate_bytes: u64,
    /// Current number of pending claims
    pub pending_claims: u64,
}

impl CacheStats {
    /// Calculate the hit rate as a fraction (0.0 - 1.0)
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let hits = self.dedup_hits + self.reuse_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            // Precision loss is acceptable for statistics display
            hits as f64 / total as f64
        }
    }
}
