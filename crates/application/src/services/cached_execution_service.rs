//! Cached command execution service
//!
//! Wraps a command handler with the response cache: redelivered requests get
//! the stored response, concurrent duplicates wait for the first execution,
//! and equivalent idempotent requests reuse earlier responses.

use std::{
    fmt,
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use domain::{CommandRequest, DedupKey, ResponsePayload};
use tracing::{debug, instrument, warn};

use crate::{
    error::ApplicationError,
    ports::{Clock, HitSource, ResponseCachePort, Retrieval, RetrievalPolicy, StorePolicy},
};

/// Per-command caching policy, usually derived from the command definition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandCachePolicy {
    /// Whether repeated execution yields an equivalent result
    pub is_idempotent: bool,
    /// Whether equivalent requests may reuse a cached response
    pub is_cacheable: bool,
    /// Whether responses may be reused across invokers
    pub can_reuse_across_invokers: bool,
    /// How long a stored response stays valid
    pub response_ttl: Duration,
}

impl CommandCachePolicy {
    /// Policy for a command with side effects: dedup only
    #[must_use]
    pub const fn non_idempotent(response_ttl: Duration) -> Self {
        Self {
            is_idempotent: false,
            is_cacheable: false,
            can_reuse_across_invokers: false,
            response_ttl,
        }
    }

    /// Policy for a side-effect free command whose responses are shareable
    #[must_use]
    pub const fn idempotent(response_ttl: Duration) -> Self {
        Self {
            is_idempotent: true,
            is_cacheable: true,
            can_reuse_across_invokers: true,
            response_ttl,
        }
    }

    /// The retrieval half of the policy
    #[must_use]
    pub const fn retrieval(&self) -> RetrievalPolicy {
        RetrievalPolicy {
            is_cacheable: self.is_cacheable,
            can_reuse_across_invokers: self.can_reuse_across_invokers,
        }
    }
}

/// Where an execution's response came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    /// Stored response for the same request
    Deduplicated,
    /// Stored response for an equivalent request
    Reused,
    /// Response of a concurrent in-flight duplicate
    Coalesced,
    /// The handler ran
    Executed,
}

impl From<HitSource> for ResponseSource {
    fn from(source: HitSource) -> Self {
        match source {
            HitSource::Dedup => Self::Deduplicated,
            HitSource::Reuse => Self::Reused,
        }
    }
}

/// Result of [`CachedExecutionService::execute`]
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// The response to publish
    pub response: ResponsePayload,
    /// Where it came from
    pub source: ResponseSource,
}

/// Runs command handlers through a [`ResponseCachePort`]
pub struct CachedExecutionService<C: ResponseCachePort + ?Sized> {
    cache: Arc<C>,
    clock: Arc<dyn Clock>,
}

impl<C: ResponseCachePort + ?Sized> fmt::Debug for CachedExecutionService<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedExecutionService")
            .field("cache_state", &self.cache.state())
            .field("clock", &self.clock)
            .finish()
    }
}

impl<C: ResponseCachePort + ?Sized> CachedExecutionService<C> {
    /// Create a new service
    pub fn new(cache: Arc<C>, clock: Arc<dyn Clock>) -> Self {
        Self { cache, clock }
    }

    /// Get the underlying cache
    pub const fn cache(&self) -> &Arc<C> {
        &self.cache
    }

    /// Produce the response for `request`, running `handler` only when needed
    ///
    /// A handler error releases the claim so coalesced waiters fall through,
    /// and is returned as [`ApplicationError::HandlerFailed`]. Dropping the
    /// returned future before the response is stored releases the claim too.
    #[instrument(
        skip(self, request, handler),
        fields(command = %request.command_name, topic = %request.topic),
        level = "debug"
    )]
    pub async fn execute<F, Fut, E>(
        &self,
        request: &CommandRequest,
        policy: CommandCachePolicy,
        handler: F,
    ) -> Result<ExecutionOutcome, ApplicationError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ResponsePayload, E>>,
        E: fmt::Display,
    {
        let claimed = match self.cache.retrieve(request, policy.retrieval()) {
            Retrieval::Hit(hit) => {
                debug!(source = ?hit.source, "Responding from cache");
                return Ok(ExecutionOutcome {
                    response: hit.record.payload().clone(),
                    source: hit.source.into(),
                });
            },
            Retrieval::Pending(waiter) => {
                if let Some(record) = waiter.wait().await {
                    debug!("Responding with coalesced in-flight result");
                    return Ok(ExecutionOutcome {
                        response: record.payload().clone(),
                        source: ResponseSource::Coalesced,
                    });
                }
                debug!("In-flight duplicate was abandoned, executing handler");
                false
            },
            Retrieval::Miss { claimed } => claimed,
        };

        let claim = ClaimGuard::new(&*self.cache, claimed.then(|| request.dedup_key()));
        let started = Instant::now();
        let response = handler()
            .await
            .map_err(|e| ApplicationError::HandlerFailed(e.to_string()))?;
        let execution_duration = started.elapsed();

        let store_policy = StorePolicy {
            is_idempotent: policy.is_idempotent,
            expiration_time: expiration_after(self.clock.now(), policy.response_ttl),
            execution_duration,
        };
        let stored = self.cache.store(request, response.clone(), store_policy);
        // The cache settled the claim either way
        claim.disarm();
        if let Err(e) = stored {
            // The response is still valid; only caching is lost
            warn!(error = %e, "Failed to cache command response");
        }

        Ok(ExecutionOutcome {
            response,
            source: ResponseSource::Executed,
        })
    }
}

/// Abandons a held claim on drop unless the response reached the cache
struct ClaimGuard<'a, C: ResponseCachePort + ?Sized> {
    cache: &'a C,
    key: Option<DedupKey>,
}

impl<'a, C: ResponseCachePort + ?Sized> ClaimGuard<'a, C> {
    const fn new(cache: &'a C, key: Option<DedupKey>) -> Self {
        Self { cache, key }
    }

    fn disarm(mut self) {
        self.key = None;
    }
}

impl<C: ResponseCachePort + ?Sized> Drop for ClaimGuard<'_, C> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            debug!(key = %key, "Releasing claim without a response");
            self.cache.abandon(&key);
        }
    }
}

fn expiration_after(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
