//! Command response cache
//!
//! Two indices over one set of records:
//! - the dedup index, keyed by `(topic, correlation id)`, which also holds
//!   pending claims for keys whose response is still being computed
//! - the reuse index, keyed by `(command, payload digest)`, which only holds
//!   idempotent non-error responses
//!
//! Lock order is dedup shard, then reuse shard or eviction queue. Nothing
//! acquires a dedup shard while holding either of the others.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU8, AtomicU64, Ordering},
    },
};

use application::{
    error::ApplicationError,
    ports::{
        BenefitInput, BenefitScorer, CacheHit, CacheStats, Clock, HitSource, ResponseCachePort,
        Retrieval, RetrievalPolicy, StorePolicy,
    },
};
use chrono::{DateTime, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use domain::{
    CacheState, CommandRequest, DedupKey, NewResponseRecord, ResponsePayload, ResponseRecord,
    ReuseKey,
};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::{
    eviction::EvictionQueue, pending::PendingClaim, reaper::spawn_expiry_reaper,
    reuse_index::ReuseIndex, scoring::CostWeightedBenefitScorer,
};
use crate::{adapters::SystemClock, config::ResponseCacheConfig};

/// Dedup index value: at most one of claim or record per key
#[derive(Debug)]
enum DedupSlot {
    Pending(PendingClaim),
    Stored(Arc<ResponseRecord>),
}

#[derive(Debug, Default)]
struct Counters {
    dedup_hits: AtomicU64,
    reuse_hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    stores: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    abandoned_claims: AtomicU64,
}

/// What one expiry sweep removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    /// Records dropped because they expired
    pub expired: usize,
    /// Pending claims discarded after the claim timeout
    pub stale_claims: usize,
    /// Records evicted to get back under the capacity limits
    pub evicted: usize,
}

impl SweepSummary {
    /// Check if the sweep removed nothing
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.expired == 0 && self.stale_claims == 0 && self.evicted == 0
    }
}

const fn hit_source_label(source: HitSource) -> &'static str {
    match source {
        HitSource::Dedup => "dedup",
        HitSource::Reuse => "reuse",
    }
}

/// Subtract from an accounting counter, clamping at zero
fn decrement(counter: &AtomicU64, by: u64, name: &'static str) {
    let result = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
        current.checked_sub(by)
    });
    if let Err(current) = result {
        let err = ApplicationError::InternalLogic(format!(
            "{name} underflow: {current} - {by}"
        ));
        error!(error = %err, "Response cache accounting out of sync");
        counter.store(0, Ordering::Release);
    }
}

/// Shared state, also held weakly by the expiry reaper
pub(crate) struct CacheInner {
    config: ResponseCacheConfig,
    clock: Arc<dyn Clock>,
    scorer: Arc<dyn BenefitScorer>,
    state: AtomicU8,
    next_sequence: AtomicU64,
    dedup: DashMap<DedupKey, DedupSlot>,
    reuse: ReuseIndex,
    eviction: EvictionQueue,
    entries: AtomicU64,
    aggregate_bytes: AtomicU64,
    pending_claims: AtomicU64,
    counters: Counters,
}

impl CacheInner {
    fn state(&self) -> CacheState {
        CacheState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Compare-and-set the lifecycle state; returns the actual state on failure
    fn transition(&self, from: CacheState, to: CacheState) -> Result<(), CacheState> {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(CacheState::from_u8)
    }

    fn retrieve(&self, request: &CommandRequest, policy: RetrievalPolicy) -> Retrieval {
        if !self.state().is_running() {
            return Retrieval::Miss { claimed: false };
        }

        let now = self.clock.now();
        let key = request.dedup_key();
        let reuse_key = policy
            .is_cacheable
            .then(|| request.reuse_key(policy.can_reuse_across_invokers));

        match self.dedup.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                match occupied.get() {
                    DedupSlot::Stored(record) if record.is_live_at(now) => {
                        return self.hit(Arc::clone(record), HitSource::Dedup);
                    },
                    DedupSlot::Pending(claim) => {
                        self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                        metrics::counter!("response_cache.coalesced").increment(1);
                        debug!(key = %key, waiters = claim.waiter_count(), "Coalescing on in-flight request");
                        return Retrieval::Pending(claim.subscribe());
                    },
                    // Expired but not yet swept
                    DedupSlot::Stored(_) => {},
                }

                if let Some(record) = self.lookup_reuse(reuse_key.as_ref(), now) {
                    return self.hit(record, HitSource::Reuse);
                }

                let previous = occupied.insert(DedupSlot::Pending(PendingClaim::new(now)));
                self.pending_claims.fetch_add(1, Ordering::AcqRel);
                if let DedupSlot::Stored(expired) = previous {
                    self.release(&expired);
                    self.counters.expirations.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("response_cache.expirations").increment(1);
                }
            },
            Entry::Vacant(vacant) => {
                if let Some(record) = self.lookup_reuse(reuse_key.as_ref(), now) {
                    return self.hit(record, HitSource::Reuse);
                }
                vacant.insert(DedupSlot::Pending(PendingClaim::new(now)));
                self.pending_claims.fetch_add(1, Ordering::AcqRel);
            },
        }

        // A stop that drained claims before ours landed would strand it
        if !self.state().is_running() {
            self.abandon_claim(&key);
            return Retrieval::Miss { claimed: false };
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("response_cache.misses").increment(1);
        debug!(key = %key, "Cache miss, claim created");
        Retrieval::Miss { claimed: true }
    }

    fn lookup_reuse(&self, key: Option<&ReuseKey>, now: DateTime<Utc>) -> Option<Arc<ResponseRecord>> {
        self.reuse.lookup(key?, now)
    }

    fn hit(&self, record: Arc<ResponseRecord>, source: HitSource) -> Retrieval {
        let counter = match source {
            HitSource::Dedup => &self.counters.dedup_hits,
            HitSource::Reuse => &self.counters.reuse_hits,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("response_cache.hits", "source" => hit_source_label(source)).increment(1);
        debug!(key = %record.dedup_key(), source = hit_source_label(source), "Cache hit");
        Retrieval::Hit(CacheHit { record, source })
    }

    fn store(
        &self,
        request: &CommandRequest,
        response: ResponsePayload,
        policy: StorePolicy,
    ) -> Result<(), ApplicationError> {
        let state = self.state();
        if !state.is_running() {
            return Err(ApplicationError::state_invalid("store", state));
        }

        let now = self.clock.now();
        let key = request.dedup_key();

        if policy.expiration_time <= now {
            debug!(key = %key, expiration = %policy.expiration_time, "Response expired before store, discarding");
            // Waiters fall through and compute the response themselves
            self.abandon_claim(&key);
            return Ok(());
        }

        let remaining_lifetime = (policy.expiration_time - now).to_std().unwrap_or_default();
        let benefit_score = self.scorer.score(&BenefitInput {
            request_payload: &request.payload,
            response: &response,
            execution_duration: policy.execution_duration,
            remaining_lifetime,
        });
        let reuse_key = (policy.is_idempotent && !response.is_error_response).then(|| {
            ReuseKey::with_digest(
                request.command_name.clone(),
                request.request_digest(),
                Some(request.invoker_id.clone()),
            )
        });
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let record = Arc::new(ResponseRecord::new(
            NewResponseRecord {
                dedup_key: key.clone(),
                reuse_key,
                invoker_id: request.invoker_id.clone(),
                payload: response,
                is_idempotent: policy.is_idempotent,
                stored_at: now,
                expiration_time: policy.expiration_time,
                execution_duration: policy.execution_duration,
                benefit_score,
            },
            sequence,
        ));

        match self.dedup.entry(key) {
            Entry::Occupied(mut occupied) => {
                match occupied.insert(DedupSlot::Stored(Arc::clone(&record))) {
                    DedupSlot::Pending(claim) => {
                        decrement(&self.pending_claims, 1, "pending claims");
                        claim.resolve(Arc::clone(&record));
                    },
                    DedupSlot::Stored(replaced) => self.release(&replaced),
                }
                self.index(&record);
            },
            Entry::Vacant(vacant) => {
                vacant.insert(DedupSlot::Stored(Arc::clone(&record)));
                self.index(&record);
            },
        }

        self.counters.stores.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("response_cache.stores").increment(1);
        debug!(
            key = %record.dedup_key(),
            command = %request.command_name,
            size_bytes = record.size_bytes(),
            score = record.benefit_score(),
            idempotent = record.is_idempotent(),
            "Response stored"
        );

        self.trim();
        self.publish_gauges();
        Ok(())
    }

    /// Add a freshly stored record to the accounting and secondary indices
    fn index(&self, record: &Arc<ResponseRecord>) {
        self.entries.fetch_add(1, Ordering::AcqRel);
        self.aggregate_bytes
            .fetch_add(record.size_bytes() as u64, Ordering::AcqRel);
        if let Some(displaced) = self.reuse.insert(record) {
            debug!(
                key = %displaced.dedup_key(),
                invoker = %displaced.invoker_id(),
                "Reuse entry superseded by newer response"
            );
        }
        self.eviction.insert(record);
    }

    /// Undo [`CacheInner::index`] for a record leaving the dedup index
    fn release(&self, record: &ResponseRecord) {
        decrement(&self.entries, 1, "entries");
        decrement(&self.aggregate_bytes, record.size_bytes() as u64, "aggregate bytes");
        self.reuse.remove(record);
        self.eviction.remove(record);
    }

    fn over_capacity(&self) -> bool {
        self.entries.load(Ordering::Acquire) > self.config.max_entry_count
            || self.aggregate_bytes.load(Ordering::Acquire) > self.config.max_aggregate_payload_bytes
    }

    /// Evict the least valuable reuse-eligible records until within limits
    fn trim(&self) -> usize {
        let mut evicted = 0;
        while self.over_capacity() {
            let Some(candidate) = self.eviction.pop_least_valuable() else {
                warn!(
                    entries = self.entries.load(Ordering::Acquire),
                    aggregate_bytes = self.aggregate_bytes.load(Ordering::Acquire),
                    "Response cache over capacity with no evictable records"
                );
                break;
            };

            let removed = self.dedup.remove_if(&candidate.dedup_key, |_, slot| {
                matches!(slot, DedupSlot::Stored(record) if record.sequence() == candidate.sequence)
            });
            let Some((key, DedupSlot::Stored(record))) = removed else {
                // Replaced or reaped between pop and removal
                debug!(key = %candidate.dedup_key, "Eviction candidate already gone");
                continue;
            };

            self.release(&record);
            evicted += 1;
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("response_cache.evictions").increment(1);
            debug!(key = %key, score = record.benefit_score(), "Evicted response");
        }
        evicted
    }

    /// Remove the pending claim on `key`, if any, and release its waiters
    fn abandon_claim(&self, key: &DedupKey) -> bool {
        let removed = self
            .dedup
            .remove_if(key, |_, slot| matches!(slot, DedupSlot::Pending(_)));
        let Some((_, DedupSlot::Pending(claim))) = removed else {
            return false;
        };

        decrement(&self.pending_claims, 1, "pending claims");
        self.counters.abandoned_claims.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("response_cache.abandoned_claims").increment(1);
        debug!(key = %key, waiters = claim.waiter_count(), "Pending claim abandoned");
        claim.abandon();
        true
    }

    fn abandon_all_claims(&self) -> usize {
        let keys: Vec<DedupKey> = self
            .dedup
            .iter()
            .filter(|entry| matches!(entry.value(), DedupSlot::Pending(_)))
            .map(|entry| entry.key().clone())
            .collect();
        keys.iter().filter(|key| self.abandon_claim(key)).count()
    }

    /// Drop expired records and stale claims, then trim to capacity
    pub(crate) fn sweep(&self) -> SweepSummary {
        let now = self.clock.now();
        let stale_cutoff = chrono::Duration::from_std(self.config.pending_claim_timeout())
            .ok()
            .and_then(|timeout| now.checked_sub_signed(timeout));

        let mut expired = Vec::new();
        let mut stale = Vec::new();
        for entry in self.dedup.iter() {
            match entry.value() {
                DedupSlot::Stored(record) if !record.is_live_at(now) => {
                    expired.push((entry.key().clone(), record.sequence()));
                },
                DedupSlot::Pending(claim)
                    if stale_cutoff.is_some_and(|cutoff| claim.claimed_at() <= cutoff) =>
                {
                    stale.push(entry.key().clone());
                },
                _ => {},
            }
        }

        let mut summary = SweepSummary::default();

        for (key, sequence) in expired {
            let removed = self.dedup.remove_if(&key, |_, slot| {
                matches!(slot, DedupSlot::Stored(record)
                    if record.sequence() == sequence && !record.is_live_at(now))
            });
            if let Some((_, DedupSlot::Stored(record))) = removed {
                self.release(&record);
                summary.expired += 1;
            }
        }

        for key in stale {
            let removed = self.dedup.remove_if(&key, |_, slot| {
                matches!(slot, DedupSlot::Pending(claim)
                    if stale_cutoff.is_some_and(|cutoff| claim.claimed_at() <= cutoff))
            });
            if let Some((_, DedupSlot::Pending(claim))) = removed {
                decrement(&self.pending_claims, 1, "pending claims");
                warn!(
                    key = %key,
                    claimed_at = %claim.claimed_at(),
                    waiters = claim.waiter_count(),
                    "Discarding stale pending claim"
                );
                claim.abandon();
                summary.stale_claims += 1;
            }
        }

        summary.evicted = self.trim();

        self.counters
            .expirations
            .fetch_add(summary.expired as u64, Ordering::Relaxed);
        self.counters
            .abandoned_claims
            .fetch_add(summary.stale_claims as u64, Ordering::Relaxed);
        metrics::counter!("response_cache.expirations").increment(summary.expired as u64);
        metrics::counter!("response_cache.abandoned_claims").increment(summary.stale_claims as u64);
        self.publish_gauges();
        summary
    }

    #[allow(clippy::cast_precision_loss)]
    fn publish_gauges(&self) {
        metrics::gauge!("response_cache.entries").set(self.entries.load(Ordering::Relaxed) as f64);
        metrics::gauge!("response_cache.aggregate_bytes")
            .set(self.aggregate_bytes.load(Ordering::Relaxed) as f64);
        metrics::gauge!("response_cache.pending_claims")
            .set(self.pending_claims.load(Ordering::Relaxed) as f64);
    }

    fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            dedup_hits: c.dedup_hits.load(Ordering::Relaxed),
            reuse_hits: c.reuse_hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            coalesced: c.coalesced.load(Ordering::Relaxed),
            stores: c.stores.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            expirations: c.expirations.load(Ordering::Relaxed),
            abandoned_claims: c.abandoned_claims.load(Ordering::Relaxed),
            entries: self.entries.load(Ordering::Acquire),
            aggregate_bytes: self.aggregate_bytes.load(Ordering::Acquire),
            pending_claims: self.pending_claims.load(Ordering::Acquire),
        }
    }
}

/// In-memory response cache for an RPC command executor
///
/// Deduplicates redelivered requests, coalesces concurrent duplicates onto a
/// single execution, and reuses idempotent responses for equivalent requests.
/// Capacity is enforced by evicting the lowest-scored reuse-eligible records;
/// records of non-idempotent commands leave only by expiring.
///
/// `start` spawns the expiry reaper on the current tokio runtime. Without a
/// runtime the cache still works; expired records are then hidden on lookup
/// and dropped by [`CommandResponseCache::purge_expired`] or on replacement.
pub struct CommandResponseCache {
    inner: Arc<CacheInner>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for CommandResponseCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandResponseCache")
            .field("state", &self.inner.state())
            .field("config", &self.inner.config)
            .field("entries", &self.inner.entries.load(Ordering::Relaxed))
            .field("pending_claims", &self.inner.pending_claims.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl CommandResponseCache {
    /// Create a cache with the given limits, clock, and benefit scorer
    pub fn new(
        config: ResponseCacheConfig,
        clock: Arc<dyn Clock>,
        scorer: Arc<dyn BenefitScorer>,
    ) -> Result<Self, ApplicationError> {
        config.validate()?;
        Ok(Self::build(config, clock, scorer))
    }

    /// Create a cache with default limits, the system clock, and the default scorer
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::build(
            ResponseCacheConfig::default(),
            Arc::new(SystemClock),
            Arc::new(CostWeightedBenefitScorer::new()),
        )
    }

    fn build(
        config: ResponseCacheConfig,
        clock: Arc<dyn Clock>,
        scorer: Arc<dyn BenefitScorer>,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                config,
                clock,
                scorer,
                state: AtomicU8::new(CacheState::NotStarted.as_u8()),
                next_sequence: AtomicU64::new(0),
                dedup: DashMap::new(),
                reuse: ReuseIndex::new(),
                eviction: EvictionQueue::new(),
                entries: AtomicU64::new(0),
                aggregate_bytes: AtomicU64::new(0),
                pending_claims: AtomicU64::new(0),
                counters: Counters::default(),
            }),
            reaper: Mutex::new(None),
        }
    }

    /// The configured limits
    #[must_use]
    pub fn config(&self) -> &ResponseCacheConfig {
        &self.inner.config
    }

    /// Run one expiry sweep now
    ///
    /// Does nothing unless the cache is running.
    #[instrument(skip(self), level = "debug")]
    pub fn purge_expired(&self) -> SweepSummary {
        if !self.inner.state().is_running() {
            return SweepSummary::default();
        }
        self.inner.sweep()
    }

    /// Number of records in the reuse index
    #[must_use]
    pub fn reusable_entries(&self) -> usize {
        self.inner.reuse.len()
    }

    /// Number of records queued for capacity eviction
    #[must_use]
    pub fn evictable_entries(&self) -> usize {
        self.inner.eviction.len()
    }
}

impl ResponseCachePort for CommandResponseCache {
    fn start(&self) -> Result<(), ApplicationError> {
        let mut reaper = self.reaper.lock();
        self.inner
            .transition(CacheState::NotStarted, CacheState::Running)
            .map_err(|state| ApplicationError::state_invalid("start", state))?;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                *reaper = Some(spawn_expiry_reaper(
                    &handle,
                    Arc::downgrade(&self.inner),
                    self.inner.config.sweep_interval(),
                ));
            },
            Err(_) => {
                warn!("No tokio runtime, expiry reaper disabled; expired records are swept on access");
            },
        }

        info!(
            max_entry_count = self.inner.config.max_entry_count,
            max_aggregate_payload_bytes = self.inner.config.max_aggregate_payload_bytes,
            "Response cache started"
        );
        Ok(())
    }

    fn stop(&self) {
        let mut reaper = self.reaper.lock();
        if let Err(state) = self
            .inner
            .transition(CacheState::Running, CacheState::Stopped)
        {
            debug!(state = %state, "Stop ignored, cache not running");
            return;
        }

        if let Some(handle) = reaper.take() {
            handle.abort();
        }
        let released = self.inner.abandon_all_claims();
        self.inner.publish_gauges();
        info!(released_claims = released, "Response cache stopped");
    }

    fn state(&self) -> CacheState {
        self.inner.state()
    }

    #[instrument(
        skip(self, request, policy),
        fields(topic = %request.topic, command = %request.command_name),
        level = "debug"
    )]
    fn retrieve(&self, request: &CommandRequest, policy: RetrievalPolicy) -> Retrieval {
        self.inner.retrieve(request, policy)
    }

    #[instrument(
        skip(self, request, response, policy),
        fields(topic = %request.topic, command = %request.command_name),
        level = "debug"
    )]
    fn store(
        &self,
        request: &CommandRequest,
        response: ResponsePayload,
        policy: StorePolicy,
    ) -> Result<(), ApplicationError> {
        self.inner.store(request, response, policy)
    }

    #[instrument(skip(self, key), fields(key = %key), level = "debug")]
    fn abandon(&self, key: &DedupKey) {
        if self.inner.state().is_running() {
            self.inner.abandon_claim(key);
        }
    }

    fn stats(&self) -> CacheStats {
        self.inner.stats()
    }
}

impl Drop for CommandResponseCache {
    fn drop(&mut self) {
        if let Some(handle) = self.reaper.get_mut().take() {
            handle.abort();
        }
    }
}
