//! Integration tests for the command response cache
//!
//! Tests cover:
//! - Lifecycle gating of store and retrieve
//! - Deduplication by `(topic, correlation id)`
//! - Request coalescing and waiter release
//! - Reuse of idempotent responses
//! - Capacity eviction and expiry
//! - The cached execution service end to end

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use application::{
    ApplicationError, BenefitInput, CachedExecutionService, Clock, CommandCachePolicy, HitSource,
    ResponseCachePort, ResponseSource, Retrieval, RetrievalPolicy, StorePolicy,
};
use bytes::Bytes;
use domain::{CacheState, CommandName, CommandRequest, CorrelationId, InvokerId, ResponsePayload, Topic};
use infrastructure::{
    CommandResponseCache, CostWeightedBenefitScorer, ManualClock, ResponseCacheConfig,
};

// ============================================================================
// Test Helpers
// ============================================================================

fn request(command: &str, invoker: &str, topic: &str, corr: &str, payload: &str) -> CommandRequest {
    CommandRequest::new(
        CommandName::new(command).unwrap(),
        InvokerId::new(invoker).unwrap(),
        Topic::new(topic).unwrap(),
        CorrelationId::new(corr.as_bytes().to_vec()).unwrap(),
        Bytes::copy_from_slice(payload.as_bytes()),
    )
}

fn simple(topic: &str, corr: &str) -> CommandRequest {
    request("increment", "client-a", topic, corr, "{}")
}

fn response(body: &str) -> ResponsePayload {
    ResponsePayload::new(body.to_string(), "application/json")
}

fn cache_with(config: ResponseCacheConfig, clock: &ManualClock) -> CommandResponseCache {
    CommandResponseCache::new(
        config,
        Arc::new(clock.clone()),
        Arc::new(CostWeightedBenefitScorer::new()),
    )
    .unwrap()
}

fn running(clock: &ManualClock) -> CommandResponseCache {
    let cache = cache_with(ResponseCacheConfig::default(), clock);
    cache.start().unwrap();
    cache
}

fn store_policy(clock: &ManualClock, ttl: chrono::Duration, is_idempotent: bool) -> StorePolicy {
    StorePolicy {
        is_idempotent,
        expiration_time: clock.now() + ttl,
        execution_duration: Duration::from_millis(20),
    }
}

fn ttl_secs(secs: i64) -> chrono::Duration {
    chrono::Duration::seconds(secs)
}

fn cacheable(can_reuse_across_invokers: bool) -> RetrievalPolicy {
    RetrievalPolicy {
        is_cacheable: true,
        can_reuse_across_invokers,
    }
}

fn hit_body(retrieval: Retrieval) -> Option<(Bytes, HitSource)> {
    match retrieval {
        Retrieval::Hit(hit) => Some((hit.record.payload().payload.clone(), hit.source)),
        Retrieval::Pending(_) | Retrieval::Miss { .. } => None,
    }
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

mod lifecycle_tests {
    use super::*;

    #[test]
    fn store_before_start_fails_with_state_invalid() {
        let clock = ManualClock::starting_now();
        let cache = cache_with(ResponseCacheConfig::default(), &clock);

        let err = cache
            .store(&simple("t1", "c1"), response("R1"), store_policy(&clock, ttl_secs(10), false))
            .unwrap_err();
        assert!(matches!(
            err,
            ApplicationError::StateInvalid {
                operation: "store",
                state: CacheState::NotStarted
            }
        ));
        assert!(!err.is_remote());
        assert!(!err.is_application_error());
    }

    #[test]
    fn retrieve_before_start_misses_without_claim() {
        let clock = ManualClock::starting_now();
        let cache = cache_with(ResponseCacheConfig::default(), &clock);

        let outcome = cache.retrieve(&simple("t1", "c1"), RetrievalPolicy::default());
        assert!(matches!(outcome, Retrieval::Miss { claimed: false }));
        assert_eq!(cache.stats().pending_claims, 0);
    }

    #[test]
    fn store_after_stop_fails_and_retrieve_misses() {
        let clock = ManualClock::starting_now();
        let cache = running(&clock);
        cache
            .store(&simple("t1", "c1"), response("R1"), store_policy(&clock, ttl_secs(10), false))
            .unwrap();
        cache.stop();

        assert_eq!(cache.state(), CacheState::Stopped);
        let err = cache
            .store(&simple("t1", "c2"), response("R2"), store_policy(&clock, ttl_secs(10), false))
            .unwrap_err();
        assert!(matches!(
            err,
            ApplicationError::StateInvalid {
                state: CacheState::Stopped,
                ..
            }
        ));
        assert!(matches!(
            cache.retrieve(&simple("t1", "c1"), RetrievalPolicy::default()),
            Retrieval::Miss { claimed: false }
        ));
    }

    #[test]
    fn start_twice_fails() {
        let clock = ManualClock::starting_now();
        let cache = running(&clock);
        assert!(matches!(
            cache.start(),
            Err(ApplicationError::StateInvalid {
                operation: "start",
                state: CacheState::Running
            })
        ));
    }

    #[test]
    fn stopped_is_terminal() {
        let clock = ManualClock::starting_now();
        let cache = running(&clock);
        cache.stop();
        assert!(cache.start().is_err());
        assert_eq!(cache.state(), CacheState::Stopped);
    }

    #[test]
    fn stop_before_start_is_noop() {
        let clock = ManualClock::starting_now();
        let cache = cache_with(ResponseCacheConfig::default(), &clock);
        cache.stop();
        assert_eq!(cache.state(), CacheState::NotStarted);
        assert!(cache.start().is_ok());
    }

    #[tokio::test]
    async fn stop_releases_waiters_to_no_value() {
        let clock = ManualClock::starting_now();
        let cache = running(&clock);
        let req = simple("t1", "c1");

        assert!(matches!(
            cache.retrieve(&req, RetrievalPolicy::default()),
            Retrieval::Miss { claimed: true }
        ));
        let Retrieval::Pending(waiter) = cache.retrieve(&req, RetrievalPolicy::default()) else {
            panic!("expected pending waiter");
        };

        cache.stop();
        assert!(waiter.wait().await.is_none());
        assert_eq!(cache.stats().pending_claims, 0);
    }
}

// ============================================================================
// Deduplication Tests
// ============================================================================

mod dedup_tests {
    use super::*;

    #[test]
    fn dedup_matches_key_not_payload() {
        let clock = ManualClock::starting_now();
        let cache = running(&clock);
        let stored = request("increment", "client-a", "t1", "c1", r#"{"by":1}"#);
        cache
            .store(&stored, response("R1"), store_policy(&clock, ttl_secs(10), false))
            .unwrap();

        let redelivered = request("increment", "client-a", "t1", "c1", r#"{"by":999}"#);
        let (body, source) = hit_body(cache.retrieve(&redelivered, RetrievalPolicy::default())).unwrap();
        assert_eq!(body, Bytes::from_static(b"R1"));
        assert_eq!(source, HitSource::Dedup);
    }

    #[test]
    fn dedup_ignores_command_name() {
        let clock = ManualClock::starting_now();
        let cache = running(&clock);
        cache
            .store(
                &request("A", "client-a", "t1", "c1", "{}"),
                response("R1"),
                store_policy(&clock, ttl_secs(10), false),
            )
            .unwrap();

        let outcome = cache.retrieve(&request("B", "client-a", "t1", "c1", "{}"), RetrievalPolicy::default());
        assert_eq!(hit_body(outcome).unwrap().0, Bytes::from_static(b"R1"));
    }

    #[test]
    fn topic_is_part_of_the_key() {
        let clock = ManualClock::starting_now();
        let cache = running(&clock);
        cache
            .store(&simple("t1", "c1"), response("R1"), store_policy(&clock, ttl_secs(10), false))
            .unwrap();

        assert!(matches!(
            cache.retrieve(&simple("t2", "c1"), RetrievalPolicy::default()),
            Retrieval::Miss { claimed: true }
        ));
    }

    #[test]
    fn round_trip_is_byte_identical() {
        let clock = ManualClock::starting_now();
        let cache = running(&clock);
        let body: Vec<u8> = (0..=255u8).collect();
        let stored = ResponsePayload::new(body.clone(), "application/octet-stream")
            .with_user_property("status", "200");
        cache
            .store(&simple("t1", "c1"), stored.clone(), store_policy(&clock, ttl_secs(10), false))
            .unwrap();

        let Retrieval::Hit(hit) = cache.retrieve(&simple("t1", "c1"), RetrievalPolicy::default()) else {
            panic!("expected hit");
        };
        assert_eq!(hit.record.payload(), &stored);
        assert_eq!(hit.record.payload().payload.as_ref(), body.as_slice());
    }

    #[test]
    fn restore_replaces_previous_record() {
        let clock = ManualClock::starting_now();
        let cache = running(&clock);
        let req = simple("t1", "c1");
        cache
            .store(&req, response("first"), store_policy(&clock, ttl_secs(10), false))
            .unwrap();
        cache
            .store(&req, response("second"), store_policy(&clock, ttl_secs(10), false))
            .unwrap();

        let (body, _) = hit_body(cache.retrieve(&req, RetrievalPolicy::default())).unwrap();
        assert_eq!(body, Bytes::from_static(b"second"));
        assert_eq!(cache.stats().entries, 1);
    }
}

// ============================================================================
// Coalescing Tests
// ============================================================================

mod coalescing_tests {
    use super::*;

    #[tokio::test]
    async fn second_retrieve_waits_for_first_store() {
        let clock = ManualClock::starting_now();
        let cache = running(&clock);
        let req = simple("t1", "c1");

        assert!(matches!(
            cache.retrieve(&req, RetrievalPolicy::default()),
            Retrieval::Miss { claimed: true }
        ));
        let Retrieval::Pending(waiter) = cache.retrieve(&req, RetrievalPolicy::default()) else {
            panic!("expected pending waiter");
        };

        cache
            .store(&req, response("R1"), store_policy(&clock, ttl_secs(10), false))
            .unwrap();

        let record = waiter.wait().await.unwrap();
        assert_eq!(record.payload().payload, Bytes::from_static(b"R1"));
        assert_eq!(cache.stats().coalesced, 1);
        assert_eq!(cache.stats().pending_claims, 0);
    }

    #[test]
    fn distinct_keys_do_not_coalesce() {
        let clock = ManualClock::starting_now();
        let cache = running(&clock);

        assert!(matches!(
            cache.retrieve(&simple("t1", "c1"), RetrievalPolicy::default()),
            Retrieval::Miss { claimed: true }
        ));
        assert!(matches!(
            cache.retrieve(&simple("t1", "c2"), RetrievalPolicy::default()),
            Retrieval::Miss { claimed: true }
        ));
        assert_eq!(cache.stats().pending_claims, 2);
    }

    #[tokio::test]
    async fn dropping_one_waiter_leaves_others() {
        let clock = ManualClock::starting_now();
        let cache = running(&clock);
        let req = simple("t1", "c1");
        cache.retrieve(&req, RetrievalPolicy::default());

        let Retrieval::Pending(dropped) = cache.retrieve(&req, RetrievalPolicy::default()) else {
            panic!("expected pending waiter");
        };
        let Retrieval::Pending(kept) = cache.retrieve(&req, RetrievalPolicy::default()) else {
            panic!("expected pending waiter");
        };
        drop(dropped);

        cache
            .store(&req, response("R1"), store_policy(&clock, ttl_secs(10), false))
            .unwrap();
        assert!(kept.wait().await.is_some());
    }

    #[tokio::test]
    async fn abandon_releases_waiters_and_next_retrieve_claims() {
        let clock = ManualClock::starting_now();
        let cache = running(&clock);
        let req = simple("t1", "c1");
        cache.retrieve(&req, RetrievalPolicy::default());
        let Retrieval::Pending(waiter) = cache.retrieve(&req, RetrievalPolicy::default()) else {
            panic!("expected pending waiter");
        };

        cache.abandon(&req.dedup_key());

        assert!(waiter.wait().await.is_none());
        assert_eq!(cache.stats().abandoned_claims, 1);
        assert!(matches!(
            cache.retrieve(&req, RetrievalPolicy::default()),
            Retrieval::Miss { claimed: true }
        ));
    }

    #[test]
    fn abandon_without_claim_is_noop() {
        let clock = ManualClock::starting_now();
        let cache = running(&clock);
        let req = simple("t1", "c1");
        cache
            .store(&req, response("R1"), store_policy(&clock, ttl_secs(10), false))
            .unwrap();

        cache.abandon(&req.dedup_key());
        assert!(cache.retrieve(&req, RetrievalPolicy::default()).is_hit());
        assert_eq!(cache.stats().abandoned_claims, 0);
    }

    #[tokio::test]
    async fn store_with_past_expiration_releases_waiters() {
        let clock = ManualClock::starting_now();
        let cache = running(&clock);
        let req = simple("t1", "c1");
        cache.retrieve(&req, RetrievalPolicy::default());
        let Retrieval::Pending(waiter) = cache.retrieve(&req, RetrievalPolicy::default()) else {
            panic!("expected pending waiter");
        };

        cache
            .store(&req, response("R1"), store_policy(&clock, ttl_secs(-1), false))
            .unwrap();

        assert!(waiter.wait().await.is_none());
        assert_eq!(cache.stats().pending_claims, 0);
    }
}

// ============================================================================
// Reuse Tests
// ============================================================================

mod reuse_tests {
    use super::*;

    #[test]
    fn idempotent_response_reused_for_same_invoker() {
        let clock = ManualClock::starting_now();
        let cache = running(&clock);
        cache
            .store(
                &request("read", "client-a", "t1", "c1", "q"),
                response("R1"),
                store_policy(&clock, ttl_secs(10), true),
            )
            .unwrap();

        let outcome = cache.retrieve(&request("read", "client-a", "t1", "c2", "q"), cacheable(false));
        let (body, source) = hit_body(outcome).unwrap();
        assert_eq!(body, Bytes::from_static(b"R1"));
        assert_eq!(source, HitSource::Reuse);
        // Reuse hits never create a claim
        assert_eq!(cache.stats().pending_claims, 0);
    }

    #[test]
    fn reuse_requires_matching_user_properties() {
        let clock = ManualClock::starting_now();
        let cache = running(&clock);
        cache
            .store(
                &request("read", "client-a", "t1", "c1", "q")
                    .with_user_property("unit", "celsius")
                    .with_user_property("__ts", "1700000000:0:client-a"),
                response("R1"),
                store_policy(&clock, ttl_secs(10), true),
            )
            .unwrap();

        let other_unit = request("read", "client-a", "t1", "c2", "q").with_user_property("unit", "kelvin");
        assert!(matches!(
            cache.retrieve(&other_unit, cacheable(true)),
            Retrieval::Miss { claimed: true }
        ));

        let same_unit = request("read", "client-a", "t1", "c3", "q")
            .with_user_property("__ts", "1700000009:1:client-a")
            .with_user_property("unit", "celsius");
        let (body, source) = hit_body(cache.retrieve(&same_unit, cacheable(true))).unwrap();
        assert_eq!(body, Bytes::from_static(b"R1"));
        assert_eq!(source, HitSource::Reuse);
    }

    #[test]
    fn scoped_reuse_misses_for_other_invoker() {
        let clock = ManualClock::starting_now();
        let cache = running(&clock);
        cache
            .store(
                &request("read", "client-a", "t1", "c1", "q"),
                response("R1"),
                store_policy(&clock, ttl_secs(10), true),
            )
            .unwrap();

        let outcome = cache.retrieve(&request("read", "client-b", "t1", "c2", "q"), cacheable(false));
        assert!(matches!(outcome, Retrieval::Miss { claimed: true }));
    }

    #[test]
    fn unscoped_reuse_hits_for_other_invoker() {
        let clock = ManualClock::starting_now();
        let cache = running(&clock);
        cache
            .store(
                &request("read", "client-a", "t1", "c1", "q"),
                response("R1"),
                store_policy(&clock, ttl_secs(10), true),
            )
            .unwrap();

        let outcome = cache.retrieve(&request("read", "client-b", "t1", "c2", "q"), cacheable(true));
        assert_eq!(hit_body(outcome).unwrap().1, HitSource::Reuse);
    }

    #[test]
    fn reuse_requires_same_command_and_payload() {
        let clock = ManualClock::starting_now();
        let cache = running(&clock);
        cache
            .store(
                &request("read", "client-a", "t1", "c1", "q"),
                response("R1"),
                store_policy(&clock, ttl_secs(10), true),
            )
            .unwrap();

        assert!(cache
            .retrieve(&request("read", "client-a", "t1", "c2", "other"), cacheable(true))
            .is_miss());
        assert!(cache
            .retrieve(&request("write", "client-a", "t1", "c3", "q"), cacheable(true))
            .is_miss());
    }

    #[test]
    fn non_cacheable_retrieve_skips_reuse() {
        let clock = ManualClock::starting_now();
        let cache = running(&clock);
        cache
            .store(
                &request("read", "client-a", "t1", "c1", "q"),
                response("R1"),
                store_policy(&clock, ttl_secs(10), true),
            )
            .unwrap();

        assert!(cache
            .retrieve(&request("read", "client-a", "t1", "c2", "q"), RetrievalPolicy::default())
            .is_miss());
    }

    #[test]
    fn non_idempotent_response_is_not_reused() {
        let clock = ManualClock::starting_now();
        let cache = running(&clock);
        cache
            .store(
                &request("write", "client-a", "t1", "c1", "q"),
                response("R1"),
                store_policy(&clock, ttl_secs(10), false),
            )
            .unwrap();

        assert!(cache
            .retrieve(&request("write", "client-a", "t1", "c2", "q"), cacheable(true))
            .is_miss());
        assert_eq!(cache.reusable_entries(), 0);
    }

    #[test]
    fn error_response_is_deduplicated_but_not_reused() {
        let clock = ManualClock::starting_now();
        let cache = running(&clock);
        let failed = request("read", "client-a", "t1", "c1", "q");
        cache
            .store(
                &failed,
                ResponsePayload::error("boom", "text/plain"),
                store_policy(&clock, ttl_secs(10), true),
            )
            .unwrap();

        assert!(cache.retrieve(&failed, RetrievalPolicy::default()).is_hit());
        assert!(cache
            .retrieve(&request("read", "client-a", "t1", "c2", "q"), cacheable(true))
            .is_miss());
        assert_eq!(cache.evictable_entries(), 0);
    }

    #[test]
    fn expired_response_is_not_reused() {
        let clock = ManualClock::starting_now();
        let cache = running(&clock);
        cache
            .store(
                &request("read", "client-a", "t1", "c1", "q"),
                response("R1"),
                store_policy(&clock, ttl_secs(5), true),
            )
            .unwrap();
        clock.advance(ttl_secs(5));

        assert!(cache
            .retrieve(&request("read", "client-a", "t1", "c2", "q"), cacheable(true))
            .is_miss());
    }
}

// ============================================================================
// Capacity Tests
// ============================================================================

mod capacity_tests {
    use super::*;

    /// Scores each response by the number in its request payload
    fn payload_scorer(input: &BenefitInput<'_>) -> f64 {
        std::str::from_utf8(input.request_payload)
            .ok()
            .and_then(|text| text.parse().ok())
            .unwrap_or(0.0)
    }

    fn two_entry_cache(clock: &ManualClock) -> CommandResponseCache {
        let config = ResponseCacheConfig {
            max_entry_count: 2,
            ..ResponseCacheConfig::default()
        };
        let cache =
            CommandResponseCache::new(config, Arc::new(clock.clone()), Arc::new(payload_scorer)).unwrap();
        cache.start().unwrap();
        cache
    }

    #[test]
    fn lowest_scored_idempotent_entry_is_evicted() {
        let clock = ManualClock::starting_now();
        let cache = two_entry_cache(&clock);

        for (corr, score) in [("c1", "0.5"), ("c2", "0.4"), ("c3", "0.3")] {
            cache
                .store(
                    &request("read", "client-a", "t1", corr, score),
                    response(score),
                    store_policy(&clock, ttl_secs(60), true),
                )
                .unwrap();
        }

        let policy = RetrievalPolicy::default();
        assert!(cache.retrieve(&request("read", "client-a", "t1", "c1", "0.5"), policy).is_hit());
        assert!(cache.retrieve(&request("read", "client-a", "t1", "c2", "0.4"), policy).is_hit());
        assert!(cache.retrieve(&request("read", "client-a", "t1", "c3", "0.3"), policy).is_miss());

        let stats = cache.stats();
        assert_eq!(stats.evictions, 1);
        // The miss above holds a claim; two records remain
        assert_eq!(stats.entries, 2);
    }

    #[test]
    fn evicted_entry_leaves_reuse_index() {
        let clock = ManualClock::starting_now();
        let cache = two_entry_cache(&clock);

        for (corr, score) in [("c1", "0.5"), ("c2", "0.4"), ("c3", "0.3")] {
            cache
                .store(
                    &request("read", "client-a", "t1", corr, score),
                    response(score),
                    store_policy(&clock, ttl_secs(60), true),
                )
                .unwrap();
        }

        assert_eq!(cache.reusable_entries(), 2);
        assert!(cache
            .retrieve(&request("read", "client-a", "t1", "c9", "0.3"), cacheable(false))
            .is_miss());
    }

    #[test]
    fn non_idempotent_entries_are_never_evicted() {
        let clock = ManualClock::starting_now();
        let cache = two_entry_cache(&clock);

        for (corr, score) in [("c1", "0.5"), ("c2", "0.4"), ("c3", "0.3")] {
            cache
                .store(
                    &request("write", "client-a", "t1", corr, score),
                    response(score),
                    store_policy(&clock, ttl_secs(60), false),
                )
                .unwrap();
        }

        for corr in ["c1", "c2", "c3"] {
            assert!(cache.retrieve(&simple("t1", corr), RetrievalPolicy::default()).is_hit());
        }
        let stats = cache.stats();
        assert_eq!(stats.entries, 3);
        assert_eq!(stats.evictions, 0);
    }

    #[test]
    fn mixed_entries_evict_only_idempotent_ones() {
        let clock = ManualClock::starting_now();
        let cache = two_entry_cache(&clock);

        cache
            .store(
                &request("write", "client-a", "t1", "c1", "0.1"),
                response("w1"),
                store_policy(&clock, ttl_secs(60), false),
            )
            .unwrap();
        cache
            .store(
                &request("read", "client-a", "t1", "c2", "0.9"),
                response("r1"),
                store_policy(&clock, ttl_secs(60), true),
            )
            .unwrap();
        cache
            .store(
                &request("write", "client-a", "t1", "c3", "0.2"),
                response("w2"),
                store_policy(&clock, ttl_secs(60), false),
            )
            .unwrap();

        assert!(cache.retrieve(&simple("t1", "c1"), RetrievalPolicy::default()).is_hit());
        assert!(cache.retrieve(&simple("t1", "c3"), RetrievalPolicy::default()).is_hit());
        assert!(cache.retrieve(&simple("t1", "c2"), RetrievalPolicy::default()).is_miss());
    }

    #[test]
    fn byte_budget_triggers_eviction() {
        let clock = ManualClock::starting_now();
        let config = ResponseCacheConfig {
            max_aggregate_payload_bytes: 10,
            ..ResponseCacheConfig::default()
        };
        let cache = cache_with(config, &clock);
        cache.start().unwrap();

        cache
            .store(&simple("t1", "c1"), response("123456"), store_policy(&clock, ttl_secs(60), true))
            .unwrap();
        cache
            .store(&simple("t1", "c2"), response("abcdef"), store_policy(&clock, ttl_secs(60), true))
            .unwrap();

        let stats = cache.stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.aggregate_bytes, 6);
    }
}

// ============================================================================
// Expiry Tests
// ============================================================================

mod expiry_tests {
    use super::*;

    #[test]
    fn past_expiration_is_never_retrievable() {
        let clock = ManualClock::starting_now();
        let cache = running(&clock);
        let req = simple("t1", "c1");

        cache
            .store(&req, response("R1"), store_policy(&clock, ttl_secs(-5), true))
            .unwrap();

        assert!(cache.retrieve(&req, RetrievalPolicy::default()).is_miss());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn entry_expires_when_time_passes() {
        let clock = ManualClock::starting_now();
        let cache = running(&clock);
        let req = simple("t1", "c1");
        cache
            .store(&req, response("R1"), store_policy(&clock, ttl_secs(2), false))
            .unwrap();

        clock.advance(ttl_secs(1));
        assert!(cache.retrieve(&req, RetrievalPolicy::default()).is_hit());

        clock.advance(ttl_secs(1));
        assert!(cache.retrieve(&req, RetrievalPolicy::default()).is_miss());
    }

    #[test]
    fn purge_drops_expired_non_idempotent_entries() {
        let clock = ManualClock::starting_now();
        let cache = running(&clock);
        cache
            .store(&simple("t1", "c1"), response("R1"), store_policy(&clock, ttl_secs(1), false))
            .unwrap();
        cache
            .store(&simple("t1", "c2"), response("R2"), store_policy(&clock, ttl_secs(60), false))
            .unwrap();

        clock.advance(ttl_secs(2));
        let summary = cache.purge_expired();

        assert_eq!(summary.expired, 1);
        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.expirations, 1);
    }

    #[tokio::test]
    async fn reaper_sweeps_in_background() {
        let clock = ManualClock::starting_now();
        let config = ResponseCacheConfig {
            sweep_interval_ms: 10,
            ..ResponseCacheConfig::default()
        };
        let cache = cache_with(config, &clock);
        cache.start().unwrap();
        cache
            .store(&simple("t1", "c1"), response("R1"), store_policy(&clock, ttl_secs(1), false))
            .unwrap();

        clock.advance(ttl_secs(5));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(cache.stats().entries, 0);
        assert_eq!(cache.stats().expirations, 1);
    }

    #[tokio::test]
    async fn stale_claims_are_discarded() {
        let clock = ManualClock::starting_now();
        let config = ResponseCacheConfig {
            pending_claim_timeout_secs: 30,
            ..ResponseCacheConfig::default()
        };
        let cache = cache_with(config, &clock);
        cache.start().unwrap();
        let req = simple("t1", "c1");
        cache.retrieve(&req, RetrievalPolicy::default());
        let Retrieval::Pending(waiter) = cache.retrieve(&req, RetrievalPolicy::default()) else {
            panic!("expected pending waiter");
        };

        clock.advance(ttl_secs(31));
        assert_eq!(cache.purge_expired().stale_claims, 1);
        assert!(waiter.wait().await.is_none());
    }
}

// ============================================================================
// Cached Execution Service Tests
// ============================================================================

mod execution_tests {
    use super::*;

    fn service(clock: &ManualClock) -> CachedExecutionService<CommandResponseCache> {
        let cache = Arc::new(running(clock));
        CachedExecutionService::new(cache, Arc::new(clock.clone()))
    }

    #[tokio::test]
    async fn redelivery_is_served_from_cache() {
        let clock = ManualClock::starting_now();
        let service = service(&clock);
        let req = simple("t1", "c1");
        let policy = CommandCachePolicy::non_idempotent(Duration::from_secs(10));
        let counter = AtomicUsize::new(0);
        let runs = &counter;

        for _ in 0..3 {
            service
                .execute(&req, policy, || async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(response("R1"))
                })
                .await
                .unwrap();
        }

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(service.cache().stats().dedup_hits, 2);
    }

    #[tokio::test]
    async fn cancelled_execution_releases_claim() {
        let clock = ManualClock::starting_now();
        let service = service(&clock);
        let req = simple("t1", "c1");
        let policy = CommandCachePolicy::non_idempotent(Duration::from_secs(10));

        let timed_out = tokio::time::timeout(
            Duration::from_millis(20),
            service.execute(&req, policy, || std::future::pending::<Result<ResponsePayload, String>>()),
        )
        .await;
        assert!(timed_out.is_err());

        let stats = service.cache().stats();
        assert_eq!(stats.pending_claims, 0);
        assert_eq!(stats.abandoned_claims, 1);
        assert!(matches!(
            service.cache().retrieve(&req, RetrievalPolicy::default()),
            Retrieval::Miss { claimed: true }
        ));
    }

    #[tokio::test]
    async fn cancelled_execution_releases_waiters() {
        let clock = ManualClock::starting_now();
        let service = service(&clock);
        let req = simple("t1", "c1");
        let policy = CommandCachePolicy::non_idempotent(Duration::from_secs(10));

        let mut execution = Box::pin(service.execute(&req, policy, || {
            std::future::pending::<Result<ResponsePayload, String>>()
        }));
        assert!(tokio::time::timeout(Duration::from_millis(20), execution.as_mut()).await.is_err());

        let Retrieval::Pending(waiter) = service.cache().retrieve(&req, RetrievalPolicy::default()) else {
            panic!("expected the in-flight execution to be joined");
        };
        drop(execution);

        assert!(waiter.wait().await.is_none());
        assert!(matches!(
            service.cache().retrieve(&req, RetrievalPolicy::default()),
            Retrieval::Miss { claimed: true }
        ));
    }

    #[tokio::test]
    async fn equivalent_request_reuses_response() {
        let clock = ManualClock::starting_now();
        let service = service(&clock);
        let policy = CommandCachePolicy::idempotent(Duration::from_secs(10));

        let first = service
            .execute(&request("read", "a", "t1", "c1", "q"), policy, || async {
                Ok::<_, String>(response("R1"))
            })
            .await
            .unwrap();
        let second = service
            .execute(&request("read", "b", "t1", "c2", "q"), policy, || async {
                Ok::<_, String>(response("R2"))
            })
            .await
            .unwrap();

        assert_eq!(first.source, ResponseSource::Executed);
        assert_eq!(second.source, ResponseSource::Reused);
        assert_eq!(second.response.payload, Bytes::from_static(b"R1"));
    }

    #[tokio::test]
    async fn handler_failure_frees_the_key() {
        let clock = ManualClock::starting_now();
        let service = service(&clock);
        let req = simple("t1", "c1");
        let policy = CommandCachePolicy::non_idempotent(Duration::from_secs(10));

        let err = service
            .execute(&req, policy, || async { Err::<ResponsePayload, _>("boom") })
            .await
            .unwrap_err();
        assert!(err.is_application_error());
        assert_eq!(service.cache().stats().pending_claims, 0);

        let retry = service
            .execute(&req, policy, || async { Ok::<_, String>(response("R1")) })
            .await
            .unwrap();
        assert_eq!(retry.source, ResponseSource::Executed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_duplicates_run_handler_once() {
        let clock = ManualClock::starting_now();
        let service = Arc::new(service(&clock));
        let runs = Arc::new(AtomicUsize::new(0));
        let policy = CommandCachePolicy::non_idempotent(Duration::from_secs(10));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let service = Arc::clone(&service);
                let runs = Arc::clone(&runs);
                tokio::spawn(async move {
                    service
                        .execute(&simple("t1", "c1"), policy, || async move {
                            runs.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok::<_, String>(response("R1"))
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            let outcome = task.await.unwrap().unwrap();
            assert_eq!(outcome.response.payload, Bytes::from_static(b"R1"));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
