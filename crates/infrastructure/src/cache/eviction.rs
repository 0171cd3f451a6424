//! Eviction planner - ranks reuse-eligible records for capacity trimming
//!
//! Only evictable records (idempotent, non-error) are queued. Records that
//! protect against duplicate side effects never enter the queue and leave
//! the cache only by expiring.

use std::{cmp::Ordering, collections::BTreeSet};

use chrono::{DateTime, Utc};
use domain::{DedupKey, ResponseRecord};
use parking_lot::Mutex;

/// Queue entry identifying one stored record
///
/// Ordered by ascending benefit score, then nearest expiration, then
/// insertion sequence, so the first element is the next to evict.
#[derive(Debug, Clone)]
pub(crate) struct EvictionCandidate {
    pub(crate) benefit_score: f64,
    pub(crate) expiration_time: DateTime<Utc>,
    pub(crate) sequence: u64,
    pub(crate) dedup_key: DedupKey,
}

impl EvictionCandidate {
    pub(crate) fn for_record(record: &ResponseRecord) -> Self {
        Self {
            benefit_score: record.benefit_score(),
            expiration_time: record.expiration_time(),
            sequence: record.sequence(),
            dedup_key: record.dedup_key().clone(),
        }
    }
}

impl PartialEq for EvictionCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for EvictionCandidate {}

impl PartialOrd for EvictionCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EvictionCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        // Sequence numbers are unique, so equal sequence means same record
        self.benefit_score
            .total_cmp(&other.benefit_score)
            .then_with(|| self.expiration_time.cmp(&other.expiration_time))
            .then_with(|| self.sequence.cmp(&other.sequence))
    }
}

/// Ranked set of eviction candidates
///
/// The lock is never held while a dedup index shard is locked by the same
/// thread in the opposite order: callers pop first, then touch the index.
#[derive(Debug, Default)]
pub(crate) struct EvictionQueue {
    candidates: Mutex<BTreeSet<EvictionCandidate>>,
}

impl EvictionQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queue a record if it is evictable
    pub(crate) fn insert(&self, record: &ResponseRecord) {
        if record.is_evictable() {
            self.candidates
                .lock()
                .insert(EvictionCandidate::for_record(record));
        }
    }

    /// Drop a record from the queue; no-op if it is not queued
    pub(crate) fn remove(&self, record: &ResponseRecord) {
        if record.is_evictable() {
            self.candidates
                .lock()
                .remove(&EvictionCandidate::for_record(record));
        }
    }

    /// Take the least valuable candidate
    pub(crate) fn pop_least_valuable(&self) -> Option<EvictionCandidate> {
        self.candidates.lock().pop_first()
    }

    pub(crate) fn len(&self) -> usize {
        self.candidates.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use domain::{CorrelationId, InvokerId, NewResponseRecord, ResponsePayload, Topic};

    use super::*;

    fn record(corr: &str, score: f64, ttl_secs: i64, idempotent: bool, seq: u64) -> ResponseRecord {
        let now = DateTime::<Utc>::UNIX_EPOCH;
        ResponseRecord::new(
            NewResponseRecord {
                dedup_key: DedupKey::new(
                    Topic::new("t").unwrap(),
                    CorrelationId::new(corr.as_bytes().to_vec()).unwrap(),
                ),
                reuse_key: None,
                invoker_id: InvokerId::new("client").unwrap(),
                payload: ResponsePayload::new("R", "text/plain"),
                is_idempotent: idempotent,
                stored_at: now,
                expiration_time: now + chrono::Duration::seconds(ttl_secs),
                execution_duration: Duration::ZERO,
                benefit_score: score,
            },
            seq,
        )
    }

    #[test]
    fn pops_lowest_score_first() {
        let queue = EvictionQueue::new();
        queue.insert(&record("a", 0.5, 60, true, 1));
        queue.insert(&record("b", 0.4, 60, true, 2));
        queue.insert(&record("c", 0.3, 60, true, 3));

        let first = queue.pop_least_valuable().unwrap();
        assert_eq!(first.sequence, 3);
        assert_eq!(queue.pop_least_valuable().unwrap().sequence, 2);
    }

    #[test]
    fn ties_break_by_nearest_expiration() {
        let queue = EvictionQueue::new();
        queue.insert(&record("late", 0.5, 120, true, 1));
        queue.insert(&record("soon", 0.5, 10, true, 2));

        assert_eq!(queue.pop_least_valuable().unwrap().sequence, 2);
    }

    #[test]
    fn non_idempotent_records_are_never_queued() {
        let queue = EvictionQueue::new();
        queue.insert(&record("a", 0.1, 60, false, 1));
        assert_eq!(queue.len(), 0);
        assert!(queue.pop_least_valuable().is_none());
    }

    #[test]
    fn error_responses_are_never_queued() {
        let queue = EvictionQueue::new();
        let template = record("a", 0.1, 60, true, 1);
        let failed = ResponseRecord::new(
            NewResponseRecord {
                dedup_key: template.dedup_key().clone(),
                reuse_key: None,
                invoker_id: template.invoker_id().clone(),
                payload: ResponsePayload::error("E", "text/plain"),
                is_idempotent: true,
                stored_at: template.stored_at(),
                expiration_time: template.expiration_time(),
                execution_duration: Duration::ZERO,
                benefit_score: 0.1,
            },
            2,
        );
        queue.insert(&failed);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn remove_drops_exact_record() {
        let queue = EvictionQueue::new();
        let keep = record("keep", 0.2, 60, true, 1);
        let drop_me = record("drop", 0.1, 60, true, 2);
        queue.insert(&keep);
        queue.insert(&drop_me);

        queue.remove(&drop_me);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop_least_valuable().unwrap().sequence, 1);
    }

    #[test]
    fn nan_scores_do_not_poison_ordering() {
        let queue = EvictionQueue::new();
        queue.insert(&record("nan", f64::NAN, 60, true, 1));
        queue.insert(&record("low", -1.0, 60, true, 2));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop_least_valuable().unwrap().sequence, 2);
    }
}
