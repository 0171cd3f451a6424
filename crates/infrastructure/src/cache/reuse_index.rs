//! Reuse index - secondary lookup of idempotent responses by request content

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use domain::{ResponseRecord, ReuseBucket, ReuseKey};

/// Maps `(command, payload digest)` to the records stored for it
///
/// Holds at most one record per producing invoker in each bucket. Every
/// record here is also in the dedup index; the cache removes it from this
/// index whenever it leaves the dedup index.
#[derive(Debug, Default)]
pub(crate) struct ReuseIndex {
    buckets: DashMap<ReuseBucket, Vec<Arc<ResponseRecord>>>,
}

impl ReuseIndex {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Index a record under its reuse key
    ///
    /// Returns the record it displaced for the same invoker, if any.
    pub(crate) fn insert(&self, record: &Arc<ResponseRecord>) -> Option<Arc<ResponseRecord>> {
        let key = record.reuse_key()?;
        let mut bucket = self.buckets.entry(key.bucket()).or_default();
        let position = bucket
            .iter()
            .position(|existing| existing.invoker_id() == record.invoker_id());
        let displaced = position.map(|index| bucket.remove(index));
        bucket.push(Arc::clone(record));
        displaced
    }

    /// Newest live record matching `key` and its invoker scope
    pub(crate) fn lookup(&self, key: &ReuseKey, now: DateTime<Utc>) -> Option<Arc<ResponseRecord>> {
        let bucket = self.buckets.get(&key.bucket())?;
        bucket
            .iter()
            .rev()
            .find(|record| record.is_live_at(now) && key.admits(record.invoker_id()))
            .cloned()
    }

    /// Remove exactly this record; returns whether it was indexed
    pub(crate) fn remove(&self, record: &ResponseRecord) -> bool {
        let Some(key) = record.reuse_key() else {
            return false;
        };
        let bucket_key = key.bucket();
        let (removed, now_empty) = {
            let Some(mut bucket) = self.buckets.get_mut(&bucket_key) else {
                return false;
            };
            let before = bucket.len();
            bucket.retain(|existing| existing.sequence() != record.sequence());
            (bucket.len() != before, bucket.is_empty())
        };
        if now_empty {
            self.buckets.remove_if(&bucket_key, |_, bucket| bucket.is_empty());
        }
        removed
    }

    /// Total number of indexed records
    pub(crate) fn len(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.len()).sum()
    }
}
