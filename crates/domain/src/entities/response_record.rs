//! Response record - the unit of caching

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::ResponsePayload;
use crate::value_objects::{DedupKey, InvokerId, ReuseKey};

/// Data needed to create a [`ResponseRecord`]
#[derive(Debug, Clone)]
pub struct NewResponseRecord {
    /// Deduplication key the response answers
    pub dedup_key: DedupKey,
    /// Reuse key, present only for reuse-eligible responses
    pub reuse_key: Option<ReuseKey>,
    /// Invoker whose request produced the response
    pub invoker_id: InvokerId,
    /// The response itself
    pub payload: ResponsePayload,
    /// Whether the command is idempotent
    pub is_idempotent: bool,
    /// When the response was stored
    pub stored_at: DateTime<Utc>,
    /// When the response stops being valid
    pub expiration_time: DateTime<Utc>,
    /// How long the handler took to produce the response
    pub execution_duration: Duration,
    /// Benefit score computed at store time
    pub benefit_score: f64,
}

/// A cached response with its bookkeeping
///
/// Immutable once created; shared between indices behind an `Arc`.
#[derive(Debug, Clone)]
pub struct ResponseRecord {
    dedup_key: DedupKey,
    reuse_key: Option<ReuseKey>,
    invoker_id: InvokerId,
    payload: ResponsePayload,
    is_idempotent: bool,
    stored_at: DateTime<Utc>,
    expiration_time: DateTime<Utc>,
    execution_duration: Duration,
    benefit_score: f64,
    size_bytes: usize,
    sequence: u64,
}

impl ResponseRecord {
    /// Create a record; `sequence` must be unique per cache instance
    #[must_use]
    pub fn new(new: NewResponseRecord, sequence: u64) -> Self {
        let size_bytes = new.payload.size_bytes();
        Self {
            dedup_key: new.dedup_key,
            reuse_key: new.reuse_key,
            invoker_id: new.invoker_id,
            payload: new.payload,
            is_idempotent: new.is_idempotent,
            stored_at: new.stored_at,
            expiration_time: new.expiration_time,
            execution_duration: new.execution_duration,
            benefit_score: new.benefit_score,
            size_bytes,
            sequence,
        }
    }

    /// Deduplication key
    #[must_use]
    pub const fn dedup_key(&self) -> &DedupKey {
        &self.dedup_key
    }

    /// Reuse key, if the record is reuse-eligible
    #[must_use]
    pub const fn reuse_key(&self) -> Option<&ReuseKey> {
        self.reuse_key.as_ref()
    }

    /// Invoker whose request produced the record
    #[must_use]
    pub const fn invoker_id(&self) -> &InvokerId {
        &self.invoker_id
    }

    /// The cached response
    #[must_use]
    pub const fn payload(&self) -> &ResponsePayload {
        &self.payload
    }

    /// Whether the record came from an idempotent command
    #[must_use]
    pub const fn is_idempotent(&self) -> bool {
        self.is_idempotent
    }

    /// Whether the eviction planner may remove the record
    ///
    /// Error responses are only kept for deduplication.
    #[must_use]
    pub const fn is_evictable(&self) -> bool {
        self.is_idempotent && !self.payload.is_error_response
    }

    /// When the record was stored
    #[must_use]
    pub const fn stored_at(&self) -> DateTime<Utc> {
        self.stored_at
    }

    /// When the record expires
    #[must_use]
    pub const fn expiration_time(&self) -> DateTime<Utc> {
        self.expiration_time
    }

    /// Handler execution time that produced the response
    #[must_use]
    pub const fn execution_duration(&self) -> Duration {
        self.execution_duration
    }

    /// Benefit score computed at store time
    #[must_use]
    pub const fn benefit_score(&self) -> f64 {
        self.benefit_score
    }

    /// Payload size in bytes
    #[must_use]
    pub const fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// Insertion sequence number
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Whether the record is still visible at `now`
    #[must_use]
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expiration_time
    }
}
