//! Pending claims - request coalescing for in-flight responses
//!
//! The first caller to miss on a dedup key creates a claim and computes the
//! response; later callers subscribe to the claim and wait. The claim is
//! settled exactly once: resolved by the matching store, or abandoned.

use std::sync::Arc;

use application::ports::{ClaimOutcome, PendingResponse};
use chrono::{DateTime, Utc};
use domain::ResponseRecord;
use tokio::sync::watch;

/// A response being computed for a dedup key with no stored record yet
#[derive(Debug)]
pub(crate) struct PendingClaim {
    sender: watch::Sender<ClaimOutcome>,
    claimed_at: DateTime<Utc>,
}

impl PendingClaim {
    pub(crate) fn new(claimed_at: DateTime<Utc>) -> Self {
        let (sender, _) = watch::channel(ClaimOutcome::InFlight);
        Self { sender, claimed_at }
    }

    /// Register a new waiter
    pub(crate) fn subscribe(&self) -> PendingResponse {
        PendingResponse::new(self.sender.subscribe())
    }

    pub(crate) const fn claimed_at(&self) -> DateTime<Utc> {
        self.claimed_at
    }

    pub(crate) fn waiter_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Hand the stored record to every waiter
    pub(crate) fn resolve(self, record: Arc<ResponseRecord>) {
        // No receivers is fine: nobody was waiting
        self.sender.send_replace(ClaimOutcome::Resolved(record));
    }

    /// Release every waiter with no response
    pub(crate) fn abandon(self) {
        self.sender.send_replace(ClaimOutcome::Abandoned);
    }
}
