//! Expiry reaper task
//!
//! Periodically drops expired records and stale pending claims, then trims
//! the cache back under its capacity limits.

use std::{sync::Weak, time::Duration};

use tokio::{
    runtime::Handle,
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, info};

use super::command_response_cache::CacheInner;

/// Spawn the reaper on `runtime`
///
/// The task holds the cache weakly and exits once it is dropped. Abort the
/// returned handle to stop it earlier.
pub(crate) fn spawn_expiry_reaper(
    runtime: &Handle,
    cache: Weak<CacheInner>,
    sweep_interval: Duration,
) -> JoinHandle<()> {
    info!(
        interval_ms = u64::try_from(sweep_interval.as_millis()).unwrap_or(u64::MAX),
        "Starting expiry reaper"
    );

    runtime.spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Don't sweep immediately on startup
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let Some(cache) = cache.upgrade() else {
                debug!("Response cache dropped, expiry reaper exiting");
                break;
            };

            let summary = cache.sweep();
            if summary.is_empty() {
                debug!("Expiry sweep found nothing to remove");
            } else {
                info!(
                    expired = summary.expired,
                    stale_claims = summary.stale_claims,
                    evicted = summary.evicted,
                    "Expiry sweep removed records"
                );
            }
        }
    })
}
