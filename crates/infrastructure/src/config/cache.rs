//! Response cache limits and background expiry settings.

use std::time::Duration;

use application::error::ApplicationError;
use serde::{Deserialize, Serialize};

/// Response cache configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseCacheConfig {
    /// Maximum number of stored records before reuse-eligible ones are evicted
    #[serde(default = "default_max_entry_count")]
    pub max_entry_count: u64,

    /// Maximum sum of stored payload sizes in bytes
    #[serde(default = "default_max_aggregate_payload_bytes")]
    pub max_aggregate_payload_bytes: u64,

    /// How often the expiry reaper sweeps, in milliseconds (default: 1s)
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Age after which an unresolved claim is discarded, in seconds (default: 60s)
    #[serde(default = "default_pending_claim_timeout_secs")]
    pub pending_claim_timeout_secs: u64,
}

const fn default_max_entry_count() -> u64 {
    10_000
}

const fn default_max_aggregate_payload_bytes() -> u64 {
    10_000_000
}

const fn default_sweep_interval_ms() -> u64 {
    1000
}

const fn default_pending_claim_timeout_secs() -> u64 {
    60
}

impl Default for ResponseCacheConfig {
    fn default() -> Self {
        Self {
            max_entry_count: default_max_entry_count(),
            max_aggregate_payload_bytes: default_max_aggregate_payload_bytes(),
            sweep_interval_ms: default_sweep_interval_ms(),
            pending_claim_timeout_secs: default_pending_claim_timeout_secs(),
        }
    }
}

impl ResponseCacheConfig {
    /// Get the sweep interval as a Duration
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Get the pending claim timeout as a Duration
    #[must_use]
    pub const fn pending_claim_timeout(&self) -> Duration {
        Duration::from_secs(self.pending_claim_timeout_secs)
    }

    /// Reject limits and intervals that would make the cache unusable
    pub fn validate(&self) -> Result<(), ApplicationError> {
        let zero_field = [
            ("max_entry_count", self.max_entry_count),
            ("max_aggregate_payload_bytes", self.max_aggregate_payload_bytes),
            ("sweep_interval_ms", self.sweep_interval_ms),
            ("pending_claim_timeout_secs", self.pending_claim_timeout_secs),
        ]
        .into_iter()
        .find(|(_, value)| *value == 0);

        match zero_field {
            Some((name, _)) => Err(ApplicationError::Configuration(format!(
                "cache.{name} must be greater than zero"
            ))),
            None => Ok(()),
        }
    }
}
