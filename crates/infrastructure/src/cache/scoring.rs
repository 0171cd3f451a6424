//! Default benefit scorer
//!
//! Favors responses that were expensive to compute and cheap to keep, scaled
//! by how much of their useful life remains.

use std::time::Duration;

use application::ports::{BenefitInput, BenefitScorer};

/// Processing cost charged to every response, so zero-duration handlers still rank
const FIXED_PROCESSING_OVERHEAD_MS: f64 = 10.0;

/// Storage cost charged to every record on top of its payload
const FIXED_STORAGE_OVERHEAD_BYTES: f64 = 100.0;

/// Remaining lifetime at which the window factor reaches one half
const VALUE_WINDOW_HALF_LIFE: Duration = Duration::from_secs(60);

/// Cost-per-byte scorer with a saturating remaining-lifetime weight
///
/// `score = (10 + exec_ms) / (100 + size_bytes) * w / (w + 60s)`
#[derive(Debug, Clone, Copy, Default)]
pub struct CostWeightedBenefitScorer;

impl CostWeightedBenefitScorer {
    /// Create the default scorer
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn window_factor(remaining_lifetime: Duration) -> f64 {
        let window = remaining_lifetime.as_secs_f64();
        window / (window + VALUE_WINDOW_HALF_LIFE.as_secs_f64())
    }
}

impl BenefitScorer for CostWeightedBenefitScorer {
    #[allow(clippy::cast_precision_loss)]
    fn score(&self, input: &BenefitInput<'_>) -> f64 {
        let processing_ms =
            FIXED_PROCESSING_OVERHEAD_MS + input.execution_duration.as_secs_f64() * 1000.0;
        // Payload sizes are far below 2^52
        let storage_bytes = FIXED_STORAGE_OVERHEAD_BYTES + input.response.size_bytes() as f64;
        processing_ms / storage_bytes * Self::window_factor(input.remaining_lifetime)
    }
}
