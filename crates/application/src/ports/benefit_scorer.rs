//! Benefit scoring strategy port
//!
//! Ranks cached responses by how much they are worth keeping. The eviction
//! planner removes the lowest-scored reuse-eligible record first.

use std::time::Duration;

use domain::ResponsePayload;

/// Everything a scorer may weigh, captured at store time
#[derive(Debug, Clone, Copy)]
pub struct BenefitInput<'a> {
    /// Serialized request payload
    pub request_payload: &'a [u8],
    /// Response being stored
    pub response: &'a ResponsePayload,
    /// Handler execution time that a cache hit avoids
    pub execution_duration: Duration,
    /// Time until the response expires
    pub remaining_lifetime: Duration,
}

/// Strategy computing a benefit score; higher is more valuable
///
/// Implementations must be pure: the score is computed once per record and
/// never recomputed. Any `Fn(&BenefitInput) -> f64` closure is a scorer.
pub trait BenefitScorer: Send + Sync {
    /// Score a response about to be stored
    fn score(&self, input: &BenefitInput<'_>) -> f64;
}

impl<F> BenefitScorer for F
where
    F: Fn(&BenefitInput<'_>) -> f64 + Send + Sync,
{
    fn score(&self, input: &BenefitInput<'_>) -> f64 {
        self(input)
    }
}
