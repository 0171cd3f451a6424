//! Port definitions for application layer
//!
//! Ports are interfaces that define how the application interacts with
//! the cache and its strategies. Adapters in the infrastructure layer
//! implement these ports.

mod benefit_scorer;
mod clock;
mod response_cache_port;

pub use benefit_scorer::{BenefitInput, BenefitScorer};
pub use clock::Clock;
#[cfg(test)]
pub use response_cache_port::MockResponseCachePort;
pub use response_cache_port::{
    CacheHit, CacheStats, ClaimOutcome, HitSource, PendingResponse, ResponseCachePort, Retrieval,
    RetrievalPolicy, StorePolicy,
};
