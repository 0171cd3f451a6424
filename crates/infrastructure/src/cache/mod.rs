//! Command response cache
//!
//! - `CommandResponseCache`: dedup and reuse indices with request coalescing
//! - `CostWeightedBenefitScorer`: default eviction ranking

mod command_response_cache;
mod eviction;
mod pending;
mod reaper;
mod reuse_index;
mod scoring;

pub use command_response_cache::{CommandResponseCache, SweepSummary};
pub use scoring::CostWeightedBenefitScorer;
