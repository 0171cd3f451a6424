//! Value Objects - Immutable, identity-less domain primitives

mod cache_state;
mod dedup_key;
mod reuse_key;

pub use cache_state::CacheState;
pub use dedup_key::{CorrelationId, DedupKey, Topic};
pub use reuse_key::{
    CommandName, EPHEMERAL_USER_PROPERTIES, InvokerId, PayloadDigest, ReuseBucket, ReuseKey,
};
