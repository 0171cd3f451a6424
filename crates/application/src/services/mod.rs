//! Application services - Use cases built on the ports

mod cached_execution_service;

pub use cached_execution_service::{
    CachedExecutionService, CommandCachePolicy, ExecutionOutcome, ResponseSource,
};
