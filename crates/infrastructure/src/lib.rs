//! Infrastructure layer - Adapters for the response cache ports
//!
//! Implements the ports defined in the application layer: the in-memory
//! command response cache, clocks, configuration loading, and logging.

pub mod adapters;
pub mod cache;
pub mod config;
pub mod telemetry;

pub use adapters::*;
pub use cache::{CommandResponseCache, CostWeightedBenefitScorer, SweepSummary};
pub use config::{AppConfig, ResponseCacheConfig};
pub use telemetry::{TelemetryConfig, TelemetryError, init_telemetry};
