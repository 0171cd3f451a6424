//! Application layer - Use cases and orchestration
//!
//! Defines the response cache port consumed by command executors, the
//! strategy ports it is parameterised with, and the cached execution use case.

pub mod error;
pub mod ports;
pub mod services;

pub use error::ApplicationError;
pub use ports::*;
pub use services::*;
