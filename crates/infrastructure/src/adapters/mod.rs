//! Infrastructure adapters
//!
//! Adapters connect application ports to concrete implementations.

mod clock;

pub use clock::{ManualClock, SystemClock};
