//! Domain layer for the edge RPC response cache
//!
//! Contains the identifiers, records and lifecycle states shared by every
//! layer. This layer has no runtime dependencies and defines the ubiquitous
//! language: dedup keys, reuse keys, response records.

pub mod entities;
pub mod errors;
pub mod value_objects;

pub use entities::*;
pub use errors::DomainError;
pub use value_objects::*;
