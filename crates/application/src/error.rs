//! Application-level errors

use domain::{CacheState, DomainError};
use thiserror::Error;

/// Errors that can occur in the application layer
#[derive(Debug, Error)]
pub enum ApplicationError {
    /// Domain-level error
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Operation requires a running cache
    ///
    /// Raised locally, never by the remote peer. Recoverable by starting the cache.
    #[error("Cannot {operation} while cache is {state}")]
    StateInvalid {
        /// Operation that was attempted
        operation: &'static str,
        /// Lifecycle state at the time of the call
        state: CacheState,
    },

    /// Cache index state violated an invariant
    #[error("Internal logic error: {0}")]
    InternalLogic(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The command handler failed
    #[error("Command handler failed: {0}")]
    HandlerFailed(String),
}

impl ApplicationError {
    /// Create a state-invalid error
    #[must_use]
    pub const fn state_invalid(operation: &'static str, state: CacheState) -> Self {
        Self::StateInvalid { operation, state }
    }

    /// Check if this error is retryable
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::StateInvalid { .. })
    }

    /// Check if the error originated at the remote peer
    ///
    /// Cache and handler errors are always raised locally.
    pub const fn is_remote(&self) -> bool {
        false
    }

    /// Check if the error was raised by user command code
    pub const fn is_application_error(&self) -> bool {
        matches!(self, Self::HandlerFailed(_))
    }
}
