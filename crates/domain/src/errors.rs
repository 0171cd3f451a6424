//! Domain-level errors

use thiserror::Error;

/// Errors that can occur in the domain layer
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Topic is empty or contains wildcard characters
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    /// Correlation data is empty
    #[error("Invalid correlation id: {0}")]
    InvalidCorrelationId(String),

    /// Command name is empty
    #[error("Invalid command name: {0}")]
    InvalidCommandName(String),

    /// Invoker identifier is empty
    #[error("Invalid invoker id: {0}")]
    InvalidInvokerId(String),

    /// Validation failed
    #[error("Validation failed: {0}")]
    ValidationError(String),
}
