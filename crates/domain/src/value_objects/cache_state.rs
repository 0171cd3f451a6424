//! Lifecycle state of a response cache

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a response cache
///
/// `NotStarted -> Running -> Stopped`. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CacheState {
    /// Constructed but not yet started
    #[default]
    NotStarted,
    /// Accepting stores and serving lookups
    Running,
    /// Shut down; lookups miss and stores are rejected
    Stopped,
}

impl CacheState {
    /// Check whether mutating operations are allowed
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Running)
    }

    /// Check whether `self -> next` is a legal transition
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::NotStarted, Self::Running) | (Self::Running, Self::Stopped)
        )
    }

    /// Get a human-readable label
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }

    /// Compact encoding for atomic storage
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::NotStarted => 0,
            Self::Running => 1,
            Self::Stopped => 2,
        }
    }

    /// Decode from [`CacheState::as_u8`]; unknown values map to `Stopped`
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::NotStarted,
            1 => Self::Running,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
