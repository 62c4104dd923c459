//! Error classification shared across crates.
//!
//! Each crate defines its own `thiserror` enum (`TreeError`, `DispatchError`,
//! `SettingsError`, ...). They all implement [`Categorize`] so callers can
//! decide how to log and whether to retry without matching on every variant.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Broad error category for logging and retry decisions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The caller asked for something invalid (unknown id, duplicate id).
    Caller,
    /// Illegal state transition on a node.
    State,
    /// Downstream asked us to slow down; retried automatically.
    Throttle,
    /// A dispatched call failed permanently.
    Dispatch,
    /// A caller-supplied processor failed.
    Processor,
    /// Reading or writing persisted state failed.
    Persistence,
    /// Configuration could not be loaded.
    Config,
    /// Shutdown in progress.
    Shutdown,
    /// Anything else.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Caller => "caller",
            Self::State => "state",
            Self::Throttle => "throttle",
            Self::Dispatch => "dispatch",
            Self::Processor => "processor",
            Self::Persistence => "persistence",
            Self::Config => "config",
            Self::Shutdown => "shutdown",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Implemented by every crate-level error enum.
pub trait Categorize {
    /// Category of this error.
    fn category(&self) -> ErrorCategory;

    /// Whether retrying the same operation later can succeed.
    fn is_retryable(&self) -> bool {
        matches!(self.category(), ErrorCategory::Throttle)
    }
}
