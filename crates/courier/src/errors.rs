//! Application-level errors.

use courier_core::{Categorize, ErrorCategory};
use courier_dispatch::DispatchError;
use courier_settings::SettingsError;
use courier_tree::TreeError;
use thiserror::Error;

/// Failures reading or writing the tree snapshot file.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem failure.
    #[error("snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),
    /// The file is not a valid snapshot document.
    #[error("snapshot JSON invalid: {0}")]
    Json(#[from] serde_json::Error),
}

impl Categorize for StoreError {
    fn category(&self) -> ErrorCategory {
        ErrorCategory::Persistence
    }
}

/// Any error the host can hit.
#[derive(Debug, Error)]
pub enum AppError {
    /// Configuration.
    #[error(transparent)]
    Settings(#[from] SettingsError),
    /// Tree structure or state.
    #[error(transparent)]
    Tree(#[from] TreeError),
    /// Outgoing call.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    /// Snapshot persistence.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Categorize for AppError {
    fn category(&self) -> ErrorCategory {
        match self {
            Self::Settings(e) => e.category(),
            Self::Tree(e) => e.category(),
            Self::Dispatch(e) => e.category(),
            Self::Store(e) => e.category(),
        }
    }
}

/// Result type for host operations.
pub type Result<T> = std::result::Result<T, AppError>;
