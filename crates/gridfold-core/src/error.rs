//! Error types shared across the GridFold crates.

use thiserror::Error;

/// Errors produced by the reduction core and its execution engines.
#[derive(Error, Debug)]
pub enum GridFoldError {
    /// Memory pool allocation failed.
    #[error("allocation of {size} bytes failed: {reason}")]
    AllocationFailed {
        /// Requested size in bytes.
        size: usize,
        /// Description of the failure.
        reason: String,
    },

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Kernel launch could not be submitted.
    #[error("launch failed: {0}")]
    LaunchFailed(String),

    /// Backend-level failure (dead stream worker, engine shut down).
    #[error("backend error: {0}")]
    BackendError(String),

    /// Index out of range.
    #[error("invalid index: {0}")]
    InvalidIndex(usize),
}

/// Result alias used throughout GridFold.
pub type Result<T> = std::result::Result<T, GridFoldError>;
