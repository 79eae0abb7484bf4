//! Error types for diffusion operations.

use thiserror::Error;

/// Errors raised by the diffusion core and the model crates built on it.
#[derive(Debug, Error)]
pub enum DiffRecError {
    /// Invalid configuration value or unrecognized selector name.
    #[error("Invalid configuration: {message}")]
    Config { message: String },

    /// Tensor shapes disagree where an exact match is required.
    ///
    /// Raised before any broadcast op so a mismatch can never silently
    /// broadcast into a wrong result.
    #[error("Shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    /// Checkpoint artifact missing, unreadable, or dimensionally incompatible.
    #[error("Checkpoint error: {message}")]
    Checkpoint { message: String },

    /// Underlying tensor operation failed.
    #[error("Tensor operation failed: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization of a schedule/config artifact failed.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Result type for diffusion operations.
pub type DiffRecResult<T> = Result<T, DiffRecError>;

impl DiffRecError {
    /// Build a `Config` error from anything displayable.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    /// Build a `Checkpoint` error from anything displayable.
    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::Checkpoint { message: message.into() }
    }
}
