//! Error types for the lock-step core.

use thiserror::Error;

/// Result type alias using [`CoreError`].
pub type Result<T> = std::result::Result<T, CoreError>;

/// Top-level error type for the deterministic core.
///
/// Stale entity references are deliberately absent: a command that points
/// at a destroyed building or unit is a no-op, reported through
/// [`DispatchOutcome`](crate::dispatcher::DispatchOutcome) instead.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Failed to load a configuration file.
    #[error("Failed to load configuration '{path}': {message}")]
    ConfigLoad {
        /// Path of the file that failed to load.
        path: String,
        /// Error message.
        message: String,
    },

    /// Save or load failed.
    #[error("Persistence failure: {0}")]
    Persistence(String),

    /// Invalid simulation state or misuse of the API.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A periodic task reported a failure.
    #[error("Periodic task '{name}' failed: {message}")]
    Task {
        /// Name of the failing task.
        name: String,
        /// Error message.
        message: String,
    },

    /// Desync detected between peers or against a replay.
    #[error("Desync detected at tick {tick}: local hash {local_hash}, remote hash {remote_hash}")]
    DesyncDetected {
        /// Tick where desync occurred.
        tick: u64,
        /// Local simulation hash.
        local_hash: u64,
        /// Remote simulation hash.
        remote_hash: u64,
    },
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl From<bincode::Error> for CoreError {
    fn from(err: bincode::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}
