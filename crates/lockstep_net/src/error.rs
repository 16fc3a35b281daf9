//! Error types for the network layer.

use lockstep_core::error::CoreError;
use thiserror::Error;

/// Result type alias using [`NetError`].
pub type Result<T> = std::result::Result<T, NetError>;

/// Errors raised by channels and sessions.
///
/// `Transport` and `Protocol` are fatal to the connection they occur on;
/// nothing in this crate retries.
#[derive(Debug, Error)]
pub enum NetError {
    /// The connection broke.
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The peer sent a malformed frame, an unknown key or an unexpected message.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// `start()` was called on a channel that is already running.
    #[error("Channel already started")]
    AlreadyStarted,

    /// The channel or session is closed.
    #[error("Channel closed")]
    Closed,

    /// The simulation rejected something.
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl From<bincode::Error> for NetError {
    fn from(err: bincode::Error) -> Self {
        Self::Protocol(format!("bad payload: {err}"))
    }
}
