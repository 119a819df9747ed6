//! Host-level errors.

use and_core::{AndError, TransportError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Join failed ({code}): {message}")]
    JoinFailed { code: i32, message: String },

    #[error("Fatal engine fault: {0}")]
    Fatal(String),

    #[error("Host is already serving")]
    AlreadyServing,

    #[error("Host shut down")]
    Shutdown,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl From<AndError> for HostError {
    fn from(e: AndError) -> Self {
        match e {
            AndError::Invalid(reason) => HostError::InvalidArgument(reason),
            AndError::Corrupted(reason) => HostError::Fatal(reason),
        }
    }
}

/// Errors from operations on a world's peers.
#[derive(Debug, Error)]
pub enum WorldError {
    #[error("Request was already accepted or declined")]
    AlreadyResolved,

    #[error(transparent)]
    Engine(#[from] AndError),
}
