//! Error types shared by the core components.

use thiserror::Error;

/// Errors returned by timeline commands, the catalog and the reaction relay.
///
/// A command that fails with any of these leaves the playback state exactly
/// as it was before the call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RadioError {
    /// Malformed request: unknown emote, empty user id, empty playlist,
    /// or a playback command while nothing is playing.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Unknown song or playlist id.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The catalog failed for a reason other than a missing id.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The timeline task has stopped.
    #[error("Radio is shut down")]
    Closed,
}

impl RadioError {
    /// Wire error code sent in `error` frames.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            RadioError::InvalidInput(_) => 1001,
            RadioError::NotFound(_) => 1004,
            RadioError::Storage(_) => 1500,
            RadioError::Closed => 1503,
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        RadioError::InvalidInput(message.into())
    }
}

/// Failure reported by an event handler.
///
/// The bus logs these and moves on; they never reach the publisher.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler could not deliver the event downstream.
    #[error("Delivery failed: {0}")]
    Delivery(String),

    /// Any other handler failure.
    #[error("{0}")]
    Other(String),
}
