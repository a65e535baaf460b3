//! Error types for the BusGrid transport abstraction.

use thiserror::Error;

/// Errors a transport can raise synchronously when a request is issued.
///
/// Asynchronous outcomes (connect refused, subscription rejected) are not
/// errors here; they arrive as [`crate::SessionEvent`]s.
#[derive(Debug, Error)]
pub enum EnvError {
    /// The provider refused the request outright
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Request needs an established connection
    #[error("Not connected")]
    NotConnected,

    /// The connection handle was already released
    #[error("Transport handle disposed")]
    Disposed,

    /// Topic or topic filter is not a valid destination
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    /// Publisher could not hand the message to the provider
    #[error("Publish rejected: {0}")]
    PublishRejected(String),

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates a transport error.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::TransportError(msg.into())
    }

    /// Creates an invalid-topic error.
    pub fn invalid_topic(topic: impl std::fmt::Display) -> Self {
        Self::InvalidTopic(topic.to_string())
    }
}
