//! Error types for relay-api.

use thiserror::Error;

use crate::types::RunnerQueue;

/// Relay API error type.
#[derive(Debug, Error)]
pub enum Error {
    /// HTTP transport error.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Invalid URL.
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// The requested resource does not exist on the coordinator.
    #[error("not found")]
    NotFound,

    /// Optimistic-concurrency conflict. The coordinator's current record
    /// is attached when the 409 body could be parsed.
    #[error("version conflict")]
    Conflict { current: Option<RunnerQueue> },

    /// Any other non-success response from the coordinator.
    #[error("API error: status {status}: {message}")]
    Api { status: u16, message: String },

    /// Envelope crypto failure.
    #[error(transparent)]
    Envelope(#[from] crate::ecies::EnvelopeError),

    /// Malformed or non-runner API token.
    #[error("invalid runner token: {0}")]
    Token(String),

    /// Response body could not be decoded.
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error identifies a queue the coordinator has forgotten.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }
}
