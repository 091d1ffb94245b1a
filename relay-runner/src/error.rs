//! Error types for relay-runner.

use thiserror::Error;

/// Runner daemon error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Coordinator API error.
    #[error("Coordinator error: {0}")]
    Api(#[from] relay_api::Error),

    /// Container runtime error.
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Unknown or unsupported container runtime kind.
    #[error("Unknown runtime kind: {0}")]
    UnknownRuntime(String),

    /// GitHub API error.
    #[error("GitHub error: {0}")]
    Github(String),

    /// Invalid container image reference.
    #[error("Invalid image reference: {0}")]
    ImageRef(String),

    /// Invalid job id.
    #[error("Invalid job id: {0}")]
    JobId(String),

    /// The operation's cancellation scope ended.
    #[error("Operation cancelled")]
    Cancelled,

    /// Shutdown did not complete within the caller's deadline.
    #[error("Shutdown deadline exceeded")]
    ShutdownTimeout,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for relay-runner.
pub type Result<T, E = Error> = std::result::Result<T, E>;
