//! Error types for agent-runner

use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Errors that can occur while driving an agent backend
#[derive(Debug, Error)]
pub enum AgentError {
    /// Failed to spawn agent process
    #[error("Failed to spawn agent process: {message}")]
    SpawnFailed {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Unknown backend name
    #[error("Invalid agent backend: {backend}")]
    InvalidBackend { backend: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON from a backend
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Channel closed
    #[error("Message channel closed")]
    ChannelClosed,
}

impl AgentError {
    /// Create a SpawnFailed error
    pub fn spawn_failed(message: impl Into<String>) -> Self {
        Self::SpawnFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a SpawnFailed error with source
    pub fn spawn_failed_with_source(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::SpawnFailed {
            message: message.into(),
            source: Some(source),
        }
    }
}
