//! Error types for the runner

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for runner operations
pub type Result<T> = std::result::Result<T, RunnerError>;

#[derive(Debug, Error)]
pub enum RunnerError {
    /// Duplex session failure
    #[error("Connection error: {0}")]
    Connection(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Handshake timed out after {seconds} seconds")]
    HandshakeTimeout { seconds: u64 },

    #[error("Gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Command payload did not match the command type
    #[error("Invalid payload for {command}: {message}")]
    InvalidPayload { command: String, message: String },

    #[error("Unsupported command type: {0}")]
    UnsupportedCommand(String),

    #[error("No dev server running for project {project_id}")]
    ProcessNotFound { project_id: String },

    #[error("Dev server already running for project {project_id}")]
    ProcessAlreadyRunning { project_id: String },

    #[error("Failed to spawn dev server: {0}")]
    SpawnFailed(String),

    /// Resolved path is outside the project root
    #[error("Path escapes project root: {path}")]
    PathEscapesRoot { path: PathBuf },

    #[error("Invalid project directory: {0}")]
    InvalidProject(String),

    #[error("File not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("File too large: {path} ({size} bytes)")]
    FileTooLarge { path: PathBuf, size: u64 },

    #[error("Port {port} has not been verified for project {project_id}")]
    PortNotVerified { project_id: String, port: u16 },

    #[error("Port {port} did not become reachable after {attempts} attempts")]
    PortUnreachable { port: u16, attempts: u32 },

    #[error("Tunnel error: {0}")]
    Tunnel(String),

    #[error("Control plane error: {0}")]
    ControlPlane(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Agent error: {0}")]
    Agent(#[from] agent_runner::AgentError),
}

impl RunnerError {
    pub fn invalid_payload(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidPayload {
            command: command.into(),
            message: message.into(),
        }
    }
}
