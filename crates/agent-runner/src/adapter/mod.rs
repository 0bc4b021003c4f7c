//! Agent backends behind one `(prompt, cwd, system prompt) -> stream` contract

use std::path::PathBuf;
use std::pin::Pin;

use futures::Stream;

use crate::message::CanonicalMessage;
use crate::process::AgentKind;

pub mod multi_turn;
pub mod streaming;

pub use multi_turn::{CodexCliDriver, MultiTurnAdapter, MultiTurnSession, StopReason, TurnDriver, TurnSummary};
pub use streaming::StreamingAdapter;

/// Stream of canonical messages produced by a backend
pub type CanonicalStream = Pin<Box<dyn Stream<Item = CanonicalMessage> + Send>>;

/// Inputs shared by every backend
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub prompt: String,
    pub working_dir: PathBuf,
    pub system_prompt: Option<String>,
    /// Thread to resume (multi-turn backend only)
    pub thread_id: Option<String>,
}

impl AgentRequest {
    pub fn new(prompt: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            prompt: prompt.into(),
            working_dir: working_dir.into(),
            system_prompt: None,
            thread_id: None,
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: Option<String>) -> Self {
        self.system_prompt = system_prompt.filter(|s| !s.trim().is_empty());
        self
    }

    pub fn with_thread_id(mut self, thread_id: Option<String>) -> Self {
        self.thread_id = thread_id.filter(|s| !s.trim().is_empty());
        self
    }
}

/// Backend strategy selected by configuration
#[derive(Debug, Clone)]
pub enum AgentBackend {
    Streaming(StreamingAdapter),
    MultiTurn(MultiTurnAdapter),
}

impl AgentBackend {
    /// Backend with default settings for the given kind
    pub fn for_kind(kind: AgentKind) -> Self {
        match kind {
            AgentKind::ClaudeCode => Self::Streaming(StreamingAdapter::new()),
            AgentKind::OpenaiCodex => Self::MultiTurn(MultiTurnAdapter::new()),
        }
    }

    pub fn kind(&self) -> AgentKind {
        match self {
            Self::Streaming(_) => AgentKind::ClaudeCode,
            Self::MultiTurn(_) => AgentKind::OpenaiCodex,
        }
    }

    /// Start the backend and return its canonical message stream
    pub fn run(&self, request: AgentRequest) -> CanonicalStream {
        match self {
            Self::Streaming(adapter) => adapter.run(request),
            Self::MultiTurn(adapter) => adapter.run(request),
        }
    }
}
