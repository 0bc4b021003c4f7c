//! Single-call streaming backend (Claude Code `stream-json`)

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use super::{AgentRequest, CanonicalStream};
use crate::message::CanonicalMessage;
use crate::parser::claude::ClaudeNormalizer;
use crate::parser::EventNormalizer;
use crate::process::{AgentKind, CliInvocation, CliProcess};

const DEFAULT_ALLOWED_TOOLS: &[&str] = &["Read", "Write", "Edit", "MultiEdit", "Glob", "Grep", "Bash", "TodoWrite"];

#[derive(Debug, Clone)]
pub struct StreamingAdapter {
    binary: String,
    allowed_tools: Vec<String>,
}

impl Default for StreamingAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamingAdapter {
    pub fn new() -> Self {
        Self::with_binary(AgentKind::ClaudeCode.command())
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            allowed_tools: DEFAULT_ALLOWED_TOOLS.iter().map(|t| t.to_string()).collect(),
        }
    }

    /// Build the CLI invocation; tool access is scoped to the working directory
    pub fn invocation(&self, request: &AgentRequest) -> CliInvocation {
        let working_dir = request.working_dir.to_string_lossy().to_string();
        let mut args = vec![
            "-p".to_string(),
            request.prompt.clone(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--permission-mode".to_string(),
            "acceptEdits".to_string(),
            "--add-dir".to_string(),
            working_dir,
            "--allowedTools".to_string(),
            self.allowed_tools.join(","),
        ];
        if let Some(system_prompt) = &request.system_prompt {
            args.push("--append-system-prompt".to_string());
            args.push(system_prompt.clone());
        }

        CliInvocation {
            program: self.binary.clone(),
            args,
            working_dir: request.working_dir.clone(),
            env: vec![("NO_COLOR".to_string(), "1".to_string())],
        }
    }

    pub fn run(&self, request: AgentRequest) -> CanonicalStream {
        info!(
            "Starting streaming agent in {:?} with prompt: {}",
            request.working_dir,
            request.prompt.chars().take(100).collect::<String>()
        );
        run_invocation(self.invocation(&request))
    }
}

/// Spawn the CLI and map its native stream 1:1 into canonical messages
pub(crate) fn run_invocation(invocation: CliInvocation) -> CanonicalStream {
    let (tx, rx) = mpsc::channel(256);

    tokio::spawn(async move {
        let mut process = match CliProcess::spawn(&invocation) {
            Ok(process) => process,
            Err(e) => {
                let _ = tx.send(CanonicalMessage::error(e.to_string())).await;
                return;
            }
        };

        let mut normalizer = ClaudeNormalizer::new();
        let mut finished = false;

        while let Some(line) = process.next_line().await {
            for message in normalizer.normalize_line(&line) {
                if matches!(message, CanonicalMessage::Result { .. } | CanonicalMessage::Error { .. }) {
                    finished = true;
                }
                if tx.send(message).await.is_err() {
                    warn!("Canonical stream receiver dropped, abandoning agent output");
                    return;
                }
            }
        }

        match process.wait().await {
            Ok(summary) if !summary.success() && !finished => {
                let detail = if summary.stderr_tail.is_empty() {
                    String::new()
                } else {
                    format!(": {}", summary.stderr_tail)
                };
                let _ = tx
                    .send(CanonicalMessage::error(format!(
                        "{} exited with code {}{}",
                        invocation.program, summary.code, detail
                    )))
                    .await;
            }
            Ok(_) => {}
            Err(e) => {
                let _ = tx.send(CanonicalMessage::error(e.to_string())).await;
            }
        }
    });

    Box::pin(ReceiverStream::new(rx))
}
