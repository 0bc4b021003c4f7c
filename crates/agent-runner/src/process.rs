//! Agent CLI process management

use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};

/// Lines of stderr kept for error reporting
const STDERR_TAIL_LINES: usize = 20;

/// Supported agent backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentKind {
    /// Single-shot streaming backend
    ClaudeCode,
    /// Autonomous multi-turn backend
    OpenaiCodex,
}

impl AgentKind {
    /// Parse agent kind from string
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "claude-code" | "claudecode" | "claude" => Ok(Self::ClaudeCode),
            "openai-codex" | "codex" => Ok(Self::OpenaiCodex),
            _ => Err(AgentError::InvalidBackend {
                backend: s.to_string(),
            }),
        }
    }

    /// Get the canonical string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClaudeCode => "claude-code",
            Self::OpenaiCodex => "openai-codex",
        }
    }

    /// Get the command to run this agent
    pub fn command(&self) -> &'static str {
        match self {
            Self::ClaudeCode => {
                if cfg!(target_os = "windows") {
                    "claude.cmd"
                } else {
                    "claude"
                }
            }
            Self::OpenaiCodex => {
                if cfg!(target_os = "windows") {
                    "codex.cmd"
                } else {
                    "codex"
                }
            }
        }
    }
}

/// A fully specified CLI invocation
#[derive(Debug, Clone)]
pub struct CliInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
}

/// How a CLI process ended
#[derive(Debug, Clone)]
pub struct ExitSummary {
    pub code: i32,
    pub stderr_tail: String,
}

impl ExitSummary {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// A running agent CLI whose stdout is consumed as JSONL
pub struct CliProcess {
    child: Child,
    lines: mpsc::Receiver<String>,
    stdout_handle: tokio::task::JoinHandle<()>,
    stderr_handle: tokio::task::JoinHandle<String>,
}

impl CliProcess {
    /// Spawn the process and start its output readers
    pub fn spawn(invocation: &CliInvocation) -> Result<Self> {
        info!(
            "Spawning {} in {:?}",
            invocation.program, invocation.working_dir
        );

        let mut cmd = if cfg!(target_os = "windows") && invocation.program.ends_with(".cmd") {
            let mut c = Command::new("cmd");
            c.arg("/C").arg(&invocation.program).args(&invocation.args);
            c
        } else {
            let mut c = Command::new(&invocation.program);
            c.args(&invocation.args);
            c
        };

        cmd.current_dir(&invocation.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &invocation.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            AgentError::spawn_failed_with_source(
                format!("Failed to spawn {}: {}", invocation.program, e),
                e,
            )
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::spawn_failed("Failed to capture stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AgentError::spawn_failed("Failed to capture stderr"))?;

        let (line_tx, lines) = mpsc::channel(1000);
        let stdout_handle = tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                if line_tx.send(line).await.is_err() {
                    warn!("Line channel closed, stopping stdout reader");
                    break;
                }
            }
        });

        let stderr_handle = tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            let mut tail: Vec<String> = Vec::new();
            while let Ok(Some(line)) = reader.next_line().await {
                debug!("agent stderr: {}", line);
                tail.push(line);
                if tail.len() > STDERR_TAIL_LINES {
                    tail.remove(0);
                }
            }
            tail.join("\n")
        });

        Ok(Self {
            child,
            lines,
            stdout_handle,
            stderr_handle,
        })
    }

    /// Next non-empty stdout line, `None` once stdout is closed
    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    /// Wait for the process to complete
    pub async fn wait(mut self) -> Result<ExitSummary> {
        let status = self.child.wait().await?;
        let _ = self.stdout_handle.await;
        let stderr_tail = self.stderr_handle.await.unwrap_or_default();

        Ok(ExitSummary {
            code: status.code().unwrap_or(-1),
            stderr_tail,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_kind_parse() {
        assert_eq!(AgentKind::parse("claude-code").unwrap(), AgentKind::ClaudeCode);
        assert_eq!(AgentKind::parse("Claude").unwrap(), AgentKind::ClaudeCode);
        assert_eq!(AgentKind::parse("openai-codex").unwrap(), AgentKind::OpenaiCodex);
        assert_eq!(AgentKind::parse("codex").unwrap(), AgentKind::OpenaiCodex);
        assert!(AgentKind::parse("gemini").is_err());
    }

    #[test]
    fn test_agent_kind_serde_matches_as_str() {
        let json = serde_json::to_string(&AgentKind::OpenaiCodex).unwrap();
        assert_eq!(json, format!("\"{}\"", AgentKind::OpenaiCodex.as_str()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cli_process_reads_lines_and_exit_code() {
        let invocation = CliInvocation {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                "echo '{\"a\":1}'; echo; echo oops >&2; exit 3".to_string(),
            ],
            working_dir: std::env::temp_dir(),
            env: vec![],
        };

        let mut process = CliProcess::spawn(&invocation).unwrap();
        assert_eq!(process.next_line().await.as_deref(), Some("{\"a\":1}"));
        assert_eq!(process.next_line().await, None);

        let summary = process.wait().await.unwrap();
        assert_eq!(summary.code, 3);
        assert!(!summary.success());
        assert_eq!(summary.stderr_tail, "oops");
    }
}
