//! Autonomous multi-turn backend (Codex `exec --json`, resumable threads)

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use super::{AgentRequest, CanonicalStream};
use crate::error::{AgentError, Result};
use crate::message::CanonicalMessage;
use crate::parser::codex::CodexNormalizer;
use crate::parser::EventNormalizer;
use crate::process::{AgentKind, CliInvocation, CliProcess};

/// Hard ceiling on turns per build
pub const MAX_TURNS: u32 = 30;

/// Prompt sent on every turn after the first
pub const CONTINUATION_PROMPT: &str =
    "Continue with the next step. When every step is finished, say \"BUILD COMPLETE\".";

/// Matched case-insensitively against a turn's assistant text
pub const COMPLETION_PHRASES: &[&str] = &[
    "build complete",
    "build is complete",
    "implementation complete",
    "all tasks complete",
    "task complete",
];

/// Whether lowercase turn text carries a completion phrase
pub fn has_completion_signal(text: &str) -> bool {
    let text = text.to_lowercase();
    COMPLETION_PHRASES.iter().any(|phrase| text.contains(phrase))
}

/// Runs one turn of the backend
///
/// Raw native events are delivered on the returned channel; the channel
/// closing marks the end of the turn. Failures after the turn has started
/// arrive as a raw `error` event.
#[async_trait]
pub trait TurnDriver: Send {
    async fn start_turn(
        &mut self,
        thread_id: Option<&str>,
        prompt: &str,
        working_dir: &Path,
    ) -> Result<mpsc::Receiver<Value>>;
}

/// Why the turn loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A completion phrase was seen
    Completed,
    /// A turn produced no canonical messages
    EmptyTurn,
    /// The turn ceiling was reached
    TurnLimit,
    /// The backend reported an error
    Failed,
}

#[derive(Debug, Clone)]
pub struct TurnSummary {
    /// Turn the loop stopped on
    pub turns: u32,
    pub stop: StopReason,
    pub thread_id: Option<String>,
}

/// Turn loop state: ordinal, thread and per-turn text
pub struct MultiTurnSession<D: TurnDriver> {
    driver: D,
    max_turns: u32,
}

impl<D: TurnDriver> MultiTurnSession<D> {
    pub fn new(driver: D, max_turns: u32) -> Self {
        Self { driver, max_turns }
    }

    fn first_prompt(request: &AgentRequest) -> String {
        match &request.system_prompt {
            Some(system_prompt) => format!("{}\n\n{}", system_prompt, request.prompt),
            None => request.prompt.clone(),
        }
    }

    /// Drive turns until completion, an empty turn, an error, or the ceiling
    pub async fn run(
        &mut self,
        request: &AgentRequest,
        tx: &mpsc::Sender<CanonicalMessage>,
    ) -> Result<TurnSummary> {
        let mut normalizer = CodexNormalizer::new();
        let mut thread_id = request.thread_id.clone();
        let mut announced = false;
        let mut turn = 0;

        while turn < self.max_turns {
            turn += 1;
            let prompt = if turn == 1 {
                Self::first_prompt(request)
            } else {
                CONTINUATION_PROMPT.to_string()
            };
            info!(turn, resume = thread_id.is_some(), "Starting agent turn");

            let mut events = match self
                .driver
                .start_turn(thread_id.as_deref(), &prompt, &request.working_dir)
                .await
            {
                Ok(events) => events,
                Err(e) => {
                    tx.send(CanonicalMessage::error(e.to_string()))
                        .await
                        .map_err(|_| AgentError::ChannelClosed)?;
                    return Ok(TurnSummary {
                        turns: turn,
                        stop: StopReason::Failed,
                        thread_id,
                    });
                }
            };

            let mut produced = 0usize;
            let mut turn_text = String::new();
            let mut failed = false;

            while let Some(raw) = events.recv().await {
                let messages = normalizer.normalize(&raw);

                if let Some(id) = normalizer.thread_id() {
                    if thread_id.as_deref() != Some(id) {
                        thread_id = Some(id.to_string());
                    }
                    if turn == 1 && !announced {
                        announced = true;
                        tx.send(CanonicalMessage::System {
                            thread_id: id.to_string(),
                        })
                        .await
                        .map_err(|_| AgentError::ChannelClosed)?;
                    }
                }

                for message in messages {
                    produced += 1;
                    if let Some(text) = message.assistant_text_content() {
                        turn_text.push_str(&text.to_lowercase());
                        turn_text.push('\n');
                    }
                    failed |= message.is_error();
                    tx.send(message).await.map_err(|_| AgentError::ChannelClosed)?;
                }
            }

            if turn == 1 && !announced {
                if let Some(id) = &thread_id {
                    announced = true;
                    tx.send(CanonicalMessage::System { thread_id: id.clone() })
                        .await
                        .map_err(|_| AgentError::ChannelClosed)?;
                }
            }

            let stop = if produced == 0 {
                warn!(turn, "Agent turn produced no output, stopping");
                Some(StopReason::EmptyTurn)
            } else if failed {
                Some(StopReason::Failed)
            } else if has_completion_signal(&turn_text) {
                Some(StopReason::Completed)
            } else {
                None
            };

            if let Some(stop) = stop {
                return Ok(TurnSummary {
                    turns: turn,
                    stop,
                    thread_id,
                });
            }
            debug!(turn, messages = produced, "Agent turn finished without completion signal");
        }

        warn!(turns = turn, "Agent reached the turn ceiling");
        Ok(TurnSummary {
            turns: turn,
            stop: StopReason::TurnLimit,
            thread_id,
        })
    }
}

/// Turn driver backed by the `codex` CLI
#[derive(Debug, Clone)]
pub struct CodexCliDriver {
    binary: String,
}

impl CodexCliDriver {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn invocation(&self, thread_id: Option<&str>, prompt: &str, working_dir: &Path) -> CliInvocation {
        let mut args = vec![
            "exec".to_string(),
            "--json".to_string(),
            "--skip-git-repo-check".to_string(),
            "--sandbox".to_string(),
            "workspace-write".to_string(),
            "--cd".to_string(),
            working_dir.to_string_lossy().to_string(),
        ];
        if let Some(thread_id) = thread_id {
            args.push("resume".to_string());
            args.push(thread_id.to_string());
        }
        args.push(prompt.to_string());

        CliInvocation {
            program: self.binary.clone(),
            args,
            working_dir: working_dir.to_path_buf(),
            env: vec![("NO_COLOR".to_string(), "1".to_string())],
        }
    }
}

#[async_trait]
impl TurnDriver for CodexCliDriver {
    async fn start_turn(
        &mut self,
        thread_id: Option<&str>,
        prompt: &str,
        working_dir: &Path,
    ) -> Result<mpsc::Receiver<Value>> {
        let invocation = self.invocation(thread_id, prompt, working_dir);
        let mut process = CliProcess::spawn(&invocation)?;
        let (tx, rx) = mpsc::channel(256);
        let program = invocation.program;

        tokio::spawn(async move {
            while let Some(line) = process.next_line().await {
                match serde_json::from_str::<Value>(&line) {
                    Ok(raw) => {
                        if tx.send(raw).await.is_err() {
                            return;
                        }
                    }
                    Err(_) => debug!("Skipping non-JSON agent output: {}", line),
                }
            }

            match process.wait().await {
                Ok(summary) if !summary.success() => {
                    let _ = tx
                        .send(json!({
                            "type": "error",
                            "message": format!("{} exited with code {}: {}", program, summary.code, summary.stderr_tail),
                        }))
                        .await;
                }
                Ok(_) => {}
                Err(e) => {
                    let _ = tx.send(json!({"type": "error", "message": e.to_string()})).await;
                }
            }
        });

        Ok(rx)
    }
}

#[derive(Debug, Clone)]
pub struct MultiTurnAdapter {
    binary: String,
    max_turns: u32,
}

impl Default for MultiTurnAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MultiTurnAdapter {
    pub fn new() -> Self {
        Self {
            binary: AgentKind::OpenaiCodex.command().to_string(),
            max_turns: MAX_TURNS,
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn run(&self, request: AgentRequest) -> CanonicalStream {
        info!(
            "Starting multi-turn agent in {:?} with prompt: {}",
            request.working_dir,
            request.prompt.chars().take(100).collect::<String>()
        );
        let (tx, rx) = mpsc::channel(256);
        let mut session = MultiTurnSession::new(CodexCliDriver::new(self.binary.clone()), self.max_turns);
        let working_dir: PathBuf = request.working_dir.clone();

        tokio::spawn(async move {
            match session.run(&request, &tx).await {
                Ok(summary) => info!(
                    turns = summary.turns,
                    stop = ?summary.stop,
                    "Multi-turn agent finished in {:?}",
                    working_dir
                ),
                Err(e) => warn!("Multi-turn agent aborted: {}", e),
            }
        });

        Box::pin(ReceiverStream::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Replays scripted turns and records what it was asked
    struct ScriptedDriver {
        turns: VecDeque<Vec<Value>>,
        calls: Vec<(Option<String>, String)>,
    }

    impl ScriptedDriver {
        fn new(turns: Vec<Vec<Value>>) -> Self {
            Self {
                turns: turns.into(),
                calls: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl TurnDriver for ScriptedDriver {
        async fn start_turn(
            &mut self,
            thread_id: Option<&str>,
            prompt: &str,
            _working_dir: &Path,
        ) -> Result<mpsc::Receiver<Value>> {
            self.calls.push((thread_id.map(str::to_string), prompt.to_string()));
            let events = self.turns.pop_front().unwrap_or_default();
            let (tx, rx) = mpsc::channel(events.len().max(1));
            for event in events {
                tx.send(event).await.unwrap();
            }
            Ok(rx)
        }
    }

    fn text_turn(text: &str) -> Vec<Value> {
        vec![
            json!({"type": "item.completed", "item": {"id": "m", "type": "agent_message", "text": text}}),
            json!({"type": "turn.completed", "usage": {}}),
        ]
    }

    async fn run_session(
        driver: ScriptedDriver,
        request: AgentRequest,
        max_turns: u32,
    ) -> (TurnSummary, Vec<CanonicalMessage>, ScriptedDriver) {
        let (tx, mut rx) = mpsc::channel(1000);
        let mut session = MultiTurnSession::new(driver, max_turns);
        let summary = session.run(&request, &tx).await.unwrap();
        drop(tx);
        let mut messages = Vec::new();
        while let Some(msg) = rx.recv().await {
            messages.push(msg);
        }
        (summary, messages, session.driver)
    }

    #[test]
    fn test_completion_signal_is_case_insensitive() {
        assert!(has_completion_signal("All good. BUILD COMPLETE!"));
        assert!(has_completion_signal("implementation Complete"));
        assert!(!has_completion_signal("building components"));
    }

    #[tokio::test]
    async fn test_stops_on_turn_with_completion_phrase() {
        let driver = ScriptedDriver::new(vec![
            text_turn("Scaffolded the project"),
            text_turn("Added routes"),
            text_turn("Everything works. Build Complete."),
            text_turn("should never run"),
        ]);
        let request = AgentRequest::new("build a blog", "/tmp/blog");

        let (summary, _messages, driver) = run_session(driver, request, 10).await;
        assert_eq!(summary.stop, StopReason::Completed);
        assert_eq!(summary.turns, 3);
        assert_eq!(driver.calls.len(), 3);
        assert_eq!(driver.calls[1].1, CONTINUATION_PROMPT);
        assert_eq!(driver.calls[2].1, CONTINUATION_PROMPT);
    }

    #[tokio::test]
    async fn test_empty_turn_stops_without_advancing() {
        let driver = ScriptedDriver::new(vec![text_turn("step one"), vec![], text_turn("unreachable")]);
        let request = AgentRequest::new("build", "/tmp/p");

        let (summary, _messages, driver) = run_session(driver, request, 10).await;
        assert_eq!(summary.stop, StopReason::EmptyTurn);
        assert_eq!(summary.turns, 2);
        assert_eq!(driver.calls.len(), 2);
    }

    #[tokio::test]
    async fn test_turn_ceiling() {
        let driver = ScriptedDriver::new((0..5).map(|i| text_turn(&format!("step {}", i))).collect());
        let request = AgentRequest::new("build", "/tmp/p");

        let (summary, _messages, driver) = run_session(driver, request, 3).await;
        assert_eq!(summary.stop, StopReason::TurnLimit);
        assert_eq!(summary.turns, 3);
        assert_eq!(driver.calls.len(), 3);
    }

    #[tokio::test]
    async fn test_thread_id_announced_once_and_reused() {
        let mut first = vec![json!({"type": "thread.started", "thread_id": "th_42"})];
        first.extend(text_turn("working"));
        let driver = ScriptedDriver::new(vec![first, text_turn("build complete")]);
        let request = AgentRequest::new("build", "/tmp/p").with_system_prompt(Some("SYSTEM".to_string()));

        let (summary, messages, driver) = run_session(driver, request, 10).await;
        assert_eq!(summary.thread_id.as_deref(), Some("th_42"));

        let announcements: Vec<_> = messages
            .iter()
            .filter(|m| matches!(m, CanonicalMessage::System { .. }))
            .collect();
        assert_eq!(announcements.len(), 1);
        assert_eq!(
            messages[0],
            CanonicalMessage::System {
                thread_id: "th_42".to_string()
            }
        );

        assert_eq!(driver.calls[0].0, None);
        assert!(driver.calls[0].1.starts_with("SYSTEM\n\nbuild"));
        assert_eq!(driver.calls[1].0.as_deref(), Some("th_42"));
    }

    #[tokio::test]
    async fn test_resumed_thread_is_announced_on_first_turn() {
        let driver = ScriptedDriver::new(vec![text_turn("task complete")]);
        let request = AgentRequest::new("fix the header", "/tmp/p").with_thread_id(Some("th_old".to_string()));

        let (summary, messages, driver) = run_session(driver, request, 10).await;
        assert_eq!(summary.turns, 1);
        assert_eq!(driver.calls[0].0.as_deref(), Some("th_old"));
        assert!(messages.contains(&CanonicalMessage::System {
            thread_id: "th_old".to_string()
        }));
    }

    #[tokio::test]
    async fn test_error_event_stops_loop() {
        let driver = ScriptedDriver::new(vec![
            vec![json!({"type": "error", "message": "quota exceeded"})],
            text_turn("unreachable"),
        ]);
        let request = AgentRequest::new("build", "/tmp/p");

        let (summary, messages, _driver) = run_session(driver, request, 10).await;
        assert_eq!(summary.stop, StopReason::Failed);
        assert_eq!(summary.turns, 1);
        assert_eq!(messages, vec![CanonicalMessage::error("quota exceeded")]);
    }

    #[test]
    fn test_codex_invocation_resumes_thread() {
        let driver = CodexCliDriver::new("codex");
        let invocation = driver.invocation(Some("th_1"), "continue", Path::new("/work/p"));
        let resume = invocation.args.iter().position(|a| a == "resume").unwrap();
        assert_eq!(invocation.args[resume + 1], "th_1");
        assert_eq!(invocation.args.last().map(String::as_str), Some("continue"));
        assert!(invocation.args.contains(&"--json".to_string()));
    }
}
