use std::sync::Arc;

use agent_runner::{run_build, AgentBackend, AgentKind, AgentRequest, CanonicalStream, FrameSink};
use async_trait::async_trait;
use tracing::info;

use super::RouterContext;
use crate::connection::EventSender;
use crate::error::Result;
use crate::protocol::{Command, Event, EventKind, StartBuildPayload};

const PROMPT_LOG_CHARS: usize = 100;

/// Starts an agent backend for a build
pub trait BuildLauncher: Send + Sync {
    fn launch(&self, kind: AgentKind, request: AgentRequest) -> CanonicalStream;
}

/// Launches the real agent CLIs
pub struct AgentLauncher;

impl BuildLauncher for AgentLauncher {
    fn launch(&self, kind: AgentKind, request: AgentRequest) -> CanonicalStream {
        AgentBackend::for_kind(kind).run(request)
    }
}

/// Forwards wire frames as `build-stream` events for one command
struct BuildStreamSink {
    events: EventSender,
    command: Command,
}

#[async_trait]
impl FrameSink for BuildStreamSink {
    async fn send_frame(&self, frame: String) {
        self.events
            .send(Event::reply(&self.command, EventKind::BuildStream { data: frame }))
            .await;
    }
}

impl RouterContext {
    pub(super) async fn start_build(self: &Arc<Self>, command: &Command) -> Result<()> {
        let payload: StartBuildPayload = command.payload()?;
        let kind = match payload.agent.as_deref().map(str::trim).filter(|a| !a.is_empty()) {
            Some(agent) => AgentKind::parse(agent)?,
            None => self.default_agent,
        };
        let dir = self.project_dir(command, payload.project_slug.as_deref())?;
        tokio::fs::create_dir_all(dir.root()).await?;

        let preview: String = payload.prompt.chars().take(PROMPT_LOG_CHARS).collect();
        info!(
            command_id = %command.id,
            project_id = %command.project_id,
            agent = kind.as_str(),
            operation = payload.operation_type.as_deref().unwrap_or("build"),
            "Starting build: {}",
            preview
        );

        let request = AgentRequest::new(payload.prompt, dir.root())
            .with_system_prompt(payload.system_prompt)
            .with_thread_id(payload.thread_id);
        let messages = self.builds.launch(kind, request);

        let sink = BuildStreamSink {
            events: self.events.clone(),
            command: command.clone(),
        };
        let outcome = run_build(&command.id, messages, dir.root(), &sink).await;

        if let Some(error) = outcome.report.failure {
            info!(command_id = %command.id, "Build failed: {}", error);
            self.send(command, EventKind::BuildFailed { error }).await;
            return Ok(());
        }

        if let Some(run_command) = outcome.run_command {
            self.send(command, EventKind::BuildMetadata { run_command }).await;
        }
        info!(
            command_id = %command.id,
            frames = outcome.report.frames,
            tool_uses = outcome.report.tool_uses,
            "Build completed"
        );
        self.send(
            command,
            EventKind::BuildCompleted {
                summary: outcome.report.summary,
                thread_id: outcome.report.thread_id,
            },
        )
        .await;
        Ok(())
    }
}
