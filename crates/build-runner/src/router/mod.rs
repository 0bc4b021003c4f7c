//! Command router: ack, dispatch by type, report handler failures

use std::sync::Arc;
use std::time::Duration;

use agent_runner::AgentKind;
use async_trait::async_trait;
use tracing::{info, warn};

use crate::connection::{CommandHandler, EventSender};
use crate::control_plane::ControlPlane;
use crate::error::{Result, RunnerError};
use crate::files::{ProjectDir, Workspace};
use crate::maintenance::{PORT_WAIT_INTERVAL, PORT_WAIT_RETRIES};
use crate::protocol::{Command, CommandType, Event, EventKind};
use crate::state::{wait_for_exit, RunnerSession};
use crate::supervisor::ProcessSupervisor;
use crate::tunnel::TunnelProvider;

mod build;
mod dev_server;
mod file_ops;
mod tunnels;

#[cfg(test)]
mod fakes;

pub use build::{AgentLauncher, BuildLauncher};

const SHUTDOWN_EXIT_WAIT: Duration = Duration::from_secs(10);

/// Collaborators and state shared by every handler
pub struct RouterContext {
    pub session: Arc<RunnerSession>,
    pub events: EventSender,
    pub workspace: Workspace,
    pub supervisor: Arc<dyn ProcessSupervisor>,
    pub tunnels: Arc<dyn TunnelProvider>,
    pub control_plane: Arc<dyn ControlPlane>,
    pub builds: Arc<dyn BuildLauncher>,
    pub default_agent: AgentKind,
    pub port_wait_retries: u32,
    pub port_wait_interval: Duration,
}

impl RouterContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: Arc<RunnerSession>,
        events: EventSender,
        workspace: Workspace,
        supervisor: Arc<dyn ProcessSupervisor>,
        tunnels: Arc<dyn TunnelProvider>,
        control_plane: Arc<dyn ControlPlane>,
        builds: Arc<dyn BuildLauncher>,
        default_agent: AgentKind,
    ) -> Self {
        Self {
            session,
            events,
            workspace,
            supervisor,
            tunnels,
            control_plane,
            builds,
            default_agent,
            port_wait_retries: PORT_WAIT_RETRIES,
            port_wait_interval: PORT_WAIT_INTERVAL,
        }
    }

    async fn send(&self, command: &Command, kind: EventKind) {
        self.events.send(Event::reply(command, kind)).await;
    }

    /// Project directory named by the slug, falling back to the project id
    fn project_dir(&self, command: &Command, slug: Option<&str>) -> Result<ProjectDir> {
        let name = slug
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(command.project_id.as_str());
        self.workspace.project(name)
    }

    async fn dispatch(self: Arc<Self>, command: Command) {
        let result = match command.command_type {
            CommandType::StartBuild => self.start_build(&command).await,
            CommandType::StartDevServer => self.start_dev_server(&command).await,
            CommandType::StopDevServer => self.stop_dev_server(&command).await,
            CommandType::FetchLogs => self.fetch_logs(&command).await,
            CommandType::StartTunnel => self.start_tunnel(&command).await,
            CommandType::StopTunnel => self.stop_tunnel(&command).await,
            CommandType::RunnerHealthCheck => {
                let status = self.session.status().await;
                self.send(&command, status).await;
                Ok(())
            }
            CommandType::ReadFile => self.read_file(&command).await,
            CommandType::WriteFile => self.write_file(&command).await,
            CommandType::ListFiles => self.list_files(&command).await,
            CommandType::DeleteProjectFiles => self.delete_project_files(&command).await,
            CommandType::Unknown => Err(RunnerError::UnsupportedCommand(command.id.clone())),
        };

        if let Err(e) = result {
            warn!(
                command_id = %command.id,
                project_id = %command.project_id,
                "{} failed: {}",
                command.command_type.as_str(),
                e
            );
            let event = match command.command_type {
                CommandType::StartBuild => Event::reply(&command, EventKind::BuildFailed { error: e.to_string() }),
                _ => Event::error(&command, e.to_string()),
            };
            self.events.send(event).await;
        }
    }

    /// Stop every dev server and close every tunnel
    pub async fn shutdown(&self) {
        let mut exits = Vec::new();
        for (project_id, control) in self.session.all_controls().await {
            info!(project_id = %project_id, "Stopping dev server for shutdown");
            control.stop();
            if let Some(exited) = self.session.exit_watch(&project_id).await {
                exits.push(exited);
            }
        }
        let all_exited = futures::future::join_all(exits.into_iter().map(wait_for_exit));
        let waited = tokio::time::timeout(SHUTDOWN_EXIT_WAIT, all_exited).await;
        if waited.is_err() {
            warn!("Dev servers still running at shutdown");
        }
        for (project_id, tunnel) in self.session.all_tunnels().await {
            if let Err(e) = self.tunnels.close(tunnel.port).await {
                warn!(project_id = %project_id, "Failed to close tunnel: {}", e);
            }
            self.session.remove_tunnel(&project_id).await;
        }
    }
}

/// Entry point for commands coming off the broker session
pub struct CommandRouter {
    ctx: Arc<RouterContext>,
}

impl CommandRouter {
    pub fn new(ctx: RouterContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    pub fn context(&self) -> Arc<RouterContext> {
        self.ctx.clone()
    }
}

#[async_trait]
impl CommandHandler for CommandRouter {
    async fn handle(&self, command: Command) {
        // Ack is queued before the handler task exists
        self.ctx.events.send(Event::ack(&command)).await;
        let ctx = self.ctx.clone();
        tokio::spawn(ctx.dispatch(command));
    }

    async fn status(&self) -> Event {
        Event::new(self.ctx.session.status().await)
    }
}

#[cfg(test)]
mod tests {
    use super::fakes::*;
    use super::*;

    #[tokio::test]
    async fn test_ack_precedes_every_other_event() {
        let harness = Harness::new().await;
        let router = CommandRouter::new(harness.context());

        router.handle(command("c1", "runner-health-check", "p1", serde_json::json!({}))).await;
        router.handle(command("c2", "stop-dev-server", "p1", serde_json::json!({}))).await;

        let events = harness.collect_until(|events| events.len() >= 4).await;
        for id in ["c1", "c2"] {
            let for_command: Vec<&Event> = events
                .iter()
                .filter(|e| e.command_id.as_deref() == Some(id))
                .collect();
            assert_eq!(for_command[0].type_name(), "ack", "first event for {}", id);
            assert!(for_command.len() >= 2);
        }

        let status = events
            .iter()
            .find(|e| e.command_id.as_deref() == Some("c1") && e.type_name() == "runner-status");
        assert!(status.is_some());
    }

    #[tokio::test]
    async fn test_unknown_command_is_acked_then_rejected() {
        let harness = Harness::new().await;
        let router = CommandRouter::new(harness.context());

        router.handle(command("c9", "launch-rocket", "p1", serde_json::json!({}))).await;

        let events = harness.collect_until(|events| events.len() >= 2).await;
        assert_eq!(events[0].type_name(), "ack");
        assert!(matches!(events[1].kind, EventKind::Error { .. }));
        assert_eq!(events[1].command_id.as_deref(), Some("c9"));
        assert_eq!(events[1].project_id.as_deref(), Some("p1"));
    }

    #[tokio::test]
    async fn test_invalid_project_name_is_reported() {
        let harness = Harness::new().await;
        let router = CommandRouter::new(harness.context());

        router
            .handle(command("c3", "list-files", "../escape", serde_json::json!({})))
            .await;

        let events = harness.collect_until(|events| events.len() >= 2).await;
        match &events[1].kind {
            EventKind::Error { error } => assert!(error.contains("Invalid project")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
