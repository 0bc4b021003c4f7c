use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::RouterContext;
use crate::error::{Result, RunnerError};
use crate::protocol::{Command, EventKind, FetchLogsPayload, StartDevServerPayload};
use crate::state::{DevServerRecord, MAX_LOG_LINES};
use crate::supervisor::{DevServerSpec, ProcessEvent};

impl RouterContext {
    pub(super) async fn start_dev_server(self: &Arc<Self>, command: &Command) -> Result<()> {
        let payload: StartDevServerPayload = command.payload()?;
        if payload.run_command.trim().is_empty() {
            return Err(RunnerError::invalid_payload("start-dev-server", "runCommand is empty"));
        }
        let dir = self.project_dir(command, payload.project_slug.as_deref())?;
        let project_id = command.project_id.clone();

        let _guard = self.session.lock_project(&project_id).await;
        if self.session.has_process(&project_id).await {
            return Err(RunnerError::ProcessAlreadyRunning { project_id });
        }
        if !tokio::fs::try_exists(dir.root()).await? {
            return Err(RunnerError::InvalidProject(format!(
                "{} does not exist",
                dir.root().display()
            )));
        }

        let handle = self
            .supervisor
            .spawn(DevServerSpec {
                project_id: project_id.clone(),
                working_dir: dir.root().to_path_buf(),
                run_command: payload.run_command.clone(),
                env: payload.env,
            })
            .await?;

        let generation = self.session.next_generation().await;
        let (exited_tx, exited_rx) = watch::channel(false);
        let record = DevServerRecord::new(handle.pid, &payload.run_command, handle.control, generation)
            .with_exit_watch(exited_rx);
        self.session.insert_process(&project_id, record).await;
        info!(
            command_id = %command.id,
            project_id = %project_id,
            pid = ?handle.pid,
            "Dev server started"
        );

        let ctx = self.clone();
        let command = command.clone();
        tokio::spawn(async move {
            ctx.pump_process_events(command, generation, handle.events, exited_tx)
                .await;
        });
        Ok(())
    }

    /// Translate supervisor events into wire events until the process exits
    async fn pump_process_events(
        self: Arc<Self>,
        command: Command,
        generation: u64,
        mut events: mpsc::Receiver<ProcessEvent>,
        exited: watch::Sender<bool>,
    ) {
        let project_id = command.project_id.clone();
        let mut exit_code = None;

        while let Some(event) = events.recv().await {
            match event {
                ProcessEvent::Log { stream, line } => {
                    self.session
                        .append_log(&project_id, generation, stream, &line)
                        .await;
                    self.send(&command, EventKind::LogChunk { stream, data: line }).await;
                }
                ProcessEvent::Port(port) => {
                    info!(project_id = %project_id, port, "Dev server port verified");
                    self.session.verify_port(&project_id, port).await;
                    self.send(&command, EventKind::PortDetected { port }).await;
                }
                ProcessEvent::Error(error) => {
                    warn!(project_id = %project_id, "Dev server error: {}", error);
                    self.send(&command, EventKind::Error { error }).await;
                }
                ProcessEvent::Exit(code) => {
                    exit_code = code;
                    break;
                }
            }
        }

        self.teardown_process(&command, generation, exit_code).await;
        exited.send_replace(true);
    }

    /// Clear the verified port, close its tunnel, then report the exit
    async fn teardown_process(&self, command: &Command, generation: u64, exit_code: Option<i32>) {
        let project_id = command.project_id.as_str();
        let _guard = self.session.lock_project(project_id).await;

        if let Some(record) = self.session.remove_process(project_id, generation).await {
            debug!(project_id, pid = ?record.pid, "Tearing down `{}`", record.run_command);
            self.session.clear_verified_port(project_id).await;

            if let Some(tunnel) = self.session.remove_tunnel(project_id).await {
                match self.tunnels.close(tunnel.port).await {
                    Ok(()) => {
                        self.send(command, EventKind::TunnelClosed { port: tunnel.port }).await;
                    }
                    Err(e) => warn!(project_id, "Failed to close tunnel on exit: {}", e),
                }
            }

            if let Err(e) = self.control_plane.unregister(project_id).await {
                warn!(project_id, "Failed to unregister exited process: {}", e);
            }
        } else {
            debug!(project_id, generation, "Exit for a replaced dev server");
        }

        info!(project_id, "Dev server exited with {:?}", exit_code);
        self.send(command, EventKind::ProcessExited { exit_code }).await;
    }

    pub(super) async fn stop_dev_server(&self, command: &Command) -> Result<()> {
        let project_id = command.project_id.as_str();
        let _guard = self.session.lock_project(project_id).await;
        let control = self
            .session
            .process_control(project_id)
            .await
            .ok_or_else(|| RunnerError::ProcessNotFound {
                project_id: project_id.to_string(),
            })?;

        if control.stop_requested() {
            debug!(project_id, "Stop already requested, waiting for exit");
        }
        info!(command_id = %command.id, project_id, "Stopping dev server");
        control.stop();
        Ok(())
    }

    pub(super) async fn fetch_logs(&self, command: &Command) -> Result<()> {
        let payload: FetchLogsPayload = command.payload()?;
        let limit = payload.limit.unwrap_or(MAX_LOG_LINES).min(MAX_LOG_LINES);
        let lines = self
            .session
            .logs(&command.project_id, limit)
            .await
            .ok_or_else(|| RunnerError::ProcessNotFound {
                project_id: command.project_id.clone(),
            })?;
        self.send(command, EventKind::Logs { lines }).await;
        Ok(())
    }
}
