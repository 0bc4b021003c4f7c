use tracing::{info, warn};

use super::RouterContext;
use crate::error::{Result, RunnerError};
use crate::maintenance::wait_for_port;
use crate::protocol::{Command, EventKind, TunnelPayload};
use crate::state::TunnelRecord;

impl RouterContext {
    /// Expose the project's verified port, replacing any existing tunnel
    pub(super) async fn start_tunnel(&self, command: &Command) -> Result<()> {
        let payload: TunnelPayload = command.payload()?;
        let project_id = command.project_id.as_str();
        let _guard = self.session.lock_project(project_id).await;

        let verified = self.session.verified_port(project_id).await;
        let port = match (payload.port, verified) {
            (Some(requested), Some(verified)) if requested == verified => verified,
            (None, Some(verified)) => verified,
            (Some(requested), _) => {
                return Err(RunnerError::PortNotVerified {
                    project_id: project_id.to_string(),
                    port: requested,
                })
            }
            (None, None) => {
                return Err(RunnerError::Tunnel(format!(
                    "no port has been verified for project {}",
                    project_id
                )))
            }
        };

        wait_for_port(port, self.port_wait_retries, self.port_wait_interval).await?;

        if let Some(existing) = self.session.remove_tunnel(project_id).await {
            match self.tunnels.close(existing.port).await {
                Ok(()) => {
                    self.send(command, EventKind::TunnelClosed { port: existing.port }).await;
                }
                Err(e) => warn!(project_id, "Failed to close previous tunnel: {}", e),
            }
        }

        let url = self.tunnels.open(port).await?;
        info!(command_id = %command.id, project_id, port, "Tunnel created: {}", url);
        self.session
            .insert_tunnel(
                project_id,
                TunnelRecord {
                    port,
                    url: url.clone(),
                },
            )
            .await;
        self.send(command, EventKind::TunnelCreated { port, url }).await;
        Ok(())
    }

    pub(super) async fn stop_tunnel(&self, command: &Command) -> Result<()> {
        let payload: TunnelPayload = command.payload()?;
        let project_id = command.project_id.as_str();
        let _guard = self.session.lock_project(project_id).await;

        // Only the project's own recorded tunnel may be closed
        let port = match (payload.port, self.session.tunnel(project_id).await) {
            (Some(requested), Some(tunnel)) if requested == tunnel.port => requested,
            (None, Some(tunnel)) => tunnel.port,
            (Some(requested), _) => {
                return Err(RunnerError::Tunnel(format!(
                    "no tunnel on port {} for project {}",
                    requested, project_id
                )))
            }
            (None, None) => {
                return Err(RunnerError::Tunnel(format!("no tunnel known for project {}", project_id)))
            }
        };

        wait_for_port(port, self.port_wait_retries, self.port_wait_interval).await?;

        self.tunnels.close(port).await?;
        self.session.remove_tunnel(project_id).await;
        info!(command_id = %command.id, project_id, port, "Tunnel closed");
        self.send(command, EventKind::TunnelClosed { port }).await;
        Ok(())
    }
}
