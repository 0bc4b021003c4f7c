//! Build runner worker
//!
//! Connects to the broker, executes build and dev-server commands inside
//! per-project directories, and streams events back.

mod config;
mod connection;
mod control_plane;
mod error;
mod files;
mod maintenance;
mod protocol;
mod router;
mod state;
mod supervisor;
mod tunnel;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{RunnerConfig, RunnerOptions};
use crate::connection::{ConnectionManager, ConnectionSettings, EventSender};
use crate::control_plane::ControlPlaneClient;
use crate::files::Workspace;
use crate::maintenance::{HealthMonitor, HEALTH_INTERVAL};
use crate::router::{AgentLauncher, CommandRouter, RouterContext};
use crate::state::RunnerSession;
use crate::supervisor::LocalSupervisor;
use crate::tunnel::CloudflaredTunnels;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "runner=info,agent_runner=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = RunnerConfig::from_options(RunnerOptions::parse())?;
    tokio::fs::create_dir_all(&config.workspace_root)
        .await
        .with_context(|| format!("creating workspace root {:?}", config.workspace_root))?;
    config.workspace_root = tokio::fs::canonicalize(&config.workspace_root)
        .await
        .with_context(|| format!("resolving workspace root {:?}", config.workspace_root))?;

    tracing::info!(
        runner_id = %config.runner_id,
        broker = %config.broker_url,
        agent = config.default_agent.as_str(),
        "Using workspace root: {:?}",
        config.workspace_root
    );

    let session = Arc::new(RunnerSession::new(config.runner_id.clone()));
    let events = EventSender::default();
    let control_plane = Arc::new(ControlPlaneClient::new(
        config.api_url.clone(),
        config.shared_secret.clone(),
    ));

    let ctx = RouterContext::new(
        session.clone(),
        events.clone(),
        Workspace::new(config.workspace_root.clone()),
        Arc::new(LocalSupervisor::new()?),
        Arc::new(CloudflaredTunnels::new()?),
        control_plane.clone(),
        Arc::new(AgentLauncher),
        config.default_agent,
    );
    let router = Arc::new(CommandRouter::new(ctx));

    #[cfg(unix)]
    maintenance::cleanup_orphans(&session, control_plane.as_ref(), &maintenance::UnixSignals).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(
        HealthMonitor::new(session.clone(), control_plane.clone()).run(HEALTH_INTERVAL, shutdown_rx.clone()),
    );
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("Shutdown signal received");
        shutdown_tx.send_replace(true);
    });

    let manager = ConnectionManager::new(
        &config,
        ConnectionSettings::from_config(&config),
        events,
        router.clone(),
        shutdown_rx,
    );
    let result = manager.run().await;

    router.context().shutdown().await;
    tracing::info!("Runner stopped");
    result.map_err(Into::into)
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("SIGTERM handler unavailable: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
