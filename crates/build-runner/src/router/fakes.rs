//! Test doubles for the router's collaborators

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use agent_runner::{AgentKind, AgentRequest, CanonicalMessage, CanonicalStream};
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::{mpsc, Mutex};

use super::{BuildLauncher, RouterContext};
use crate::connection::EventSender;
use crate::control_plane::{ControlPlane, HealthReport, RegisteredProcess};
use crate::error::{Result, RunnerError};
use crate::files::Workspace;
use crate::protocol::{Command, Event};
use crate::state::RunnerSession;
use crate::supervisor::{DevServerHandle, DevServerSpec, ProcessControl, ProcessEvent, ProcessSupervisor};
use crate::tunnel::TunnelProvider;

pub fn command(id: &str, command_type: &str, project_id: &str, payload: serde_json::Value) -> Command {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "type": command_type,
        "projectId": project_id,
        "timestamp": "2024-01-01T00:00:00Z",
        "payload": payload,
    }))
    .unwrap()
}

/// Spawns nothing; tests drive the event stream by hand
#[derive(Default)]
pub struct FakeSupervisor {
    pub spawned: Mutex<Vec<DevServerSpec>>,
    pub senders: Mutex<HashMap<String, mpsc::Sender<ProcessEvent>>>,
}

impl FakeSupervisor {
    pub async fn emit(&self, project_id: &str, event: ProcessEvent) {
        let tx = self.senders.lock().await.get(project_id).cloned().unwrap();
        tx.send(event).await.unwrap();
    }
}

#[async_trait]
impl ProcessSupervisor for FakeSupervisor {
    async fn spawn(&self, spec: DevServerSpec) -> Result<DevServerHandle> {
        let (tx, events) = mpsc::channel(100);
        let (control, mut stop_rx) = ProcessControl::new();

        // A stop request ends the fake process
        let exit_tx = tx.clone();
        tokio::spawn(async move {
            while !*stop_rx.borrow_and_update() {
                if stop_rx.changed().await.is_err() {
                    return;
                }
            }
            let _ = exit_tx.send(ProcessEvent::Exit(Some(143))).await;
        });

        self.senders.lock().await.insert(spec.project_id.clone(), tx);
        self.spawned.lock().await.push(spec);
        Ok(DevServerHandle {
            pid: Some(4242),
            events,
            control,
        })
    }
}

/// Records tunnel operations in order
#[derive(Default)]
pub struct FakeTunnels {
    pub operations: Mutex<Vec<String>>,
}

#[async_trait]
impl TunnelProvider for FakeTunnels {
    async fn open(&self, port: u16) -> Result<String> {
        self.operations.lock().await.push(format!("open:{}", port));
        Ok(format!("https://tunnel-{}.trycloudflare.com", port))
    }

    async fn close(&self, port: u16) -> Result<()> {
        self.operations.lock().await.push(format!("close:{}", port));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeControlPlane {
    pub unregistered: Mutex<Vec<String>>,
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn list_processes(&self, _runner_id: &str) -> Result<Vec<RegisteredProcess>> {
        Ok(Vec::new())
    }

    async fn report_health(&self, _project_id: &str, _report: &HealthReport) -> Result<()> {
        Ok(())
    }

    async fn unregister(&self, project_id: &str) -> Result<()> {
        self.unregistered.lock().await.push(project_id.to_string());
        Err(RunnerError::ControlPlane("offline".into()))
    }
}

/// Replays a fixed canonical message script
#[derive(Default)]
pub struct FakeLauncher {
    pub script: std::sync::Mutex<Vec<CanonicalMessage>>,
    pub requests: std::sync::Mutex<Vec<(AgentKind, AgentRequest)>>,
}

impl BuildLauncher for FakeLauncher {
    fn launch(&self, kind: AgentKind, request: AgentRequest) -> CanonicalStream {
        self.requests.lock().unwrap().push((kind, request));
        let messages = self.script.lock().unwrap().clone();
        Box::pin(futures::stream::iter(messages))
    }
}

pub struct Harness {
    pub tmp: TempDir,
    pub session: Arc<RunnerSession>,
    pub events: EventSender,
    pub rx: Mutex<mpsc::UnboundedReceiver<Event>>,
    pub supervisor: Arc<FakeSupervisor>,
    pub tunnels: Arc<FakeTunnels>,
    pub control_plane: Arc<FakeControlPlane>,
    pub launcher: Arc<FakeLauncher>,
}

impl Harness {
    pub async fn new() -> Self {
        let (events, rx) = EventSender::channel().await;
        Self {
            tmp: TempDir::new().unwrap(),
            session: Arc::new(RunnerSession::new("runner-test")),
            events,
            rx: Mutex::new(rx),
            supervisor: Arc::new(FakeSupervisor::default()),
            tunnels: Arc::new(FakeTunnels::default()),
            control_plane: Arc::new(FakeControlPlane::default()),
            launcher: Arc::new(FakeLauncher::default()),
        }
    }

    pub fn context(&self) -> RouterContext {
        let mut ctx = RouterContext::new(
            self.session.clone(),
            self.events.clone(),
            Workspace::new(self.tmp.path()),
            self.supervisor.clone(),
            self.tunnels.clone(),
            self.control_plane.clone(),
            self.launcher.clone(),
            AgentKind::ClaudeCode,
        );
        ctx.port_wait_retries = 3;
        ctx.port_wait_interval = Duration::from_millis(10);
        ctx
    }

    pub async fn project_dir(&self, name: &str) -> std::path::PathBuf {
        let dir = self.tmp.path().join(name);
        tokio::fs::create_dir_all(&dir).await.unwrap();
        dir
    }

    /// Receive events until `done` holds, failing after five seconds
    pub async fn collect_until(&self, done: impl Fn(&[Event]) -> bool) -> Vec<Event> {
        let mut rx = self.rx.lock().await;
        let mut events = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !done(&events) {
                events.push(rx.recv().await.unwrap());
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out, got {:?}", events));
        events
    }

    /// Receive until an event of `type_name` arrives, returning everything seen
    pub async fn collect_through(&self, type_name: &str) -> Vec<Event> {
        self.collect_until(|events| events.last().is_some_and(|e| e.type_name() == type_name))
            .await
    }
}
