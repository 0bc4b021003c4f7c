//! Dev-server process supervision
//!
//! The router only consumes the [`ProcessSupervisor`] contract: a spawned
//! server yields a stream of [`ProcessEvent`]s (`log`, `port`, `exit`,
//! `error`) and a [`ProcessControl`] to stop it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::{Result, RunnerError};
use crate::protocol::LogStream;

/// Grace period between SIGTERM and a hard kill
const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct DevServerSpec {
    pub project_id: String,
    pub working_dir: PathBuf,
    pub run_command: String,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Log { stream: LogStream, line: String },
    /// First port the process was seen listening on
    Port(u16),
    Exit(Option<i32>),
    Error(String),
}

/// Stop switch for a supervised process
#[derive(Debug, Clone)]
pub struct ProcessControl {
    stop: Arc<watch::Sender<bool>>,
}

impl ProcessControl {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { stop: Arc::new(tx) }, rx)
    }

    /// Request a stop; the supervisor reports `Exit` once it is gone
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }
}

pub struct DevServerHandle {
    pub pid: Option<u32>,
    pub events: mpsc::Receiver<ProcessEvent>,
    pub control: ProcessControl,
}

#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    async fn spawn(&self, spec: DevServerSpec) -> Result<DevServerHandle>;
}

/// Recognizes "listening on" style lines
#[derive(Debug, Clone)]
pub struct PortDetector {
    pattern: Regex,
}

impl PortDetector {
    pub fn new() -> Result<Self> {
        let pattern = Regex::new(
            r"(?i)(?:localhost|127\.0\.0\.1|0\.0\.0\.0|\[::\]|\[::1\]):(\d{2,5})|\bport\s*:?\s*(\d{2,5})\b",
        )
        .map_err(|e| RunnerError::InvalidConfig(format!("port pattern: {}", e)))?;
        Ok(Self { pattern })
    }

    pub fn detect(&self, line: &str) -> Option<u16> {
        let captures = self.pattern.captures(line)?;
        captures
            .get(1)
            .or_else(|| captures.get(2))
            .and_then(|m| m.as_str().parse::<u16>().ok())
            .filter(|port| *port >= 80)
    }
}

/// Runs dev servers as local shell commands
pub struct LocalSupervisor {
    detector: Arc<PortDetector>,
}

impl LocalSupervisor {
    pub fn new() -> Result<Self> {
        Ok(Self {
            detector: Arc::new(PortDetector::new()?),
        })
    }

    fn command(spec: &DevServerSpec) -> Command {
        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.arg("/C").arg(&spec.run_command);
            c
        } else {
            let mut c = Command::new("sh");
            c.arg("-c").arg(&spec.run_command);
            c
        };
        cmd.current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        cmd
    }
}

fn spawn_reader<R>(
    reader: R,
    stream: LogStream,
    detector: Arc<PortDetector>,
    port_seen: Arc<AtomicBool>,
    tx: mpsc::Sender<ProcessEvent>,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let port = detector.detect(&line);
            if tx.send(ProcessEvent::Log { stream, line }).await.is_err() {
                break;
            }
            if let Some(port) = port {
                if !port_seen.swap(true, Ordering::SeqCst) {
                    let _ = tx.send(ProcessEvent::Port(port)).await;
                }
            }
        }
    })
}

#[cfg(unix)]
fn terminate_group(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        debug!(pid, "SIGTERM to process group failed: {}", e);
    }
}

#[cfg(not(unix))]
fn terminate_group(_pid: u32) {}

/// Resolves once a stop is requested or every control is dropped
async fn stop_signal(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn stop_child(child: &mut Child) -> Option<i32> {
    if let Some(pid) = child.id() {
        terminate_group(pid);
    }
    match tokio::time::timeout(STOP_GRACE, child.wait()).await {
        Ok(Ok(status)) => return status.code(),
        Ok(Err(e)) => warn!("Failed waiting for dev server: {}", e),
        Err(_) => warn!("Dev server ignored SIGTERM, killing"),
    }
    let _ = child.start_kill();
    child.wait().await.ok().and_then(|s| s.code())
}

#[async_trait]
impl ProcessSupervisor for LocalSupervisor {
    async fn spawn(&self, spec: DevServerSpec) -> Result<DevServerHandle> {
        info!(
            project_id = %spec.project_id,
            "Starting dev server `{}` in {:?}",
            spec.run_command,
            spec.working_dir
        );

        let mut child = Self::command(&spec)
            .spawn()
            .map_err(|e| RunnerError::SpawnFailed(format!("{}: {}", spec.run_command, e)))?;
        let pid = child.id();

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunnerError::SpawnFailed("Failed to capture stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RunnerError::SpawnFailed("Failed to capture stderr".into()))?;

        let (tx, events) = mpsc::channel(1000);
        let (control, mut stop_rx) = ProcessControl::new();
        let port_seen = Arc::new(AtomicBool::new(false));

        let out = spawn_reader(stdout, LogStream::Stdout, self.detector.clone(), port_seen.clone(), tx.clone());
        let err = spawn_reader(stderr, LogStream::Stderr, self.detector.clone(), port_seen, tx.clone());

        let project_id = spec.project_id.clone();
        tokio::spawn(async move {
            let finished = tokio::select! {
                status = child.wait() => Some(status),
                _ = stop_signal(&mut stop_rx) => None,
            };
            let exit_code = match finished {
                Some(Ok(status)) => status.code(),
                Some(Err(e)) => {
                    let _ = tx.send(ProcessEvent::Error(e.to_string())).await;
                    None
                }
                None => {
                    info!(project_id = %project_id, "Stopping dev server");
                    stop_child(&mut child).await
                }
            };
            // Drain remaining output before reporting the exit
            let _ = out.await;
            let _ = err.await;
            info!(project_id = %project_id, "Dev server exited with {:?}", exit_code);
            let _ = tx.send(ProcessEvent::Exit(exit_code)).await;
        });

        Ok(DevServerHandle { pid, events, control })
    }
}
