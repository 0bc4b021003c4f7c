//! Supervisory work around dev servers: port waits, orphan cleanup, health

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::control_plane::{ControlPlane, HealthReport};
use crate::error::{Result, RunnerError};
use crate::state::RunnerSession;

pub const PORT_WAIT_RETRIES: u32 = 10;
pub const PORT_WAIT_INTERVAL: Duration = Duration::from_millis(500);
pub const HEALTH_INTERVAL: Duration = Duration::from_secs(30);
pub const HEALTH_FAILURE_THRESHOLD: u32 = 3;

pub async fn port_open(port: u16) -> bool {
    TcpStream::connect(("127.0.0.1", port)).await.is_ok()
}

/// Poll until `port` accepts connections
pub async fn wait_for_port(port: u16, retries: u32, interval: Duration) -> Result<()> {
    for attempt in 1..=retries {
        if port_open(port).await {
            debug!(port, attempt, "Port reachable");
            return Ok(());
        }
        if attempt < retries {
            tokio::time::sleep(interval).await;
        }
    }
    Err(RunnerError::PortUnreachable { port, attempts: retries })
}

/// Whether `pid` names one other process
///
/// Zero and values past `i32::MAX` address process groups once cast, and the
/// runner never signals itself.
pub fn signalable_pid(pid: u32) -> bool {
    pid != 0 && pid <= i32::MAX as u32 && pid != std::process::id()
}

/// Liveness probing and termination of OS processes
pub trait ProcessSignals: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
    fn terminate(&self, pid: u32) -> Result<()>;
}

#[cfg(unix)]
pub struct UnixSignals;

#[cfg(unix)]
impl ProcessSignals for UnixSignals {
    fn is_alive(&self, pid: u32) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if !signalable_pid(pid) {
            return false;
        }
        // Signal 0 only checks existence; EPERM still means alive
        match kill(Pid::from_raw(pid as i32), None::<Signal>) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    fn terminate(&self, pid: u32) -> Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if !signalable_pid(pid) {
            return Err(RunnerError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("refusing to signal pid {}", pid),
            )));
        }
        kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
            .map_err(|e| RunnerError::Io(std::io::Error::from_raw_os_error(e as i32)))
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    /// Registered but no longer running
    pub dead: Vec<String>,
    /// Running but not owned by this runner
    pub terminated: Vec<String>,
    pub kept: Vec<String>,
    /// Pid that cannot name another process; deregistered without signals
    pub rejected: Vec<String>,
}

/// Reconcile the control plane's process registry with this host
pub async fn cleanup_orphans(
    session: &RunnerSession,
    control_plane: &dyn ControlPlane,
    signals: &dyn ProcessSignals,
) -> CleanupReport {
    let mut report = CleanupReport::default();
    let registered = match control_plane.list_processes(session.runner_id()).await {
        Ok(registered) => registered,
        Err(e) => {
            warn!("Orphan cleanup skipped, could not list processes: {}", e);
            return report;
        }
    };
    let tracked = session.tracked_pids().await;

    for process in registered {
        let project_id = process.project_id.clone();
        if !signalable_pid(process.pid) {
            warn!(project_id = %project_id, pid = process.pid, "Deregistering process with unusable pid");
            report.rejected.push(project_id.clone());
        } else if !signals.is_alive(process.pid) {
            info!(project_id = %project_id, pid = process.pid, "Deregistering dead process");
            report.dead.push(project_id.clone());
        } else if !tracked.contains(&process.pid) {
            info!(project_id = %project_id, pid = process.pid, "Terminating orphaned process");
            if let Err(e) = signals.terminate(process.pid) {
                warn!(project_id = %project_id, "Failed to terminate orphan: {}", e);
            }
            report.terminated.push(project_id.clone());
        } else {
            report.kept.push(project_id);
            continue;
        }

        if let Err(e) = control_plane.unregister(&project_id).await {
            warn!(project_id = %project_id, "Failed to deregister process: {}", e);
        }
    }

    info!(
        dead = report.dead.len(),
        terminated = report.terminated.len(),
        kept = report.kept.len(),
        rejected = report.rejected.len(),
        "Orphan cleanup finished"
    );
    report
}

/// Periodic reachability check of verified dev-server ports
pub struct HealthMonitor {
    session: Arc<RunnerSession>,
    control_plane: Arc<dyn ControlPlane>,
    failures: HashMap<String, u32>,
}

impl HealthMonitor {
    pub fn new(session: Arc<RunnerSession>, control_plane: Arc<dyn ControlPlane>) -> Self {
        Self {
            session,
            control_plane,
            failures: HashMap::new(),
        }
    }

    /// One pass; returns the projects stopped for being unhealthy
    pub async fn check_once(&mut self) -> Vec<String> {
        let ports = self.session.verified_ports().await;
        self.failures
            .retain(|project, _| ports.iter().any(|(verified, _)| verified == project));

        let mut stopped = Vec::new();
        for (project_id, port) in ports {
            let healthy = port_open(port).await;
            let failures = self.failures.entry(project_id.clone()).or_insert(0);
            *failures = if healthy { 0 } else { *failures + 1 };
            let consecutive = *failures;

            let report = HealthReport::new(self.session.runner_id(), port, healthy, consecutive);
            if let Err(e) = self.control_plane.report_health(&project_id, &report).await {
                debug!(project_id = %project_id, "Health report failed: {}", e);
            }

            if consecutive >= HEALTH_FAILURE_THRESHOLD {
                warn!(project_id = %project_id, port, "Dev server failed {} health checks, stopping", consecutive);
                if let Some(control) = self.session.process_control(&project_id).await {
                    control.stop();
                }
                self.failures.remove(&project_id);
                stopped.push(project_id);
            }
        }
        stopped
    }

    pub async fn run(mut self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Health loop stopping");
                        return;
                    }
                }
            }
        }
    }
}
