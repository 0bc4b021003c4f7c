//! Shared runner state owned by one session object

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{watch, Mutex, OwnedMutexGuard, RwLock};

use crate::protocol::{EventKind, LogStream};
use crate::supervisor::ProcessControl;

/// Log lines kept per dev server
pub const MAX_LOG_LINES: usize = 1000;

/// A dev server this runner spawned
#[derive(Debug)]
pub struct DevServerRecord {
    pub pid: Option<u32>,
    pub run_command: String,
    pub control: ProcessControl,
    /// Distinguishes restarts of the same project
    pub generation: u64,
    logs: VecDeque<String>,
    /// Flips to true once the process has exited and been torn down
    exited: Option<watch::Receiver<bool>>,
}

impl DevServerRecord {
    pub fn new(pid: Option<u32>, run_command: impl Into<String>, control: ProcessControl, generation: u64) -> Self {
        Self {
            pid,
            run_command: run_command.into(),
            control,
            generation,
            logs: VecDeque::new(),
            exited: None,
        }
    }

    pub fn with_exit_watch(mut self, exited: watch::Receiver<bool>) -> Self {
        self.exited = Some(exited);
        self
    }

    pub fn push_log(&mut self, stream: LogStream, line: &str) {
        if self.logs.len() == MAX_LOG_LINES {
            self.logs.pop_front();
        }
        let line = match stream {
            LogStream::Stdout => line.to_string(),
            LogStream::Stderr => format!("[stderr] {}", line),
        };
        self.logs.push_back(line);
    }

    /// Most recent `limit` lines, oldest first
    pub fn tail(&self, limit: usize) -> Vec<String> {
        let skip = self.logs.len().saturating_sub(limit);
        self.logs.iter().skip(skip).cloned().collect()
    }
}

/// Resolves once an exit watch flips or its sender is dropped
pub async fn wait_for_exit(mut exited: watch::Receiver<bool>) {
    while !*exited.borrow_and_update() {
        if exited.changed().await.is_err() {
            return;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRecord {
    pub port: u16,
    pub url: String,
}

/// Runner-wide mutable state, passed to every handler
pub struct RunnerSession {
    runner_id: String,
    started_at: Instant,
    verified_ports: RwLock<HashMap<String, u16>>,
    processes: RwLock<HashMap<String, DevServerRecord>>,
    tunnels: RwLock<HashMap<String, TunnelRecord>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    generations: Mutex<u64>,
}

impl RunnerSession {
    pub fn new(runner_id: impl Into<String>) -> Self {
        Self {
            runner_id: runner_id.into(),
            started_at: Instant::now(),
            verified_ports: RwLock::new(HashMap::new()),
            processes: RwLock::new(HashMap::new()),
            tunnels: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            generations: Mutex::new(0),
        }
    }

    pub fn runner_id(&self) -> &str {
        &self.runner_id
    }

    /// Serializes state-mutating handlers for one project
    pub async fn lock_project(&self, project_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(project_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    pub async fn next_generation(&self) -> u64 {
        let mut generation = self.generations.lock().await;
        *generation += 1;
        *generation
    }

    // Verified ports

    pub async fn verify_port(&self, project_id: &str, port: u16) {
        self.verified_ports
            .write()
            .await
            .insert(project_id.to_string(), port);
    }

    pub async fn verified_port(&self, project_id: &str) -> Option<u16> {
        self.verified_ports.read().await.get(project_id).copied()
    }

    pub async fn clear_verified_port(&self, project_id: &str) -> Option<u16> {
        self.verified_ports.write().await.remove(project_id)
    }

    pub async fn verified_ports(&self) -> Vec<(String, u16)> {
        let mut ports: Vec<_> = self
            .verified_ports
            .read()
            .await
            .iter()
            .map(|(project, port)| (project.clone(), *port))
            .collect();
        ports.sort();
        ports
    }

    // Process table

    pub async fn insert_process(&self, project_id: &str, record: DevServerRecord) {
        self.processes
            .write()
            .await
            .insert(project_id.to_string(), record);
    }

    pub async fn has_process(&self, project_id: &str) -> bool {
        self.processes.read().await.contains_key(project_id)
    }

    pub async fn process_control(&self, project_id: &str) -> Option<ProcessControl> {
        self.processes
            .read()
            .await
            .get(project_id)
            .map(|record| record.control.clone())
    }

    pub async fn exit_watch(&self, project_id: &str) -> Option<watch::Receiver<bool>> {
        self.processes
            .read()
            .await
            .get(project_id)
            .and_then(|record| record.exited.clone())
    }

    /// Remove the record only if it is still `generation`
    pub async fn remove_process(&self, project_id: &str, generation: u64) -> Option<DevServerRecord> {
        let mut processes = self.processes.write().await;
        if processes.get(project_id).map(|r| r.generation) == Some(generation) {
            processes.remove(project_id)
        } else {
            None
        }
    }

    pub async fn append_log(&self, project_id: &str, generation: u64, stream: LogStream, line: &str) {
        if let Some(record) = self.processes.write().await.get_mut(project_id) {
            if record.generation == generation {
                record.push_log(stream, line);
            }
        }
    }

    pub async fn logs(&self, project_id: &str, limit: usize) -> Option<Vec<String>> {
        self.processes
            .read()
            .await
            .get(project_id)
            .map(|record| record.tail(limit))
    }

    pub async fn tracked_pids(&self) -> Vec<u32> {
        self.processes
            .read()
            .await
            .values()
            .filter_map(|record| record.pid)
            .collect()
    }

    pub async fn active_projects(&self) -> Vec<String> {
        let mut projects: Vec<String> = self.processes.read().await.keys().cloned().collect();
        projects.sort();
        projects
    }

    pub async fn all_controls(&self) -> Vec<(String, ProcessControl)> {
        self.processes
            .read()
            .await
            .iter()
            .map(|(project, record)| (project.clone(), record.control.clone()))
            .collect()
    }

    // Tunnels

    pub async fn insert_tunnel(&self, project_id: &str, record: TunnelRecord) {
        self.tunnels
            .write()
            .await
            .insert(project_id.to_string(), record);
    }

    pub async fn tunnel(&self, project_id: &str) -> Option<TunnelRecord> {
        self.tunnels.read().await.get(project_id).cloned()
    }

    pub async fn remove_tunnel(&self, project_id: &str) -> Option<TunnelRecord> {
        self.tunnels.write().await.remove(project_id)
    }

    pub async fn all_tunnels(&self) -> Vec<(String, TunnelRecord)> {
        self.tunnels
            .read()
            .await
            .iter()
            .map(|(project, record)| (project.clone(), record.clone()))
            .collect()
    }

    pub async fn status(&self) -> EventKind {
        EventKind::RunnerStatus {
            runner_id: self.runner_id.clone(),
            status: "online".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            active_projects: self.active_projects().await,
        }
    }
}
