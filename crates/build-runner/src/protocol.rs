//! Broker wire protocol: inbound commands, outbound events

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Result, RunnerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandType {
    StartBuild,
    StartDevServer,
    StopDevServer,
    StartTunnel,
    StopTunnel,
    FetchLogs,
    RunnerHealthCheck,
    DeleteProjectFiles,
    ReadFile,
    WriteFile,
    ListFiles,
    #[serde(other)]
    Unknown,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StartBuild => "start-build",
            Self::StartDevServer => "start-dev-server",
            Self::StopDevServer => "stop-dev-server",
            Self::StartTunnel => "start-tunnel",
            Self::StopTunnel => "stop-tunnel",
            Self::FetchLogs => "fetch-logs",
            Self::RunnerHealthCheck => "runner-health-check",
            Self::DeleteProjectFiles => "delete-project-files",
            Self::ReadFile => "read-file",
            Self::WriteFile => "write-file",
            Self::ListFiles => "list-files",
            Self::Unknown => "unknown",
        }
    }
}

/// Command sent from the broker to this runner
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: String,
    #[serde(rename = "type")]
    pub command_type: CommandType,
    #[serde(default)]
    pub project_id: String,
    /// Broker send time, as an RFC 3339 string or epoch milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<serde_json::Value>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Command {
    /// Decode the payload into the shape this command type expects
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        let value = if self.payload.is_null() {
            serde_json::Value::Object(Default::default())
        } else {
            self.payload.clone()
        };
        serde_json::from_value(value)
            .map_err(|e| RunnerError::invalid_payload(self.command_type.as_str(), e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartBuildPayload {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_slug: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartDevServerPayload {
    pub run_command: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_slug: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchLogsPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadFilePayload {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_slug: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileEncoding {
    #[default]
    Utf8,
    Base64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteFilePayload {
    pub path: String,
    pub content: String,
    #[serde(default)]
    pub encoding: FileEncoding,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_slug: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFilesPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_slug: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteProjectFilesPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_slug: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    /// Relative to the project root, `/` separated
    pub path: String,
    pub is_dir: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Event payloads, tagged by wire type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum EventKind {
    Ack,
    RunnerStatus {
        runner_id: String,
        status: String,
        version: String,
        uptime_seconds: u64,
        active_projects: Vec<String>,
    },
    RunnerHeartbeat {
        runner_id: String,
    },
    BuildStream {
        data: String,
    },
    BuildMetadata {
        run_command: String,
    },
    BuildCompleted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
    },
    BuildFailed {
        error: String,
    },
    LogChunk {
        stream: LogStream,
        data: String,
    },
    PortDetected {
        port: u16,
    },
    ProcessExited {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    TunnelCreated {
        port: u16,
        url: String,
    },
    TunnelClosed {
        port: u16,
    },
    Logs {
        lines: Vec<String>,
    },
    FileContent {
        path: String,
        content: String,
        encoding: FileEncoding,
    },
    FileWritten {
        path: String,
        bytes: usize,
    },
    FileList {
        path: String,
        entries: Vec<FileEntry>,
    },
    FilesDeleted {
        path: String,
    },
    Error {
        error: String,
    },
}

/// Event sent from this runner to the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(flatten)]
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Event not tied to any command
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            command_id: None,
            project_id: None,
            timestamp: Utc::now(),
        }
    }

    /// Event correlated with `command`
    pub fn reply(command: &Command, kind: EventKind) -> Self {
        Self::for_project(&command.project_id, kind).with_command(&command.id)
    }

    pub fn for_project(project_id: &str, kind: EventKind) -> Self {
        let mut event = Self::new(kind);
        if !project_id.is_empty() {
            event.project_id = Some(project_id.to_string());
        }
        event
    }

    pub fn with_command(mut self, command_id: &str) -> Self {
        self.command_id = Some(command_id.to_string());
        self
    }

    pub fn ack(command: &Command) -> Self {
        Self::reply(command, EventKind::Ack)
    }

    pub fn error(command: &Command, error: impl Into<String>) -> Self {
        Self::reply(command, EventKind::Error { error: error.into() })
    }

    pub fn type_name(&self) -> &'static str {
        match &self.kind {
            EventKind::Ack => "ack",
            EventKind::RunnerStatus { .. } => "runner-status",
            EventKind::RunnerHeartbeat { .. } => "runner-heartbeat",
            EventKind::BuildStream { .. } => "build-stream",
            EventKind::BuildMetadata { .. } => "build-metadata",
            EventKind::BuildCompleted { .. } => "build-completed",
            EventKind::BuildFailed { .. } => "build-failed",
            EventKind::LogChunk { .. } => "log-chunk",
            EventKind::PortDetected { .. } => "port-detected",
            EventKind::ProcessExited { .. } => "process-exited",
            EventKind::TunnelCreated { .. } => "tunnel-created",
            EventKind::TunnelClosed { .. } => "tunnel-closed",
            EventKind::Logs { .. } => "logs",
            EventKind::FileContent { .. } => "file-content",
            EventKind::FileWritten { .. } => "file-written",
            EventKind::FileList { .. } => "file-list",
            EventKind::FilesDeleted { .. } => "files-deleted",
            EventKind::Error { .. } => "error",
        }
    }
}
