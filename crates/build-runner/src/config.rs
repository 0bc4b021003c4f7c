//! Runner configuration: explicit option, then environment, then default

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use agent_runner::AgentKind;

use crate::error::{Result, RunnerError};

pub const DEFAULT_BROKER_URL: &str = "ws://localhost:4000/ws/runner";
pub const DEFAULT_SHARED_SECRET: &str = "dev-secret";
pub const DEFAULT_RUNNER_ID: &str = "local";
pub const DEFAULT_WORKSPACE_ROOT: &str = "./workspace";
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 15_000;
pub const DEFAULT_API_URL: &str = "http://localhost:3000";

/// Command-line options; every field falls back to the environment
#[derive(Debug, Clone, Default, Parser)]
#[command(name = "runner", about = "Build runner worker agent")]
pub struct RunnerOptions {
    /// Broker WebSocket URL
    #[arg(long)]
    pub broker_url: Option<String>,

    /// Shared secret sent as a bearer token
    #[arg(long)]
    pub shared_secret: Option<String>,

    #[arg(long)]
    pub runner_id: Option<String>,

    /// Directory holding one sub-directory per project
    #[arg(long)]
    pub workspace_root: Option<PathBuf>,

    #[arg(long)]
    pub heartbeat_interval_ms: Option<u64>,

    /// Control-plane HTTP base URL
    #[arg(long)]
    pub api_url: Option<String>,

    /// Default agent backend (claude-code or openai-codex)
    #[arg(long)]
    pub agent: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub broker_url: String,
    pub shared_secret: String,
    pub runner_id: String,
    pub workspace_root: PathBuf,
    pub heartbeat_interval: Duration,
    pub api_url: String,
    pub default_agent: AgentKind,
}

fn pick(option: Option<String>, env: &impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    option
        .filter(|v| !v.trim().is_empty())
        .or_else(|| env(name).filter(|v| !v.trim().is_empty()))
        .unwrap_or_else(|| default.to_string())
}

impl RunnerConfig {
    /// Resolve from options and the process environment
    pub fn from_options(options: RunnerOptions) -> Result<Self> {
        Self::resolve(options, |name| std::env::var(name).ok())
    }

    pub fn resolve(options: RunnerOptions, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let heartbeat_ms = match options.heartbeat_interval_ms {
            Some(ms) => ms,
            None => match env("RUNNER_HEARTBEAT_INTERVAL_MS") {
                Some(raw) => raw.trim().parse::<u64>().map_err(|_| {
                    RunnerError::InvalidConfig(format!("RUNNER_HEARTBEAT_INTERVAL_MS is not a number: {}", raw))
                })?,
                None => DEFAULT_HEARTBEAT_INTERVAL_MS,
            },
        };
        if heartbeat_ms == 0 {
            return Err(RunnerError::InvalidConfig("heartbeat interval must be positive".into()));
        }

        let agent = pick(options.agent, &env, "RUNNER_AGENT", AgentKind::ClaudeCode.as_str());
        let default_agent = AgentKind::parse(&agent)?;

        let workspace_root = options
            .workspace_root
            .or_else(|| env("WORKSPACE_ROOT").filter(|v| !v.trim().is_empty()).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKSPACE_ROOT));

        Ok(Self {
            broker_url: pick(options.broker_url, &env, "RUNNER_BROKER_URL", DEFAULT_BROKER_URL),
            shared_secret: pick(options.shared_secret, &env, "RUNNER_SHARED_SECRET", DEFAULT_SHARED_SECRET),
            runner_id: pick(options.runner_id, &env, "RUNNER_ID", DEFAULT_RUNNER_ID),
            workspace_root,
            heartbeat_interval: Duration::from_millis(heartbeat_ms),
            api_url: pick(options.api_url, &env, "RUNNER_API_URL", DEFAULT_API_URL)
                .trim_end_matches('/')
                .to_string(),
            default_agent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = RunnerConfig::resolve(RunnerOptions::default(), env_of(&[])).unwrap();
        assert_eq!(config.broker_url, DEFAULT_BROKER_URL);
        assert_eq!(config.runner_id, DEFAULT_RUNNER_ID);
        assert_eq!(config.workspace_root, PathBuf::from(DEFAULT_WORKSPACE_ROOT));
        assert_eq!(config.heartbeat_interval, Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS));
        assert_eq!(config.default_agent, AgentKind::ClaudeCode);
    }

    #[test]
    fn test_option_beats_env_beats_default() {
        let env = env_of(&[
            ("RUNNER_ID", "from-env"),
            ("RUNNER_SHARED_SECRET", "env-secret"),
            ("RUNNER_HEARTBEAT_INTERVAL_MS", "5000"),
            ("RUNNER_API_URL", "https://api.example.com/"),
        ]);
        let options = RunnerOptions {
            runner_id: Some("from-option".to_string()),
            ..Default::default()
        };

        let config = RunnerConfig::resolve(options, env).unwrap();
        assert_eq!(config.runner_id, "from-option");
        assert_eq!(config.shared_secret, "env-secret");
        assert_eq!(config.heartbeat_interval, Duration::from_millis(5000));
        assert_eq!(config.api_url, "https://api.example.com");
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let bad_interval = RunnerConfig::resolve(
            RunnerOptions::default(),
            env_of(&[("RUNNER_HEARTBEAT_INTERVAL_MS", "soon")]),
        );
        assert!(bad_interval.is_err());

        let bad_agent = RunnerConfig::resolve(
            RunnerOptions {
                agent: Some("gemini".to_string()),
                ..Default::default()
            },
            env_of(&[]),
        );
        assert!(bad_agent.is_err());
    }
}
