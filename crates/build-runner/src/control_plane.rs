//! Control-plane HTTP API: process registry and health reports

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, RunnerError};

pub const HTTP_RETRY_ATTEMPTS: u32 = 3;
pub const HTTP_RETRY_UNIT: Duration = Duration::from_secs(1);

/// A dev server the control plane believes is running
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredProcess {
    pub project_id: String,
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub runner_id: String,
    pub port: u16,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub checked_at: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ProcessList {
    Wrapped { processes: Vec<RegisteredProcess> },
    Bare(Vec<RegisteredProcess>),
}

#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn list_processes(&self, runner_id: &str) -> Result<Vec<RegisteredProcess>>;
    async fn report_health(&self, project_id: &str, report: &HealthReport) -> Result<()>;
    async fn unregister(&self, project_id: &str) -> Result<()>;
}

/// Retry `op` with linear backoff: attempt `n` failing waits `n * unit`
pub async fn with_retry<T, F, Fut>(label: &str, attempts: u32, unit: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                warn!(attempt, "{} failed: {}, retrying", label, e);
                tokio::time::sleep(unit * attempt).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

pub struct ControlPlaneClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
    retry_unit: Duration,
}

impl ControlPlaneClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            retry_unit: HTTP_RETRY_UNIT,
        }
    }

    #[cfg(test)]
    pub fn with_retry_unit(mut self, unit: Duration) -> Self {
        self.retry_unit = unit;
        self
    }

    fn process_url(&self, project_id: &str) -> String {
        format!(
            "{}/api/runner/processes/{}",
            self.base_url,
            urlencoding::encode(project_id)
        )
    }

    async fn check(resp: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        if resp.status().is_success() {
            Ok(resp)
        } else {
            Err(RunnerError::ControlPlane(format!("{}: HTTP {}", what, resp.status())))
        }
    }
}

#[async_trait]
impl ControlPlane for ControlPlaneClient {
    async fn list_processes(&self, runner_id: &str) -> Result<Vec<RegisteredProcess>> {
        let url = format!(
            "{}/api/runner/processes?runnerId={}",
            self.base_url,
            urlencoding::encode(runner_id)
        );
        with_retry("List processes", HTTP_RETRY_ATTEMPTS, self.retry_unit, || async {
            let resp = self.client.get(&url).bearer_auth(&self.token).send().await?;
            let list: ProcessList = Self::check(resp, "List processes").await?.json().await?;
            Ok(match list {
                ProcessList::Wrapped { processes } => processes,
                ProcessList::Bare(processes) => processes,
            })
        })
        .await
    }

    async fn report_health(&self, project_id: &str, report: &HealthReport) -> Result<()> {
        let url = format!("{}/health", self.process_url(project_id));
        with_retry("Report health", HTTP_RETRY_ATTEMPTS, self.retry_unit, || async {
            let resp = self
                .client
                .post(&url)
                .bearer_auth(&self.token)
                .json(report)
                .send()
                .await?;
            Self::check(resp, "Report health").await?;
            Ok(())
        })
        .await
    }

    async fn unregister(&self, project_id: &str) -> Result<()> {
        let url = self.process_url(project_id);
        with_retry("Unregister process", HTTP_RETRY_ATTEMPTS, self.retry_unit, || async {
            let resp = self.client.delete(&url).bearer_auth(&self.token).send().await?;
            Self::check(resp, "Unregister process").await?;
            debug!(project_id, "Process unregistered");
            Ok(())
        })
        .await
    }
}

impl HealthReport {
    pub fn new(runner_id: &str, port: u16, healthy: bool, consecutive_failures: u32) -> Self {
        Self {
            runner_id: runner_id.to_string(),
            port,
            healthy,
            consecutive_failures,
            checked_at: Utc::now().to_rfc3339(),
        }
    }
}
