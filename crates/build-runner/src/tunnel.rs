//! Public tunnels for verified dev-server ports

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, RunnerError};

const URL_TIMEOUT: Duration = Duration::from_secs(30);

/// Opens and closes a public URL for a local port
#[async_trait]
pub trait TunnelProvider: Send + Sync {
    /// Returns the public URL
    async fn open(&self, port: u16) -> Result<String>;
    async fn close(&self, port: u16) -> Result<()>;
}

/// Quick tunnels through the `cloudflared` CLI
pub struct CloudflaredTunnels {
    binary: String,
    url_pattern: Regex,
    tunnels: Mutex<HashMap<u16, Child>>,
}

impl CloudflaredTunnels {
    pub fn new() -> Result<Self> {
        Self::with_binary("cloudflared")
    }

    pub fn with_binary(binary: impl Into<String>) -> Result<Self> {
        let url_pattern = Regex::new(r"https://[a-z0-9-]+\.trycloudflare\.com")
            .map_err(|e| RunnerError::Tunnel(format!("url pattern: {}", e)))?;
        Ok(Self {
            binary: binary.into(),
            url_pattern,
            tunnels: Mutex::new(HashMap::new()),
        })
    }

    /// Scan the tunnel's log output for its public URL
    async fn read_url(&self, child: &mut Child) -> Result<String> {
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RunnerError::Tunnel("Failed to capture cloudflared output".into()))?;
        let mut lines = BufReader::new(stderr).lines();

        let scan = async {
            while let Some(line) = lines.next_line().await? {
                debug!("cloudflared: {}", line);
                if let Some(found) = self.url_pattern.find(&line) {
                    return Ok(Some(found.as_str().to_string()));
                }
            }
            Ok::<_, std::io::Error>(None)
        };

        let url = tokio::time::timeout(URL_TIMEOUT, scan)
            .await
            .map_err(|_| RunnerError::Tunnel(format!("no URL within {}s", URL_TIMEOUT.as_secs())))??
            .ok_or_else(|| RunnerError::Tunnel("cloudflared exited before printing a URL".into()))?;

        // Keep draining so the process never blocks on a full pipe
        tokio::spawn(async move { while let Ok(Some(_)) = lines.next_line().await {} });
        Ok(url)
    }
}

#[async_trait]
impl TunnelProvider for CloudflaredTunnels {
    async fn open(&self, port: u16) -> Result<String> {
        if let Some(mut previous) = self.tunnels.lock().await.remove(&port) {
            warn!(port, "Replacing existing tunnel");
            let _ = previous.kill().await;
        }

        let mut child = Command::new(&self.binary)
            .args(["tunnel", "--no-autoupdate", "--url"])
            .arg(format!("http://localhost:{}", port))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RunnerError::Tunnel(format!("Failed to spawn {}: {}", self.binary, e)))?;

        match self.read_url(&mut child).await {
            Ok(url) => {
                info!(port, "Tunnel open at {}", url);
                self.tunnels.lock().await.insert(port, child);
                Ok(url)
            }
            Err(e) => {
                let _ = child.kill().await;
                Err(e)
            }
        }
    }

    async fn close(&self, port: u16) -> Result<()> {
        match self.tunnels.lock().await.remove(&port) {
            Some(mut child) => {
                child.kill().await?;
                info!(port, "Tunnel closed");
                Ok(())
            }
            None => {
                debug!(port, "No tunnel to close");
                Ok(())
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn fake_cloudflared(dir: &TempDir, script: &str) -> String {
        let path = dir.path().join("cloudflared");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", script)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn test_open_parses_url_and_close_kills() {
        let dir = TempDir::new().unwrap();
        let binary = fake_cloudflared(
            &dir,
            "echo 'INF Requesting new quick Tunnel' >&2\necho 'INF |  https://calm-river-42.trycloudflare.com  |' >&2\nsleep 30",
        );
        let tunnels = CloudflaredTunnels::with_binary(binary).unwrap();

        let url = tunnels.open(5173).await.unwrap();
        assert_eq!(url, "https://calm-river-42.trycloudflare.com");
        assert!(tunnels.tunnels.lock().await.contains_key(&5173));

        tunnels.close(5173).await.unwrap();
        assert!(tunnels.tunnels.lock().await.is_empty());
        tunnels.close(5173).await.unwrap();
    }

    #[tokio::test]
    async fn test_exit_without_url_is_error() {
        let dir = TempDir::new().unwrap();
        let binary = fake_cloudflared(&dir, "echo 'ERR failed to connect' >&2\nexit 1");
        let tunnels = CloudflaredTunnels::with_binary(binary).unwrap();

        let err = tunnels.open(3000).await.unwrap_err();
        assert!(matches!(err, RunnerError::Tunnel(_)));
    }
}
