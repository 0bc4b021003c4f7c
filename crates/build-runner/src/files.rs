//! Path-scoped file operations inside a project directory
//!
//! Every path is resolved lexically against the project root and rejected
//! before any I/O when it leaves that root.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::{debug, info, warn};

use crate::error::{Result, RunnerError};
use crate::protocol::{FileEncoding, FileEntry};

pub const MAX_READ_BYTES: u64 = 5 * 1024 * 1024;
const MAX_LIST_DEPTH: usize = 12;
const MAX_LIST_ENTRIES: usize = 5_000;
const SKIPPED_DIRS: &[&str] = &["node_modules", ".git", ".next", "target"];
pub const DELETE_RETRIES: u32 = 3;
const DELETE_RETRY_UNIT: Duration = Duration::from_millis(500);

/// Collapse `.` and `..` without touching the filesystem
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Resolves project directories under the workspace root
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `name` must be exactly one normal path component
    pub fn project(&self, name: &str) -> Result<ProjectDir> {
        let mut components = Path::new(name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(part)), None) if part == name => Ok(ProjectDir {
                root: normalize(&self.root.join(part)),
            }),
            _ => Err(RunnerError::InvalidProject(name.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProjectDir {
    root: PathBuf,
}

impl ProjectDir {
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `relative` under the root, rejecting escapes
    pub fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let resolved = normalize(&self.root.join(relative));
        if resolved.starts_with(&self.root) {
            Ok(resolved)
        } else {
            warn!("Rejected path outside project root: {}", relative);
            Err(RunnerError::PathEscapesRoot {
                path: PathBuf::from(relative),
            })
        }
    }

    fn display(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Text files come back as UTF-8, anything else as base64
    pub async fn read_file(&self, relative: &str) -> Result<(String, FileEncoding)> {
        let path = self.resolve(relative)?;
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RunnerError::FileNotFound { path: relative.into() })
            }
            Err(e) => return Err(e.into()),
        };
        if metadata.is_dir() {
            return Err(RunnerError::FileNotFound { path: relative.into() });
        }
        if metadata.len() > MAX_READ_BYTES {
            return Err(RunnerError::FileTooLarge {
                path: relative.into(),
                size: metadata.len(),
            });
        }

        let bytes = tokio::fs::read(&path).await?;
        Ok(match String::from_utf8(bytes) {
            Ok(text) => (text, FileEncoding::Utf8),
            Err(e) => (BASE64.encode(e.into_bytes()), FileEncoding::Base64),
        })
    }

    /// Returns the number of bytes written
    pub async fn write_file(&self, relative: &str, content: &str, encoding: FileEncoding) -> Result<usize> {
        let path = self.resolve(relative)?;
        if path == self.root {
            return Err(RunnerError::invalid_payload("write-file", "path names the project root"));
        }
        let bytes = match encoding {
            FileEncoding::Utf8 => content.as_bytes().to_vec(),
            FileEncoding::Base64 => BASE64
                .decode(content)
                .map_err(|e| RunnerError::invalid_payload("write-file", e.to_string()))?,
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &bytes).await?;
        debug!("Wrote {} bytes to {:?}", bytes.len(), path);
        Ok(bytes.len())
    }

    /// Recursive listing sorted by path, skipping dependency and VCS dirs
    pub async fn list_files(&self, relative: Option<&str>) -> Result<Vec<FileEntry>> {
        let start = self.resolve(relative.unwrap_or(""))?;
        if !tokio::fs::try_exists(&start).await? {
            return Err(RunnerError::FileNotFound {
                path: relative.unwrap_or("").into(),
            });
        }

        let mut entries = Vec::new();
        let mut pending = vec![(start, 0usize)];
        while let Some((dir, depth)) = pending.pop() {
            let mut reader = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = reader.next_entry().await? {
                let file_type = entry.file_type().await?;
                let name = entry.file_name();
                let path = entry.path();
                if file_type.is_dir() {
                    if SKIPPED_DIRS.iter().any(|skip| name == *skip) {
                        continue;
                    }
                    entries.push(FileEntry {
                        path: self.display(&path),
                        is_dir: true,
                        size: None,
                    });
                    if depth + 1 < MAX_LIST_DEPTH {
                        pending.push((path, depth + 1));
                    }
                } else {
                    let size = entry.metadata().await.ok().map(|m| m.len());
                    entries.push(FileEntry {
                        path: self.display(&path),
                        is_dir: false,
                        size,
                    });
                }
                if entries.len() >= MAX_LIST_ENTRIES {
                    warn!("Listing truncated at {} entries", MAX_LIST_ENTRIES);
                    entries.sort_by(|a, b| a.path.cmp(&b.path));
                    return Ok(entries);
                }
            }
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    /// Privileged delete first, then a forced recursive delete with retries
    pub async fn delete_all(&self) -> Result<()> {
        if !tokio::fs::try_exists(&self.root).await? {
            debug!("Project directory {:?} already gone", self.root);
            return Ok(());
        }

        let privileged = tokio::process::Command::new("sudo")
            .arg("-n")
            .arg("rm")
            .arg("-rf")
            .arg(&self.root)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await;
        match privileged {
            Ok(status) if status.success() => {
                if !tokio::fs::try_exists(&self.root).await? {
                    info!("Deleted {:?}", self.root);
                    return Ok(());
                }
            }
            Ok(status) => debug!("Privileged delete exited with {}", status),
            Err(e) => debug!("Privileged delete unavailable: {}", e),
        }

        let mut attempt = 1;
        loop {
            match tokio::fs::remove_dir_all(&self.root).await {
                Ok(()) => {
                    info!("Deleted {:?}", self.root);
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) if attempt < DELETE_RETRIES => {
                    warn!(attempt, "Delete of {:?} failed: {}, retrying", self.root, e);
                    tokio::time::sleep(DELETE_RETRY_UNIT * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
