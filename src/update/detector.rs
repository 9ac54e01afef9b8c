//! Change detection: which files of a repository need rewriting.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::models::CodeChange;
use crate::errors::DetectionError;

const DEFAULT_DETECT_TIMEOUT: Duration = Duration::from_secs(300);

#[async_trait]
pub trait ChangeDetector: Send + Sync {
    /// Return the candidate files of `repository_url`. Either the full list
    /// or an error; there is no partial detection.
    async fn detect(&self, repository_url: &str) -> Result<Vec<CodeChange>, DetectionError>;
}

/// Reject a change list that names the same path twice.
pub fn ensure_unique_paths(changes: &[CodeChange]) -> Result<(), DetectionError> {
    let mut seen = HashSet::new();
    for change in changes {
        if !seen.insert(change.path.as_str()) {
            return Err(DetectionError::DuplicatePath {
                path: change.path.clone(),
            });
        }
    }
    Ok(())
}

/// Turn a detector-reported path into a `/`-separated path relative to
/// `root`. Absolute paths must live under `root`.
pub fn normalize_path(raw: &str, root: &Path) -> Result<String, DetectionError> {
    let invalid = || DetectionError::InvalidPath {
        path: raw.to_string(),
    };
    let path = Path::new(raw);
    let relative = if path.is_absolute() {
        let canonical_root = root.canonicalize().ok();
        path.strip_prefix(root)
            .ok()
            .or_else(|| canonical_root.as_deref().and_then(|r| path.strip_prefix(r).ok()))
            .ok_or_else(invalid)?
    } else {
        path
    };

    let mut parts: Vec<String> = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop().ok_or_else(invalid)?;
            }
            Component::RootDir | Component::Prefix(_) => return Err(invalid()),
        }
    }
    if parts.is_empty() {
        return Err(invalid());
    }
    Ok(parts.join("/"))
}

#[derive(Deserialize)]
struct DetectedFile {
    path: String,
    content: String,
}

/// Parse detector stdout (`[{path, content}]`) into normalized changes.
pub fn parse_detector_output(stdout: &[u8], root: &Path) -> Result<Vec<CodeChange>, DetectionError> {
    let files: Vec<DetectedFile> =
        serde_json::from_slice(stdout).map_err(DetectionError::InvalidOutput)?;
    let changes = files
        .into_iter()
        .map(|file| {
            Ok(CodeChange {
                path: normalize_path(&file.path, root)?,
                content: file.content,
            })
        })
        .collect::<Result<Vec<_>, DetectionError>>()?;
    ensure_unique_paths(&changes)?;
    Ok(changes)
}

/// Removes the checkout directory when dropped.
struct Checkout(PathBuf);

impl Drop for Checkout {
    fn drop(&mut self) {
        if self.0.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.0) {
                debug!(path = %self.0.display(), "failed to remove detector checkout: {}", e);
            }
        }
    }
}

/// Runs an external detector program against a fresh checkout.
///
/// The repository is cloned into a private directory and the configured
/// argv is run with the checkout path appended as the last argument. The
/// program must print a JSON array of `{path, content}` objects on stdout.
pub struct CommandDetector {
    command: Vec<String>,
    work_root: PathBuf,
    timeout: Duration,
}

impl CommandDetector {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            work_root: std::env::temp_dir(),
            timeout: DEFAULT_DETECT_TIMEOUT,
        }
    }

    /// Kill the detector if it runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Place checkouts under `dir` instead of the system temp directory.
    pub fn with_work_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_root = dir.into();
        self
    }

    async fn clone_into(&self, url: &str, dest: &Path) -> Result<(), DetectionError> {
        let url = url.to_string();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || {
            git2::Repository::clone(&url, &dest)
                .map(|_| ())
                .map_err(|source| DetectionError::Clone { url, source })
        })
        .await
        .map_err(|e| DetectionError::Workspace(std::io::Error::other(format!("clone task failed: {}", e))))?
    }
}

#[async_trait]
impl ChangeDetector for CommandDetector {
    async fn detect(&self, repository_url: &str) -> Result<Vec<CodeChange>, DetectionError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or(DetectionError::NotConfigured)?;

        std::fs::create_dir_all(&self.work_root).map_err(DetectionError::Workspace)?;
        let checkout = Checkout(
            self.work_root
                .join(format!("uplift-detect-{}", uuid::Uuid::new_v4().simple())),
        );

        debug!(url = repository_url, path = %checkout.0.display(), "cloning for detection");
        self.clone_into(repository_url, &checkout.0).await?;

        let run = Command::new(program)
            .args(args)
            .arg(&checkout.0)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| {
                warn!(url = repository_url, "detector timed out");
                DetectionError::TimedOut {
                    secs: self.timeout.as_secs(),
                }
            })?
            .map_err(|source| DetectionError::Spawn {
                program: program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(DetectionError::CommandFailed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let changes = parse_detector_output(&output.stdout, &checkout.0)?;
        info!(url = repository_url, candidates = changes.len(), "detection finished");
        Ok(changes)
    }
}
