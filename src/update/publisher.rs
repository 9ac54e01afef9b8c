//! Staging and publication of rewritten files.
//!
//! `stage` clones the repository into `<staging_root>/<run_id>` and writes
//! the rewrites; `publish` branches, commits, pushes and opens the pull
//! request. All git2 work runs on the blocking pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use git2::{Cred, PushOptions, RemoteCallbacks, Repository, Signature};
use tracing::{debug, info, warn};

use super::detector::normalize_path;
use super::github::{NewPullRequest, PullRequestApi};
use super::hub::StatusHub;
use super::models::{PublicationRequest, StatusEvent, StatusKind};
use crate::config::{OrphanBranchPolicy, PublishConfig};
use crate::errors::PublicationError;

const DEFAULT_PR_BACKOFF: Duration = Duration::from_secs(2);

/// `<prefix><uuid-v4 hex>`. Never derived from content.
pub fn generate_branch_name(prefix: &str) -> String {
    format!("{}{}", prefix, uuid::Uuid::new_v4().simple())
}

fn auth_callbacks(token: Option<&str>) -> RemoteCallbacks<'_> {
    let mut callbacks = RemoteCallbacks::new();
    if let Some(token) = token {
        callbacks.credentials(move |_url, _username, _allowed| {
            Cred::userpass_plaintext("x-access-token", token)
        });
    }
    callbacks
}

/// Push one refspec to `origin`, surfacing per-ref rejections as errors.
fn push_refspec(repo_path: &Path, refspec: &str, token: Option<&str>) -> Result<(), String> {
    let repo = Repository::open(repo_path).map_err(|e| e.message().to_string())?;
    let mut remote = repo
        .find_remote("origin")
        .map_err(|e| e.message().to_string())?;

    let mut rejection: Option<String> = None;
    {
        let mut callbacks = auth_callbacks(token);
        callbacks.push_update_reference(|refname, status| {
            if let Some(msg) = status {
                rejection = Some(format!("{} rejected: {}", refname, msg));
            }
            Ok(())
        });
        let mut options = PushOptions::new();
        options.remote_callbacks(callbacks);
        remote
            .push(&[refspec], Some(&mut options))
            .map_err(|e| e.message().to_string())?;
    }
    match rejection {
        Some(msg) => Err(msg),
        None => Ok(()),
    }
}

/// Why `rel` cannot be overwritten inside `root`, if it cannot. Every
/// component is checked without following links: parents must be real
/// directories and the target a regular file.
async fn unwritable_reason(root: &Path, rel: &str) -> Option<&'static str> {
    let components: Vec<_> = Path::new(rel).components().collect();
    let mut current = root.to_path_buf();
    for (i, component) in components.iter().enumerate() {
        current.push(component);
        let Ok(meta) = tokio::fs::symlink_metadata(&current).await else {
            return Some("file does not exist in clone");
        };
        let file_type = meta.file_type();
        if file_type.is_symlink() {
            return Some("path goes through a symlink");
        }
        let last = i + 1 == components.len();
        if last && !file_type.is_file() {
            return Some("not a regular file");
        }
        if !last && !file_type.is_dir() {
            return Some("file does not exist in clone");
        }
    }
    None
}

/// A fresh clone with the rewrites written into it. The directory is
/// removed on drop unless staging is kept.
#[derive(Debug)]
pub struct StagedClone {
    path: PathBuf,
    written: Vec<String>,
    skipped: Vec<String>,
    keep: bool,
}

impl StagedClone {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Repo-relative paths that were overwritten, in request order.
    pub fn written(&self) -> &[String] {
        &self.written
    }

    /// Paths that were not present in the clone.
    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }
}

impl Drop for StagedClone {
    fn drop(&mut self) {
        if self.keep || !self.path.exists() {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            warn!(path = %self.path.display(), "failed to remove staging clone: {}", e);
        }
    }
}

/// Result of a successful publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub branch: String,
    pub pr_url: String,
}

pub struct Publisher {
    config: PublishConfig,
    token: Option<String>,
    pr_api: Arc<dyn PullRequestApi>,
    hub: StatusHub,
    pr_backoff: Duration,
}

impl Publisher {
    pub fn new(
        config: PublishConfig,
        token: Option<String>,
        pr_api: Arc<dyn PullRequestApi>,
        hub: StatusHub,
    ) -> Self {
        Self {
            config,
            token,
            pr_api,
            hub,
            pr_backoff: DEFAULT_PR_BACKOFF,
        }
    }

    /// Base delay between pull request attempts; attempt `n` waits `n * backoff`.
    pub fn with_pr_backoff(mut self, backoff: Duration) -> Self {
        self.pr_backoff = backoff;
        self
    }

    fn loading(&self, run_id: &str, message: impl Into<String>) {
        self.hub.emit(run_id, StatusEvent::new(StatusKind::Loading, message));
    }

    /// Steps 1-3: clone, open, write.
    pub async fn stage(
        &self,
        run_id: &str,
        request: &PublicationRequest,
    ) -> Result<StagedClone, PublicationError> {
        let dest = self.config.staging_root.join(run_id);

        self.loading(run_id, "Cloning repository...");
        let url = request.repository.clone();
        let clone_dest = dest.clone();
        let token = self.token.clone();
        tokio::task::spawn_blocking(move || clone_fresh(&url, &clone_dest, token.as_deref()))
            .await
            .map_err(|e| PublicationError::Task(e.to_string()))??;

        // From here on the directory is owned by the staged clone.
        let mut staged = StagedClone {
            path: dest,
            written: Vec::new(),
            skipped: Vec::new(),
            keep: self.config.keep_staging,
        };

        self.loading(run_id, "Loading repository...");
        let open_path = staged.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), PublicationError> {
            let repo = Repository::open(&open_path).map_err(PublicationError::Open)?;
            repo.find_remote("origin").map_err(PublicationError::Open)?;
            Ok(())
        })
        .await
        .map_err(|e| PublicationError::Task(e.to_string()))??;

        let rewrites: Vec<_> = request
            .results
            .iter()
            .filter(|r| r.succeeded)
            .filter_map(|r| r.new_content.as_ref().map(|c| (r.path.as_str(), c.as_str())))
            .collect();
        self.loading(run_id, format!("Writing {} files...", rewrites.len()));

        for (rel, content) in rewrites {
            let normalized = match normalize_path(rel, &staged.path) {
                Ok(normalized) => normalized,
                Err(_) => {
                    warn!(run_id, path = rel, "skipping path outside the repository");
                    staged.skipped.push(rel.to_string());
                    continue;
                }
            };
            if let Some(reason) = unwritable_reason(&staged.path, &normalized).await {
                warn!(run_id, path = rel, reason, "skipping rewrite");
                staged.skipped.push(rel.to_string());
                continue;
            }
            let full_path = staged.path.join(&normalized);
            tokio::fs::write(&full_path, content)
                .await
                .map_err(|source| PublicationError::Write {
                    path: rel.to_string(),
                    source,
                })?;
            staged.written.push(normalized);
        }

        debug!(
            run_id,
            written = staged.written.len(),
            skipped = staged.skipped.len(),
            "staging finished"
        );
        Ok(staged)
    }

    /// Steps 4-7: branch, commit, push, pull request.
    pub async fn publish(
        &self,
        run_id: &str,
        staged: &StagedClone,
        owner: &str,
        name: &str,
    ) -> Result<Publication, PublicationError> {
        self.loading(run_id, "Creating branches...");
        let branch = generate_branch_name(&self.config.branch_prefix);
        let repo_path = staged.path.clone();
        let new_branch = branch.clone();
        tokio::task::spawn_blocking(move || create_branch(&repo_path, &new_branch))
            .await
            .map_err(|e| PublicationError::Task(e.to_string()))??;

        self.loading(run_id, format!("Committing {} files...", staged.written.len()));
        let repo_path = staged.path.clone();
        let written = staged.written.clone();
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || commit_paths(&repo_path, &written, &config))
            .await
            .map_err(|e| PublicationError::Task(e.to_string()))??;
        info!(run_id, branch = %branch, files = staged.written.len(), "committed rewrites");

        self.loading(run_id, "Pushing branch...");
        let refspec = format!("refs/heads/{0}:refs/heads/{0}", branch);
        self.push(&staged.path, refspec)
            .await
            .map_err(|message| PublicationError::Push {
                branch: branch.clone(),
                message,
            })?;

        self.loading(run_id, "Opening pull request...");
        let request = NewPullRequest::for_branch(owner, name, &branch, &self.config.base_branch);
        let attempts = self.config.pr_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.pr_api.create_pull_request(&request).await {
                Ok(pr_url) => {
                    info!(run_id, branch = %branch, pr_url = %pr_url, "pull request opened");
                    return Ok(Publication { branch, pr_url });
                }
                Err(e) => {
                    warn!(run_id, attempt, attempts, "pull request attempt failed: {:#}", e);
                    last_error = format!("{:#}", e);
                    if attempt < attempts {
                        tokio::time::sleep(self.pr_backoff * attempt).await;
                    }
                }
            }
        }

        let orphan_deleted = match self.config.on_pr_failure {
            OrphanBranchPolicy::KeepBranch => false,
            OrphanBranchPolicy::DeleteBranch => {
                match self
                    .push(&staged.path, format!(":refs/heads/{}", branch))
                    .await
                {
                    Ok(()) => {
                        info!(run_id, branch = %branch, "deleted orphaned branch");
                        true
                    }
                    Err(e) => {
                        warn!(run_id, branch = %branch, "failed to delete orphaned branch: {}", e);
                        false
                    }
                }
            }
        };

        Err(PublicationError::PullRequest {
            branch,
            orphan_deleted,
            message: last_error,
        })
    }

    async fn push(&self, repo_path: &Path, refspec: String) -> Result<(), String> {
        let repo_path = repo_path.to_path_buf();
        let token = self.token.clone();
        tokio::task::spawn_blocking(move || push_refspec(&repo_path, &refspec, token.as_deref()))
            .await
            .map_err(|e| format!("push task failed: {}", e))?
    }
}

fn clone_fresh(url: &str, dest: &Path, token: Option<&str>) -> Result<(), PublicationError> {
    let clone_error = |message: String| PublicationError::Clone {
        url: url.to_string(),
        path: dest.to_path_buf(),
        message,
    };
    if dest.exists() {
        std::fs::remove_dir_all(dest).map_err(|e| clone_error(e.to_string()))?;
    }
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|e| clone_error(e.to_string()))?;
    }

    let mut fetch = git2::FetchOptions::new();
    fetch.remote_callbacks(auth_callbacks(token));
    git2::build::RepoBuilder::new()
        .fetch_options(fetch)
        .clone(url, dest)
        .map_err(|e| clone_error(e.message().to_string()))?;
    Ok(())
}

/// Create `branch` at HEAD and check it out.
fn create_branch(repo_path: &Path, branch: &str) -> Result<(), PublicationError> {
    let repo = Repository::open(repo_path).map_err(PublicationError::Open)?;
    let branch_error = |source: git2::Error| PublicationError::Branch {
        branch: branch.to_string(),
        source,
    };

    let head = repo
        .head()
        .and_then(|h| h.peel_to_commit())
        .map_err(branch_error)?;
    repo.branch(branch, &head, false).map_err(branch_error)?;
    repo.set_head(&format!("refs/heads/{}", branch))
        .map_err(branch_error)?;
    Ok(())
}

/// Stage exactly `written` and commit on top of HEAD.
fn commit_paths(
    repo_path: &Path,
    written: &[String],
    config: &PublishConfig,
) -> Result<(), PublicationError> {
    let repo = Repository::open(repo_path).map_err(PublicationError::Open)?;
    let head = repo
        .head()
        .and_then(|h| h.peel_to_commit())
        .map_err(PublicationError::Commit)?;

    let mut index = repo.index().map_err(PublicationError::Commit)?;
    for path in written {
        index
            .add_path(Path::new(path))
            .map_err(PublicationError::Commit)?;
    }
    index.write().map_err(PublicationError::Commit)?;
    let tree_id = index.write_tree().map_err(PublicationError::Commit)?;
    let tree = repo.find_tree(tree_id).map_err(PublicationError::Commit)?;
    let sig = Signature::now(&config.author_name, &config.author_email)
        .map_err(PublicationError::Commit)?;
    repo.commit(
        Some("HEAD"),
        &sig,
        &sig,
        &config.commit_message,
        &tree,
        &[&head],
    )
    .map_err(PublicationError::Commit)?;
    Ok(())
}
