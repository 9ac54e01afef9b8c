//! Fan-out of rewrite jobs to the remote executor.

use std::sync::Arc;

use tracing::{debug, warn};

use super::executor::RewriteExecutor;
use super::hub::StatusHub;
use super::models::{RewriteJob, RewriteResult, StatusEvent, StatusKind};

/// Last `/`-separated segment of a repo-relative path.
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Truncate to at most `max_chars` characters, never splitting a char.
pub fn truncate_preview(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

pub struct RewriteDispatcher {
    executor: Arc<dyn RewriteExecutor>,
    hub: StatusHub,
    preview_chars: usize,
}

impl RewriteDispatcher {
    pub fn new(executor: Arc<dyn RewriteExecutor>, hub: StatusHub, preview_chars: usize) -> Self {
        Self {
            executor,
            hub,
            preview_chars,
        }
    }

    /// Run every job concurrently and return one result per job, in job
    /// order. A failed or panicked job yields a failed result; it never
    /// aborts its siblings.
    pub async fn dispatch(&self, run_id: &str, jobs: Vec<RewriteJob>) -> Vec<RewriteResult> {
        let mut handles = Vec::with_capacity(jobs.len());
        for job in jobs {
            let path = job.path.clone();
            let executor = Arc::clone(&self.executor);
            let hub = self.hub.clone();
            let run_id_owned = run_id.to_string();
            let preview_chars = self.preview_chars;

            let handle = tokio::spawn(async move {
                match executor.rewrite(&job).await {
                    Ok(report) => {
                        let preview = truncate_preview(&report.refactored_code, preview_chars);
                        hub.emit(
                            &run_id_owned,
                            StatusEvent::new(
                                StatusKind::Writing,
                                format!("Updating {}...", file_name(&job.path)),
                            )
                            .with_code(preview),
                        );
                        debug!(run_id = %run_id_owned, path = %job.path, "rewrite succeeded");
                        RewriteResult::success(
                            job.path,
                            report.refactored_code,
                            report.refactored_code_comments,
                        )
                    }
                    Err(e) => {
                        warn!(run_id = %run_id_owned, path = %job.path, "rewrite failed: {}", e);
                        RewriteResult::failure(job.path)
                    }
                }
            });
            handles.push((path, handle));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (path, handle) in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(join_err) => {
                    warn!(run_id, path = %path, "rewrite task panicked: {}", join_err);
                    results.push(RewriteResult::failure(path));
                }
            }
        }
        results
    }
}
