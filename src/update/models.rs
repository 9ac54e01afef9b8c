use serde::{Deserialize, Serialize};

pub use uplift_common::{
    CodeChange, PipelineStage, RewriteJob, RewriteResult, StatusEvent, StatusKind,
};

/// Control-surface input: one request to modernize one repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub repository: String,
    pub repository_owner: String,
    pub repository_name: String,
}

impl UpdateRequest {
    /// Returns the name of the first empty field, if any.
    pub fn missing_field(&self) -> Option<&'static str> {
        if self.repository.trim().is_empty() {
            Some("repository")
        } else if self.repository_owner.trim().is_empty() {
            Some("repository_owner")
        } else if self.repository_name.trim().is_empty() {
            Some("repository_name")
        } else {
            None
        }
    }
}

/// Input to the publisher: only successful rewrites, in dispatch order.
#[derive(Debug, Clone)]
pub struct PublicationRequest {
    pub results: Vec<RewriteResult>,
    pub repository: String,
    pub owner: String,
    pub name: String,
}

/// One applied rewrite as reported back to the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppliedChange {
    pub path: String,
    pub new_content: String,
    pub comments: Option<String>,
}

/// Rewrites lost to remote failures, reported when the run is configured to
/// flag partial completion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartialReport {
    pub failed: usize,
    pub total: usize,
    pub failed_paths: Vec<String>,
}

/// Successful run result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateOutcome {
    pub run_id: String,
    pub pr_url: String,
    pub branch: String,
    pub changes: Vec<AppliedChange>,
    pub skipped_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial: Option<PartialReport>,
}

/// A status event as stored, with its owning run and creation time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredEvent {
    pub id: i64,
    pub run_id: String,
    #[serde(flatten)]
    pub event: StatusEvent,
    pub created_at: String,
}

/// Persisted record of one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRun {
    pub id: String,
    pub repository: String,
    pub owner: String,
    pub name: String,
    pub stage: PipelineStage,
    pub branch_name: Option<String>,
    pub pr_url: Option<String>,
    pub error: Option<String>,
    pub total_changes: Option<i64>,
    pub failed_changes: Option<i64>,
    pub started_at: String,
    pub completed_at: Option<String>,
}
