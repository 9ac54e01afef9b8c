//! Typed error hierarchy for the update pipeline.
//!
//! Fatal errors abort a run and reach the caller wrapped in `PipelineError`:
//! - `DetectionError`: change detection failed, nothing was dispatched
//! - `PublicationError`: a staging or publication step failed
//!
//! Non-fatal errors are logged and only show up as an absence:
//! - `RewriteJobError`: one rewrite job failed, its file is left out
//! - `ObserverDeliveryError`: one observer missed a broadcast

use std::path::PathBuf;

use thiserror::Error;
use uplift_common::PipelineStage;

/// Errors from the change detector. Always fatal for the run.
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("No detector command configured (set [detector].command or UPLIFT_DETECTOR_COMMAND)")]
    NotConfigured,

    #[error("Failed to fetch repository {url}: {source}")]
    Clone {
        url: String,
        #[source]
        source: git2::Error,
    },

    #[error("Failed to prepare checkout directory: {0}")]
    Workspace(#[source] std::io::Error),

    #[error("Failed to spawn detector command '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Detector did not finish within {secs}s")]
    TimedOut { secs: u64 },

    #[error("Detector exited with {status}: {stderr}")]
    CommandFailed { status: String, stderr: String },

    #[error("Detector output is not a list of {{path, content}}: {0}")]
    InvalidOutput(#[source] serde_json::Error),

    #[error("Detector reported a path outside the repository: {path}")]
    InvalidPath { path: String },

    #[error("Detector reported {path} more than once")]
    DuplicatePath { path: String },
}

/// Errors from a single remote rewrite job. Never fatal for the run.
#[derive(Debug, Error)]
pub enum RewriteJobError {
    #[error("Rewrite request failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("Rewrite endpoint returned {code}: {body}")]
    Status { code: u16, body: String },

    #[error("Malformed rewrite response: {0}")]
    Malformed(String),
}

/// Errors from staging and publication. Fatal once raised.
#[derive(Debug, Error)]
pub enum PublicationError {
    #[error("Failed to clone {url} into {path}: {message}")]
    Clone {
        url: String,
        path: PathBuf,
        message: String,
    },

    #[error("Failed to open staging repository: {0}")]
    Open(#[source] git2::Error),

    #[error("Failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create branch {branch}: {source}")]
    Branch {
        branch: String,
        #[source]
        source: git2::Error,
    },

    #[error("Failed to commit staged files: {0}")]
    Commit(#[source] git2::Error),

    #[error("Failed to push {branch} to origin: {message}")]
    Push { branch: String, message: String },

    #[error("Failed to open pull request for {branch}: {message}")]
    PullRequest {
        branch: String,
        orphan_deleted: bool,
        message: String,
    },

    #[error("Git task panicked: {0}")]
    Task(String),
}

impl PublicationError {
    /// Name of the publication step that failed.
    pub fn step(&self) -> &'static str {
        match self {
            Self::Clone { .. } => "clone",
            Self::Open(_) => "open",
            Self::Write { .. } => "write",
            Self::Branch { .. } => "branch",
            Self::Commit(_) => "commit",
            Self::Push { .. } => "push",
            Self::PullRequest { .. } => "pull_request",
            Self::Task(_) => "task",
        }
    }
}

/// A broadcast could not reach one observer (closed connection).
#[derive(Debug, Error)]
#[error("Observer {observer_id} is closed")]
pub struct ObserverDeliveryError {
    pub observer_id: u64,
}

/// Fatal run failure, tagged with the stage it happened in.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{stage} failed: {source}")]
    Detection {
        stage: PipelineStage,
        #[source]
        source: DetectionError,
    },

    #[error("{stage} failed at {step}: {source}", step = .source.step())]
    Publication {
        stage: PipelineStage,
        #[source]
        source: PublicationError,
    },

    #[error("{stage} failed: {message}")]
    Internal {
        stage: PipelineStage,
        message: String,
    },
}

impl PipelineError {
    pub fn stage(&self) -> PipelineStage {
        match self {
            Self::Detection { stage, .. }
            | Self::Publication { stage, .. }
            | Self::Internal { stage, .. } => *stage,
        }
    }

    /// Short machine-readable error kind for API responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Detection { .. } => "detection_error",
            Self::Publication { .. } => "publication_error",
            Self::Internal { .. } => "internal_error",
        }
    }
}

/// Errors loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value for {key}: {message}")]
    Invalid { key: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_error_detection_carries_stage() {
        let err = PipelineError::Detection {
            stage: PipelineStage::Detecting,
            source: DetectionError::CommandFailed {
                status: "exit status: 2".to_string(),
                stderr: "repository not found".to_string(),
            },
        };
        assert_eq!(err.stage(), PipelineStage::Detecting);
        assert_eq!(err.kind(), "detection_error");
        let msg = err.to_string();
        assert!(msg.starts_with("detecting failed"));
        assert!(msg.contains("repository not found"));
    }

    #[test]
    fn pipeline_error_publication_names_step() {
        let err = PipelineError::Publication {
            stage: PipelineStage::Publishing,
            source: PublicationError::Push {
                branch: "uplift/abc".to_string(),
                message: "rejected".to_string(),
            },
        };
        assert_eq!(err.stage(), PipelineStage::Publishing);
        assert!(err.to_string().contains("failed at push"));
    }

    #[test]
    fn publication_error_steps_are_distinct() {
        let io = || std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let steps = [
            PublicationError::Clone {
                url: "u".into(),
                path: PathBuf::from("/tmp/x"),
                message: "m".into(),
            }
            .step(),
            PublicationError::Open(git2::Error::from_str("x")).step(),
            PublicationError::Write {
                path: "a".into(),
                source: io(),
            }
            .step(),
            PublicationError::Commit(git2::Error::from_str("x")).step(),
            PublicationError::PullRequest {
                branch: "b".into(),
                orphan_deleted: false,
                message: "m".into(),
            }
            .step(),
        ];
        let mut unique = steps.to_vec();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), steps.len());
    }

    #[test]
    fn detection_error_duplicate_path_is_matchable() {
        let err = DetectionError::DuplicatePath {
            path: "src/a.js".to_string(),
        };
        match &err {
            DetectionError::DuplicatePath { path } => assert_eq!(path, "src/a.js"),
            _ => panic!("Expected DuplicatePath variant"),
        }
    }
}
