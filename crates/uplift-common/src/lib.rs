//! Shared domain types for the uplift update pipeline.
//!
//! These types cross every boundary of a run: the change detector produces
//! [`CodeChange`]s, the dispatcher turns them into [`RewriteJob`]s and
//! [`RewriteResult`]s, and every stage reports progress as [`StatusEvent`]s.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One candidate file needing modernization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeChange {
    /// Repository-relative path, `/`-separated.
    pub path: String,
    pub content: String,
}

/// Unit of work sent to a remote rewrite worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteJob {
    pub path: String,
    pub content: String,
}

impl From<CodeChange> for RewriteJob {
    fn from(change: CodeChange) -> Self {
        Self {
            path: change.path,
            content: change.content,
        }
    }
}

/// Outcome of one [`RewriteJob`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteResult {
    pub path: String,
    pub new_content: Option<String>,
    pub comments: Option<String>,
    pub succeeded: bool,
}

impl RewriteResult {
    pub fn success(path: impl Into<String>, new_content: String, comments: String) -> Self {
        Self {
            path: path.into(),
            new_content: Some(new_content),
            comments: Some(comments),
            succeeded: true,
        }
    }

    pub fn failure(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            new_content: None,
            comments: None,
            succeeded: false,
        }
    }
}

/// Kind of a progress notification, as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusKind {
    Detecting,
    Dispatching,
    Writing,
    Staging,
    Publishing,
    Done,
    Failed,
    /// Sub-step progress inside a stage; never a state transition.
    Loading,
}

impl StatusKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Detecting => "DETECTING",
            Self::Dispatching => "DISPATCHING",
            Self::Writing => "WRITING",
            Self::Staging => "STAGING",
            Self::Publishing => "PUBLISHING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
            Self::Loading => "LOADING",
        }
    }
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DETECTING" => Ok(Self::Detecting),
            "DISPATCHING" => Ok(Self::Dispatching),
            "WRITING" => Ok(Self::Writing),
            "STAGING" => Ok(Self::Staging),
            "PUBLISHING" => Ok(Self::Publishing),
            "DONE" => Ok(Self::Done),
            "FAILED" => Ok(Self::Failed),
            "LOADING" => Ok(Self::Loading),
            _ => Err(format!("Invalid status: {}", s)),
        }
    }
}

/// One progress notification. Created at each stage transition (and for
/// sub-step progress), broadcast immediately and persisted; never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub status: StatusKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl StatusEvent {
    pub fn new(status: StatusKind, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// State of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Detecting,
    Dispatching,
    Staging,
    Publishing,
    Done,
    Failed,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Detecting => "detecting",
            Self::Dispatching => "dispatching",
            Self::Staging => "staging",
            Self::Publishing => "publishing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// The only legal successor on the success path, if any.
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Detecting => Some(Self::Dispatching),
            Self::Dispatching => Some(Self::Staging),
            Self::Staging => Some(Self::Publishing),
            Self::Publishing => Some(Self::Done),
            Self::Done | Self::Failed => None,
        }
    }

    pub fn status_kind(&self) -> StatusKind {
        match self {
            Self::Detecting => StatusKind::Detecting,
            Self::Dispatching => StatusKind::Dispatching,
            Self::Staging => StatusKind::Staging,
            Self::Publishing => StatusKind::Publishing,
            Self::Done => StatusKind::Done,
            Self::Failed => StatusKind::Failed,
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "detecting" => Ok(Self::Detecting),
            "dispatching" => Ok(Self::Dispatching),
            "staging" => Ok(Self::Staging),
            "publishing" => Ok(Self::Publishing),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid pipeline stage: {}", s)),
        }
    }
}
