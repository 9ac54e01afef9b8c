//! The update run: detect → dispatch → stage → publish.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use super::db::{DbHandle, StatusDb};
use super::detector::{ChangeDetector, CommandDetector, ensure_unique_paths};
use super::dispatcher::RewriteDispatcher;
use super::executor::{ChatCompletionExecutor, RewriteExecutor};
use super::github::{GitHubClient, PullRequestApi};
use super::hub::StatusHub;
use super::models::*;
use super::publisher::Publisher;
use crate::config::{PartialFailurePolicy, UpliftConfig};
use crate::errors::{PipelineError, PublicationError};

/// Tracks the stage of one run and rejects illegal transitions.
#[derive(Debug)]
pub struct RunStateMachine {
    stage: PipelineStage,
}

impl Default for RunStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStateMachine {
    pub fn new() -> Self {
        Self {
            stage: PipelineStage::Detecting,
        }
    }

    pub fn stage(&self) -> PipelineStage {
        self.stage
    }

    /// `FAILED` is reachable from every non-terminal stage; otherwise only
    /// the next stage on the success path is.
    pub fn can_transition(from: PipelineStage, to: PipelineStage) -> bool {
        if from.is_terminal() {
            return false;
        }
        to == PipelineStage::Failed || from.next() == Some(to)
    }

    pub fn transition(&mut self, to: PipelineStage) -> Result<(), PipelineError> {
        if !Self::can_transition(self.stage, to) {
            return Err(PipelineError::Internal {
                stage: self.stage,
                message: format!("illegal transition {} -> {}", self.stage, to),
            });
        }
        self.stage = to;
        Ok(())
    }
}

/// Message for the DONE event.
pub fn done_message(pr_url: &str, partial: Option<&PartialReport>) -> String {
    match partial {
        Some(report) => format!(
            "Pull request opened: {} ({} of {} rewrites failed)",
            pr_url, report.failed, report.total
        ),
        None => format!("Pull request opened: {}", pr_url),
    }
}

pub struct UpdatePipeline {
    detector: Arc<dyn ChangeDetector>,
    dispatcher: RewriteDispatcher,
    publisher: Publisher,
    hub: StatusHub,
    db: Option<DbHandle>,
    partial_failure: PartialFailurePolicy,
}

impl UpdatePipeline {
    pub fn new(
        config: &UpliftConfig,
        hub: StatusHub,
        detector: Arc<dyn ChangeDetector>,
        executor: Arc<dyn RewriteExecutor>,
        pr_api: Arc<dyn PullRequestApi>,
    ) -> Self {
        Self {
            detector,
            dispatcher: RewriteDispatcher::new(executor, hub.clone(), config.rewrite.preview_chars),
            publisher: Publisher::new(
                config.publish.clone(),
                config.github.token.clone(),
                pr_api,
                hub.clone(),
            ),
            hub,
            db: None,
            partial_failure: config.pipeline.partial_failure,
        }
    }

    /// Build the pipeline with the real detector, executor and GitHub client.
    pub fn from_config(config: &UpliftConfig, hub: StatusHub, db: DbHandle) -> anyhow::Result<Self> {
        let detector = CommandDetector::new(config.detector.command.clone())
            .with_timeout(Duration::from_secs(config.detector.timeout_secs));
        let executor = ChatCompletionExecutor::new(&config.rewrite)?;
        let github = GitHubClient::new(&config.github);
        Ok(Self::new(
            config,
            hub,
            Arc::new(detector),
            Arc::new(executor),
            Arc::new(github),
        )
        .with_db(db))
    }

    /// Record run state in `db` as the run progresses.
    pub fn with_db(mut self, db: DbHandle) -> Self {
        self.db = Some(db);
        self
    }

    /// Replace the publisher, e.g. to tune pull request backoff.
    pub fn with_publisher(mut self, publisher: Publisher) -> Self {
        self.publisher = publisher;
        self
    }

    /// Run state bookkeeping is best effort: a store failure is logged and
    /// never fails the run.
    async fn record<F, R>(&self, run_id: &str, f: F)
    where
        F: FnOnce(&StatusDb) -> anyhow::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let Some(db) = &self.db else {
            return;
        };
        if let Err(e) = db.call(f).await {
            warn!(run_id, "failed to record run state: {:#}", e);
        }
    }

    async fn advance(
        &self,
        run_id: &str,
        machine: &mut RunStateMachine,
        to: PipelineStage,
        message: String,
    ) -> Result<(), PipelineError> {
        machine.transition(to)?;
        self.hub
            .emit(run_id, StatusEvent::new(to.status_kind(), message));
        if !to.is_terminal() {
            let id = run_id.to_string();
            self.record(run_id, move |db| db.update_run_stage(&id, to))
                .await;
        }
        Ok(())
    }

    /// Execute one run to completion. Every event of the run is persisted
    /// before this returns.
    pub async fn run(&self, request: &UpdateRequest) -> Result<UpdateOutcome, PipelineError> {
        let run_id = uuid::Uuid::new_v4().to_string();
        info!(run_id = %run_id, repository = %request.repository, "update run started");

        let id = run_id.clone();
        let req = request.clone();
        self.record(&run_id, move |db| db.create_run(&id, &req)).await;

        let mut machine = RunStateMachine::new();
        self.hub.emit(
            &run_id,
            StatusEvent::new(
                StatusKind::Detecting,
                format!("Detecting outdated files in {}...", request.repository),
            ),
        );

        let result = self.execute(&run_id, &mut machine, request).await;

        match &result {
            Ok(outcome) => {
                let id = run_id.clone();
                let pr_url = outcome.pr_url.clone();
                self.record(&run_id, move |db| db.complete_run(&id, &pr_url))
                    .await;
                info!(run_id = %run_id, pr_url = %outcome.pr_url, "update run finished");
            }
            Err(e) => {
                if let Err(illegal) = machine.transition(PipelineStage::Failed) {
                    error!(run_id = %run_id, "{}", illegal);
                }
                self.hub
                    .emit(&run_id, StatusEvent::new(StatusKind::Failed, e.to_string()));
                if let PipelineError::Publication {
                    source:
                        PublicationError::PullRequest {
                            branch,
                            orphan_deleted: false,
                            ..
                        },
                    ..
                } = e
                {
                    let id = run_id.clone();
                    let branch = branch.clone();
                    self.record(&run_id, move |db| db.update_run_branch(&id, &branch))
                        .await;
                }
                let id = run_id.clone();
                let message = e.to_string();
                self.record(&run_id, move |db| db.fail_run(&id, &message))
                    .await;
                error!(run_id = %run_id, stage = %e.stage(), "update run failed: {}", e);
            }
        }

        self.hub.flush().await;
        result
    }

    async fn execute(
        &self,
        run_id: &str,
        machine: &mut RunStateMachine,
        request: &UpdateRequest,
    ) -> Result<UpdateOutcome, PipelineError> {
        // ── Detect ───────────────────────────────────────────────────
        let changes = self
            .detector
            .detect(&request.repository)
            .await
            .and_then(|changes| ensure_unique_paths(&changes).map(|_| changes))
            .map_err(|source| PipelineError::Detection {
                stage: PipelineStage::Detecting,
                source,
            })?;

        // ── Dispatch ─────────────────────────────────────────────────
        let total = changes.len();
        self.advance(
            run_id,
            machine,
            PipelineStage::Dispatching,
            format!("Rewriting {} files...", total),
        )
        .await?;
        let jobs = changes.into_iter().map(RewriteJob::from).collect();
        let results = self.dispatcher.dispatch(run_id, jobs).await;

        let (succeeded, failed): (Vec<_>, Vec<_>) =
            results.into_iter().partition(|r| r.succeeded);
        let failed_paths: Vec<String> = failed.into_iter().map(|r| r.path).collect();
        let id = run_id.to_string();
        let failed_count = failed_paths.len() as i64;
        self.record(run_id, move |db| {
            db.update_run_counts(&id, total as i64, failed_count)
        })
        .await;
        if !failed_paths.is_empty() {
            warn!(run_id, failed = failed_paths.len(), total, "some rewrites failed");
        }

        // ── Stage ────────────────────────────────────────────────────
        self.advance(
            run_id,
            machine,
            PipelineStage::Staging,
            format!("Staging {} rewritten files...", succeeded.len()),
        )
        .await?;
        let publication_request = PublicationRequest {
            results: succeeded,
            repository: request.repository.clone(),
            owner: request.repository_owner.clone(),
            name: request.repository_name.clone(),
        };
        let staged = self
            .publisher
            .stage(run_id, &publication_request)
            .await
            .map_err(|source| PipelineError::Publication {
                stage: PipelineStage::Staging,
                source,
            })?;

        // ── Publish ──────────────────────────────────────────────────
        self.advance(
            run_id,
            machine,
            PipelineStage::Publishing,
            "Publishing changes...".to_string(),
        )
        .await?;
        let publication = self
            .publisher
            .publish(
                run_id,
                &staged,
                &request.repository_owner,
                &request.repository_name,
            )
            .await
            .map_err(|source| PipelineError::Publication {
                stage: PipelineStage::Publishing,
                source,
            })?;
        let id = run_id.to_string();
        let branch = publication.branch.clone();
        self.record(run_id, move |db| db.update_run_branch(&id, &branch))
            .await;

        let partial = match self.partial_failure {
            PartialFailurePolicy::FlagPartial if !failed_paths.is_empty() => Some(PartialReport {
                failed: failed_paths.len(),
                total,
                failed_paths,
            }),
            _ => None,
        };

        let changes = publication_request
            .results
            .into_iter()
            .filter(|r| staged.written().contains(&r.path))
            .map(|r| AppliedChange {
                new_content: r.new_content.unwrap_or_default(),
                path: r.path,
                comments: r.comments,
            })
            .collect();

        self.advance(
            run_id,
            machine,
            PipelineStage::Done,
            done_message(&publication.pr_url, partial.as_ref()),
        )
        .await?;

        Ok(UpdateOutcome {
            run_id: run_id.to_string(),
            pr_url: publication.pr_url,
            branch: publication.branch,
            changes,
            skipped_paths: staged.skipped().to_vec(),
            partial,
        })
    }
}
