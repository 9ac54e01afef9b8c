//! One-shot update command: `uplift update <repository>`.

use std::sync::Arc;

use anyhow::{Context, Result};
use console::style;
use tokio::task::JoinHandle;

use uplift::config::UpliftConfig;
use uplift::update::db::{DbHandle, StatusDb};
use uplift::update::dispatcher::truncate_preview;
use uplift::update::github::parse_owner_repo_from_url;
use uplift::update::hub::StatusHub;
use uplift::update::models::{StatusKind, UpdateRequest};
use uplift::update::pipeline::UpdatePipeline;

/// Wait for the progress printer. A panicked printer is logged, never fatal;
/// returns whether it finished cleanly.
async fn join_printer(printer: JoinHandle<()>) -> bool {
    match printer.await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("progress printer task failed: {}", e);
            false
        }
    }
}

pub async fn cmd_update(
    config: &UpliftConfig,
    repository: String,
    owner: Option<String>,
    name: Option<String>,
    open: bool,
) -> Result<()> {
    let (owner, name) = match (owner, name) {
        (Some(owner), Some(name)) => (owner, name),
        (owner, name) => {
            let (parsed_owner, parsed_name) = parse_owner_repo_from_url(&repository)
                .context("Cannot infer owner/name from the repository URL; pass --owner and --name")?;
            (owner.unwrap_or(parsed_owner), name.unwrap_or(parsed_name))
        }
    };

    let db_path = &config.server.db_path;
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = DbHandle::new(StatusDb::new(db_path)?);
    let hub = StatusHub::new(Arc::new(db.clone()));
    let pipeline = UpdatePipeline::from_config(config, hub.clone(), db)?;

    let mut observer = hub.connect(Some("cli".to_string()));
    let printer = tokio::spawn(async move {
        while let Some(msg) = observer.recv().await {
            let event = msg.event;
            let label = match event.status {
                StatusKind::Done => style(event.status.as_str()).green().bold(),
                StatusKind::Failed => style(event.status.as_str()).red().bold(),
                StatusKind::Loading | StatusKind::Writing => style(event.status.as_str()).dim(),
                _ => style(event.status.as_str()).cyan(),
            };
            println!("{:>12} {}", label, event.message);
            if let Some(code) = event.code {
                let first_line = truncate_preview(code.lines().next().unwrap_or(""), 80);
                println!("{:>12} {}", "", style(first_line).dim());
            }
            if matches!(event.status, StatusKind::Done | StatusKind::Failed) {
                break;
            }
        }
    });

    let request = UpdateRequest {
        repository,
        repository_owner: owner,
        repository_name: name,
    };
    let result = pipeline.run(&request).await;
    join_printer(printer).await;

    let outcome = result?;
    println!();
    println!("{} {}", style("Pull request:").bold(), outcome.pr_url);
    println!("{} {}", style("Branch:").bold(), outcome.branch);
    println!("{} {}", style("Run:").bold(), outcome.run_id);
    for change in &outcome.changes {
        println!("  {} {}", style("M").green(), change.path);
    }
    for path in &outcome.skipped_paths {
        println!("  {} {} (not in repository)", style("S").yellow(), path);
    }
    if let Some(partial) = &outcome.partial {
        for path in &partial.failed_paths {
            println!("  {} {} (rewrite failed)", style("F").red(), path);
        }
    }

    if open {
        if let Err(e) = open::that(&outcome.pr_url) {
            tracing::warn!("failed to open browser: {}", e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_join_printer_reports_clean_exit() {
        assert!(join_printer(tokio::spawn(async {})).await);
    }

    #[tokio::test]
    async fn test_join_printer_survives_a_panicked_printer() {
        let printer = tokio::spawn(async { panic!("terminal went away") });
        assert!(!join_printer(printer).await);
    }
}
