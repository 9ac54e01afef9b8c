//! Run history command: `uplift history`.

use std::path::Path;

use anyhow::{Context, Result};
use console::style;

use uplift::update::db::StatusDb;
use uplift::update::models::PipelineStage;

pub fn cmd_history(db_path: &Path, run: Option<&str>, limit: i64) -> Result<()> {
    if !db_path.exists() {
        println!("No runs recorded yet ({} does not exist).", db_path.display());
        return Ok(());
    }
    let db = StatusDb::new(db_path).context("Failed to open status database")?;

    let Some(run_id) = run else {
        let runs = db.list_runs(limit)?;
        if runs.is_empty() {
            println!("No runs recorded yet.");
            return Ok(());
        }
        for run in runs {
            let stage = match run.stage {
                PipelineStage::Done => style(run.stage.as_str()).green(),
                PipelineStage::Failed => style(run.stage.as_str()).red(),
                _ => style(run.stage.as_str()).yellow(),
            };
            println!(
                "{}  {:<11} {}/{}  {}",
                style(&run.id).dim(),
                stage,
                run.owner,
                run.name,
                run.pr_url.as_deref().or(run.error.as_deref()).unwrap_or("")
            );
        }
        return Ok(());
    };

    let run = db
        .get_run(run_id)?
        .with_context(|| format!("Run {} not found", run_id))?;
    println!("{} {}", style("Run").bold(), run.id);
    println!("  repository: {}", run.repository);
    println!("  stage:      {}", run.stage);
    if let Some(branch) = &run.branch_name {
        println!("  branch:     {}", branch);
    }
    if let Some(pr_url) = &run.pr_url {
        println!("  pr:         {}", pr_url);
    }
    if let (Some(total), Some(failed)) = (run.total_changes, run.failed_changes) {
        println!("  rewrites:   {} ok, {} failed", total - failed, failed);
    }
    if let Some(error) = &run.error {
        println!("  error:      {}", style(error).red());
    }
    println!();
    for stored in db.list_events(run_id)? {
        println!(
            "{}  {:<11} {}",
            style(&stored.created_at).dim(),
            stored.event.status,
            stored.event.message
        );
    }
    Ok(())
}
