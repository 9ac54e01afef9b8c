use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{Connection, params};

use super::hub::StatusStore;
use super::models::*;

/// Async-safe handle to the status database.
///
/// Wraps `StatusDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, keeping synchronous SQLite
/// I/O off the async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<StatusDb>>,
}

impl DbHandle {
    pub fn new(db: StatusDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&StatusDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

#[async_trait]
impl StatusStore for DbHandle {
    async fn append(&self, run_id: &str, event: &StatusEvent) -> Result<()> {
        let run_id = run_id.to_string();
        let event = event.clone();
        self.call(move |db| db.append_event(&run_id, &event).map(|_| ()))
            .await
    }
}

pub struct StatusDb {
    conn: Connection,
}

impl StatusDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")
            .context("Failed to configure database")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS update_runs (
                    id TEXT PRIMARY KEY,
                    repository TEXT NOT NULL,
                    owner TEXT NOT NULL,
                    name TEXT NOT NULL,
                    stage TEXT NOT NULL DEFAULT 'detecting',
                    branch_name TEXT,
                    pr_url TEXT,
                    error TEXT,
                    total_changes INTEGER,
                    failed_changes INTEGER,
                    started_at TEXT NOT NULL DEFAULT (datetime('now')),
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS status_events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id TEXT NOT NULL,
                    status TEXT NOT NULL,
                    message TEXT NOT NULL DEFAULT '',
                    code TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_status_events_run ON status_events(run_id, id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Status events ─────────────────────────────────────────────────

    /// Append one event. Events are never updated or deleted.
    pub fn append_event(&self, run_id: &str, event: &StatusEvent) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO status_events (run_id, status, message, code) VALUES (?1, ?2, ?3, ?4)",
                params![run_id, event.status.as_str(), event.message, event.code],
            )
            .context("Failed to insert status event")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// All events of one run, in emission order.
    pub fn list_events(&self, run_id: &str) -> Result<Vec<StoredEvent>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, run_id, status, message, code, created_at
                 FROM status_events WHERE run_id = ?1 ORDER BY id ASC",
            )
            .context("Failed to prepare list_events")?;
        let rows = stmt
            .query_map(params![run_id], EventRow::from_row)
            .context("Failed to query status events")?;
        rows.map(|row| row.context("Failed to read status_events row")?.into_stored_event())
            .collect()
    }

    /// The most recent `limit` events across all runs, oldest first.
    pub fn recent_events(&self, limit: i64) -> Result<Vec<StoredEvent>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, run_id, status, message, code, created_at FROM (
                     SELECT * FROM status_events ORDER BY id DESC LIMIT ?1
                 ) ORDER BY id ASC",
            )
            .context("Failed to prepare recent_events")?;
        let rows = stmt
            .query_map(params![limit], EventRow::from_row)
            .context("Failed to query recent status events")?;
        rows.map(|row| row.context("Failed to read status_events row")?.into_stored_event())
            .collect()
    }

    // ── Runs ──────────────────────────────────────────────────────────

    pub fn create_run(&self, id: &str, request: &UpdateRequest) -> Result<UpdateRun> {
        self.conn
            .execute(
                "INSERT INTO update_runs (id, repository, owner, name) VALUES (?1, ?2, ?3, ?4)",
                params![
                    id,
                    request.repository,
                    request.repository_owner,
                    request.repository_name
                ],
            )
            .context("Failed to insert update run")?;
        self.get_run(id)?.context("Update run not found after insert")
    }

    /// Record a stage transition. Terminal stages also set `completed_at`.
    pub fn update_run_stage(&self, id: &str, stage: PipelineStage) -> Result<UpdateRun> {
        if stage.is_terminal() {
            self.conn
                .execute(
                    "UPDATE update_runs SET stage = ?1, completed_at = datetime('now') WHERE id = ?2",
                    params![stage.as_str(), id],
                )
                .context("Failed to update run stage")?;
        } else {
            self.conn
                .execute(
                    "UPDATE update_runs SET stage = ?1 WHERE id = ?2",
                    params![stage.as_str(), id],
                )
                .context("Failed to update run stage")?;
        }
        self.get_run(id)?.context("Update run not found after stage update")
    }

    pub fn update_run_counts(&self, id: &str, total: i64, failed: i64) -> Result<UpdateRun> {
        self.conn
            .execute(
                "UPDATE update_runs SET total_changes = ?1, failed_changes = ?2 WHERE id = ?3",
                params![total, failed, id],
            )
            .context("Failed to update run counts")?;
        self.get_run(id)?.context("Update run not found after count update")
    }

    pub fn update_run_branch(&self, id: &str, branch_name: &str) -> Result<UpdateRun> {
        self.conn
            .execute(
                "UPDATE update_runs SET branch_name = ?1 WHERE id = ?2",
                params![branch_name, id],
            )
            .context("Failed to update run branch")?;
        self.get_run(id)?.context("Update run not found after branch update")
    }

    pub fn complete_run(&self, id: &str, pr_url: &str) -> Result<UpdateRun> {
        self.conn
            .execute(
                "UPDATE update_runs SET pr_url = ?1 WHERE id = ?2",
                params![pr_url, id],
            )
            .context("Failed to set run PR URL")?;
        self.update_run_stage(id, PipelineStage::Done)
    }

    pub fn fail_run(&self, id: &str, error: &str) -> Result<UpdateRun> {
        self.conn
            .execute(
                "UPDATE update_runs SET error = ?1 WHERE id = ?2",
                params![error, id],
            )
            .context("Failed to set run error")?;
        self.update_run_stage(id, PipelineStage::Failed)
    }

    pub fn get_run(&self, id: &str) -> Result<Option<UpdateRun>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, repository, owner, name, stage, branch_name, pr_url, error,
                        total_changes, failed_changes, started_at, completed_at
                 FROM update_runs WHERE id = ?1",
            )
            .context("Failed to prepare get_run")?;
        let mut rows = stmt
            .query_map(params![id], RunRow::from_row)
            .context("Failed to query update run")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read update_runs row")?.into_run()?)),
            None => Ok(None),
        }
    }

    /// Most recent runs first.
    pub fn list_runs(&self, limit: i64) -> Result<Vec<UpdateRun>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, repository, owner, name, stage, branch_name, pr_url, error,
                        total_changes, failed_changes, started_at, completed_at
                 FROM update_runs ORDER BY started_at DESC, rowid DESC LIMIT ?1",
            )
            .context("Failed to prepare list_runs")?;
        let rows = stmt
            .query_map(params![limit], RunRow::from_row)
            .context("Failed to query update runs")?;
        rows.map(|row| row.context("Failed to read update_runs row")?.into_run())
            .collect()
    }
}

/// Intermediate row struct for status_events.
struct EventRow {
    id: i64,
    run_id: String,
    status: String,
    message: String,
    code: Option<String>,
    created_at: String,
}

impl EventRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            run_id: row.get(1)?,
            status: row.get(2)?,
            message: row.get(3)?,
            code: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    fn into_stored_event(self) -> Result<StoredEvent> {
        let status = StatusKind::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse event status")?;
        Ok(StoredEvent {
            id: self.id,
            run_id: self.run_id,
            event: StatusEvent {
                status,
                message: self.message,
                code: self.code,
            },
            created_at: self.created_at,
        })
    }
}

/// Intermediate row struct for update_runs.
struct RunRow {
    id: String,
    repository: String,
    owner: String,
    name: String,
    stage: String,
    branch_name: Option<String>,
    pr_url: Option<String>,
    error: Option<String>,
    total_changes: Option<i64>,
    failed_changes: Option<i64>,
    started_at: String,
    completed_at: Option<String>,
}

impl RunRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            repository: row.get(1)?,
            owner: row.get(2)?,
            name: row.get(3)?,
            stage: row.get(4)?,
            branch_name: row.get(5)?,
            pr_url: row.get(6)?,
            error: row.get(7)?,
            total_changes: row.get(8)?,
            failed_changes: row.get(9)?,
            started_at: row.get(10)?,
            completed_at: row.get(11)?,
        })
    }

    fn into_run(self) -> Result<UpdateRun> {
        let stage = PipelineStage::from_str(&self.stage)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse run stage")?;
        Ok(UpdateRun {
            id: self.id,
            repository: self.repository,
            owner: self.owner,
            name: self.name,
            stage,
            branch_name: self.branch_name,
            pr_url: self.pr_url,
            error: self.error,
            total_changes: self.total_changes,
            failed_changes: self.failed_changes,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
