use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use crate::models::*;

/// Async-safe handle to the prefab database.
///
/// Wraps `PrefabDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<PrefabDb>>,
}

impl DbHandle {
    pub fn new(db: PrefabDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&PrefabDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct PrefabDb {
    conn: Connection,
}

impl PrefabDb {
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
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS credit_balances (
                    user_id TEXT NOT NULL,
                    credit_type TEXT NOT NULL,
                    balance INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY (user_id, credit_type)
                );

                CREATE TABLE IF NOT EXISTS usage_records (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    usage_type TEXT NOT NULL,
                    credit_type TEXT NOT NULL,
                    amount INTEGER NOT NULL,
                    details TEXT,
                    refunded INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS projects (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    prompt TEXT NOT NULL,
                    sandbox_id TEXT,
                    preview_url TEXT,
                    status TEXT NOT NULL DEFAULT 'generating',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS sessions (
                    id TEXT PRIMARY KEY,
                    prompt TEXT NOT NULL,
                    sandbox_id TEXT,
                    status TEXT NOT NULL DEFAULT 'running',
                    started_at TEXT NOT NULL DEFAULT (datetime('now')),
                    finished_at TEXT
                );
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Credits ──────────────────────────────────────────────────────

    /// Add credits to a user's balance, creating the row if absent.
    pub fn grant_credits(&self, user_id: &str, credit_type: CreditType, amount: i64) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO credit_balances (user_id, credit_type, balance)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (user_id, credit_type)
                 DO UPDATE SET balance = balance + ?3",
                params![user_id, credit_type.as_str(), amount],
            )
            .context("Failed to grant credits")?;
        Ok(())
    }

    pub fn get_balance(&self, user_id: &str, credit_type: CreditType) -> Result<i64> {
        let balance: Option<i64> = self
            .conn
            .query_row(
                "SELECT balance FROM credit_balances WHERE user_id = ?1 AND credit_type = ?2",
                params![user_id, credit_type.as_str()],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read balance")?;
        Ok(balance.unwrap_or(0))
    }

    /// Atomically check-and-decrement a balance and record the usage.
    ///
    /// The guard is the single `UPDATE ... WHERE balance >= amount`: SQLite
    /// serializes writers, so two racing requests at the floor cannot both
    /// pass. Returns `None` when the balance was insufficient.
    pub fn consume_credits(
        &self,
        user_id: &str,
        usage_type: UsageType,
        credit_type: CreditType,
        amount: i64,
        details: Option<&str>,
    ) -> Result<Option<UsageRecord>> {
        let updated = self
            .conn
            .execute(
                "UPDATE credit_balances
                 SET balance = balance - ?3
                 WHERE user_id = ?1 AND credit_type = ?2 AND balance >= ?3",
                params![user_id, credit_type.as_str(), amount],
            )
            .context("Failed to decrement balance")?;

        if updated == 0 {
            return Ok(None);
        }

        let id = uuid::Uuid::new_v4().to_string();
        self.conn
            .execute(
                "INSERT INTO usage_records (id, user_id, usage_type, credit_type, amount, details)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id,
                    user_id,
                    usage_type.as_str(),
                    credit_type.as_str(),
                    amount,
                    details
                ],
            )
            .context("Failed to record usage")?;

        self.get_usage_record(&id)?
            .context("Usage record vanished after insert")
            .map(Some)
    }

    pub fn get_usage_record(&self, id: &str) -> Result<Option<UsageRecord>> {
        self.conn
            .query_row(
                "SELECT id, user_id, usage_type, credit_type, amount, details, refunded, created_at
                 FROM usage_records WHERE id = ?1",
                params![id],
                Self::row_to_usage_record,
            )
            .optional()
            .context("Failed to read usage record")
    }

    /// Roll back a consumed ledger entry. Idempotent: a second refund of the
    /// same record is a no-op returning `false`.
    pub fn refund_usage(&self, usage_id: &str) -> Result<bool> {
        let Some(record) = self.get_usage_record(usage_id)? else {
            return Ok(false);
        };
        if record.refunded {
            return Ok(false);
        }

        self.conn
            .execute(
                "UPDATE usage_records SET refunded = 1 WHERE id = ?1 AND refunded = 0",
                params![usage_id],
            )
            .context("Failed to mark usage refunded")?;
        self.grant_credits(&record.user_id, record.credit_type, record.amount)?;
        Ok(true)
    }

    fn row_to_usage_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<UsageRecord> {
        let usage_type: String = row.get(2)?;
        let credit_type: String = row.get(3)?;
        Ok(UsageRecord {
            id: row.get(0)?,
            user_id: row.get(1)?,
            usage_type: UsageType::from_str(&usage_type).unwrap_or(UsageType::Generation),
            credit_type: CreditType::from_str(&credit_type).unwrap_or(CreditType::Message),
            amount: row.get(4)?,
            details: row.get(5)?,
            refunded: row.get::<_, i64>(6)? != 0,
            created_at: row.get(7)?,
        })
    }

    // ── Projects ─────────────────────────────────────────────────────

    pub fn create_project(&self, user_id: &str, name: &str, prompt: &str) -> Result<Project> {
        self.conn
            .execute(
                "INSERT INTO projects (user_id, name, prompt) VALUES (?1, ?2, ?3)",
                params![user_id, name, prompt],
            )
            .context("Failed to create project")?;
        let id = self.conn.last_insert_rowid();
        self.get_project(id)?
            .context("Project vanished after insert")
    }

    pub fn get_project(&self, id: i64) -> Result<Option<Project>> {
        self.conn
            .query_row(
                "SELECT id, user_id, name, prompt, sandbox_id, preview_url, status, created_at, updated_at
                 FROM projects WHERE id = ?1",
                params![id],
                Self::row_to_project,
            )
            .optional()
            .context("Failed to read project")
    }

    pub fn list_projects(&self, user_id: &str) -> Result<Vec<Project>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, name, prompt, sandbox_id, preview_url, status, created_at, updated_at
             FROM projects WHERE user_id = ?1 ORDER BY created_at DESC",
        )?;
        let projects = stmt
            .query_map(params![user_id], Self::row_to_project)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list projects")?;
        Ok(projects)
    }

    pub fn count_projects(&self, user_id: &str) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM projects WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .context("Failed to count projects")
    }

    /// Record the outcome of a generation run against a project.
    pub fn update_project_result(
        &self,
        id: i64,
        sandbox_id: Option<&str>,
        preview_url: Option<&str>,
        status: ProjectStatus,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE projects
                 SET sandbox_id = COALESCE(?2, sandbox_id),
                     preview_url = COALESCE(?3, preview_url),
                     status = ?4,
                     updated_at = datetime('now')
                 WHERE id = ?1",
                params![id, sandbox_id, preview_url, status.as_str()],
            )
            .context("Failed to update project result")?;
        Ok(())
    }

    fn row_to_project(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
        let status: String = row.get(6)?;
        Ok(Project {
            id: row.get(0)?,
            user_id: row.get(1)?,
            name: row.get(2)?,
            prompt: row.get(3)?,
            sandbox_id: row.get(4)?,
            preview_url: row.get(5)?,
            status: ProjectStatus::from_str(&status).unwrap_or(ProjectStatus::Generating),
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    // ── Sessions ─────────────────────────────────────────────────────

    pub fn create_session(&self, id: &str, prompt: &str, sandbox_id: Option<&str>) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sessions (id, prompt, sandbox_id) VALUES (?1, ?2, ?3)",
                params![id, prompt, sandbox_id],
            )
            .context("Failed to create session")?;
        Ok(())
    }

    pub fn finish_session(&self, id: &str, status: SessionStatus) -> Result<()> {
        self.conn
            .execute(
                "UPDATE sessions
                 SET status = ?2, finished_at = datetime('now')
                 WHERE id = ?1",
                params![id, status.as_str()],
            )
            .context("Failed to finish session")?;
        Ok(())
    }

    pub fn get_session(&self, id: &str) -> Result<Option<GenerationSession>> {
        self.conn
            .query_row(
                "SELECT id, prompt, sandbox_id, status, started_at, finished_at
                 FROM sessions WHERE id = ?1",
                params![id],
                |row| {
                    let status: String = row.get(3)?;
                    Ok(GenerationSession {
                        id: row.get(0)?,
                        prompt: row.get(1)?,
                        sandbox_id: row.get(2)?,
                        status: SessionStatus::from_str(&status).unwrap_or(SessionStatus::Running),
                        started_at: row.get(4)?,
                        finished_at: row.get(5)?,
                    })
                },
            )
            .optional()
            .context("Failed to read session")
    }
}
