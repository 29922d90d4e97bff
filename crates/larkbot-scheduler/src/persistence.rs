//! SQLite-backed execution history.
//! Optional: without it history lives only in the in-memory ring buffer.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use larkbot_core::error::{LarkBotError, Result};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::history::TaskStats;
use crate::tasks::ExecutionResult;

/// One persisted execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRecord {
    pub id: i64,
    pub task_name: String,
    pub executed_at: DateTime<Utc>,
    pub success: bool,
    pub duration: Duration,
    pub error: Option<String>,
    pub actions_executed: u32,
    pub actions_failed: u32,
    pub timed_out: bool,
}

/// SQLite-backed history store.
pub struct HistoryDb {
    conn: Mutex<rusqlite::Connection>,
}

fn db_err(context: &str) -> impl Fn(rusqlite::Error) -> LarkBotError + '_ {
    move |e| LarkBotError::Database(format!("{context}: {e}"))
}

fn parse_time(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}

impl HistoryDb {
    /// Open or create the history database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = rusqlite::Connection::open(path).map_err(db_err("DB open"))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory().map_err(db_err("DB open"))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: rusqlite::Connection) -> Result<Self> {
        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    fn lock(&self) -> Result<MutexGuard<'_, rusqlite::Connection>> {
        self.conn
            .lock()
            .map_err(|_| LarkBotError::Database("history connection poisoned".into()))
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.lock()?
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS execution_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_name TEXT NOT NULL,
                executed_at TEXT NOT NULL,
                success INTEGER NOT NULL,
                duration REAL NOT NULL,
                error TEXT,
                actions_executed INTEGER NOT NULL DEFAULT 0,
                actions_failed INTEGER NOT NULL DEFAULT 0,
                timed_out INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_execution_task ON execution_records(task_name, executed_at);

            CREATE TABLE IF NOT EXISTS task_stats (
                task_name TEXT PRIMARY KEY,
                total_runs INTEGER NOT NULL DEFAULT 0,
                total_successes INTEGER NOT NULL DEFAULT 0,
                total_failures INTEGER NOT NULL DEFAULT 0,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                last_run_at TEXT
            );
         ",
            )
            .map_err(db_err("Migration"))
    }

    // ─── Writes ───────────────────────────────────────────────

    /// Append one execution and fold it into the per-task aggregate.
    pub fn save_execution(&self, result: &ExecutionResult) -> Result<i64> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err("Begin"))?;
        let executed_at = result.end_time.to_rfc3339();
        tx.execute(
            "INSERT INTO execution_records
             (task_name, executed_at, success, duration, error, actions_executed, actions_failed, timed_out)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                result.task_name,
                executed_at,
                result.success as i32,
                result.duration.as_secs_f64(),
                result.error,
                result.actions_executed,
                result.actions_failed,
                result.timed_out as i32,
            ],
        )
        .map_err(db_err("Save execution"))?;
        let id = tx.last_insert_rowid();

        tx.execute(
            "INSERT INTO task_stats
             (task_name, total_runs, total_successes, total_failures, consecutive_failures, last_run_at)
             VALUES (?1, 1, ?2, ?3, ?3, ?4)
             ON CONFLICT(task_name) DO UPDATE SET
                total_runs = total_runs + 1,
                total_successes = total_successes + excluded.total_successes,
                total_failures = total_failures + excluded.total_failures,
                consecutive_failures = CASE WHEN excluded.total_successes = 1
                    THEN 0 ELSE consecutive_failures + 1 END,
                last_run_at = excluded.last_run_at",
            rusqlite::params![
                result.task_name,
                result.success as i32,
                (!result.success) as i32,
                executed_at,
            ],
        )
        .map_err(db_err("Update stats"))?;
        tx.commit().map_err(db_err("Commit"))?;
        Ok(id)
    }

    /// Delete execution records older than `days`. Aggregates are kept.
    pub fn cleanup_older_than(&self, days: u32) -> Result<usize> {
        let cutoff = (Utc::now() - ChronoDuration::days(i64::from(days))).to_rfc3339();
        let removed = self
            .lock()?
            .execute("DELETE FROM execution_records WHERE executed_at < ?1", [cutoff])
            .map_err(db_err("Cleanup"))?;
        if removed > 0 {
            tracing::info!("🧹 Removed {removed} execution records older than {days} days");
        }
        Ok(removed)
    }

    // ─── Reads ────────────────────────────────────────────────

    /// Most recent executions, newest first, optionally for one task.
    pub fn recent_executions(&self, task_name: Option<&str>, limit: usize) -> Result<Vec<ExecutionRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, task_name, executed_at, success, duration, error,
                        actions_executed, actions_failed, timed_out
                 FROM execution_records
                 WHERE (?1 IS NULL OR task_name = ?1)
                 ORDER BY id DESC LIMIT ?2",
            )
            .map_err(db_err("Query executions"))?;
        let rows = stmt
            .query_map(rusqlite::params![task_name, limit as i64], |row| {
                Ok(ExecutionRecord {
                    id: row.get(0)?,
                    task_name: row.get(1)?,
                    executed_at: parse_time(&row.get::<_, String>(2)?),
                    success: row.get::<_, i32>(3)? != 0,
                    duration: Duration::from_secs_f64(row.get::<_, f64>(4)?.max(0.0)),
                    error: row.get(5)?,
                    actions_executed: row.get(6)?,
                    actions_failed: row.get(7)?,
                    timed_out: row.get::<_, i32>(8)? != 0,
                })
            })
            .map_err(db_err("Query executions"))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err("Read execution"))
    }

    pub fn task_stats(&self, task_name: &str) -> Result<Option<TaskStats>> {
        Ok(self
            .all_stats()?
            .into_iter()
            .find(|s| s.task_name == task_name))
    }

    /// Aggregates for every task that has run, by name.
    pub fn all_stats(&self) -> Result<Vec<TaskStats>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT task_name, total_runs, total_successes, total_failures,
                        consecutive_failures, last_run_at
                 FROM task_stats ORDER BY task_name",
            )
            .map_err(db_err("Query stats"))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(TaskStats {
                    task_name: row.get(0)?,
                    total_runs: row.get(1)?,
                    total_successes: row.get(2)?,
                    total_failures: row.get(3)?,
                    consecutive_failures: row.get(4)?,
                    last_run_at: row.get::<_, Option<String>>(5)?.map(|t| parse_time(&t)),
                })
            })
            .map_err(db_err("Query stats"))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err("Read stats"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(task: &str, success: bool) -> ExecutionResult {
        let mut r = ExecutionResult::started(task);
        r.success = success;
        r.actions_executed = 1;
        if !success {
            r.actions_failed = 1;
            r.error = Some("boom".into());
        }
        r.finish();
        r
    }

    #[test]
    fn test_open_and_migrate() {
        let dir = std::env::temp_dir().join("larkbot-history-db-test");
        let db = HistoryDb::open(&dir.join("history.db")).unwrap();
        assert!(db.all_stats().unwrap().is_empty());
        drop(db);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_save_and_aggregate() {
        let db = HistoryDb::open_in_memory().unwrap();
        db.save_execution(&result("sync", true)).unwrap();
        db.save_execution(&result("sync", false)).unwrap();
        db.save_execution(&result("sync", false)).unwrap();
        db.save_execution(&result("other", true)).unwrap();

        let stats = db.task_stats("sync").unwrap().unwrap();
        assert_eq!(stats.total_runs, 3);
        assert_eq!(stats.total_successes, 1);
        assert_eq!(stats.total_failures, 2);
        assert_eq!(stats.consecutive_failures, 2);
        assert!(stats.last_run_at.is_some());

        db.save_execution(&result("sync", true)).unwrap();
        assert_eq!(db.task_stats("sync").unwrap().unwrap().consecutive_failures, 0);
        assert!(db.task_stats("missing").unwrap().is_none());
    }

    #[test]
    fn test_recent_executions_filter() {
        let db = HistoryDb::open_in_memory().unwrap();
        db.save_execution(&result("a", true)).unwrap();
        db.save_execution(&result("b", false)).unwrap();
        db.save_execution(&result("a", false)).unwrap();

        let all = db.recent_executions(None, 10).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].task_name, "a");
        assert!(!all[0].success);

        let only_b = db.recent_executions(Some("b"), 10).unwrap();
        assert_eq!(only_b.len(), 1);
        assert_eq!(only_b[0].error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_cleanup_keeps_recent_rows() {
        let db = HistoryDb::open_in_memory().unwrap();
        db.save_execution(&result("a", true)).unwrap();
        assert_eq!(db.cleanup_older_than(30).unwrap(), 0);

        let mut old = result("a", true);
        old.end_time = Utc::now() - ChronoDuration::days(90);
        db.save_execution(&old).unwrap();
        assert_eq!(db.cleanup_older_than(30).unwrap(), 1);
        assert_eq!(db.recent_executions(Some("a"), 10).unwrap().len(), 1);
        assert_eq!(db.task_stats("a").unwrap().unwrap().total_runs, 2);
    }
}
