//! Execution history: in-memory ring buffer with optional SQLite backing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::persistence::HistoryDb;
use crate::tasks::ExecutionResult;

/// Per-task aggregate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStats {
    pub task_name: String,
    pub total_runs: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_failures: u32,
    pub last_run_at: Option<DateTime<Utc>>,
}

impl TaskStats {
    pub fn success_rate(&self) -> f64 {
        if self.total_runs == 0 {
            return 0.0;
        }
        f64::from(self.total_successes) / f64::from(self.total_runs)
    }
}

/// Scheduler health summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub total_runs: u32,
    pub success_rate: f64,
    /// Tasks at or above the consecutive-failure threshold.
    pub failing_tasks: Vec<TaskStats>,
    pub generated_at: DateTime<Utc>,
}

/// Append-only execution log with query and aggregation.
pub struct ExecutionHistoryStore {
    max_history: usize,
    records: Mutex<VecDeque<ExecutionResult>>,
    db: Option<Arc<HistoryDb>>,
}

impl ExecutionHistoryStore {
    pub fn new(max_history: usize) -> Self {
        Self {
            max_history: max_history.max(1),
            records: Mutex::new(VecDeque::new()),
            db: None,
        }
    }

    /// Also persist every record to SQLite.
    pub fn with_db(mut self, db: Arc<HistoryDb>) -> Self {
        self.db = Some(db);
        self
    }

    pub fn db(&self) -> Option<&Arc<HistoryDb>> {
        self.db.as_ref()
    }

    pub fn capacity(&self) -> usize {
        self.max_history
    }

    /// Append a result. Trimming happens under the same lock as the push.
    pub fn record(&self, result: &ExecutionResult) {
        {
            let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            records.push_back(result.clone());
            while records.len() > self.max_history {
                records.pop_front();
            }
        }
        if let Some(db) = &self.db
            && let Err(e) = db.save_execution(result)
        {
            tracing::warn!("⚠️ Failed to persist execution of '{}': {e}", result.task_name);
        }
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> VecDeque<ExecutionResult> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Up to `limit` most recent results in completion order (oldest first).
    pub fn recent(&self, limit: usize) -> Vec<ExecutionResult> {
        let records = self.snapshot();
        let skip = records.len().saturating_sub(limit);
        records.into_iter().skip(skip).collect()
    }

    /// Up to `limit` most recent results for one task, oldest first.
    pub fn for_task(&self, task_name: &str, limit: usize) -> Vec<ExecutionResult> {
        let mut matching: Vec<ExecutionResult> = self
            .snapshot()
            .into_iter()
            .rev()
            .filter(|r| r.task_name == task_name)
            .take(limit)
            .collect();
        matching.reverse();
        matching
    }

    /// Aggregate for one task. Uses the database when attached, otherwise
    /// whatever the ring buffer still holds.
    pub fn stats(&self, task_name: &str) -> Option<TaskStats> {
        if let Some(db) = &self.db {
            match db.task_stats(task_name) {
                Ok(stats) => return stats,
                Err(e) => tracing::warn!("⚠️ Falling back to in-memory stats: {e}"),
            }
        }
        let records = self.snapshot();
        Self::aggregate(task_name, records.iter().filter(|r| r.task_name == task_name))
    }

    pub fn success_rate(&self, task_name: &str) -> Option<f64> {
        self.stats(task_name).map(|s| s.success_rate())
    }

    fn all_stats(&self) -> Vec<TaskStats> {
        if let Some(db) = &self.db {
            match db.all_stats() {
                Ok(stats) => return stats,
                Err(e) => tracing::warn!("⚠️ Falling back to in-memory stats: {e}"),
            }
        }
        let records = self.snapshot();
        let mut names: Vec<&str> = records.iter().map(|r| r.task_name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        names
            .into_iter()
            .filter_map(|name| Self::aggregate(name, records.iter().filter(|r| r.task_name == name)))
            .collect()
    }

    fn aggregate<'a>(task_name: &str, results: impl Iterator<Item = &'a ExecutionResult>) -> Option<TaskStats> {
        let mut stats = TaskStats { task_name: task_name.to_string(), ..Default::default() };
        for result in results {
            stats.total_runs += 1;
            if result.success {
                stats.total_successes += 1;
                stats.consecutive_failures = 0;
            } else {
                stats.total_failures += 1;
                stats.consecutive_failures += 1;
            }
            stats.last_run_at = Some(result.end_time);
        }
        (stats.total_runs > 0).then_some(stats)
    }

    /// Summarize scheduler health; tasks with at least
    /// `failure_threshold` consecutive failures are listed as failing.
    pub fn health_report(&self, failure_threshold: u32) -> HealthReport {
        let stats = self.all_stats();
        let total_runs: u32 = stats.iter().map(|s| s.total_runs).sum();
        let total_successes: u32 = stats.iter().map(|s| s.total_successes).sum();
        let failing_tasks: Vec<TaskStats> = stats
            .into_iter()
            .filter(|s| s.consecutive_failures >= failure_threshold.max(1))
            .collect();
        HealthReport {
            healthy: failing_tasks.is_empty(),
            total_runs,
            success_rate: if total_runs == 0 {
                1.0
            } else {
                f64::from(total_successes) / f64::from(total_runs)
            },
            failing_tasks,
            generated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(task: &str, success: bool) -> ExecutionResult {
        let mut r = ExecutionResult::started(task);
        r.success = success;
        r.finish();
        r
    }

    #[test]
    fn test_ring_buffer_is_capped() {
        let store = ExecutionHistoryStore::new(3);
        for i in 0..5 {
            store.record(&result(&format!("t{i}"), true));
        }
        assert_eq!(store.len(), 3);
        let names: Vec<String> = store.recent(10).into_iter().map(|r| r.task_name).collect();
        assert_eq!(names, vec!["t2", "t3", "t4"]);
        assert_eq!(store.recent(1)[0].task_name, "t4");
    }

    #[test]
    fn test_concurrent_appends_never_exceed_capacity() {
        let store = Arc::new(ExecutionHistoryStore::new(10));
        let handles: Vec<_> = (0..8)
            .map(|n| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        store.record(&result(&format!("w{n}-{i}"), i % 2 == 0));
                        assert!(store.len() <= 10);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.len(), 10);
    }

    #[test]
    fn test_stats_from_memory() {
        let store = ExecutionHistoryStore::new(100);
        store.record(&result("a", true));
        store.record(&result("a", false));
        store.record(&result("a", false));
        store.record(&result("b", true));

        let stats = store.stats("a").unwrap();
        assert_eq!(stats.total_runs, 3);
        assert_eq!(stats.consecutive_failures, 2);
        assert!((store.success_rate("a").unwrap() - 1.0 / 3.0).abs() < 1e-9);
        assert!(store.stats("zzz").is_none());
        assert_eq!(store.for_task("a", 2).len(), 2);
    }

    #[test]
    fn test_health_report() {
        let store = ExecutionHistoryStore::new(100);
        assert!(store.health_report(3).healthy);
        for _ in 0..3 {
            store.record(&result("flaky", false));
        }
        store.record(&result("steady", true));
        let report = store.health_report(3);
        assert!(!report.healthy);
        assert_eq!(report.failing_tasks.len(), 1);
        assert_eq!(report.failing_tasks[0].task_name, "flaky");
        assert_eq!(report.total_runs, 4);
    }

    #[test]
    fn test_db_backed_stats_outlive_ring_buffer() {
        let db = Arc::new(HistoryDb::open_in_memory().unwrap());
        let store = ExecutionHistoryStore::new(2).with_db(db);
        for _ in 0..5 {
            store.record(&result("sync", true));
        }
        assert_eq!(store.len(), 2);
        assert_eq!(store.stats("sync").unwrap().total_runs, 5);
    }
}
