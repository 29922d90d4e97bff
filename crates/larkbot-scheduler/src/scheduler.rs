//! In-process [`Scheduler`] on the tokio timer.
//!
//! One driver task per job sleeps until the next run time, spawns the job
//! body and computes the following run. Interval and one-shot date triggers
//! are supported; cron expressions are rejected.

use chrono::{DateTime, Utc};
use larkbot_core::error::{LarkBotError, Result};
use larkbot_core::traits::{JobFn, JobInfo, JobTrigger, Scheduler};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::AbortHandle;

#[derive(Debug, Clone, Copy)]
enum Plan {
    Every(Duration),
    Once(DateTime<Utc>),
}

impl Plan {
    fn from_trigger(trigger: &JobTrigger) -> Result<Self> {
        match trigger {
            JobTrigger::Interval { .. } => match trigger.period() {
                Some(period) if !period.is_zero() => Ok(Plan::Every(period)),
                _ => Err(LarkBotError::Scheduler("interval trigger needs a non-zero period".into())),
            },
            JobTrigger::Date { run_date } => Ok(Plan::Once(*run_date)),
            JobTrigger::Cron { .. } => Err(LarkBotError::Scheduler(
                "cron triggers are not supported by the built-in scheduler".into(),
            )),
        }
    }

    fn first_run(self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Plan::Every(period) => now + period,
            Plan::Once(at) => at,
        }
    }
}

#[derive(Debug)]
struct Timing {
    next_run: Option<DateTime<Utc>>,
    paused: bool,
}

struct JobState {
    timing: Mutex<Timing>,
    changed: Notify,
}

impl JobState {
    fn timing(&self) -> std::sync::MutexGuard<'_, Timing> {
        self.timing.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct JobEntry {
    plan: Plan,
    state: Arc<JobState>,
    driver: AbortHandle,
}

type JobTable = Mutex<HashMap<String, JobEntry>>;

pub struct TokioScheduler {
    jobs: Arc<JobTable>,
    runtime: Handle,
}

impl TokioScheduler {
    /// Scheduler on the current tokio runtime.
    pub fn new() -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| LarkBotError::Scheduler(format!("no tokio runtime available: {e}")))?;
        Ok(Self::with_handle(runtime))
    }

    pub fn with_handle(runtime: Handle) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            runtime,
        }
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<String, JobEntry>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn job_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.table().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stop every driver. Running job bodies finish on their own.
    pub fn shutdown(&self) {
        let mut jobs = self.table();
        for entry in jobs.values() {
            entry.driver.abort();
        }
        let count = jobs.len();
        jobs.clear();
        tracing::info!("🛑 Scheduler stopped ({count} jobs removed)");
    }

    fn set_paused(&self, job_id: &str, paused: bool) -> Result<()> {
        let jobs = self.table();
        let entry = jobs
            .get(job_id)
            .ok_or_else(|| LarkBotError::Scheduler(format!("Job '{job_id}' not found")))?;
        {
            let mut timing = entry.state.timing();
            timing.paused = paused;
            timing.next_run = if paused { None } else { Some(entry.plan.first_run(Utc::now())) };
        }
        entry.state.changed.notify_waiters();
        Ok(())
    }
}

async fn drive(job_id: String, job: JobFn, plan: Plan, state: Arc<JobState>, jobs: Weak<JobTable>) {
    loop {
        let changed = state.changed.notified();
        let next = state.timing().next_run;
        let Some(at) = next else {
            changed.await;
            continue;
        };

        let wait = (at - Utc::now()).to_std().unwrap_or_default();
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = changed => continue,
        }

        {
            let mut timing = state.timing();
            // Paused or rescheduled while sleeping.
            if timing.paused || timing.next_run != Some(at) {
                continue;
            }
            timing.next_run = match plan {
                Plan::Every(period) => Some((at + period).max(Utc::now())),
                Plan::Once(_) => None,
            };
        }

        tracing::debug!("⏰ Job '{job_id}' fired");
        tokio::spawn(job());

        if let Plan::Once(_) = plan {
            if let Some(jobs) = jobs.upgrade() {
                let mut table = jobs.lock().unwrap_or_else(|e| e.into_inner());
                if table.get(&job_id).is_some_and(|e| Arc::ptr_eq(&e.state, &state)) {
                    table.remove(&job_id);
                }
            }
            return;
        }
    }
}

impl Scheduler for TokioScheduler {
    fn add_job(&self, job: JobFn, trigger: JobTrigger, job_id: &str, replace_existing: bool) -> Result<String> {
        let plan = Plan::from_trigger(&trigger)?;
        let mut jobs = self.table();
        if let Some(existing) = jobs.get(job_id) {
            if !replace_existing {
                return Err(LarkBotError::Scheduler(format!("Job '{job_id}' already exists")));
            }
            existing.driver.abort();
        }

        let state = Arc::new(JobState {
            timing: Mutex::new(Timing {
                next_run: Some(plan.first_run(Utc::now())),
                paused: false,
            }),
            changed: Notify::new(),
        });
        let driver = self
            .runtime
            .spawn(drive(job_id.to_string(), job, plan, state.clone(), Arc::downgrade(&self.jobs)))
            .abort_handle();
        jobs.insert(job_id.to_string(), JobEntry { plan, state, driver });
        tracing::debug!("📅 Job '{job_id}' scheduled ({})", trigger.kind());
        Ok(job_id.to_string())
    }

    fn remove_job(&self, job_id: &str) -> Result<()> {
        let entry = self
            .table()
            .remove(job_id)
            .ok_or_else(|| LarkBotError::Scheduler(format!("Job '{job_id}' not found")))?;
        entry.driver.abort();
        Ok(())
    }

    fn get_job(&self, job_id: &str) -> Option<JobInfo> {
        let jobs = self.table();
        let entry = jobs.get(job_id)?;
        let timing = entry.state.timing();
        Some(JobInfo {
            id: job_id.to_string(),
            next_run_time: timing.next_run,
            paused: timing.paused,
        })
    }

    fn pause_job(&self, job_id: &str) -> Result<()> {
        self.set_paused(job_id, true)
    }

    fn resume_job(&self, job_id: &str) -> Result<()> {
        self.set_paused(job_id, false)
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        for entry in self.table().values() {
            entry.driver.abort();
        }
    }
}
