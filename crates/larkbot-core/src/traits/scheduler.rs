//! Job scheduler contract.
//!
//! The scheduler owns wall-clock evaluation (intervals, cron, one-shot
//! dates). The automation core only decides trigger specs and reacts to
//! firings.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

/// Future produced by one job firing.
pub type JobFuture = BoxFuture<'static, ()>;

/// Job body invoked by the scheduler on every firing.
pub type JobFn = Arc<dyn Fn() -> JobFuture + Send + Sync>;

/// When a job fires. Opaque to the automation core beyond its kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobTrigger {
    /// Fire every `days/hours/minutes/seconds`.
    Interval {
        #[serde(default)]
        seconds: u64,
        #[serde(default)]
        minutes: u64,
        #[serde(default)]
        hours: u64,
        #[serde(default)]
        days: u64,
    },
    /// Cron schedule, either a 5-field expression or named fields
    /// (`hour = "8"`, `minute = "0"`). Evaluated by the external scheduler.
    Cron {
        #[serde(default)]
        expression: Option<String>,
        #[serde(default)]
        fields: BTreeMap<String, String>,
    },
    /// Fire once at `run_date`.
    Date { run_date: DateTime<Utc> },
}

impl JobTrigger {
    pub fn every(period: Duration) -> Self {
        JobTrigger::Interval {
            seconds: period.as_secs(),
            minutes: 0,
            hours: 0,
            days: 0,
        }
    }

    pub fn at(run_date: DateTime<Utc>) -> Self {
        JobTrigger::Date { run_date }
    }

    /// Period of an interval trigger.
    pub fn period(&self) -> Option<Duration> {
        match self {
            JobTrigger::Interval {
                seconds,
                minutes,
                hours,
                days,
            } => Some(Duration::from_secs(
                seconds + minutes * 60 + hours * 3600 + days * 86_400,
            )),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            JobTrigger::Interval { .. } => "interval",
            JobTrigger::Cron { .. } => "cron",
            JobTrigger::Date { .. } => "date",
        }
    }
}

/// Snapshot of a registered job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobInfo {
    pub id: String,
    pub next_run_time: Option<DateTime<Utc>>,
    pub paused: bool,
}

pub trait Scheduler: Send + Sync {
    /// Register `job`. With `replace_existing = false` an existing id is an error.
    fn add_job(
        &self,
        job: JobFn,
        trigger: JobTrigger,
        job_id: &str,
        replace_existing: bool,
    ) -> Result<String>;

    /// Remove a job. Only prevents future firings.
    fn remove_job(&self, job_id: &str) -> Result<()>;

    fn get_job(&self, job_id: &str) -> Option<JobInfo>;

    fn pause_job(&self, job_id: &str) -> Result<()>;

    fn resume_job(&self, job_id: &str) -> Result<()>;
}
