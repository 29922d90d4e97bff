use larkbot_core::error::{LarkBotError, Result};
use larkbot_core::traits::{JobFn, JobTrigger, Scheduler};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// `mode` is the scheduler trigger kind (`interval`, `cron`, `date`);
/// `arguments` are its fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleTriggerConfig {
    pub mode: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl ScheduleTriggerConfig {
    pub fn to_job_trigger(&self) -> Result<JobTrigger> {
        let mut job = self.arguments.clone();
        job.insert("type".into(), Value::String(self.mode.clone()));
        serde_json::from_value(Value::Object(job))
            .map_err(|e| LarkBotError::Config(format!("invalid {} schedule: {e}", self.mode)))
    }
}

/// Owns the `automation.{rule}` job id.
#[derive(Debug, Clone)]
pub struct ScheduleTrigger {
    job_id: String,
    trigger: JobTrigger,
}

impl ScheduleTrigger {
    pub fn new(rule_name: &str, config: ScheduleTriggerConfig) -> Result<Self> {
        Ok(Self {
            job_id: format!("automation.{rule_name}"),
            trigger: config.to_job_trigger()?,
        })
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn job_trigger(&self) -> &JobTrigger {
        &self.trigger
    }

    pub fn start(&self, scheduler: &dyn Scheduler, job: JobFn) -> Result<()> {
        scheduler.add_job(job, self.trigger.clone(), &self.job_id, true)?;
        tracing::info!("⏰ Scheduled '{}' ({})", self.job_id, self.trigger.kind());
        Ok(())
    }

    pub fn stop(&self, scheduler: &dyn Scheduler) {
        if scheduler.get_job(&self.job_id).is_some()
            && let Err(e) = scheduler.remove_job(&self.job_id)
        {
            tracing::warn!("⚠️ Could not remove job '{}': {e}", self.job_id);
        }
    }
}
