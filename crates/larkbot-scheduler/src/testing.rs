//! In-crate fakes for the collaborator traits.

use async_trait::async_trait;
use larkbot_core::error::{LarkBotError, Result};
use larkbot_core::traits::{
    AiActionRunner, HttpClient, JobFn, JobInfo, JobTrigger, MessageSender, Scheduler,
};
use larkbot_core::types::{AiTaskResult, Context, HttpRequest, HttpResponse};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use crate::retry::Sleeper;

/// Records every `send_text`; knows a fixed set of targets.
pub struct StubSender {
    targets: HashSet<String>,
    pub sent: Mutex<Vec<(String, String)>>,
    fail_targets: HashSet<String>,
}

impl StubSender {
    pub fn new(targets: &[&str]) -> Self {
        Self {
            targets: targets.iter().map(|t| t.to_string()).collect(),
            sent: Mutex::new(Vec::new()),
            fail_targets: HashSet::new(),
        }
    }

    /// Sends to `target` fail with a channel error.
    pub fn failing_on(mut self, target: &str) -> Self {
        self.fail_targets.insert(target.to_string());
        self
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageSender for StubSender {
    async fn send_text(&self, text: &str, target: &str) -> Result<()> {
        if !self.targets.contains(target) {
            return Err(LarkBotError::Channel(format!("Unknown target '{target}'")));
        }
        if self.fail_targets.contains(target) {
            return Err(LarkBotError::Channel(format!("send to '{target}' failed")));
        }
        self.sent.lock().unwrap().push((text.to_string(), target.to_string()));
        Ok(())
    }

    fn has_target(&self, target: &str) -> bool {
        self.targets.contains(target)
    }
}

pub struct RecordedJob {
    pub job: JobFn,
    pub trigger: JobTrigger,
    pub paused: bool,
}

/// Keeps jobs in memory; tests fire them by id.
#[derive(Default)]
pub struct RecordingScheduler {
    pub jobs: Mutex<HashMap<String, RecordedJob>>,
    pub added: Mutex<Vec<(String, JobTrigger)>>,
}

impl RecordingScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.jobs.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn trigger_of(&self, job_id: &str) -> Option<JobTrigger> {
        self.jobs.lock().unwrap().get(job_id).map(|j| j.trigger.clone())
    }

    pub fn is_paused(&self, job_id: &str) -> bool {
        self.jobs.lock().unwrap().get(job_id).is_some_and(|j| j.paused)
    }

    /// Run a registered job to completion. Returns false when the id is unknown.
    pub async fn fire(&self, job_id: &str) -> bool {
        let job = self.jobs.lock().unwrap().get(job_id).map(|j| j.job.clone());
        match job {
            Some(job) => {
                job().await;
                true
            }
            None => false,
        }
    }
}

impl Scheduler for RecordingScheduler {
    fn add_job(&self, job: JobFn, trigger: JobTrigger, job_id: &str, replace_existing: bool) -> Result<String> {
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.contains_key(job_id) && !replace_existing {
            return Err(LarkBotError::Scheduler(format!("Job '{job_id}' already exists")));
        }
        self.added.lock().unwrap().push((job_id.to_string(), trigger.clone()));
        jobs.insert(job_id.to_string(), RecordedJob { job, trigger, paused: false });
        Ok(job_id.to_string())
    }

    fn remove_job(&self, job_id: &str) -> Result<()> {
        self.jobs
            .lock()
            .unwrap()
            .remove(job_id)
            .map(|_| ())
            .ok_or_else(|| LarkBotError::Scheduler(format!("No job '{job_id}'")))
    }

    fn get_job(&self, job_id: &str) -> Option<JobInfo> {
        self.jobs.lock().unwrap().get(job_id).map(|j| JobInfo {
            id: job_id.to_string(),
            next_run_time: None,
            paused: j.paused,
        })
    }

    fn pause_job(&self, job_id: &str) -> Result<()> {
        match self.jobs.lock().unwrap().get_mut(job_id) {
            Some(job) => {
                job.paused = true;
                Ok(())
            }
            None => Err(LarkBotError::Scheduler(format!("No job '{job_id}'"))),
        }
    }

    fn resume_job(&self, job_id: &str) -> Result<()> {
        match self.jobs.lock().unwrap().get_mut(job_id) {
            Some(job) => {
                job.paused = false;
                Ok(())
            }
            None => Err(LarkBotError::Scheduler(format!("No job '{job_id}'"))),
        }
    }
}

/// Scripted HTTP client: pops one outcome per request, then succeeds with `{}`.
#[derive(Default)]
pub struct StubHttp {
    script: Mutex<VecDeque<Result<HttpResponse>>>,
    pub requests: Mutex<Vec<HttpRequest>>,
}

impl StubHttp {
    pub fn new() -> Self {
        Self::default()
    }

    /// First `n` requests fail, the rest succeed.
    pub fn failing_times(n: usize) -> Self {
        let stub = Self::default();
        for i in 0..n {
            stub.push_err(&format!("HTTP 503 (attempt {})", i + 1));
        }
        stub
    }

    pub fn push_ok(&self, body: &str) {
        self.script.lock().unwrap().push_back(Ok(HttpResponse { status: 200, body: body.to_string() }));
    }

    pub fn push_err(&self, message: &str) {
        self.script.lock().unwrap().push_back(Err(LarkBotError::Http(message.to_string())));
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpClient for StubHttp {
    async fn request(&self, request: &HttpRequest) -> Result<HttpResponse> {
        self.requests.lock().unwrap().push(request.clone());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(HttpResponse { status: 200, body: "{}".into() }))
    }
}

/// Records requested sleeps without sleeping.
#[derive(Default)]
pub struct RecordingSleeper {
    pub sleeps: Mutex<Vec<f64>>,
}

impl RecordingSleeper {
    pub fn sleeps(&self) -> Vec<f64> {
        self.sleeps.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, seconds: f64) {
        self.sleeps.lock().unwrap().push(seconds);
    }
}

/// AI runner returning a fixed result.
pub struct StubAi {
    pub result: AiTaskResult,
    pub calls: Mutex<Vec<Value>>,
}

impl StubAi {
    pub fn answering(response: &str) -> Self {
        Self {
            result: AiTaskResult { success: true, response: response.to_string(), ..Default::default() },
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(error: &str) -> Self {
        Self {
            result: AiTaskResult { success: false, error: Some(error.to_string()), ..Default::default() },
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl AiActionRunner for StubAi {
    async fn execute_ai_task_action(&self, action_config: &Value, _context: &Context) -> Result<AiTaskResult> {
        self.calls.lock().unwrap().push(action_config.clone());
        Ok(self.result.clone())
    }
}
