//! Workflow orchestrator: multi-step runs with explicit step dependencies.
//!
//! ## Architecture
//! ```text
//! execute_workflow(id, rule, steps, context, parallel)
//!   → DependencyResolver: validate graph, compute batches
//!   → sequential: steps in listed order
//!     parallel:   batch by batch, siblings on a bounded pool
//!       → checkpoint (cancelled? paused → wait for resume)
//!       → condition false → skipped
//!       → StepActionExecutor.execute(action_type, config, context)
//!       → on_error: fail | continue | retry (delay *= backoff)
//!   → WorkflowExecution {status, step_results, context, retries}
//! ```
//!
//! Cancel and pause only affect future dispatch. A step already running is
//! never interrupted.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use larkbot_core::error::{LarkBotError, Result};
use larkbot_core::types::{Context, opt_duration_secs};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;

use crate::executor::ExecutionServices;
use crate::expression::ExpressionEngine;
use crate::resolver::DependencyResolver;
use crate::retry::{Sleeper, TokioSleeper};
use crate::tasks::Action;
use crate::template::interpolate_value;

pub const DEFAULT_MAX_WORKERS: usize = 4;
/// Finished executions kept for `get_execution` / `list_executions`.
pub const DEFAULT_MAX_RETAINED: usize = 100;

// ─── Model ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Paused,
    Waiting,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    #[default]
    Fail,
    Continue,
    Retry,
}

fn default_max_retries() -> u32 {
    3
}

fn default_delay() -> f64 {
    1.0
}

fn default_backoff() -> f64 {
    2.0
}

/// Per-step retry policy; only used when `on_error = "retry"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Seconds before the first retry.
    #[serde(default = "default_delay")]
    pub delay: f64,
    #[serde(default = "default_backoff")]
    pub backoff: f64,
}

impl Default for StepRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            delay: default_delay(),
            backoff: default_backoff(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub name: String,
    pub action_type: String,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Expression over `context`; false skips the step.
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub retry_config: Option<StepRetryConfig>,
    #[serde(default, with = "opt_duration_secs")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub on_error: OnError,
}

impl WorkflowStep {
    pub fn new(name: &str, action_type: &str, config: Value) -> Self {
        Self {
            name: name.to_string(),
            action_type: action_type.to_string(),
            config,
            depends_on: Vec::new(),
            condition: None,
            retry_config: None,
            timeout: None,
            on_error: OnError::Fail,
        }
    }

    pub fn after(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn when(mut self, condition: &str) -> Self {
        self.condition = Some(condition.to_string());
        self
    }

    pub fn on_error(mut self, policy: OnError) -> Self {
        self.on_error = policy;
        self
    }

    pub fn with_retry(mut self, retry: StepRetryConfig) -> Self {
        self.retry_config = Some(retry);
        self
    }
}

/// One workflow invocation, mutated in place as steps finish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub workflow_id: String,
    pub rule_name: String,
    pub status: WorkflowStatus,
    /// Steps finished so far (completed, skipped or failed).
    pub current_step: usize,
    pub total_steps: usize,
    pub step_results: BTreeMap<String, Value>,
    pub context: Context,
    pub error: Option<String>,
    /// Retry attempts across all steps.
    pub retries: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Runs the action behind a workflow step.
#[async_trait]
pub trait StepActionExecutor: Send + Sync {
    async fn execute(&self, action_type: &str, config: &Value, context: &Context) -> Result<Value>;
}

/// Objects pass through; anything else becomes `{success: true, data}`.
pub fn normalize_result(value: Value) -> Value {
    match value {
        Value::Object(_) => value,
        other => json!({"success": true, "data": other}),
    }
}

// ─── Step runner ────────────────────────────────────────

enum StepOutcome {
    Completed(Value),
    Skipped(String),
    Failed(LarkBotError),
}

struct StepReport {
    outcome: StepOutcome,
    retries: u32,
}

impl StepReport {
    fn skipped(reason: String) -> Self {
        Self { outcome: StepOutcome::Skipped(reason), retries: 0 }
    }
}

#[derive(Clone)]
struct StepRunner {
    actions: Arc<dyn StepActionExecutor>,
    expressions: Arc<ExpressionEngine>,
    sleeper: Arc<dyn Sleeper>,
}

impl StepRunner {
    async fn run(&self, step: &WorkflowStep, context: &Context) -> StepReport {
        if let Some(condition) = &step.condition {
            match self.expressions.evaluate_bool(condition, context) {
                Ok(true) => {}
                Ok(false) => return StepReport::skipped(format!("condition not met: {condition}")),
                Err(e) => {
                    tracing::warn!("⚠️ Step '{}' condition could not be evaluated: {e}", step.name);
                    return StepReport::skipped(format!("condition error: {e}"));
                }
            }
        }

        let retry = step.retry_config.clone().unwrap_or_default();
        let attempts = match step.on_error {
            OnError::Retry => retry.max_retries + 1,
            _ => 1,
        };
        let mut delay = retry.delay.max(0.0);
        let mut retries = 0;
        loop {
            match self.attempt(step, context).await {
                Ok(value) => {
                    return StepReport { outcome: StepOutcome::Completed(normalize_result(value)), retries };
                }
                Err(e) if e.is_structural() || retries + 1 >= attempts => {
                    return StepReport { outcome: StepOutcome::Failed(e), retries };
                }
                Err(e) => {
                    retries += 1;
                    tracing::warn!(
                        "🔁 Step '{}' failed (retry {retries}/{}): {e}; retrying in {delay:.2}s",
                        step.name,
                        attempts - 1
                    );
                    self.sleeper.sleep(delay).await;
                    delay *= retry.backoff;
                }
            }
        }
    }

    async fn attempt(&self, step: &WorkflowStep, context: &Context) -> Result<Value> {
        let call = self.actions.execute(&step.action_type, &step.config, context);
        match step.timeout {
            Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
                LarkBotError::Action(format!(
                    "step '{}' timed out after {:.1}s",
                    step.name,
                    limit.as_secs_f64()
                ))
            })?,
            None => call.await,
        }
    }
}

// ─── Orchestrator ───────────────────────────────────────

struct Tracked {
    state: Mutex<WorkflowExecution>,
    resumed: Notify,
}

impl Tracked {
    fn status(&self) -> WorkflowStatus {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).status
    }

    fn snapshot(&self) -> WorkflowExecution {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn context(&self) -> Context {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).context.clone()
    }
}

enum Flow {
    Continue,
    Stop,
}

pub struct WorkflowOrchestrator {
    runner: StepRunner,
    max_workers: usize,
    max_retained: usize,
    executions: RwLock<HashMap<String, Arc<Tracked>>>,
}

impl WorkflowOrchestrator {
    pub fn new(actions: Arc<dyn StepActionExecutor>, expressions: Arc<ExpressionEngine>) -> Self {
        Self {
            runner: StepRunner {
                actions,
                expressions,
                sleeper: Arc::new(TokioSleeper),
            },
            max_workers: DEFAULT_MAX_WORKERS,
            max_retained: DEFAULT_MAX_RETAINED,
            executions: RwLock::new(HashMap::new()),
        }
    }

    /// Orchestrator whose steps run task actions against `services`.
    pub fn from_services(services: Arc<ExecutionServices>) -> Self {
        let expressions = services.expressions.clone();
        let sleeper = services.sleeper.clone();
        Self::new(Arc::new(ServicesStepExecutor::new(services)), expressions).with_sleeper(sleeper)
    }

    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers.max(1);
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.runner.sleeper = sleeper;
        self
    }

    pub fn with_max_retained(mut self, max_retained: usize) -> Self {
        self.max_retained = max_retained;
        self
    }

    /// Run `steps` to completion, cancellation or failure.
    ///
    /// Graph errors (duplicate or unknown step names, cycles) and structural
    /// step errors are returned as `Err`; every other step failure is
    /// handled by the step's `on_error` policy and reported in the result.
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        rule_name: &str,
        steps: Vec<WorkflowStep>,
        initial_context: Context,
        parallel: bool,
    ) -> Result<WorkflowExecution> {
        let resolver =
            DependencyResolver::from_edges(steps.iter().map(|s| (s.name.clone(), s.depends_on.clone())));
        let batches = resolver.get_execution_order()?;

        let tracked = self.track(workflow_id, rule_name, steps.len(), initial_context)?;
        tracing::info!(
            "🔀 Workflow '{workflow_id}' ({rule_name}) started: {} steps, {}",
            steps.len(),
            if parallel { "parallel" } else { "sequential" }
        );

        let outcome = if parallel {
            self.run_batches(&tracked, &steps, &batches).await
        } else {
            self.run_sequential(&tracked, &steps).await
        };

        let execution = {
            let mut state = tracked.state.lock().unwrap_or_else(|e| e.into_inner());
            if outcome.is_ok() && matches!(state.status, WorkflowStatus::Running | WorkflowStatus::Paused) {
                state.status = WorkflowStatus::Completed;
            }
            state.finished_at = Some(Utc::now());
            state.clone()
        };

        match execution.status {
            WorkflowStatus::Completed => tracing::info!(
                "✅ Workflow '{workflow_id}' completed ({}/{} steps, {} retries)",
                execution.current_step,
                execution.total_steps,
                execution.retries
            ),
            WorkflowStatus::Cancelled => tracing::info!("🛑 Workflow '{workflow_id}' cancelled"),
            _ => tracing::error!(
                "❌ Workflow '{workflow_id}' failed: {}",
                execution.error.as_deref().unwrap_or("unknown error")
            ),
        }
        Self::prune(
            &mut self.executions.write().unwrap_or_else(|e| e.into_inner()),
            self.max_retained,
        );
        outcome.map(|()| execution)
    }

    fn track(&self, workflow_id: &str, rule_name: &str, total_steps: usize, context: Context) -> Result<Arc<Tracked>> {
        let mut executions = self.executions.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = executions.get(workflow_id)
            && !existing.status().is_terminal()
        {
            return Err(LarkBotError::Validation(format!("workflow '{workflow_id}' is already running")));
        }
        let tracked = Arc::new(Tracked {
            state: Mutex::new(WorkflowExecution {
                workflow_id: workflow_id.to_string(),
                rule_name: rule_name.to_string(),
                status: WorkflowStatus::Running,
                current_step: 0,
                total_steps,
                step_results: BTreeMap::new(),
                context,
                error: None,
                retries: 0,
                started_at: Utc::now(),
                finished_at: None,
            }),
            resumed: Notify::new(),
        });
        executions.insert(workflow_id.to_string(), tracked.clone());
        Self::prune(&mut executions, self.max_retained);
        Ok(tracked)
    }

    /// Drop the oldest finished executions beyond `max_retained`. Active
    /// ones are never evicted.
    fn prune(executions: &mut HashMap<String, Arc<Tracked>>, max_retained: usize) {
        let mut finished: Vec<(DateTime<Utc>, String)> = executions
            .iter()
            .filter_map(|(id, tracked)| {
                let state = tracked.state.lock().unwrap_or_else(|e| e.into_inner());
                state.status.is_terminal().then(|| (state.started_at, id.clone()))
            })
            .collect();
        if finished.len() <= max_retained {
            return;
        }
        finished.sort();
        let excess = finished.len() - max_retained;
        for (_, id) in finished.into_iter().take(excess) {
            executions.remove(&id);
        }
        tracing::debug!("🧹 Evicted {excess} finished workflow executions");
    }

    async fn run_sequential(&self, tracked: &Tracked, steps: &[WorkflowStep]) -> Result<()> {
        for step in steps {
            if !Self::checkpoint(tracked).await {
                break;
            }
            let report = self.runner.run(step, &tracked.context()).await;
            if let Flow::Stop = Self::apply(tracked, step, report)? {
                break;
            }
        }
        Ok(())
    }

    async fn run_batches(&self, tracked: &Tracked, steps: &[WorkflowStep], batches: &[Vec<String>]) -> Result<()> {
        let by_name: HashMap<&str, &WorkflowStep> = steps.iter().map(|s| (s.name.as_str(), s)).collect();
        let mut failed: HashSet<String> = HashSet::new();

        for batch in batches {
            if !Self::checkpoint(tracked).await {
                break;
            }
            let context = tracked.context();
            let mut reports: Vec<(usize, StepReport)> = Vec::new();
            let mut runnable: Vec<(usize, WorkflowStep)> = Vec::new();
            for (pos, name) in batch.iter().enumerate() {
                let Some(step) = by_name.get(name.as_str()) else {
                    continue;
                };
                match step.depends_on.iter().find(|d| failed.contains(*d)) {
                    Some(dep) => reports.push((pos, StepReport::skipped(format!("dependency '{dep}' failed")))),
                    None => runnable.push((pos, (*step).clone())),
                }
            }

            if runnable.len() == 1 {
                let (pos, step) = &runnable[0];
                reports.push((*pos, self.runner.run(step, &context).await));
            } else if !runnable.is_empty() {
                tracing::debug!("🔀 Running batch of {} steps", runnable.len());
                reports.extend(self.run_pool(runnable, &context).await);
            }

            reports.sort_by_key(|(pos, _)| *pos);
            let mut stop = false;
            let mut structural = None;
            for (pos, report) in reports {
                let step = by_name[batch[pos].as_str()];
                if matches!(report.outcome, StepOutcome::Failed(_)) {
                    failed.insert(step.name.clone());
                }
                match Self::apply(tracked, step, report) {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Stop) => stop = true,
                    Err(e) => {
                        structural.get_or_insert(e);
                    }
                }
            }
            if let Some(e) = structural {
                return Err(e);
            }
            if stop {
                break;
            }
        }
        Ok(())
    }

    /// Run sibling steps on at most `max_workers` tasks. A panicking step is
    /// reported as a failure of that step only.
    async fn run_pool(&self, runnable: Vec<(usize, WorkflowStep)>, context: &Context) -> Vec<(usize, StepReport)> {
        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut set = JoinSet::new();
        for (pos, step) in runnable {
            let runner = self.runner.clone();
            let context = context.clone();
            let semaphore = semaphore.clone();
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let report = AssertUnwindSafe(runner.run(&step, &context))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| StepReport {
                        outcome: StepOutcome::Failed(LarkBotError::Action(format!("step '{}' panicked", step.name))),
                        retries: 0,
                    });
                (pos, report)
            });
        }

        let mut reports = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => tracing::warn!("⚠️ Step task ended abnormally: {e}"),
            }
        }
        reports
    }

    /// Wait while paused. False once the workflow is cancelled or failed.
    async fn checkpoint(tracked: &Tracked) -> bool {
        loop {
            let resumed = tracked.resumed.notified();
            match tracked.status() {
                WorkflowStatus::Paused => {
                    tracing::info!("⏸️ Workflow paused, waiting for resume");
                    resumed.await;
                }
                WorkflowStatus::Cancelled | WorkflowStatus::Failed => return false,
                _ => return true,
            }
        }
    }

    fn apply(tracked: &Tracked, step: &WorkflowStep, report: StepReport) -> Result<Flow> {
        let mut state = tracked.state.lock().unwrap_or_else(|e| e.into_inner());
        state.current_step += 1;
        state.retries += report.retries;
        match report.outcome {
            StepOutcome::Completed(value) => {
                tracing::debug!("✅ Step '{}' completed", step.name);
                state.context.insert(step.name.clone(), value.clone());
                state.step_results.insert(step.name.clone(), value);
                Ok(Flow::Continue)
            }
            StepOutcome::Skipped(reason) => {
                tracing::info!("⏭️ Step '{}' skipped: {reason}", step.name);
                state
                    .step_results
                    .insert(step.name.clone(), json!({"status": "skipped", "reason": reason}));
                Ok(Flow::Continue)
            }
            StepOutcome::Failed(error) => {
                let message = error.to_string();
                state.step_results.insert(
                    step.name.clone(),
                    json!({"success": false, "status": "failed", "error": message}),
                );
                let fatal = error.is_structural();
                if (fatal || step.on_error == OnError::Fail) && state.status != WorkflowStatus::Cancelled {
                    state.status = WorkflowStatus::Failed;
                    state.error = Some(format!("Step '{}' failed: {message}", step.name));
                }
                if fatal {
                    return Err(error);
                }
                match step.on_error {
                    OnError::Fail => Ok(Flow::Stop),
                    OnError::Continue | OnError::Retry => {
                        tracing::warn!("⚠️ Step '{}' failed, continuing: {message}", step.name);
                        Ok(Flow::Continue)
                    }
                }
            }
        }
    }

    fn transition(&self, workflow_id: &str, from: &[WorkflowStatus], to: WorkflowStatus) -> bool {
        let Some(tracked) = self
            .executions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(workflow_id)
            .cloned()
        else {
            return false;
        };
        {
            let mut state = tracked.state.lock().unwrap_or_else(|e| e.into_inner());
            if !from.contains(&state.status) {
                return false;
            }
            state.status = to;
        }
        tracked.resumed.notify_waiters();
        tracing::info!("🔀 Workflow '{workflow_id}' → {to:?}");
        true
    }

    /// Stop dispatching further steps. Acts on running or paused workflows.
    pub fn cancel_execution(&self, workflow_id: &str) -> bool {
        self.transition(
            workflow_id,
            &[WorkflowStatus::Running, WorkflowStatus::Paused],
            WorkflowStatus::Cancelled,
        )
    }

    pub fn pause_execution(&self, workflow_id: &str) -> bool {
        self.transition(workflow_id, &[WorkflowStatus::Running], WorkflowStatus::Paused)
    }

    pub fn resume_execution(&self, workflow_id: &str) -> bool {
        self.transition(workflow_id, &[WorkflowStatus::Paused], WorkflowStatus::Running)
    }

    pub fn get_execution(&self, workflow_id: &str) -> Option<WorkflowExecution> {
        self.executions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(workflow_id)
            .map(|t| t.snapshot())
    }

    /// Every tracked execution, oldest first.
    pub fn list_executions(&self) -> Vec<WorkflowExecution> {
        let mut all: Vec<WorkflowExecution> = self
            .executions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|t| t.snapshot())
            .collect();
        all.sort_by_key(|e| e.started_at);
        all
    }
}

// ─── Task actions as steps ──────────────────────────────

const STEP_ACTIONS: &[&str] = &[
    "plugin_method",
    "send_message",
    "http_request",
    "script",
    "python_code",
    "ai_chat",
    "ai_query",
];

/// Runs task actions as workflow steps. `config` holds the action fields;
/// the result is the set of context keys the action wrote.
pub struct ServicesStepExecutor {
    services: Arc<ExecutionServices>,
}

impl ServicesStepExecutor {
    pub fn new(services: Arc<ExecutionServices>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl StepActionExecutor for ServicesStepExecutor {
    async fn execute(&self, action_type: &str, config: &Value, context: &Context) -> Result<Value> {
        if !STEP_ACTIONS.contains(&action_type) {
            return Err(LarkBotError::UnknownAction(action_type.to_string()));
        }
        let mut fields = match config {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            _ => {
                return Err(LarkBotError::Config(format!("config of '{action_type}' step must be a table")));
            }
        };
        fields.insert("type".into(), Value::String(action_type.to_string()));
        let action: Action = serde_json::from_value(Value::Object(fields))
            .map_err(|e| LarkBotError::Config(format!("invalid '{action_type}' step: {e}")))?;

        let mut scratch = context.clone();
        self.services.perform(&action, &mut scratch).await?;
        let updates: Map<String, Value> = scratch
            .into_iter()
            .filter(|(key, value)| context.get(key) != Some(value))
            .collect();
        Ok(Value::Object(updates))
    }
}

// ─── Templates ──────────────────────────────────────────

/// Reusable step list with `${param}` placeholders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Parameter defaults.
    #[serde(default)]
    pub parameters: Context,
    #[serde(default)]
    pub parallel: bool,
    pub steps: Vec<WorkflowStep>,
}

#[derive(Default)]
pub struct WorkflowTemplateRegistry {
    templates: RwLock<BTreeMap<String, WorkflowTemplate>>,
}

impl WorkflowTemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a template.
    pub fn register(&self, template: WorkflowTemplate) {
        self.templates
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(template.name.clone(), template);
    }

    pub fn get(&self, name: &str) -> Option<WorkflowTemplate> {
        self.templates.read().unwrap_or_else(|e| e.into_inner()).get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.templates.read().unwrap_or_else(|e| e.into_inner()).keys().cloned().collect()
    }

    /// Steps of `name` with parameters substituted over the defaults.
    pub fn instantiate(&self, name: &str, params: &Context) -> Result<Vec<WorkflowStep>> {
        let template = self
            .get(name)
            .ok_or_else(|| LarkBotError::Validation(format!("workflow template '{name}' not found")))?;
        let mut values = template.parameters.clone();
        values.extend(params.clone());
        // only step config is templated; conditions are scripts and stay verbatim
        Ok(template
            .steps
            .iter()
            .map(|step| WorkflowStep {
                config: interpolate_value(&step.config, &values),
                ..step.clone()
            })
            .collect())
    }
}
