//! Task manager: owns task definitions, registers them with the scheduler
//! and drives the per-task state machine.
//!
//! ```text
//! scheduler tick / run_task / retry job / dependent queue
//!   → admit: dependency gate → concurrency slot → RUNNING
//!   → build context → conditions → TaskExecutor
//!   → SUCCESS | FAILED → history → retry/backoff or final failure
//!   → trigger dependents (work queue, N workers)
//! ```
//!
//! All status, running-count, retry-count and waiting bookkeeping lives in
//! one `DependencyState` behind a single lock.

use chrono::Utc;
use larkbot_core::config::LarkBotConfig;
use larkbot_core::error::{LarkBotError, Result};
use larkbot_core::traits::{JobFn, JobTrigger, Scheduler};
use larkbot_core::types::Context;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};

use crate::executor::{ExecutionServices, TaskExecutor};
use crate::history::ExecutionHistoryStore;
use crate::resolver::DependencyResolver;
use crate::retry::backoff_delay;
use crate::tasks::{ExecutionResult, FailureAction, TaskDefinition, TaskExecutionStatus};

/// What a FAILED or SKIPPED dependency means when
/// `skip_if_dependency_failed` is off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailedDependencyPolicy {
    /// Keep waiting: the task stays in WAITING_DEPENDENCY across ticks.
    #[default]
    Wait,
    /// Wait at most `dependency_timeout`, then skip.
    Timeout,
}

impl FromStr for FailedDependencyPolicy {
    type Err = LarkBotError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "wait" => Ok(Self::Wait),
            "timeout" => Ok(Self::Timeout),
            other => Err(LarkBotError::Config(format!(
                "unknown failed_dependency_policy '{other}' (expected wait|timeout)"
            ))),
        }
    }
}

/// Manager-wide settings.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Active environment name, exposed as `context["environment"]`.
    pub environment: Option<String>,
    /// Variables of the active environment.
    pub variables: Context,
    pub failed_dependency_policy: FailedDependencyPolicy,
    pub dependent_workers: usize,
    pub parallel_workers: usize,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            environment: None,
            variables: Context::new(),
            failed_dependency_policy: FailedDependencyPolicy::Wait,
            dependent_workers: 2,
            parallel_workers: 4,
        }
    }
}

impl ManagerOptions {
    pub fn from_config(config: &LarkBotConfig) -> Result<Self> {
        Ok(Self {
            environment: config.active_environment.clone(),
            variables: config
                .active_variables()
                .map(|vars| vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default(),
            failed_dependency_policy: config.scheduler.failed_dependency_policy.parse()?,
            dependent_workers: config.scheduler.dependent_workers.max(1),
            parallel_workers: config.scheduler.parallel_workers.max(1),
        })
    }
}

/// Why a run was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunTrigger {
    Scheduled,
    Manual,
    Dependency,
    Retry,
}

impl fmt::Display for RunTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunTrigger::Scheduled => "scheduled",
            RunTrigger::Manual => "manual",
            RunTrigger::Dependency => "dependency",
            RunTrigger::Retry => "retry",
        })
    }
}

/// Result of asking the manager to run a task.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Actions ran; the result says whether they succeeded.
    Finished(ExecutionResult),
    /// Dependencies or conditions not met. Zero actions executed.
    Skipped(ExecutionResult),
    /// `max_concurrent` reached. Nothing recorded.
    Refused { reason: String },
}

impl RunOutcome {
    pub fn result(&self) -> Option<&ExecutionResult> {
        match self {
            RunOutcome::Finished(r) | RunOutcome::Skipped(r) => Some(r),
            RunOutcome::Refused { .. } => None,
        }
    }

    pub fn succeeded(&self) -> bool {
        matches!(self, RunOutcome::Finished(r) if r.success)
    }

    fn into_result(self, task_name: &str) -> ExecutionResult {
        match self {
            RunOutcome::Finished(r) | RunOutcome::Skipped(r) => r,
            RunOutcome::Refused { reason } => ExecutionResult::skipped(task_name, reason),
        }
    }
}

/// Outcome of [`TaskManager::run_task_chain`].
#[derive(Debug, Clone)]
pub struct ChainRunReport {
    /// One result per task, in chain order.
    pub results: Vec<ExecutionResult>,
    /// Tasks not run because an earlier one failed.
    pub skipped: Vec<String>,
    /// Context as the last task left it.
    pub context: Context,
}

impl ChainRunReport {
    pub fn success(&self) -> bool {
        self.skipped.is_empty() && self.results.iter().all(|r| r.success)
    }
}

/// Outcome of [`TaskManager::run_parallel_tasks`].
#[derive(Debug, Clone)]
pub struct ParallelRunReport {
    pub results: BTreeMap<String, ExecutionResult>,
    /// Tasks still running when the overall timeout expired.
    pub timed_out: Vec<String>,
}

enum DependencyCheck {
    Ready,
    NotReady(String),
    Blocked(String),
}

enum Admission {
    Admitted(SlotGuard, Context),
    NotReady(String),
    Blocked(String),
    Refused(String),
}

#[derive(Default)]
struct DependencyState {
    statuses: HashMap<String, TaskExecutionStatus>,
    running: HashMap<String, usize>,
    retry_counts: HashMap<String, u32>,
    last_results: HashMap<String, ExecutionResult>,
    waiting_since: HashMap<String, Instant>,
}

impl DependencyState {
    fn status(&self, name: &str) -> TaskExecutionStatus {
        self.statuses.get(name).copied().unwrap_or_default()
    }

    fn release(&mut self, name: &str) {
        if let Some(count) = self.running.get_mut(name) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.running.remove(name);
            }
        }
    }
}

struct ManagerInner {
    tasks: RwLock<HashMap<String, TaskDefinition>>,
    state: Mutex<DependencyState>,
    scheduler: Arc<dyn Scheduler>,
    services: Arc<ExecutionServices>,
    history: Arc<ExecutionHistoryStore>,
    options: ManagerOptions,
    started: AtomicBool,
    dependent_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ManagerInner {
    fn lock_state(&self) -> MutexGuard<'_, DependencyState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Holds one concurrency slot. Dropping it without `finish` (an aborted
/// run) frees the slot and marks the task FAILED.
struct SlotGuard {
    inner: Arc<ManagerInner>,
    name: String,
    armed: bool,
}

impl SlotGuard {
    fn finish(mut self, status: TaskExecutionStatus, result: Option<&ExecutionResult>) {
        let mut state = self.inner.lock_state();
        state.release(&self.name);
        state.statuses.insert(self.name.clone(), status);
        if let Some(result) = result {
            state.last_results.insert(self.name.clone(), result.clone());
            if result.success {
                state.retry_counts.remove(&self.name);
            }
        }
        self.armed = false;
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.inner.lock_state();
            state.release(&self.name);
            state.statuses.insert(self.name.clone(), TaskExecutionStatus::Failed);
            tracing::warn!("⚠️ Execution of '{}' was cancelled", self.name);
        }
    }
}

fn task_job_id(name: &str) -> String {
    format!("task.{name}")
}

/// Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<ManagerInner>,
}

impl TaskManager {
    pub fn new(
        scheduler: Arc<dyn Scheduler>,
        services: Arc<ExecutionServices>,
        history: Arc<ExecutionHistoryStore>,
        options: ManagerOptions,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                tasks: RwLock::new(HashMap::new()),
                state: Mutex::new(DependencyState::default()),
                scheduler,
                services,
                history,
                options,
                started: AtomicBool::new(false),
                dependent_tx: Mutex::new(None),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    fn from_weak(weak: &Weak<ManagerInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn history(&self) -> &Arc<ExecutionHistoryStore> {
        &self.inner.history
    }

    pub fn services(&self) -> &Arc<ExecutionServices> {
        &self.inner.services
    }

    // ─── Task registry ────────────────────────────────────────

    /// Add a task. Duplicate names and `max_concurrent = 0` are rejected.
    pub fn add_task(&self, task: TaskDefinition) -> Result<()> {
        if task.name.trim().is_empty() {
            return Err(LarkBotError::Validation("task name must not be empty".into()));
        }
        if task.max_concurrent == 0 {
            return Err(LarkBotError::Validation(format!(
                "task '{}': max_concurrent must be >= 1",
                task.name
            )));
        }
        {
            let mut tasks = self.inner.tasks.write().unwrap_or_else(|e| e.into_inner());
            if tasks.contains_key(&task.name) {
                return Err(LarkBotError::Validation(format!("task '{}' already exists", task.name)));
            }
            let initial = if task.schedule.is_none() && task.has_dependencies() {
                TaskExecutionStatus::WaitingDependency
            } else {
                TaskExecutionStatus::Pending
            };
            self.inner.lock_state().statuses.insert(task.name.clone(), initial);
            tasks.insert(task.name.clone(), task.clone());
        }
        tracing::info!("📅 Task added: '{}'", task.name);

        if self.inner.started.load(Ordering::SeqCst) && task.schedule.is_some() {
            self.register_job(&task)?;
        }
        Ok(())
    }

    pub fn load_tasks(&self, tasks: impl IntoIterator<Item = TaskDefinition>) -> Result<usize> {
        let mut count = 0;
        for task in tasks {
            self.add_task(task)?;
            count += 1;
        }
        Ok(count)
    }

    /// Remove a task and its scheduler job.
    pub fn remove_task(&self, name: &str) -> Result<TaskDefinition> {
        let removed = self
            .inner
            .tasks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
            .ok_or_else(|| LarkBotError::TaskNotFound(name.to_string()))?;
        if self.inner.scheduler.get_job(&task_job_id(name)).is_some() {
            self.inner.scheduler.remove_job(&task_job_id(name))?;
        }
        let mut state = self.inner.lock_state();
        state.statuses.remove(name);
        state.retry_counts.remove(name);
        state.waiting_since.remove(name);
        tracing::info!("🗑️ Task removed: '{name}'");
        Ok(removed)
    }

    pub fn get_task(&self, name: &str) -> Option<TaskDefinition> {
        self.inner
            .tasks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Sorted task names.
    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .tasks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn enable_task(&self, name: &str) -> Result<()> {
        self.set_enabled(name, true)
    }

    pub fn disable_task(&self, name: &str) -> Result<()> {
        self.set_enabled(name, false)
    }

    fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        {
            let mut tasks = self.inner.tasks.write().unwrap_or_else(|e| e.into_inner());
            let task = tasks
                .get_mut(name)
                .ok_or_else(|| LarkBotError::TaskNotFound(name.to_string()))?;
            task.enabled = enabled;
        }
        let job_id = task_job_id(name);
        if self.inner.scheduler.get_job(&job_id).is_some() {
            if enabled {
                self.inner.scheduler.resume_job(&job_id)?;
            } else {
                self.inner.scheduler.pause_job(&job_id)?;
            }
        }
        tracing::info!("{} Task '{name}' {}", if enabled { "▶️" } else { "⏸️" }, if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    // ─── Status ───────────────────────────────────────────────

    pub fn task_status(&self, name: &str) -> Option<TaskExecutionStatus> {
        self.inner.lock_state().statuses.get(name).copied()
    }

    pub fn all_statuses(&self) -> BTreeMap<String, TaskExecutionStatus> {
        self.inner
            .lock_state()
            .statuses
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    pub fn last_result(&self, name: &str) -> Option<ExecutionResult> {
        self.inner.lock_state().last_results.get(name).cloned()
    }

    pub fn retry_count(&self, name: &str) -> u32 {
        self.inner.lock_state().retry_counts.get(name).copied().unwrap_or(0)
    }

    pub fn running_count(&self, name: &str) -> usize {
        self.inner.lock_state().running.get(name).copied().unwrap_or(0)
    }

    // ─── Lifecycle ────────────────────────────────────────────

    /// Validate the task graph, start the dependent-task workers and register
    /// scheduled tasks as `task.{name}` jobs. Must run inside a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let tasks: Vec<TaskDefinition> = {
            let tasks = self.inner.tasks.read().unwrap_or_else(|e| e.into_inner());
            let mut tasks: Vec<TaskDefinition> = tasks.values().cloned().collect();
            tasks.sort_by(|a, b| a.name.cmp(&b.name));
            tasks
        };
        DependencyResolver::from_edges(tasks.iter().map(|t| (t.name.clone(), t.upstream().cloned().collect::<Vec<_>>())))
            .get_execution_order()?;

        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.spawn_dependent_workers();

        let mut scheduled = 0;
        for task in tasks.iter().filter(|t| t.schedule.is_some()) {
            match self.register_job(task) {
                Ok(()) => scheduled += 1,
                Err(e) => tracing::error!("❌ Could not schedule task '{}': {e}", task.name),
            }
        }
        tracing::info!(
            "🚀 Task manager started: {} tasks, {} scheduled, {} dependent workers",
            tasks.len(),
            scheduled,
            self.inner.options.dependent_workers
        );
        Ok(())
    }

    /// Remove every task job and stop the dependent workers.
    pub fn shutdown(&self) {
        self.inner.dependent_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        for handle in self.inner.workers.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            handle.abort();
        }
        for name in self.task_names() {
            let job_id = task_job_id(&name);
            if self.inner.scheduler.get_job(&job_id).is_some()
                && let Err(e) = self.inner.scheduler.remove_job(&job_id)
            {
                tracing::debug!("Could not remove job '{job_id}': {e}");
            }
        }
        self.inner.started.store(false, Ordering::SeqCst);
        tracing::info!("🛑 Task manager stopped");
    }

    fn register_job(&self, task: &TaskDefinition) -> Result<()> {
        let Some(trigger) = task.schedule.clone() else {
            return Ok(());
        };
        let weak = Arc::downgrade(&self.inner);
        let name = task.name.clone();
        let job: JobFn = Arc::new(move || {
            let weak = weak.clone();
            let name = name.clone();
            Box::pin(async move {
                if let Some(manager) = TaskManager::from_weak(&weak) {
                    manager.log_outcome(&name, manager.execute_task(&name, Context::new(), RunTrigger::Scheduled).await);
                }
            })
        });
        let job_id = task_job_id(&task.name);
        self.inner.scheduler.add_job(job, trigger, &job_id, true)?;
        if !task.enabled {
            self.inner.scheduler.pause_job(&job_id)?;
        }
        tracing::debug!("⏰ Registered job '{job_id}'");
        Ok(())
    }

    fn spawn_dependent_workers(&self) {
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let mut workers = self.inner.workers.lock().unwrap_or_else(|e| e.into_inner());
        for worker_id in 0..self.inner.options.dependent_workers.max(1) {
            let rx = rx.clone();
            let weak = Arc::downgrade(&self.inner);
            workers.push(tokio::spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(name) = next else { break };
                    let Some(manager) = TaskManager::from_weak(&weak) else { break };
                    tracing::debug!("🔗 Worker {worker_id} running dependent task '{name}'");
                    let outcome = manager.execute_task(&name, Context::new(), RunTrigger::Dependency).await;
                    manager.log_outcome(&name, outcome);
                }
            }));
        }
        *self.inner.dependent_tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
    }

    fn log_outcome(&self, name: &str, outcome: Result<RunOutcome>) {
        match outcome {
            Ok(RunOutcome::Refused { reason }) => tracing::warn!("🚦 {reason}"),
            Ok(_) => {}
            Err(e) => tracing::error!("❌ Task '{name}' could not run: {e}"),
        }
    }

    // ─── Execution ────────────────────────────────────────────

    /// Run a task now. Dependency gating, conditions and concurrency limits
    /// apply as for scheduled runs.
    pub async fn run_task(&self, name: &str, overrides: Context) -> Result<RunOutcome> {
        self.execute_task(name, overrides, RunTrigger::Manual).await
    }

    async fn execute_task(&self, name: &str, overrides: Context, trigger: RunTrigger) -> Result<RunOutcome> {
        let task = self
            .get_task(name)
            .ok_or_else(|| LarkBotError::TaskNotFound(name.to_string()))?;

        let (guard, dependency_results) = match self.admit(&task, true) {
            Admission::Admitted(guard, deps) => (guard, deps),
            Admission::NotReady(reason) => {
                tracing::info!("⏳ Task '{name}' waiting: {reason}");
                return Ok(self.skip(name, format!("Dependencies not met: {reason}")));
            }
            Admission::Blocked(reason) => {
                tracing::info!("⏭️ Task '{name}' skipped: {reason}");
                return Ok(self.skip(name, format!("Dependency failed: {reason}")));
            }
            Admission::Refused(reason) => {
                tracing::warn!("🚦 {reason}");
                return Ok(RunOutcome::Refused { reason });
            }
        };

        let context = self.build_context(&task, &overrides, dependency_results);
        let executor = TaskExecutor::new(Arc::new(task.clone()), self.inner.services.clone());
        let check = executor.can_execute(&context);
        if !check.passed {
            guard.finish(TaskExecutionStatus::Skipped, None);
            tracing::info!("⏭️ Task '{name}' skipped: {}", check.reason);
            return Ok(self.skip(name, format!("Conditions not met: {}", check.reason)));
        }

        tracing::debug!("🔔 Task '{name}' triggered ({trigger})");
        let result = executor.execute(context).await;
        let status = if result.success {
            TaskExecutionStatus::Success
        } else {
            TaskExecutionStatus::Failed
        };
        guard.finish(status, Some(&result));
        self.inner.history.record(&result);

        if !result.success {
            self.handle_failure(&task, &result, &overrides).await;
        }
        self.trigger_dependent_tasks(name);
        Ok(RunOutcome::Finished(result))
    }

    /// Dependency gate and concurrency slot, under the dependency lock.
    fn admit(&self, task: &TaskDefinition, gate_dependencies: bool) -> Admission {
        let name = task.name.as_str();
        let mut state = self.inner.lock_state();

        if gate_dependencies && task.has_dependencies() {
            match self.check_dependencies(task, &state) {
                DependencyCheck::Ready => {}
                DependencyCheck::NotReady(reason) => {
                    state.statuses.insert(name.to_string(), TaskExecutionStatus::WaitingDependency);
                    state.waiting_since.entry(name.to_string()).or_insert_with(Instant::now);
                    return Admission::NotReady(reason);
                }
                DependencyCheck::Blocked(reason) => {
                    state.statuses.insert(name.to_string(), TaskExecutionStatus::Skipped);
                    state.waiting_since.remove(name);
                    return Admission::Blocked(reason);
                }
            }
        }

        let running = state.running.get(name).copied().unwrap_or(0);
        if running >= task.max_concurrent {
            return Admission::Refused(format!(
                "Task '{name}' refused: {running}/{} executions already running",
                task.max_concurrent
            ));
        }
        *state.running.entry(name.to_string()).or_insert(0) += 1;
        state.statuses.insert(name.to_string(), TaskExecutionStatus::Running);
        state.waiting_since.remove(name);

        let mut dependency_results = Context::new();
        for upstream in task.upstream() {
            if let Some(result) = state.last_results.get(upstream)
                && let Ok(value) = serde_json::to_value(result)
            {
                dependency_results.insert(upstream.clone(), value);
            }
        }

        Admission::Admitted(
            SlotGuard {
                inner: self.inner.clone(),
                name: name.to_string(),
                armed: true,
            },
            dependency_results,
        )
    }

    fn check_dependencies(&self, task: &TaskDefinition, state: &DependencyState) -> DependencyCheck {
        for dep in &task.depends_on {
            match state.status(dep) {
                TaskExecutionStatus::Success => {}
                TaskExecutionStatus::Running => {
                    return DependencyCheck::NotReady(format!("dependency '{dep}' is still running"));
                }
                status @ (TaskExecutionStatus::Failed | TaskExecutionStatus::Skipped) => {
                    if task.skip_if_dependency_failed {
                        return DependencyCheck::Blocked(format!("dependency '{dep}' is {status}"));
                    }
                    let waited_out = self.inner.options.failed_dependency_policy == FailedDependencyPolicy::Timeout
                        && state
                            .waiting_since
                            .get(&task.name)
                            .is_some_and(|since| since.elapsed() >= task.dependency_timeout);
                    if waited_out {
                        return DependencyCheck::Blocked(format!(
                            "dependency '{dep}' is {status}; gave up after {:.0}s",
                            task.dependency_timeout.as_secs_f64()
                        ));
                    }
                    return DependencyCheck::NotReady(format!("dependency '{dep}' is {status}"));
                }
                TaskExecutionStatus::Pending | TaskExecutionStatus::WaitingDependency => {
                    return DependencyCheck::NotReady(format!("dependency '{dep}' has not run yet"));
                }
            }
        }
        for dep in &task.run_after {
            let status = state.status(dep);
            if !status.is_terminal() {
                return DependencyCheck::NotReady(format!("'{dep}' has not finished ({status})"));
            }
        }
        DependencyCheck::Ready
    }

    fn skip(&self, name: &str, reason: String) -> RunOutcome {
        let mut result = ExecutionResult::skipped(name, reason);
        result.finish();
        self.inner.history.record(&result);
        RunOutcome::Skipped(result)
    }

    /// environment → task.context → environment variables → parameter
    /// defaults → overrides → `dependency_results`.
    fn build_context(&self, task: &TaskDefinition, overrides: &Context, dependency_results: Context) -> Context {
        let options = &self.inner.options;
        let mut context = Context::new();
        if let Some(env) = &options.environment {
            context.insert("environment".into(), Value::String(env.clone()));
        }
        context.extend(task.context.clone());
        context.extend(options.variables.clone());
        for param in &task.parameters {
            if !param.default.is_null() || !context.contains_key(&param.name) {
                context.insert(param.name.clone(), param.default.clone());
            }
        }
        context.extend(overrides.clone());
        if !dependency_results.is_empty() {
            context.insert("dependency_results".into(), Value::Object(dependency_results));
        }
        context
    }

    // ─── Retry / failure ──────────────────────────────────────

    async fn handle_failure(&self, task: &TaskDefinition, result: &ExecutionResult, overrides: &Context) {
        let policy = &task.error_handling;
        if !policy.retry_on_failure {
            // the executor already applied log/notify for this run
            if policy.on_failure_action == FailureAction::Disable {
                self.disable_after_failure(&task.name);
            }
            return;
        }

        let attempt = {
            let mut state = self.inner.lock_state();
            let count = state.retry_counts.entry(task.name.clone()).or_insert(0);
            if *count < policy.max_retries {
                let attempt = *count;
                *count += 1;
                Some(attempt)
            } else {
                *count = 0;
                None
            }
        };

        match attempt {
            Some(attempt) => {
                if let Err(e) = self.schedule_retry(task, attempt, overrides) {
                    tracing::error!("❌ Could not schedule retry for '{}': {e}", task.name);
                }
            }
            None => self.handle_final_failure(task, result).await,
        }
    }

    /// One-shot `date` job after `min(retry_delay * 2^attempt, 300s)`.
    fn schedule_retry(&self, task: &TaskDefinition, attempt: u32, overrides: &Context) -> Result<String> {
        let delay = backoff_delay(task.error_handling.retry_delay, attempt);
        let run_date = Utc::now()
            + chrono::Duration::from_std(delay).map_err(|e| LarkBotError::Scheduler(e.to_string()))?;
        let job_id = format!("{}.retry.{}", task_job_id(&task.name), attempt + 1);

        let weak = Arc::downgrade(&self.inner);
        let name = task.name.clone();
        let overrides = overrides.clone();
        let job: JobFn = Arc::new(move || {
            let weak = weak.clone();
            let name = name.clone();
            let overrides = overrides.clone();
            Box::pin(async move {
                if let Some(manager) = TaskManager::from_weak(&weak) {
                    manager.log_outcome(&name, manager.execute_task(&name, overrides, RunTrigger::Retry).await);
                }
            })
        });

        let id = self
            .inner
            .scheduler
            .add_job(job, JobTrigger::at(run_date), &job_id, true)?;
        tracing::info!(
            "🔁 Retry {}/{} for '{}' in {:.0}s",
            attempt + 1,
            task.error_handling.max_retries,
            task.name,
            delay.as_secs_f64()
        );
        Ok(id)
    }

    async fn handle_final_failure(&self, task: &TaskDefinition, result: &ExecutionResult) {
        let name = task.name.as_str();
        let error = result.error.as_deref().unwrap_or("unknown error");
        tracing::error!("💀 Task '{name}' failed permanently after all retries: {error}");
        let policy = &task.error_handling;
        match policy.on_failure_action {
            FailureAction::Disable => self.disable_after_failure(name),
            FailureAction::Notify => match &policy.notification_target {
                Some(target) => {
                    if let Err(e) = self
                        .inner
                        .services
                        .notifier
                        .task_failed_permanently(name, error, target)
                        .await
                    {
                        tracing::warn!("⚠️ Failure notification for '{name}' not delivered: {e}");
                    }
                }
                None => tracing::warn!("⚠️ Task '{name}' has no notification_target"),
            },
            FailureAction::Log => {}
            FailureAction::Ignore | FailureAction::Continue => {
                tracing::debug!("Final failure of '{name}' ignored")
            }
        }
    }

    fn disable_after_failure(&self, name: &str) {
        match self.set_enabled(name, false) {
            Ok(()) => tracing::warn!("🚫 Task '{name}' disabled after failure"),
            Err(e) => tracing::error!("❌ Could not disable '{name}': {e}"),
        }
    }

    // ─── Dependents ───────────────────────────────────────────

    /// Queue every waiting task that `completed` may have unblocked.
    fn trigger_dependent_tasks(&self, completed: &str) {
        let Some(tx) = self.inner.dependent_tx.lock().unwrap_or_else(|e| e.into_inner()).clone() else {
            return;
        };

        let mut ready = Vec::new();
        {
            let tasks = self.inner.tasks.read().unwrap_or_else(|e| e.into_inner());
            let mut state = self.inner.lock_state();
            for task in tasks
                .values()
                .filter(|t| t.enabled && t.upstream().any(|u| u == completed))
            {
                let status = state.status(&task.name);
                // dependency-driven tasks rerun whenever an upstream completes
                let eligible = status == TaskExecutionStatus::WaitingDependency
                    || (task.schedule.is_none() && status.is_terminal());
                if !eligible {
                    continue;
                }
                match self.check_dependencies(task, &state) {
                    DependencyCheck::NotReady(_) => {
                        state.statuses.insert(task.name.clone(), TaskExecutionStatus::WaitingDependency);
                    }
                    DependencyCheck::Ready | DependencyCheck::Blocked(_) => {
                        state.statuses.insert(task.name.clone(), TaskExecutionStatus::Pending);
                        ready.push(task.name.clone());
                    }
                }
            }
        }

        for name in ready {
            tracing::info!("🔗 '{completed}' completed, queueing dependent '{name}'");
            if tx.send(name).is_err() {
                tracing::warn!("⚠️ Dependent task queue is closed");
            }
        }
    }

    // ─── Groups & tags ────────────────────────────────────────

    fn names_where(&self, predicate: impl Fn(&TaskDefinition) -> bool) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .tasks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|t| predicate(t))
            .map(|t| t.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn get_tasks_by_tag(&self, tag: &str) -> Vec<String> {
        self.names_where(|t| t.tags.contains(tag))
    }

    pub fn get_tasks_by_group(&self, group: &str) -> Vec<String> {
        self.names_where(|t| t.group.as_deref() == Some(group))
    }

    pub fn list_groups(&self) -> Vec<String> {
        let tasks = self.inner.tasks.read().unwrap_or_else(|e| e.into_inner());
        tasks
            .values()
            .filter_map(|t| t.group.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn enable_group(&self, group: &str) -> Result<usize> {
        let names = self.get_tasks_by_group(group);
        for name in &names {
            self.enable_task(name)?;
        }
        Ok(names.len())
    }

    pub fn disable_group(&self, group: &str) -> Result<usize> {
        let names = self.get_tasks_by_group(group);
        for name in &names {
            self.disable_task(name)?;
        }
        Ok(names.len())
    }

    /// Run every task of a group, upstream members first.
    pub async fn run_group(&self, group: &str, overrides: Context) -> Result<Vec<(String, RunOutcome)>> {
        let members = self.get_tasks_by_group(group);
        if members.is_empty() {
            return Err(LarkBotError::Validation(format!("no tasks in group '{group}'")));
        }
        let mut resolver = DependencyResolver::new();
        for name in &members {
            if let Some(task) = self.get_task(name) {
                let deps: Vec<String> = task.upstream().filter(|d| members.contains(d)).cloned().collect();
                resolver.add(name.clone(), deps);
            }
        }
        let order = resolver.get_execution_order()?;

        tracing::info!("📦 Running group '{group}' ({} tasks)", members.len());
        let mut outcomes = Vec::new();
        for name in order.into_iter().flatten() {
            let outcome = self.run_task(&name, overrides.clone()).await?;
            outcomes.push((name, outcome));
        }
        Ok(outcomes)
    }

    // ─── Chains & parallel runs ───────────────────────────────

    /// Run `names` one after another over one shared context. Dependency
    /// gates do not apply; with `stop_on_failure` the rest of the chain is
    /// marked skipped after the first failure.
    pub async fn run_task_chain(
        &self,
        names: &[String],
        initial_context: Context,
        stop_on_failure: bool,
    ) -> Result<ChainRunReport> {
        let tasks: Vec<TaskDefinition> = names
            .iter()
            .map(|n| self.get_task(n).ok_or_else(|| LarkBotError::TaskNotFound(n.clone())))
            .collect::<Result<_>>()?;

        tracing::info!("⛓️ Running chain: {}", names.join(" → "));
        let mut context = initial_context;
        let mut results = Vec::new();
        let mut skipped = Vec::new();
        let mut failed = false;

        for task in tasks {
            let name = task.name.clone();
            if failed && stop_on_failure {
                self.inner
                    .lock_state()
                    .statuses
                    .insert(name.clone(), TaskExecutionStatus::Skipped);
                if let RunOutcome::Skipped(result) = self.skip(&name, "Skipped: an earlier task in the chain failed".into()) {
                    results.push(result);
                }
                skipped.push(name);
                continue;
            }

            let guard = match self.admit(&task, false) {
                Admission::Admitted(guard, _) => guard,
                Admission::Refused(reason) | Admission::NotReady(reason) | Admission::Blocked(reason) => {
                    tracing::warn!("🚦 {reason}");
                    results.push(ExecutionResult::skipped(&name, reason));
                    failed = true;
                    continue;
                }
            };

            let run_context = self.build_context(&task, &context, Context::new());
            let executor = TaskExecutor::new(Arc::new(task), self.inner.services.clone());
            let check = executor.can_execute(&run_context);
            if !check.passed {
                guard.finish(TaskExecutionStatus::Skipped, None);
                if let RunOutcome::Skipped(result) = self.skip(&name, format!("Conditions not met: {}", check.reason)) {
                    results.push(result);
                }
                continue;
            }

            let (result, updated) = executor.execute_with_context(run_context).await;
            let status = if result.success {
                TaskExecutionStatus::Success
            } else {
                TaskExecutionStatus::Failed
            };
            guard.finish(status, Some(&result));
            self.inner.history.record(&result);
            context = updated;
            failed |= !result.success;
            results.push(result);
        }

        Ok(ChainRunReport { results, skipped, context })
    }

    /// Run `names` concurrently on at most `max_workers` workers. Tasks not
    /// finished within `timeout` are cancelled and reported as timed out.
    pub async fn run_parallel_tasks(
        &self,
        names: &[String],
        max_workers: Option<usize>,
        timeout: Duration,
    ) -> Result<ParallelRunReport> {
        let mut unique: Vec<String> = Vec::new();
        for name in names {
            if self.get_task(name).is_none() {
                return Err(LarkBotError::TaskNotFound(name.clone()));
            }
            if !unique.contains(name) {
                unique.push(name.clone());
            }
        }

        let workers = max_workers.unwrap_or(self.inner.options.parallel_workers).max(1);
        let semaphore = Arc::new(Semaphore::new(workers));
        let mut set = JoinSet::new();
        for name in &unique {
            let manager = self.clone();
            let semaphore = semaphore.clone();
            let name = name.clone();
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let outcome = manager.execute_task(&name, Context::new(), RunTrigger::Manual).await;
                (name, outcome)
            });
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let mut results = BTreeMap::new();
        loop {
            match tokio::time::timeout_at(deadline, set.join_next()).await {
                Ok(Some(Ok((name, outcome)))) => {
                    let result = match outcome {
                        Ok(outcome) => outcome.into_result(&name),
                        Err(e) => ExecutionResult::skipped(&name, e.to_string()),
                    };
                    results.insert(name, result);
                }
                Ok(Some(Err(e))) => tracing::error!("❌ Parallel task crashed: {e}"),
                Ok(None) => break,
                Err(_) => {
                    set.abort_all();
                    while set.join_next().await.is_some() {}
                    break;
                }
            }
        }

        let mut timed_out = Vec::new();
        for name in unique {
            if results.contains_key(&name) {
                continue;
            }
            let mut result = ExecutionResult::skipped(&name, format!("Timed out after {:.1}s", timeout.as_secs_f64()));
            result.timed_out = true;
            result.finish();
            self.inner.history.record(&result);
            tracing::warn!("⏱️ Task '{name}' timed out in parallel run");
            timed_out.push(name.clone());
            results.insert(name, result);
        }
        Ok(ParallelRunReport { results, timed_out })
    }
}
