//! Task definitions: the core data model for scheduled work.

use chrono::{DateTime, Utc};
use larkbot_core::traits::JobTrigger;
use larkbot_core::types::{Context, duration_secs, opt_duration_secs};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use crate::condition::Condition;
use crate::retry::RetryConfig;

/// A named, independently schedulable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Unique task name.
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub description: String,
    /// Passed through to the scheduler untouched. Tasks without a schedule
    /// run on demand or when their dependencies complete.
    #[serde(default)]
    pub schedule: Option<JobTrigger>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub error_handling: ErrorHandling,
    /// Tasks that must have succeeded.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Tasks that must have finished, whatever the outcome.
    #[serde(default)]
    pub run_after: Vec<String>,
    #[serde(default)]
    pub skip_if_dependency_failed: bool,
    #[serde(default = "default_dependency_timeout", with = "duration_secs")]
    pub dependency_timeout: Duration,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default, with = "opt_duration_secs")]
    pub timeout: Option<Duration>,
    /// Default variables.
    #[serde(default)]
    pub context: Context,
    #[serde(default)]
    pub parameters: Vec<TaskParameter>,
}

fn default_true() -> bool {
    true
}

fn default_dependency_timeout() -> Duration {
    Duration::from_secs(3600)
}

fn default_max_concurrent() -> usize {
    1
}

impl TaskDefinition {
    /// A task with no actions and default policies.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            enabled: true,
            description: String::new(),
            schedule: None,
            conditions: Vec::new(),
            actions: Vec::new(),
            error_handling: ErrorHandling::default(),
            depends_on: Vec::new(),
            run_after: Vec::new(),
            skip_if_dependency_failed: false,
            dependency_timeout: default_dependency_timeout(),
            max_concurrent: default_max_concurrent(),
            group: None,
            tags: BTreeSet::new(),
            timeout: None,
            context: Context::new(),
            parameters: Vec::new(),
        }
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    /// Whether this task waits on other tasks.
    pub fn has_dependencies(&self) -> bool {
        !self.depends_on.is_empty() || !self.run_after.is_empty()
    }

    /// Every upstream task name (`depends_on` then `run_after`).
    pub fn upstream(&self) -> impl Iterator<Item = &String> {
        self.depends_on.iter().chain(self.run_after.iter())
    }
}

/// A declared task parameter and its default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskParameter {
    pub name: String,
    #[serde(default)]
    pub default: Value,
    #[serde(default)]
    pub description: String,
}

/// One step of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Call `plugin.method(**args)`.
    PluginMethod {
        plugin: String,
        method: String,
        #[serde(default)]
        args: Map<String, Value>,
        #[serde(default)]
        save_as: Option<String>,
    },
    /// Send a `${var}` templated text (or a named template) to webhook targets.
    SendMessage {
        #[serde(default)]
        message: String,
        #[serde(default)]
        webhooks: Vec<String>,
        #[serde(default)]
        template: Option<String>,
    },
    HttpRequest {
        #[serde(default = "default_method")]
        method: String,
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        params: BTreeMap<String, String>,
        #[serde(default, alias = "json")]
        json_body: Option<Value>,
        #[serde(default, alias = "data")]
        data_body: Option<BTreeMap<String, String>>,
        #[serde(default = "default_http_timeout", with = "duration_secs")]
        timeout: Duration,
        #[serde(default)]
        retry: Option<RetryConfig>,
        /// Store the response body in `context[save_as]`.
        #[serde(default)]
        save_as: Option<String>,
    },
    /// Sandboxed script with read/write access to `context`.
    #[serde(alias = "python_code")]
    Script { code: String },
    /// Delegate to the AI action runner.
    #[serde(rename = "ai_chat", alias = "ai_query")]
    Ai {
        prompt: String,
        #[serde(default)]
        tools: Vec<String>,
        #[serde(default)]
        save_as: Option<String>,
        #[serde(default)]
        options: Map<String, Value>,
    },
}

fn default_method() -> String {
    "GET".into()
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::PluginMethod { .. } => "plugin_method",
            Action::SendMessage { .. } => "send_message",
            Action::HttpRequest { .. } => "http_request",
            Action::Script { .. } => "script",
            Action::Ai { .. } => "ai_chat",
        }
    }

    pub fn send_message(message: &str) -> Self {
        Action::SendMessage {
            message: message.to_string(),
            webhooks: Vec::new(),
            template: None,
        }
    }
}

/// Per-task error policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorHandling {
    #[serde(default)]
    pub retry_on_failure: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay for exponential backoff.
    #[serde(default = "default_retry_delay", with = "duration_secs")]
    pub retry_delay: Duration,
    #[serde(default)]
    pub on_failure_action: FailureAction,
    #[serde(default, alias = "notification_webhook")]
    pub notification_target: Option<String>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(60)
}

impl Default for ErrorHandling {
    fn default() -> Self {
        Self {
            retry_on_failure: false,
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
            on_failure_action: FailureAction::default(),
            notification_target: None,
        }
    }
}

/// What to do once a task has failed for good.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureAction {
    #[default]
    Log,
    Notify,
    Disable,
    Ignore,
    Continue,
}

/// Outcome of one task execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub task_name: String,
    pub success: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    pub actions_executed: u32,
    pub actions_failed: u32,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub timed_out: bool,
}

impl ExecutionResult {
    /// A result whose clock starts now.
    pub fn started(task_name: &str) -> Self {
        let now = Utc::now();
        Self {
            task_name: task_name.to_string(),
            success: false,
            start_time: now,
            end_time: now,
            duration: Duration::ZERO,
            actions_executed: 0,
            actions_failed: 0,
            error: None,
            timed_out: false,
        }
    }

    /// A skip: unsuccessful, zero actions, never an error.
    pub fn skipped(task_name: &str, reason: impl Into<String>) -> Self {
        let mut result = Self::started(task_name);
        result.error = Some(reason.into());
        result
    }

    /// Stop the clock.
    pub fn finish(&mut self) {
        self.end_time = Utc::now();
        self.duration = (self.end_time - self.start_time).to_std().unwrap_or_default();
    }
}

/// Current state of a task name in the manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskExecutionStatus {
    #[default]
    Pending,
    WaitingDependency,
    Running,
    Success,
    Failed,
    Skipped,
}

impl TaskExecutionStatus {
    /// Finished for this cycle, whatever the outcome.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::WaitingDependency => "waiting_dependency",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for TaskExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
