//! # LarkBot Scheduler
//!
//! Dependency-aware task scheduling, multi-source triggers, automation rules
//! and workflows for the LarkBot Feishu/Lark bot.
//!
//! ## Design Principles
//! - Collaborators behind traits: scheduler, sender, HTTP, plugins, templates, AI
//! - Skips are results, not errors; structural errors are never retried
//! - Bounded concurrency: semaphores, worker pools, per-task slots
//! - SQLite history is optional; the in-memory ring buffer always works
//!
//! ## Architecture
//! ```text
//! Scheduler job / event / webhook / manual call / rule completion
//!   ├── TaskManager ── admit (deps, concurrency) → TaskExecutor
//!   │     ├── ConditionEvaluator (time, weekday, env, custom)
//!   │     ├── actions: plugin, send, http, script, ai
//!   │     ├── ExecutionHistoryStore (+ HistoryDb)
//!   │     ├── retry (date job) / final failure policy
//!   │     └── dependents → work queue → workers
//!   ├── TriggerRegistry ── schedule | event | webhook | manual | chain
//!   │     └── callback → AutomationEngine.trigger_rule
//!   ├── AutomationEngine ── send_text | send_template | http_request
//!   └── WorkflowOrchestrator ── DependencyResolver batches → steps
//! ```

pub mod automation;
pub mod condition;
pub mod definitions;
pub mod dispatch;
pub mod executor;
pub mod expression;
pub mod history;
pub mod http;
pub mod manager;
pub mod notify;
pub mod persistence;
pub mod resolver;
pub mod retry;
pub mod scheduler;
pub mod tasks;
pub mod template;
pub mod triggers;
pub mod workflow;

#[cfg(test)]
mod testing;

pub use automation::{AutomationEngine, AutomationRule, RuleAction, RuleExecution, RuleTrigger};
pub use condition::{Condition, ConditionCheck, ConditionEvaluator};
pub use definitions::AutomationConfig;
pub use dispatch::{WebhookSender, WebhookTarget};
pub use executor::{ExecutionServices, TaskExecutor};
pub use expression::ExpressionEngine;
pub use history::{ExecutionHistoryStore, HealthReport, TaskStats};
pub use http::ReqwestHttpClient;
pub use manager::{FailedDependencyPolicy, ManagerOptions, RunOutcome, TaskManager};
pub use notify::Notifier;
pub use persistence::HistoryDb;
pub use resolver::DependencyResolver;
pub use retry::{RetryConfig, Sleeper, TokioSleeper};
pub use scheduler::TokioScheduler;
pub use tasks::{Action, ExecutionResult, TaskDefinition, TaskExecutionStatus};
pub use template::{MessageTemplate, TemplateStore};
pub use triggers::{Trigger, TriggerConfig, TriggerContext, TriggerKind, TriggerRegistry};
pub use workflow::{
    WorkflowExecution, WorkflowOrchestrator, WorkflowStatus, WorkflowStep, WorkflowTemplateRegistry,
};
