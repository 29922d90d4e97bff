//! Automation engine: declarative rules with a small action vocabulary.
//!
//! Rules fire on a schedule (`automation.{rule}` job), on inbound events, or
//! on demand. Actions run in order; a failed `send_text`/`send_template` is
//! logged and the rule carries on, an `http_request` that exhausts its
//! retries aborts the rest of the rule.

use chrono::{DateTime, Utc};
use larkbot_core::error::{LarkBotError, Result};
use larkbot_core::traits::{JobFn, JobTrigger, Scheduler};
use larkbot_core::types::{Context, HttpRequest, duration_secs, lookup_path};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use crate::executor::ExecutionServices;
use crate::retry::{RetryConfig, request_with_retry};
use crate::template::{display_value, interpolate_map, interpolate_value, safe_substitute};
use crate::triggers::TriggerRegistry;

pub const MAX_RULE_HISTORY: usize = 100;

fn default_true() -> bool {
    true
}

fn default_method() -> String {
    "GET".into()
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

/// A declarative automation rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationRule {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub description: String,
    pub trigger: RuleTrigger,
    #[serde(default)]
    pub actions: Vec<RuleAction>,
    /// Targets for send actions that name none.
    #[serde(default)]
    pub default_webhooks: Vec<String>,
    #[serde(default)]
    pub default_context: Context,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleTrigger {
    Schedule { schedule: JobTrigger },
    Event {
        #[serde(default)]
        event_type: Option<String>,
        #[serde(default)]
        filters: Vec<EventFilter>,
    },
}

/// `{path, equals | contains}` over the inbound payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFilter {
    pub path: String,
    #[serde(default)]
    pub equals: Option<Value>,
    #[serde(default)]
    pub contains: Option<String>,
}

impl EventFilter {
    fn matches(&self, payload: &Value) -> bool {
        let Some(actual) = lookup_path(payload, &self.path) else {
            return false;
        };
        let equals_ok = self
            .equals
            .as_ref()
            .is_none_or(|expected| actual == expected || display_value(actual) == display_value(expected));
        let contains_ok = self
            .contains
            .as_ref()
            .is_none_or(|needle| display_value(actual).contains(needle.as_str()));
        equals_ok && contains_ok
    }
}

/// Request settings of an `http_request` rule action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleHttpRequest {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default, alias = "json_body")]
    pub json: Option<Value>,
    #[serde(default, alias = "data_body")]
    pub data: Option<BTreeMap<String, String>>,
    #[serde(default = "default_timeout", with = "duration_secs")]
    pub timeout: Duration,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Context key receiving the response body.
    #[serde(default)]
    pub save_as: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleAction {
    SendText {
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        template: Option<String>,
        #[serde(default)]
        webhooks: Vec<String>,
        #[serde(default)]
        context: Context,
    },
    SendTemplate {
        template: String,
        #[serde(default)]
        webhooks: Vec<String>,
        #[serde(default)]
        context: Context,
    },
    HttpRequest {
        #[serde(default)]
        request: Option<RuleHttpRequest>,
        #[serde(default)]
        context: Context,
    },
}

impl RuleAction {
    pub fn kind(&self) -> &'static str {
        match self {
            RuleAction::SendText { .. } => "send_text",
            RuleAction::SendTemplate { .. } => "send_template",
            RuleAction::HttpRequest { .. } => "http_request",
        }
    }

    fn local_context(&self) -> &Context {
        match self {
            RuleAction::SendText { context, .. }
            | RuleAction::SendTemplate { context, .. }
            | RuleAction::HttpRequest { context, .. } => context,
        }
    }
}

/// Record of one rule execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleExecution {
    pub rule_name: String,
    /// `schedule`, `event`, `manual` or `chain`.
    pub trigger: String,
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub actions_executed: u32,
    pub actions_failed: u32,
    /// Per-action failures that did not stop the rule.
    #[serde(default)]
    pub errors: Vec<String>,
    /// The failure that aborted the rule.
    #[serde(default)]
    pub error: Option<String>,
}

pub struct AutomationEngine {
    rules: RwLock<BTreeMap<String, AutomationRule>>,
    services: Arc<ExecutionServices>,
    scheduler: Option<Arc<dyn Scheduler>>,
    triggers: Option<Arc<TriggerRegistry>>,
    history: Mutex<VecDeque<RuleExecution>>,
    max_history: usize,
}

impl AutomationEngine {
    pub fn new(services: Arc<ExecutionServices>, scheduler: Option<Arc<dyn Scheduler>>) -> Self {
        Self {
            rules: RwLock::new(BTreeMap::new()),
            services,
            scheduler,
            triggers: None,
            history: Mutex::new(VecDeque::new()),
            max_history: MAX_RULE_HISTORY,
        }
    }

    /// Report every finished rule to `registry` so chain triggers can react.
    pub fn with_trigger_registry(mut self, registry: Arc<TriggerRegistry>) -> Self {
        self.triggers = Some(registry);
        self
    }

    pub fn add_rule(&self, rule: AutomationRule) -> Result<()> {
        if rule.name.trim().is_empty() {
            return Err(LarkBotError::Validation("rule name must not be empty".into()));
        }
        let mut rules = self.rules.write().unwrap_or_else(|e| e.into_inner());
        if rules.contains_key(&rule.name) {
            return Err(LarkBotError::Validation(format!("rule '{}' already exists", rule.name)));
        }
        rules.insert(rule.name.clone(), rule);
        Ok(())
    }

    pub fn load_rules(&self, rules: impl IntoIterator<Item = AutomationRule>) -> Result<usize> {
        let mut count = 0;
        for rule in rules {
            self.add_rule(rule)?;
            count += 1;
        }
        Ok(count)
    }

    pub fn get_rule(&self, name: &str) -> Option<AutomationRule> {
        self.rules.read().unwrap_or_else(|e| e.into_inner()).get(name).cloned()
    }

    pub fn rule_names(&self) -> Vec<String> {
        self.rules.read().unwrap_or_else(|e| e.into_inner()).keys().cloned().collect()
    }

    /// Register enabled schedule rules as `automation.{rule}` jobs. Returns
    /// how many were registered; failures are logged, never fatal.
    pub fn start(self: &Arc<Self>) -> usize {
        let rules: Vec<AutomationRule> = self
            .rules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|r| r.enabled)
            .cloned()
            .collect();

        let mut registered = 0;
        for rule in &rules {
            let RuleTrigger::Schedule { schedule } = &rule.trigger else {
                continue;
            };
            let Some(scheduler) = &self.scheduler else {
                tracing::warn!("⚠️ No scheduler available, schedule rule '{}' not registered", rule.name);
                continue;
            };
            let job = self.rule_job(&rule.name);
            match scheduler.add_job(job, schedule.clone(), &format!("automation.{}", rule.name), true) {
                Ok(_) => registered += 1,
                Err(e) => tracing::error!("❌ Could not schedule rule '{}': {e}", rule.name),
            }
        }
        tracing::info!(
            "🤖 Automation engine started: {} rules, {} scheduled",
            rules.len(),
            registered
        );
        registered
    }

    fn rule_job(self: &Arc<Self>, rule_name: &str) -> JobFn {
        let weak: Weak<Self> = Arc::downgrade(self);
        let name = rule_name.to_string();
        Arc::new(move || {
            let weak = weak.clone();
            let name = name.clone();
            Box::pin(async move {
                if let Some(engine) = weak.upgrade()
                    && let Err(e) = engine.run_named(&name, None, "schedule").await
                {
                    tracing::error!("❌ Scheduled rule '{name}' failed: {e}");
                }
            })
        })
    }

    /// Remove every `automation.*` job.
    pub fn stop(&self) {
        let Some(scheduler) = &self.scheduler else {
            return;
        };
        for name in self.rule_names() {
            let job_id = format!("automation.{name}");
            if scheduler.get_job(&job_id).is_some()
                && let Err(e) = scheduler.remove_job(&job_id)
            {
                tracing::warn!("⚠️ Could not remove job '{job_id}': {e}");
            }
        }
    }

    fn event_rule_matches(rule: &AutomationRule, payload: &Value) -> bool {
        let RuleTrigger::Event { event_type, filters } = &rule.trigger else {
            return false;
        };
        if let Some(expected) = event_type
            && lookup_path(payload, "header.event_type").and_then(Value::as_str) != Some(expected.as_str())
        {
            return false;
        }
        filters.iter().all(|f| f.matches(payload))
    }

    /// Run every enabled event rule that matches `payload`. Returns the
    /// names of the rules that ran.
    pub async fn handle_event(&self, payload: &Value) -> Vec<String> {
        let matched: Vec<AutomationRule> = self
            .rules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|r| r.enabled && Self::event_rule_matches(r, payload))
            .cloned()
            .collect();

        let mut ran = Vec::new();
        for rule in matched {
            if let Err(e) = self.execute_rule(&rule, Some(payload), "event").await {
                tracing::error!("❌ Rule '{}' failed on event: {e}", rule.name);
            }
            ran.push(rule.name);
        }
        ran
    }

    /// Run a rule by name now, optionally with an event payload.
    pub async fn trigger_rule(&self, name: &str, event: Option<Value>) -> Result<RuleExecution> {
        self.run_named(name, event.as_ref(), "manual").await
    }

    async fn run_named(&self, name: &str, event: Option<&Value>, trigger: &str) -> Result<RuleExecution> {
        let rule = self
            .get_rule(name)
            .ok_or_else(|| LarkBotError::Validation(format!("rule '{name}' not found")))?;
        self.execute_rule(&rule, event, trigger).await
    }

    /// Execute `rule`. Send failures are collected and the rule continues;
    /// an HTTP failure or a structural error aborts it and is returned.
    pub async fn execute_rule(&self, rule: &AutomationRule, event: Option<&Value>, trigger: &str) -> Result<RuleExecution> {
        let mut context = rule.default_context.clone();
        if let Some(event) = event {
            context.insert("event".into(), event.clone());
        }

        let mut execution = RuleExecution {
            rule_name: rule.name.clone(),
            trigger: trigger.to_string(),
            success: false,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            actions_executed: 0,
            actions_failed: 0,
            errors: Vec::new(),
            error: None,
        };
        tracing::info!("🤖 Running rule '{}' ({trigger})", rule.name);

        let mut abort = None;
        for (index, action) in rule.actions.iter().enumerate() {
            let mut action_context = context.clone();
            action_context.extend(action.local_context().clone());

            match self.run_action(rule, action, &action_context).await {
                Ok(updates) => {
                    context.extend(updates);
                    execution.actions_executed += 1;
                }
                Err(e) => {
                    execution.actions_failed += 1;
                    let message = format!("action {} ({}): {e}", index + 1, action.kind());
                    if matches!(action, RuleAction::HttpRequest { .. }) || e.is_structural() {
                        tracing::error!("❌ Rule '{}' aborted at {message}", rule.name);
                        execution.error = Some(message);
                        abort = Some(e);
                        break;
                    }
                    tracing::warn!("⚠️ Rule '{}' {message}", rule.name);
                    execution.errors.push(message);
                }
            }
        }

        execution.success = execution.actions_failed == 0;
        execution.finished_at = Utc::now();
        self.record(execution.clone());

        if let Some(registry) = &self.triggers {
            let result = serde_json::to_value(&execution).unwrap_or(Value::Null);
            registry
                .notify_rule_completed(&rule.name, execution.success, &result)
                .await;
        }

        match abort {
            Some(e) => Err(e),
            None => Ok(execution),
        }
    }

    /// Run one action. Returns the context updates it produced.
    async fn run_action(&self, rule: &AutomationRule, action: &RuleAction, context: &Context) -> Result<Context> {
        match action {
            RuleAction::SendText { text, template, webhooks, .. } => {
                let content = match (template, text) {
                    (Some(name), fallback) => match self.services.templates.render(name, context) {
                        Ok(rendered) => rendered.content,
                        Err(e) => match fallback {
                            Some(text) => {
                                tracing::warn!("⚠️ Template '{name}' unavailable ({e}), sending text");
                                safe_substitute(text, context)
                            }
                            None => return Err(e),
                        },
                    },
                    (None, Some(text)) => safe_substitute(text, context),
                    (None, None) => {
                        return Err(LarkBotError::Config("send_text action needs 'text' or 'template'".into()));
                    }
                };
                self.send(rule, &content, webhooks).await?;
                Ok(Context::new())
            }
            RuleAction::SendTemplate { template, webhooks, .. } => {
                let rendered = self.services.templates.render(template, context)?;
                self.send(rule, &rendered.content, webhooks).await?;
                Ok(Context::new())
            }
            RuleAction::HttpRequest { request, .. } => {
                let settings = request.as_ref().ok_or_else(|| {
                    LarkBotError::Config(format!("rule '{}': http_request action has no request config", rule.name))
                })?;
                let mut http_request = HttpRequest::new(&settings.method, &safe_substitute(&settings.url, context));
                http_request.headers = interpolate_map(&settings.headers, context);
                http_request.params = interpolate_map(&settings.params, context);
                http_request.json = settings.json.as_ref().map(|body| interpolate_value(body, context));
                http_request.form = settings.data.as_ref().map(|form| interpolate_map(form, context));
                http_request.timeout = settings.timeout;

                let response = request_with_retry(
                    self.services.http.as_ref(),
                    self.services.sleeper.as_ref(),
                    &http_request,
                    &settings.retry,
                )
                .await?;
                tracing::debug!("🌐 {} {} → {}", http_request.method, http_request.url, response.status);

                let mut updates = Context::new();
                if let Some(key) = &settings.save_as {
                    updates.insert(key.clone(), response.body_value());
                }
                Ok(updates)
            }
        }
    }

    /// Send to the action's targets, else the rule's defaults, else the
    /// default target. Unknown targets fail the action before anything is sent.
    async fn send(&self, rule: &AutomationRule, text: &str, webhooks: &[String]) -> Result<()> {
        let targets: Vec<String> = if !webhooks.is_empty() {
            webhooks.to_vec()
        } else if !rule.default_webhooks.is_empty() {
            rule.default_webhooks.clone()
        } else {
            vec![self.services.default_target.clone()]
        };
        if let Some(unknown) = targets.iter().find(|t| !self.services.sender.has_target(t)) {
            return Err(LarkBotError::Validation(format!("unknown webhook target '{unknown}'")));
        }
        for target in &targets {
            self.services.sender.send_text(text, target).await?;
        }
        Ok(())
    }

    fn record(&self, execution: RuleExecution) {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.push_back(execution);
        while history.len() > self.max_history {
            history.pop_front();
        }
    }

    /// Most recent executions, oldest first.
    pub fn get_execution_history(&self, limit: Option<usize>) -> Vec<RuleExecution> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let limit = limit.unwrap_or(history.len());
        history.iter().skip(history.len().saturating_sub(limit)).cloned().collect()
    }
}
