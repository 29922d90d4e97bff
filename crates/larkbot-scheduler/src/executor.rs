//! Task executor: runs one task instance to completion.
//!
//! Conditions are checked first (a failed check is a skip, never an error),
//! then actions run in declaration order against the injected collaborators.

use larkbot_core::error::{LarkBotError, Result};
use larkbot_core::plugin::{PluginProvider, PluginRegistry};
use larkbot_core::traits::{AiActionRunner, HttpClient, MessageSender, TemplateRenderer};
use larkbot_core::types::{Context, HttpRequest};
use serde_json::Value;
use std::sync::Arc;

use crate::condition::{ConditionCheck, ConditionEvaluator};
use crate::expression::ExpressionEngine;
use crate::notify::Notifier;
use crate::retry::{Sleeper, TokioSleeper, request_with_retry};
use crate::tasks::{Action, ExecutionResult, FailureAction, TaskDefinition};
use crate::template::{TemplateStore, interpolate_map, interpolate_value, safe_substitute};

/// Collaborators shared by every execution.
pub struct ExecutionServices {
    pub sender: Arc<dyn MessageSender>,
    pub plugins: Arc<dyn PluginProvider>,
    pub http: Arc<dyn HttpClient>,
    pub ai: Option<Arc<dyn AiActionRunner>>,
    pub templates: Arc<dyn TemplateRenderer>,
    pub expressions: Arc<ExpressionEngine>,
    pub notifier: Arc<Notifier>,
    pub sleeper: Arc<dyn Sleeper>,
    /// Target used when an action names none.
    pub default_target: String,
}

impl ExecutionServices {
    pub fn new(sender: Arc<dyn MessageSender>, http: Arc<dyn HttpClient>) -> Self {
        Self {
            notifier: Arc::new(Notifier::new(sender.clone())),
            sender,
            plugins: Arc::new(PluginRegistry::new()),
            http,
            ai: None,
            templates: Arc::new(TemplateStore::new()),
            expressions: Arc::new(ExpressionEngine::new()),
            sleeper: Arc::new(TokioSleeper),
            default_target: "default".into(),
        }
    }

    pub fn with_plugins(mut self, plugins: Arc<dyn PluginProvider>) -> Self {
        self.plugins = plugins;
        self
    }

    pub fn with_ai(mut self, ai: Arc<dyn AiActionRunner>) -> Self {
        self.ai = Some(ai);
        self
    }

    pub fn with_templates(mut self, templates: Arc<dyn TemplateRenderer>) -> Self {
        self.templates = templates;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_default_target(mut self, target: &str) -> Self {
        self.default_target = target.to_string();
        self
    }

    /// Explicit targets, or the default target when none are given.
    pub fn resolve_targets(&self, targets: &[String]) -> Vec<String> {
        if targets.is_empty() {
            vec![self.default_target.clone()]
        } else {
            targets.to_vec()
        }
    }

    /// Send `text` to every known target; unknown targets are logged and skipped.
    /// Returns how many targets received the message.
    pub async fn send_to_targets(&self, text: &str, targets: &[String]) -> Result<usize> {
        let mut delivered = 0;
        for target in self.resolve_targets(targets) {
            if !self.sender.has_target(&target) {
                tracing::warn!("⚠️ Unknown message target '{target}', skipping");
                continue;
            }
            self.sender.send_text(text, &target).await?;
            delivered += 1;
        }
        Ok(delivered)
    }

    /// Run one action against `context`; `save_as` and scripts write back into it.
    pub async fn perform(&self, action: &Action, context: &mut Context) -> Result<()> {
        match action {
            Action::PluginMethod { plugin, method, args, save_as } => {
                let target = self
                    .plugins
                    .get_plugin(plugin)
                    .ok_or_else(|| LarkBotError::Plugin(format!("Plugin '{plugin}' not found")))?;
                let args = match interpolate_value(&Value::Object(args.clone()), context) {
                    Value::Object(map) => map,
                    _ => args.clone(),
                };
                let output = target.call(method, args).await?;
                if let Some(key) = save_as {
                    context.insert(key.clone(), output);
                }
                Ok(())
            }
            Action::SendMessage { message, webhooks, template } => {
                let text = match template {
                    Some(name) => self.templates.render(name, context)?.content,
                    None => safe_substitute(message, context),
                };
                self.send_to_targets(&text, webhooks).await.map(|_| ())
            }
            Action::HttpRequest {
                method,
                url,
                headers,
                params,
                json_body,
                data_body,
                timeout,
                retry,
                save_as,
            } => {
                let mut request = HttpRequest::new(method, &safe_substitute(url, context));
                request.headers = interpolate_map(headers, context);
                request.params = interpolate_map(params, context);
                request.json = json_body.as_ref().map(|body| interpolate_value(body, context));
                request.form = data_body.as_ref().map(|form| interpolate_map(form, context));
                request.timeout = *timeout;

                let retry = retry.clone().unwrap_or_default();
                let response =
                    request_with_retry(self.http.as_ref(), self.sleeper.as_ref(), &request, &retry).await?;
                if let Some(key) = save_as {
                    context.insert(key.clone(), response.body_value());
                }
                Ok(())
            }
            Action::Script { code } => {
                *context = self.expressions.run_script(code, context)?;
                Ok(())
            }
            Action::Ai { prompt, save_as, .. } => {
                let runner = self
                    .ai
                    .as_ref()
                    .ok_or_else(|| LarkBotError::Action("No AI runner configured".into()))?;
                let mut config = serde_json::to_value(action)?;
                if let Some(obj) = config.as_object_mut() {
                    obj.insert("prompt".into(), Value::String(safe_substitute(prompt, context)));
                }
                let answer = runner.execute_ai_task_action(&config, context).await?;
                if !answer.success {
                    return Err(LarkBotError::Action(format!(
                        "AI action failed: {}",
                        answer.error.as_deref().unwrap_or("unknown error")
                    )));
                }
                if let Some(key) = save_as {
                    context.insert(key.clone(), Value::String(answer.response));
                }
                Ok(())
            }
        }
    }
}

/// Runs a single task definition.
pub struct TaskExecutor {
    task: Arc<TaskDefinition>,
    services: Arc<ExecutionServices>,
    conditions: ConditionEvaluator,
}

impl TaskExecutor {
    pub fn new(task: Arc<TaskDefinition>, services: Arc<ExecutionServices>) -> Self {
        let conditions = ConditionEvaluator::new(services.expressions.clone());
        Self { task, services, conditions }
    }

    pub fn task(&self) -> &TaskDefinition {
        &self.task
    }

    /// Whether the task may run now: enabled and every condition passes.
    pub fn can_execute(&self, context: &Context) -> ConditionCheck {
        if !self.task.enabled {
            return ConditionCheck::fail("Task is disabled");
        }
        self.conditions.evaluate_all(&self.task.conditions, context)
    }

    pub async fn execute(&self, context: Context) -> ExecutionResult {
        self.execute_with_context(context).await.0
    }

    /// Execute and also hand back the context as the actions left it.
    pub async fn execute_with_context(&self, mut context: Context) -> (ExecutionResult, Context) {
        let name = self.task.name.as_str();
        let mut result = ExecutionResult::started(name);

        let check = self.can_execute(&context);
        if !check.passed {
            tracing::info!("⏭️ Task '{name}' skipped: {}", check.reason);
            result.error = Some(format!("Conditions not met: {}", check.reason));
            result.finish();
            return (result, context);
        }

        tracing::info!("▶️ Executing task '{name}' ({} actions)", self.task.actions.len());
        let mut timed_out = false;
        let outcome = match self.task.timeout {
            Some(limit) => match tokio::time::timeout(limit, self.run_actions(&mut result, &mut context)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    timed_out = true;
                    Err(LarkBotError::Action(format!(
                        "Task timed out after {:.1}s",
                        limit.as_secs_f64()
                    )))
                }
            },
            None => self.run_actions(&mut result, &mut context).await,
        };
        result.timed_out = timed_out;

        match outcome {
            Ok(()) => {
                result.success = result.actions_failed == 0;
                if !result.success && result.error.is_none() {
                    result.error = Some(format!("{} action(s) failed", result.actions_failed));
                }
            }
            Err(e) => {
                result.success = false;
                result.error = Some(e.to_string());
                self.handle_error(&e).await;
            }
        }
        result.finish();

        if result.success {
            tracing::info!(
                "✅ Task '{name}' completed in {:.2}s ({} actions)",
                result.duration.as_secs_f64(),
                result.actions_executed
            );
        } else {
            tracing::warn!(
                "❌ Task '{name}' failed: {}",
                result.error.as_deref().unwrap_or("unknown error")
            );
        }
        (result, context)
    }

    async fn run_actions(&self, result: &mut ExecutionResult, context: &mut Context) -> Result<()> {
        let name = self.task.name.as_str();
        for (index, action) in self.task.actions.iter().enumerate() {
            tracing::debug!("🔧 [{name}] action {} ({})", index + 1, action.kind());
            match self.services.perform(action, context).await {
                Ok(()) => result.actions_executed += 1,
                Err(e) => {
                    result.actions_failed += 1;
                    tracing::error!("❌ [{name}] action {} ({}) failed: {e}", index + 1, action.kind());
                    if !self.task.error_handling.retry_on_failure {
                        return Err(e);
                    }
                    result.error = Some(e.to_string());
                }
            }
        }
        Ok(())
    }

    /// Local error policy for an aborted run.
    async fn handle_error(&self, error: &LarkBotError) {
        let name = self.task.name.as_str();
        let policy = &self.task.error_handling;
        match policy.on_failure_action {
            FailureAction::Log => tracing::error!("❌ Task '{name}' error: {error}"),
            FailureAction::Notify => match &policy.notification_target {
                Some(target) => {
                    if let Err(e) = self.services.notifier.task_failed(name, &error.to_string(), target).await {
                        tracing::warn!("⚠️ Could not notify about '{name}': {e}");
                    }
                }
                None => tracing::warn!("⚠️ Task '{name}' wants notification but has no notification_target"),
            },
            FailureAction::Disable => {
                tracing::warn!("⚠️ Task '{name}' failed and is marked for disabling: {error}")
            }
            FailureAction::Ignore | FailureAction::Continue => {
                tracing::debug!("Task '{name}' error ignored: {error}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Condition;
    use crate::testing::{RecordingSleeper, StubAi, StubHttp, StubSender};
    use crate::template::MessageTemplate;
    use larkbot_core::plugin::Plugin;
    use serde_json::json;
    use std::time::Duration;

    fn ctx(value: Value) -> Context {
        value.as_object().cloned().unwrap()
    }

    struct Fixture {
        sender: Arc<StubSender>,
        http: Arc<StubHttp>,
        services: Arc<ExecutionServices>,
    }

    fn fixture_with(configure: impl FnOnce(ExecutionServices) -> ExecutionServices) -> Fixture {
        let sender = Arc::new(StubSender::new(&["default", "ops"]));
        let http = Arc::new(StubHttp::new());
        let mut plugins = PluginRegistry::new();
        plugins.register(
            Plugin::new("weather")
                .method("lookup", |args| async move {
                    Ok(json!({"city": args.get("city").cloned().unwrap_or(Value::Null), "temp": 21}))
                })
                .method("slow", |_args| async move {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(Value::Null)
                }),
        );
        let services = ExecutionServices::new(sender.clone(), http.clone())
            .with_plugins(Arc::new(plugins))
            .with_sleeper(Arc::new(RecordingSleeper::default()));
        Fixture { sender, http, services: Arc::new(configure(services)) }
    }

    fn fixture() -> Fixture {
        fixture_with(|s| s)
    }

    fn executor(f: &Fixture, task: TaskDefinition) -> TaskExecutor {
        TaskExecutor::new(Arc::new(task), f.services.clone())
    }

    fn missing_plugin() -> Action {
        Action::PluginMethod {
            plugin: "ghost".into(),
            method: "boo".into(),
            args: Default::default(),
            save_as: None,
        }
    }

    #[tokio::test]
    async fn test_ping_sends_templated_text() {
        let f = fixture();
        let task = TaskDefinition::new("ping").with_action(Action::send_message("hi ${who}"));
        let result = executor(&f, task).execute(ctx(json!({"who": "bob"}))).await;
        assert_eq!(f.sender.sent(), vec![("hi bob".to_string(), "default".to_string())]);
        assert!(result.success);
        assert_eq!(result.actions_executed, 1);
        assert_eq!(result.actions_failed, 0);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_unmet_condition_is_a_skip() {
        let f = fixture();
        let mut task = TaskDefinition::new("prod-only").with_action(Action::send_message("x"));
        task.conditions.push(Condition::Environment { environment: Some("prod".into()) });
        let result = executor(&f, task).execute(ctx(json!({"environment": "dev"}))).await;
        assert!(!result.success);
        assert_eq!(result.actions_executed, 0);
        assert!(result.error.unwrap().starts_with("Conditions not met: "));
        assert!(f.sender.sent().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_task_cannot_execute() {
        let f = fixture();
        let mut task = TaskDefinition::new("off");
        task.enabled = false;
        let exec = executor(&f, task);
        assert!(!exec.can_execute(&Context::new()).passed);
        let result = exec.execute(Context::new()).await;
        assert_eq!(result.error.as_deref(), Some("Conditions not met: Task is disabled"));
    }

    #[tokio::test]
    async fn test_failure_aborts_without_retry() {
        let f = fixture();
        let task = TaskDefinition::new("abort")
            .with_action(missing_plugin())
            .with_action(Action::send_message("never"));
        let result = executor(&f, task).execute(Context::new()).await;
        assert!(!result.success);
        assert_eq!(result.actions_failed, 1);
        assert_eq!(result.actions_executed, 0);
        assert!(result.error.unwrap().contains("Plugin 'ghost' not found"));
        assert!(f.sender.sent().is_empty());
    }

    #[tokio::test]
    async fn test_failure_continues_with_retry_enabled() {
        let f = fixture();
        let mut task = TaskDefinition::new("keep-going")
            .with_action(missing_plugin())
            .with_action(Action::send_message("still sent"));
        task.error_handling.retry_on_failure = true;
        let result = executor(&f, task).execute(Context::new()).await;
        assert!(!result.success);
        assert_eq!(result.actions_failed, 1);
        assert_eq!(result.actions_executed, 1);
        assert_eq!(f.sender.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_target_is_skipped() {
        let f = fixture();
        let task = TaskDefinition::new("fanout").with_action(Action::SendMessage {
            message: "hello".into(),
            webhooks: vec!["nowhere".into(), "ops".into()],
            template: None,
        });
        let result = executor(&f, task).execute(Context::new()).await;
        assert!(result.success);
        assert_eq!(f.sender.sent(), vec![("hello".to_string(), "ops".to_string())]);
    }

    #[tokio::test]
    async fn test_plugin_result_flows_into_message() {
        let f = fixture();
        let task = TaskDefinition::new("weather")
            .with_action(Action::PluginMethod {
                plugin: "weather".into(),
                method: "lookup".into(),
                args: ctx(json!({"city": "$city"})),
                save_as: Some("weather".into()),
            })
            .with_action(Action::send_message("${weather.city}: ${weather.temp}C"));
        let result = executor(&f, task).execute(ctx(json!({"city": "Hangzhou"}))).await;
        assert!(result.success);
        assert_eq!(f.sender.sent()[0].0, "Hangzhou: 21C");
    }

    #[tokio::test]
    async fn test_http_request_saves_body() {
        let f = fixture();
        f.http.push_ok(r#"{"count": 7}"#);
        let task: TaskDefinition = serde_json::from_value(json!({
            "name": "fetch",
            "actions": [
                {"type": "http_request", "method": "post", "url": "https://api.test/$path",
                 "headers": {"Authorization": "Bearer ${token}"}, "json": {"q": "$path"}, "save_as": "resp"},
                {"type": "send_message", "message": "count=${resp.count}"}
            ]
        }))
        .unwrap();
        let result = executor(&f, task)
            .execute(ctx(json!({"path": "items", "token": "t0k"})))
            .await;
        assert!(result.success);
        let request = &f.http.requests()[0];
        assert_eq!(request.method, "POST");
        assert_eq!(request.url, "https://api.test/items");
        assert_eq!(request.headers["Authorization"], "Bearer t0k");
        assert_eq!(request.json, Some(json!({"q": "items"})));
        assert_eq!(f.sender.sent()[0].0, "count=7");
    }

    #[tokio::test]
    async fn test_http_failure_is_action_failure() {
        let f = fixture();
        f.http.push_err("HTTP 500");
        let task: TaskDefinition = serde_json::from_value(json!({
            "name": "fetch",
            "actions": [{"type": "http_request", "url": "https://api.test/x"}]
        }))
        .unwrap();
        let result = executor(&f, task).execute(Context::new()).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("HTTP 500"));
    }

    #[tokio::test]
    async fn test_script_updates_context() {
        let f = fixture();
        let task = TaskDefinition::new("script")
            .with_action(Action::Script { code: "context.greeting = \"hi \" + context.who;".into() })
            .with_action(Action::send_message("$greeting"));
        let (result, context) = executor(&f, task)
            .execute_with_context(ctx(json!({"who": "ann"})))
            .await;
        assert!(result.success);
        assert_eq!(context["greeting"], json!("hi ann"));
        assert_eq!(f.sender.sent()[0].0, "hi ann");
    }

    #[tokio::test]
    async fn test_template_message() {
        let mut store = TemplateStore::new();
        store.insert("alert", MessageTemplate { kind: "text".into(), content: "ALERT: $what".into() });
        let f = fixture_with(|s| s.with_templates(Arc::new(store)));
        let task = TaskDefinition::new("alert").with_action(Action::SendMessage {
            message: String::new(),
            webhooks: vec![],
            template: Some("alert".into()),
        });
        executor(&f, task).execute(ctx(json!({"what": "disk"}))).await;
        assert_eq!(f.sender.sent()[0].0, "ALERT: disk");
    }

    #[tokio::test]
    async fn test_ai_action() {
        let ai = Arc::new(StubAi::answering("all good"));
        let f = fixture_with(|s| s.with_ai(ai.clone()));
        let task = TaskDefinition::new("ask").with_action(Action::Ai {
            prompt: "status of $svc?".into(),
            tools: vec![],
            save_as: Some("answer".into()),
            options: Default::default(),
        });
        let (result, context) = executor(&f, task).execute_with_context(ctx(json!({"svc": "db"}))).await;
        assert!(result.success);
        assert_eq!(context["answer"], json!("all good"));
        assert_eq!(ai.calls.lock().unwrap()[0]["prompt"], json!("status of db?"));

        let failing = fixture_with(|s| s.with_ai(Arc::new(StubAi::failing("quota"))));
        let task = TaskDefinition::new("ask").with_action(Action::Ai {
            prompt: "x".into(),
            tools: vec![],
            save_as: None,
            options: Default::default(),
        });
        let result = executor(&failing, task).execute(Context::new()).await;
        assert!(result.error.unwrap().contains("quota"));
    }

    #[tokio::test]
    async fn test_timeout_marks_timed_out() {
        let f = fixture();
        let mut task = TaskDefinition::new("slow").with_action(Action::PluginMethod {
            plugin: "weather".into(),
            method: "slow".into(),
            args: Default::default(),
            save_as: None,
        });
        task.timeout = Some(Duration::from_millis(50));
        let result = executor(&f, task).execute(Context::new()).await;
        assert!(!result.success);
        assert!(result.timed_out);
    }

    #[tokio::test]
    async fn test_notify_policy_sends_failure_text() {
        let f = fixture();
        let mut task = TaskDefinition::new("nightly").with_action(missing_plugin());
        task.error_handling.on_failure_action = FailureAction::Notify;
        task.error_handling.notification_target = Some("ops".into());
        executor(&f, task).execute(Context::new()).await;
        let sent = f.sender.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "ops");
        assert!(sent[0].0.starts_with("Task 'nightly' failed."));
    }
}
