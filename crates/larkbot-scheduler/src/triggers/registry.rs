//! Trigger registry: owns every trigger, indexes them by rule and webhook
//! path, and routes inbound activations.

use futures::future::join_all;
use larkbot_core::error::{LarkBotError, Result};
use larkbot_core::traits::{JobFn, Scheduler};
use larkbot_core::types::Context;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::{Trigger, TriggerCallback, TriggerConfig, TriggerKind, TriggerVariant};

/// Result of routing one webhook call.
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookOutcome {
    /// Validated and fired; `success` is the callback outcome.
    Accepted { rule_name: String, success: bool },
    Rejected { status: u16, reason: String },
    NotFound,
}

#[derive(Default)]
struct Indices {
    triggers: HashMap<String, Arc<Trigger>>,
    webhook_paths: HashMap<String, String>,
}

pub struct TriggerRegistry {
    scheduler: Option<Arc<dyn Scheduler>>,
    indices: RwLock<Indices>,
}

impl TriggerRegistry {
    pub fn new(scheduler: Option<Arc<dyn Scheduler>>) -> Self {
        Self {
            scheduler,
            indices: RwLock::new(Indices::default()),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Indices> {
        self.indices.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Indices> {
        self.indices.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register (or replace) the trigger of `rule_name`. Schedule triggers
    /// get their scheduler job here; a taken webhook path is an error.
    ///
    /// The previous trigger stays in place until the new one is started and
    /// indexed, so a failed registration leaves the rule as it was.
    pub fn register(&self, rule_name: &str, config: TriggerConfig, callback: TriggerCallback) -> Result<()> {
        let trigger = Arc::new(Trigger::new(rule_name, config, callback)?);

        if let TriggerVariant::Schedule(schedule) = trigger.variant() {
            match &self.scheduler {
                Some(scheduler) => {
                    let weak = Arc::downgrade(&trigger);
                    let job: JobFn = Arc::new(move || {
                        let weak = weak.clone();
                        Box::pin(async move {
                            if let Some(trigger) = weak.upgrade() {
                                trigger.fire(Value::Null, Context::new()).await;
                            }
                        })
                    });
                    schedule.start(scheduler.as_ref(), job)?;
                }
                None => tracing::warn!(
                    "⚠️ No scheduler available, '{}' will only fire when triggered directly",
                    rule_name
                ),
            }
        }

        let previous = {
            let mut indices = self.write();
            if let TriggerVariant::Webhook(webhook) = trigger.variant() {
                if let Some(owner) = indices.webhook_paths.get(webhook.path())
                    && owner != rule_name
                {
                    return Err(LarkBotError::Validation(format!(
                        "webhook path '{}' is already used by '{owner}'",
                        webhook.path()
                    )));
                }
                indices.webhook_paths.retain(|_, owner| owner != rule_name);
                indices
                    .webhook_paths
                    .insert(webhook.path().to_string(), rule_name.to_string());
            } else {
                indices.webhook_paths.retain(|_, owner| owner != rule_name);
            }
            indices.triggers.insert(rule_name.to_string(), trigger.clone())
        };

        // same `automation.{rule}` job id: a new schedule already replaced the old job
        if let Some(previous) = previous
            && trigger.kind() != TriggerKind::Schedule
        {
            self.stop(&previous);
        }
        tracing::info!("🎯 Registered {} trigger for '{rule_name}'", trigger.kind());
        Ok(())
    }

    /// Register from a raw config value; unknown types are rejected.
    pub fn register_value(&self, rule_name: &str, config: Value, callback: TriggerCallback) -> Result<()> {
        self.register(rule_name, TriggerConfig::from_value(config)?, callback)
    }

    /// Remove the trigger of `rule_name` and stop its job. Returns whether
    /// one existed.
    pub fn unregister(&self, rule_name: &str) -> bool {
        let removed = {
            let mut indices = self.write();
            let removed = indices.triggers.remove(rule_name);
            indices.webhook_paths.retain(|_, owner| owner != rule_name);
            removed
        };
        match removed {
            Some(trigger) => {
                self.stop(&trigger);
                tracing::info!("🗑️ Unregistered trigger for '{rule_name}'");
                true
            }
            None => false,
        }
    }

    fn stop(&self, trigger: &Trigger) {
        if let (TriggerVariant::Schedule(schedule), Some(scheduler)) = (trigger.variant(), &self.scheduler) {
            schedule.stop(scheduler.as_ref());
        }
    }

    pub fn get(&self, rule_name: &str) -> Option<Arc<Trigger>> {
        self.read().triggers.get(rule_name).cloned()
    }

    /// Sorted rule names.
    pub fn rule_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().triggers.keys().cloned().collect();
        names.sort();
        names
    }

    fn of_kind(&self, kind: TriggerKind) -> Vec<Arc<Trigger>> {
        let mut triggers: Vec<Arc<Trigger>> = self
            .read()
            .triggers
            .values()
            .filter(|t| t.kind() == kind)
            .cloned()
            .collect();
        triggers.sort_by(|a, b| a.rule_name().cmp(b.rule_name()));
        triggers
    }

    /// Fire every event trigger matching `payload`. Returns the fired rule
    /// names, sorted.
    pub async fn dispatch_event(&self, payload: &Value) -> Vec<String> {
        let matched: Vec<Arc<Trigger>> = self
            .of_kind(TriggerKind::Event)
            .into_iter()
            .filter(|t| matches!(t.variant(), TriggerVariant::Event(e) if e.matches(payload)))
            .collect();
        if matched.is_empty() {
            tracing::debug!("No event trigger matched");
            return Vec::new();
        }
        join_all(matched.iter().map(|t| t.fire(payload.clone(), Context::new()))).await;
        matched.iter().map(|t| t.rule_name().to_string()).collect()
    }

    /// Route a webhook call by exact path.
    pub async fn handle_webhook(
        &self,
        path: &str,
        method: &str,
        payload: &Value,
        signature: Option<&str>,
    ) -> WebhookOutcome {
        let trigger = {
            let indices = self.read();
            indices
                .webhook_paths
                .get(path)
                .and_then(|rule| indices.triggers.get(rule))
                .cloned()
        };
        let Some(trigger) = trigger else {
            tracing::debug!("No webhook trigger on '{path}'");
            return WebhookOutcome::NotFound;
        };
        let TriggerVariant::Webhook(webhook) = trigger.variant() else {
            return WebhookOutcome::NotFound;
        };

        if let Err(rejection) = webhook.validate(method, payload, signature) {
            tracing::warn!("🚫 Webhook '{path}' rejected: {rejection}");
            return WebhookOutcome::Rejected {
                status: rejection.status(),
                reason: rejection.to_string(),
            };
        }

        let mut metadata = Context::new();
        metadata.insert("path".into(), json!(path));
        metadata.insert("method".into(), json!(method.to_uppercase()));
        let success = trigger.fire(payload.clone(), metadata).await;
        WebhookOutcome::Accepted {
            rule_name: trigger.rule_name().to_string(),
            success,
        }
    }

    /// Validate parameters and fire the manual trigger of `rule_name`.
    /// Returns the callback outcome.
    pub async fn trigger_manual(&self, rule_name: &str, params: &Context, confirmed: bool) -> Result<bool> {
        let trigger = self
            .get(rule_name)
            .ok_or_else(|| LarkBotError::Validation(format!("no trigger registered for '{rule_name}'")))?;
        let TriggerVariant::Manual(manual) = trigger.variant() else {
            return Err(LarkBotError::Validation(format!(
                "'{rule_name}' has a {} trigger, not a manual one",
                trigger.kind()
            )));
        };
        let prepared = manual.prepare(params, confirmed)?;

        let mut metadata = Context::new();
        metadata.insert("confirmed".into(), json!(confirmed));
        Ok(trigger.fire(Value::Object(prepared), metadata).await)
    }

    /// Fan a rule completion out to the chain triggers watching it. Returns
    /// the rules whose chain trigger fired.
    pub async fn notify_rule_completed(&self, source_rule: &str, success: bool, result: &Value) -> Vec<String> {
        let mut fired = Vec::new();
        for trigger in self.of_kind(TriggerKind::Chain) {
            let TriggerVariant::Chain(chain) = trigger.variant() else {
                continue;
            };
            if let Some(payload) = chain.on_rule_completed(source_rule, success, result) {
                let mut metadata = Context::new();
                metadata.insert("source_rule".into(), json!(source_rule));
                trigger.fire(payload, metadata).await;
                fired.push(trigger.rule_name().to_string());
            }
        }
        fired
    }

    /// Stop every trigger and clear all indices.
    pub fn shutdown(&self) {
        let triggers: Vec<Arc<Trigger>> = {
            let mut indices = self.write();
            indices.webhook_paths.clear();
            indices.triggers.drain().map(|(_, t)| t).collect()
        };
        for trigger in &triggers {
            self.stop(trigger);
        }
        tracing::info!("🛑 Trigger registry stopped ({} triggers)", triggers.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingScheduler;
    use crate::triggers::test_support::recording;
    use crate::triggers::{
        ChainTriggerConfig, EventCondition, EventOperator, EventTriggerConfig, ManualParameter,
        ManualTriggerConfig, ParamType, ScheduleTriggerConfig, WebhookTriggerConfig, callback,
        webhook_signature,
    };

    fn webhook(path: &str, secret: Option<&str>) -> TriggerConfig {
        TriggerConfig::Webhook(WebhookTriggerConfig {
            path: path.into(),
            methods: vec!["POST".into()],
            secret: secret.map(String::from),
            validate_payload: false,
            payload_schema: None,
        })
    }

    #[tokio::test]
    async fn test_schedule_trigger_registers_job() {
        let scheduler = Arc::new(RecordingScheduler::new());
        let registry = TriggerRegistry::new(Some(scheduler.clone()));
        let (cb, seen) = recording();
        let config = TriggerConfig::Schedule(ScheduleTriggerConfig {
            mode: "interval".into(),
            arguments: serde_json::from_value(json!({"seconds": 30})).unwrap(),
        });
        registry.register("digest", config, cb).unwrap();
        assert_eq!(scheduler.job_ids(), vec!["automation.digest"]);

        assert!(scheduler.fire("automation.digest").await);
        assert_eq!(seen.lock().unwrap()[0].trigger_type, TriggerKind::Schedule);

        assert!(registry.unregister("digest"));
        assert!(scheduler.job_ids().is_empty());
        assert!(!registry.unregister("digest"));
    }

    #[tokio::test]
    async fn test_dispatch_event_returns_fired_rules() {
        let registry = TriggerRegistry::new(None);
        let (cb, seen) = recording();
        let on_message = TriggerConfig::Event(EventTriggerConfig {
            event_type: Some("im.message.receive_v1".into()),
            conditions: vec![EventCondition {
                field: "event.text".into(),
                operator: EventOperator::Contains,
                value: json!("deploy"),
            }],
        });
        registry.register("deploy-bot", on_message, cb.clone()).unwrap();
        registry
            .register("any-event", TriggerConfig::Event(EventTriggerConfig::default()), cb)
            .unwrap();

        let payload = json!({"header": {"event_type": "im.message.receive_v1"}, "event": {"text": "deploy now"}});
        assert_eq!(registry.dispatch_event(&payload).await, vec!["any-event", "deploy-bot"]);
        let other = json!({"header": {"event_type": "im.chat.updated_v1"}});
        assert_eq!(registry.dispatch_event(&other).await, vec!["any-event"]);
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_failing_event_handler_does_not_reach_caller() {
        let registry = TriggerRegistry::new(None);
        let cb = callback(|_| async { Err(LarkBotError::Action("handler failed".into())) });
        registry
            .register("broken", TriggerConfig::Event(EventTriggerConfig::default()), cb)
            .unwrap();
        assert_eq!(registry.dispatch_event(&json!({})).await, vec!["broken"]);
    }

    #[tokio::test]
    async fn test_webhook_routing_and_signature() {
        let registry = TriggerRegistry::new(None);
        let (cb, seen) = recording();
        registry.register("deploy", webhook("/hooks/deploy", Some("s3cr3t")), cb).unwrap();

        let payload = json!({"a": 1});
        let signature = webhook_signature("s3cr3t", &payload);
        assert_eq!(
            registry.handle_webhook("/hooks/deploy", "post", &payload, Some(&signature)).await,
            WebhookOutcome::Accepted { rule_name: "deploy".into(), success: true }
        );
        assert_eq!(
            registry.handle_webhook("/hooks/deploy", "POST", &payload, Some("forged")).await,
            WebhookOutcome::Rejected { status: 401, reason: "Invalid signature".into() }
        );
        assert_eq!(
            registry.handle_webhook("/hooks/other", "POST", &payload, None).await,
            WebhookOutcome::NotFound
        );
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].metadata["method"], json!("POST"));
    }

    #[tokio::test]
    async fn test_webhook_path_conflict() {
        let registry = TriggerRegistry::new(None);
        let (cb, _) = recording();
        registry.register("a", webhook("/hook", None), cb.clone()).unwrap();
        assert!(registry.register("b", webhook("/hook", None), cb.clone()).is_err());
        registry.register("a", webhook("/hook2", None), cb).unwrap();
        assert_eq!(
            registry.handle_webhook("/hook", "POST", &json!({}), None).await,
            WebhookOutcome::NotFound
        );
    }

    #[test]
    fn test_concurrent_webhook_registration_claims_path_once() {
        let registry = TriggerRegistry::new(None);
        let (cb, _) = recording();
        let wins = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let registry = &registry;
                    let cb = cb.clone();
                    scope.spawn(move || registry.register(&format!("rule-{i}"), webhook("/shared", None), cb).is_ok())
                })
                .collect();
            handles.into_iter().filter_map(|h| h.join().ok()).filter(|&won| won).count()
        });
        assert_eq!(wins, 1);
        assert_eq!(registry.rule_names().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_replacement_keeps_previous_trigger() {
        let scheduler = Arc::new(crate::scheduler::TokioScheduler::new().unwrap());
        let registry = TriggerRegistry::new(Some(scheduler.clone()));
        let (cb, _) = recording();
        let every_minute = TriggerConfig::Schedule(ScheduleTriggerConfig {
            mode: "interval".into(),
            arguments: serde_json::from_value(json!({"minutes": 1})).unwrap(),
        });
        registry.register("digest", every_minute, cb.clone()).unwrap();

        // the in-process scheduler rejects cron
        let cron = TriggerConfig::Schedule(ScheduleTriggerConfig {
            mode: "cron".into(),
            arguments: serde_json::from_value(json!({"expression": "0 8 * * *"})).unwrap(),
        });
        assert!(registry.register("digest", cron, cb).is_err());

        let kept = registry.get("digest").unwrap();
        assert!(matches!(kept.variant(), TriggerVariant::Schedule(s) if s.job_trigger().kind() == "interval"));
        assert!(scheduler.get_job("automation.digest").is_some());
    }

    #[tokio::test]
    async fn test_replacing_schedule_with_webhook_stops_job() {
        let scheduler = Arc::new(RecordingScheduler::new());
        let registry = TriggerRegistry::new(Some(scheduler.clone()));
        let (cb, _) = recording();
        let schedule = TriggerConfig::Schedule(ScheduleTriggerConfig {
            mode: "interval".into(),
            arguments: serde_json::from_value(json!({"minutes": 5})).unwrap(),
        });
        registry.register("digest", schedule.clone(), cb.clone()).unwrap();
        registry.register("digest", schedule, cb.clone()).unwrap();
        assert_eq!(scheduler.job_ids(), vec!["automation.digest"]);

        registry.register("digest", webhook("/digest", None), cb).unwrap();
        assert!(scheduler.job_ids().is_empty());
        assert_eq!(registry.get("digest").unwrap().kind(), TriggerKind::Webhook);
    }

    #[tokio::test]
    async fn test_manual_trigger() {
        let registry = TriggerRegistry::new(None);
        let (cb, seen) = recording();
        let config = TriggerConfig::Manual(ManualTriggerConfig {
            parameters: vec![ManualParameter {
                name: "env".into(),
                kind: ParamType::String,
                required: true,
                default: None,
                description: String::new(),
            }],
            require_confirmation: false,
        });
        registry.register("release", config, cb).unwrap();

        assert!(registry.trigger_manual("release", &Context::new(), false).await.is_err());
        let mut params = Context::new();
        params.insert("env".into(), json!("prod"));
        assert!(registry.trigger_manual("release", &params, false).await.unwrap());
        assert_eq!(seen.lock().unwrap()[0].payload, json!({"env": "prod"}));
        assert!(registry.trigger_manual("ghost", &params, false).await.is_err());
    }

    #[tokio::test]
    async fn test_chain_fan_out() {
        let registry = TriggerRegistry::new(None);
        let (cb, seen) = recording();
        let config = TriggerConfig::Chain(ChainTriggerConfig {
            source_rules: vec!["A".into(), "B".into()],
            require_success: true,
            wait_all: true,
        });
        registry.register("report", config, cb).unwrap();

        assert!(registry.notify_rule_completed("A", true, &Value::Null).await.is_empty());
        assert_eq!(registry.notify_rule_completed("B", true, &Value::Null).await, vec!["report"]);
        assert!(registry.notify_rule_completed("A", true, &Value::Null).await.is_empty());
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_clears_everything() {
        let scheduler = Arc::new(RecordingScheduler::new());
        let registry = TriggerRegistry::new(Some(scheduler.clone()));
        let (cb, _) = recording();
        let schedule = TriggerConfig::Schedule(ScheduleTriggerConfig {
            mode: "interval".into(),
            arguments: serde_json::from_value(json!({"minutes": 1})).unwrap(),
        });
        registry.register("tick", schedule, cb.clone()).unwrap();
        registry.register("hook", webhook("/h", None), cb).unwrap();

        registry.shutdown();
        assert!(registry.rule_names().is_empty());
        assert!(scheduler.job_ids().is_empty());
        assert_eq!(
            registry.handle_webhook("/h", "POST", &json!({}), None).await,
            WebhookOutcome::NotFound
        );
    }

    #[test]
    fn test_register_value_rejects_unknown_type() {
        let registry = TriggerRegistry::new(None);
        let (cb, _) = recording();
        let err = registry.register_value("x", json!({"type": "sms"}), cb).unwrap_err();
        assert!(matches!(err, LarkBotError::UnknownTrigger(_)));
    }
}
