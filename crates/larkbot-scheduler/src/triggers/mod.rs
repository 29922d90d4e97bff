//! Trigger family: five activation sources normalized into one
//! `TriggerContext → callback` shape.
//!
//! | Kind | Fires on |
//! |---|---|
//! | `schedule` | scheduler job `automation.{rule}` |
//! | `event` | inbound payload matching `header.event_type` + conditions |
//! | `webhook` | HTTP call on an exact path, after method/signature/schema checks |
//! | `manual` | explicit call with validated parameters |
//! | `chain` | completion of watched rules |
//!
//! A failing or panicking callback is logged and swallowed by
//! [`Trigger::fire`]; it never reaches the trigger source.

mod chain;
mod event;
mod manual;
mod registry;
mod schedule;
mod webhook;

pub use chain::{ChainTrigger, ChainTriggerConfig};
pub use event::{EventCondition, EventOperator, EventTrigger, EventTriggerConfig};
pub use manual::{ManualParameter, ManualTrigger, ManualTriggerConfig, ParamType};
pub use registry::{TriggerRegistry, WebhookOutcome};
pub use schedule::{ScheduleTrigger, ScheduleTriggerConfig};
pub use webhook::{
    FieldSchema, PayloadSchema, WebhookRejection, WebhookTrigger, WebhookTriggerConfig,
    canonical_json, webhook_signature,
};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use larkbot_core::error::{LarkBotError, Result};
use larkbot_core::types::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Closed set of trigger kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Schedule,
    Event,
    Webhook,
    Manual,
    Chain,
}

impl TriggerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerKind::Schedule => "schedule",
            TriggerKind::Event => "event",
            TriggerKind::Webhook => "webhook",
            TriggerKind::Manual => "manual",
            TriggerKind::Chain => "chain",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "schedule" => Ok(TriggerKind::Schedule),
            "event" => Ok(TriggerKind::Event),
            "webhook" => Ok(TriggerKind::Webhook),
            "manual" => Ok(TriggerKind::Manual),
            "chain" => Ok(TriggerKind::Chain),
            other => Err(LarkBotError::UnknownTrigger(other.to_string())),
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a callback receives on every firing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerContext {
    pub trigger_type: TriggerKind,
    pub triggered_at: DateTime<Utc>,
    pub trigger_id: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub metadata: Context,
}

impl TriggerContext {
    pub fn new(trigger_type: TriggerKind, payload: Value) -> Self {
        Self {
            trigger_type,
            triggered_at: Utc::now(),
            trigger_id: uuid::Uuid::new_v4().to_string(),
            payload,
            metadata: Context::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Context) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Callback invoked by a firing trigger.
pub type TriggerCallback = Arc<dyn Fn(TriggerContext) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wrap an async closure as a [`TriggerCallback`].
pub fn callback<F, Fut>(f: F) -> TriggerCallback
where
    F: Fn(TriggerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Per-kind trigger configuration, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerConfig {
    Schedule(ScheduleTriggerConfig),
    Event(EventTriggerConfig),
    Webhook(WebhookTriggerConfig),
    Manual(ManualTriggerConfig),
    Chain(ChainTriggerConfig),
}

impl TriggerConfig {
    /// Parse a config value. An unknown `type` is reported as
    /// [`LarkBotError::UnknownTrigger`], other shape errors as config errors.
    pub fn from_value(value: Value) -> Result<Self> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| LarkBotError::Config("trigger config needs a 'type'".into()))?;
        TriggerKind::parse(kind)?;
        serde_json::from_value(value).map_err(|e| LarkBotError::Config(format!("invalid trigger config: {e}")))
    }

    pub fn kind(&self) -> TriggerKind {
        match self {
            TriggerConfig::Schedule(_) => TriggerKind::Schedule,
            TriggerConfig::Event(_) => TriggerKind::Event,
            TriggerConfig::Webhook(_) => TriggerKind::Webhook,
            TriggerConfig::Manual(_) => TriggerKind::Manual,
            TriggerConfig::Chain(_) => TriggerKind::Chain,
        }
    }
}

/// Kind-specific state of a registered trigger.
pub enum TriggerVariant {
    Schedule(ScheduleTrigger),
    Event(EventTrigger),
    Webhook(WebhookTrigger),
    Manual(ManualTrigger),
    Chain(ChainTrigger),
}

/// A trigger bound to one rule and its callback.
pub struct Trigger {
    rule_name: String,
    variant: TriggerVariant,
    callback: TriggerCallback,
    fire_count: AtomicU64,
}

impl Trigger {
    /// Build a trigger, validating its config up front.
    pub fn new(rule_name: &str, config: TriggerConfig, callback: TriggerCallback) -> Result<Self> {
        let variant = match config {
            TriggerConfig::Schedule(c) => TriggerVariant::Schedule(ScheduleTrigger::new(rule_name, c)?),
            TriggerConfig::Event(c) => TriggerVariant::Event(EventTrigger::new(c)?),
            TriggerConfig::Webhook(c) => TriggerVariant::Webhook(WebhookTrigger::new(c)?),
            TriggerConfig::Manual(c) => TriggerVariant::Manual(ManualTrigger::new(c)),
            TriggerConfig::Chain(c) => TriggerVariant::Chain(ChainTrigger::new(c)?),
        };
        Ok(Self {
            rule_name: rule_name.to_string(),
            variant,
            callback,
            fire_count: AtomicU64::new(0),
        })
    }

    pub fn rule_name(&self) -> &str {
        &self.rule_name
    }

    pub fn kind(&self) -> TriggerKind {
        match &self.variant {
            TriggerVariant::Schedule(_) => TriggerKind::Schedule,
            TriggerVariant::Event(_) => TriggerKind::Event,
            TriggerVariant::Webhook(_) => TriggerKind::Webhook,
            TriggerVariant::Manual(_) => TriggerKind::Manual,
            TriggerVariant::Chain(_) => TriggerKind::Chain,
        }
    }

    pub fn variant(&self) -> &TriggerVariant {
        &self.variant
    }

    /// Number of callback invocations so far.
    pub fn fire_count(&self) -> u64 {
        self.fire_count.load(Ordering::Relaxed)
    }

    /// Invoke the callback. Returns whether it completed without error;
    /// errors and panics are logged here and go no further.
    pub async fn fire(&self, payload: Value, metadata: Context) -> bool {
        let context = TriggerContext::new(self.kind(), payload).with_metadata(metadata);
        self.fire_count.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            "🎯 {} trigger fired for '{}' ({})",
            context.trigger_type,
            self.rule_name,
            context.trigger_id
        );

        let callback = self.callback.clone();
        let outcome = AssertUnwindSafe(async move { callback(context).await })
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::error!("❌ Trigger callback for '{}' failed: {e}", self.rule_name);
                false
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".into());
                tracing::error!("💥 Trigger callback for '{}' panicked: {message}", self.rule_name);
                false
            }
        }
    }
}
