use larkbot_core::error::{LarkBotError, Result};
use larkbot_core::types::Context;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::sync::Mutex;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainTriggerConfig {
    pub source_rules: Vec<String>,
    #[serde(default = "default_true")]
    pub require_success: bool,
    #[serde(default)]
    pub wait_all: bool,
}

#[derive(Default)]
struct Completions {
    rules: BTreeSet<String>,
    results: Context,
}

/// Fires on completion of watched rules. With `wait_all` it accumulates
/// completions until every source has completed once, fires, and resets.
pub struct ChainTrigger {
    config: ChainTriggerConfig,
    sources: BTreeSet<String>,
    completed: Mutex<Completions>,
}

impl ChainTrigger {
    pub fn new(config: ChainTriggerConfig) -> Result<Self> {
        let sources: BTreeSet<String> = config.source_rules.iter().cloned().collect();
        if sources.is_empty() {
            return Err(LarkBotError::Config("chain trigger needs at least one source rule".into()));
        }
        Ok(Self {
            config,
            sources,
            completed: Mutex::new(Completions::default()),
        })
    }

    pub fn watches(&self, rule: &str) -> bool {
        self.sources.contains(rule)
    }

    pub fn source_rules(&self) -> &[String] {
        &self.config.source_rules
    }

    /// Sources completed in the current `wait_all` cycle.
    pub fn pending_completions(&self) -> Vec<String> {
        let completed = self.completed.lock().unwrap_or_else(|e| e.into_inner());
        completed.rules.iter().cloned().collect()
    }

    /// Record a completion. Returns the payload to fire with, or `None` when
    /// this completion does not fire the trigger.
    pub fn on_rule_completed(&self, source_rule: &str, success: bool, result: &Value) -> Option<Value> {
        if !self.watches(source_rule) || (self.config.require_success && !success) {
            return None;
        }
        if !self.config.wait_all {
            return Some(json!({
                "source_rule": source_rule,
                "success": success,
                "result": result,
            }));
        }

        let mut completed = self.completed.lock().unwrap_or_else(|e| e.into_inner());
        completed.rules.insert(source_rule.to_string());
        completed.results.insert(source_rule.to_string(), result.clone());
        if completed.rules.len() < self.sources.len() {
            tracing::debug!(
                "🔗 Chain waiting: {}/{} sources completed",
                completed.rules.len(),
                self.sources.len()
            );
            return None;
        }
        let cycle = std::mem::take(&mut *completed);
        Some(json!({
            "source_rule": source_rule,
            "source_rules": cycle.rules,
            "results": cycle.results,
        }))
    }
}
