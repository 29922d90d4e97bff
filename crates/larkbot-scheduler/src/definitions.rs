//! Automation file: tasks, rules, workflow templates, message templates
//! and trigger bindings in one TOML document.
//!
//! ```toml
//! [templates.alert]
//! content = "🚨 $service is down"
//!
//! [[tasks]]
//! name = "health-check"
//! schedule = { type = "interval", minutes = 5 }
//! actions = [{ type = "http_request", url = "https://api.example.com/health" }]
//!
//! [[rules]]
//! name = "greet"
//! trigger = { type = "event", event_type = "im.message.receive_v1" }
//! actions = [{ type = "send_text", text = "hi" }]
//!
//! [[triggers]]
//! rule = "greet"
//! type = "webhook"
//! path = "/hooks/greet"
//! ```

use larkbot_core::error::{LarkBotError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::automation::AutomationRule;
use crate::tasks::TaskDefinition;
use crate::template::{MessageTemplate, TemplateStore};
use crate::triggers::TriggerConfig;
use crate::workflow::WorkflowTemplate;

/// Extra trigger attached to a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerBinding {
    pub rule: String,
    #[serde(flatten)]
    pub config: Map<String, Value>,
}

impl TriggerBinding {
    pub fn trigger_config(&self) -> Result<TriggerConfig> {
        TriggerConfig::from_value(Value::Object(self.config.clone()))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutomationConfig {
    #[serde(default)]
    pub tasks: Vec<TaskDefinition>,
    #[serde(default)]
    pub rules: Vec<AutomationRule>,
    #[serde(default)]
    pub workflows: Vec<WorkflowTemplate>,
    #[serde(default)]
    pub templates: HashMap<String, MessageTemplate>,
    #[serde(default)]
    pub triggers: Vec<TriggerBinding>,
}

impl AutomationConfig {
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| LarkBotError::Config(format!("Failed to read {}: {e}", path.display())))?;
        let config = Self::from_toml_str(&content)?;
        tracing::info!(
            "📂 Loaded {} tasks, {} rules, {} workflows, {} templates from {}",
            config.tasks.len(),
            config.rules.len(),
            config.workflows.len(),
            config.templates.len(),
            path.display()
        );
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| LarkBotError::Config(format!("Failed to parse automation file: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Unique names per section; trigger bindings name known rules and
    /// parse.
    pub fn validate(&self) -> Result<()> {
        unique("task", self.tasks.iter().map(|t| t.name.as_str()))?;
        unique("rule", self.rules.iter().map(|r| r.name.as_str()))?;
        unique("workflow", self.workflows.iter().map(|w| w.name.as_str()))?;

        let rules: HashSet<&str> = self.rules.iter().map(|r| r.name.as_str()).collect();
        for binding in &self.triggers {
            if !rules.contains(binding.rule.as_str()) {
                return Err(LarkBotError::Validation(format!(
                    "trigger bound to unknown rule '{}'",
                    binding.rule
                )));
            }
            binding.trigger_config()?;
        }
        Ok(())
    }

    pub fn template_store(&self) -> TemplateStore {
        TemplateStore::from_map(self.templates.clone())
    }
}

fn unique<'a>(kind: &str, names: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(LarkBotError::Validation(format!("duplicate {kind} name '{name}'")));
        }
    }
    Ok(())
}
