//! LarkBot configuration system.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::error::{LarkBotError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LarkBotConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Named outbound targets (`default`, `ops`, `qq-group`, ...).
    #[serde(default)]
    pub webhooks: HashMap<String, WebhookConfig>,
    /// Target used when an action names no webhook.
    #[serde(default = "default_target")]
    pub default_target: String,
    /// Variable sets per environment (`dev`, `prod`, ...).
    #[serde(default)]
    pub environments: HashMap<String, BTreeMap<String, Value>>,
    #[serde(default)]
    pub active_environment: Option<String>,
    /// Tasks, rules, workflows and templates.
    #[serde(default = "default_automation_file")]
    pub automation_file: String,
    #[serde(default)]
    pub log: LogConfig,
}

fn default_target() -> String {
    "default".into()
}

fn default_automation_file() -> String {
    "~/.larkbot/automation.toml".into()
}

impl Default for LarkBotConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            webhooks: HashMap::new(),
            default_target: default_target(),
            environments: HashMap::new(),
            active_environment: None,
            automation_file: default_automation_file(),
            log: LogConfig::default(),
        }
    }
}

impl LarkBotConfig {
    /// Load config from the default path (~/.larkbot/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| LarkBotError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| LarkBotError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| LarkBotError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Reject settings the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.parallel_workers == 0 {
            return Err(LarkBotError::Config("scheduler.parallel_workers must be >= 1".into()));
        }
        if self.scheduler.dependent_workers == 0 {
            return Err(LarkBotError::Config("scheduler.dependent_workers must be >= 1".into()));
        }
        if let Some(env) = &self.active_environment
            && !self.environments.contains_key(env)
        {
            return Err(LarkBotError::Config(format!(
                "active_environment '{env}' has no [environments.{env}] table"
            )));
        }
        for (name, hook) in &self.webhooks {
            if hook.url.is_empty() {
                return Err(LarkBotError::Config(format!("webhook '{name}' has an empty url")));
            }
        }
        Ok(())
    }

    /// Variables of the active environment, if one is set.
    pub fn active_variables(&self) -> Option<&BTreeMap<String, Value>> {
        self.active_environment
            .as_ref()
            .and_then(|name| self.environments.get(name))
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the LarkBot home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".larkbot")
    }
}

/// Scheduler core settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Workers draining the dependent-task queue.
    #[serde(default = "default_dependent_workers")]
    pub dependent_workers: usize,
    /// Pool size for parallel task runs and workflow batches.
    #[serde(default = "default_parallel_workers")]
    pub parallel_workers: usize,
    /// In-memory history ring buffer size.
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    /// SQLite file for durable history; in-memory only when unset.
    #[serde(default)]
    pub history_db: Option<String>,
    #[serde(default = "default_retention_days")]
    pub history_retention_days: u32,
    /// `wait` or `timeout`, see `FailedDependencyPolicy`.
    #[serde(default = "default_failed_dependency_policy")]
    pub failed_dependency_policy: String,
}

fn default_dependent_workers() -> usize {
    2
}

fn default_parallel_workers() -> usize {
    4
}

fn default_max_history() -> usize {
    100
}

fn default_retention_days() -> u32 {
    30
}

fn default_failed_dependency_policy() -> String {
    "wait".into()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            dependent_workers: default_dependent_workers(),
            parallel_workers: default_parallel_workers(),
            max_history: default_max_history(),
            history_db: None,
            history_retention_days: default_retention_days(),
            failed_dependency_policy: default_failed_dependency_policy(),
        }
    }
}

/// One outbound webhook target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// `feishu` (custom bot) or `webhook` (generic JSON POST).
    #[serde(default = "default_provider")]
    pub provider: String,
    pub url: String,
    /// Feishu signing secret.
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_provider() -> String {
    "feishu".into()
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}
