use larkbot_core::error::{LarkBotError, Result};
use larkbot_core::types::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Declared type of a manual parameter or webhook payload field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    #[default]
    Any,
}

impl ParamType {
    pub fn matches(self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Number => value.is_number(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Array => value.is_array(),
            ParamType::Object => value.is_object(),
            ParamType::Any => true,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Number => "number",
            ParamType::Integer => "integer",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
            ParamType::Any => "any",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualParameter {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManualTriggerConfig {
    #[serde(default)]
    pub parameters: Vec<ManualParameter>,
    #[serde(default)]
    pub require_confirmation: bool,
}

#[derive(Debug, Clone)]
pub struct ManualTrigger {
    config: ManualTriggerConfig,
}

impl ManualTrigger {
    pub fn new(config: ManualTriggerConfig) -> Self {
        Self { config }
    }

    pub fn parameters(&self) -> &[ManualParameter] {
        &self.config.parameters
    }

    /// Check confirmation, required parameters and types, then fill
    /// defaults. Undeclared parameters pass through untouched.
    pub fn prepare(&self, params: &Context, confirmed: bool) -> Result<Context> {
        if self.config.require_confirmation && !confirmed {
            return Err(LarkBotError::Validation("this trigger requires confirmation".into()));
        }
        let mut prepared = params.clone();
        for param in &self.config.parameters {
            match params.get(&param.name) {
                Some(value) if !param.kind.matches(value) => {
                    return Err(LarkBotError::Validation(format!(
                        "parameter '{}' must be of type {}",
                        param.name,
                        param.kind.as_str()
                    )));
                }
                Some(_) => {}
                None if param.required => {
                    return Err(LarkBotError::Validation(format!(
                        "missing required parameter '{}'",
                        param.name
                    )));
                }
                None => {
                    if let Some(default) = &param.default {
                        prepared.insert(param.name.clone(), default.clone());
                    }
                }
            }
        }
        Ok(prepared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn trigger() -> ManualTrigger {
        let config: ManualTriggerConfig = serde_json::from_value(json!({
            "parameters": [
                {"name": "env", "type": "string", "required": true},
                {"name": "replicas", "type": "integer", "default": 2},
                {"name": "dry_run", "type": "boolean", "default": false}
            ]
        }))
        .unwrap();
        ManualTrigger::new(config)
    }

    fn params(value: Value) -> Context {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_defaults_fill_in() {
        let prepared = trigger().prepare(&params(json!({"env": "prod", "extra": 1})), false).unwrap();
        assert_eq!(prepared["replicas"], json!(2));
        assert_eq!(prepared["dry_run"], json!(false));
        assert_eq!(prepared["extra"], json!(1));
    }

    #[test]
    fn test_required_and_types() {
        let t = trigger();
        let err = t.prepare(&Context::new(), false).unwrap_err();
        assert!(err.to_string().contains("missing required parameter 'env'"));

        let err = t.prepare(&params(json!({"env": "prod", "replicas": 1.5})), false).unwrap_err();
        assert!(err.to_string().contains("'replicas' must be of type integer"));
        assert!(t.prepare(&params(json!({"env": 3})), false).is_err());
    }

    #[test]
    fn test_confirmation() {
        let t = ManualTrigger::new(ManualTriggerConfig {
            parameters: vec![],
            require_confirmation: true,
        });
        assert!(t.prepare(&Context::new(), false).is_err());
        assert!(t.prepare(&Context::new(), true).is_ok());
    }

    #[test]
    fn test_param_types() {
        assert!(ParamType::Number.matches(&json!(1)));
        assert!(ParamType::Number.matches(&json!(1.5)));
        assert!(!ParamType::Integer.matches(&json!(1.5)));
        assert!(ParamType::Array.matches(&json!([])));
        assert!(ParamType::Object.matches(&json!({})));
        assert!(ParamType::Any.matches(&Value::Null));
    }
}
