use larkbot_core::error::{LarkBotError, Result};
use larkbot_core::types::lookup_path;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::template::display_value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOperator {
    Equals,
    Contains,
    Regex,
    Exists,
    GreaterThan,
    LessThan,
    InList,
}

/// One filter over a dot-path of the inbound payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventCondition {
    #[serde(alias = "path")]
    pub field: String,
    pub operator: EventOperator,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventTriggerConfig {
    /// Compared with `payload.header.event_type`; any event when unset.
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub conditions: Vec<EventCondition>,
}

#[derive(Debug, Clone)]
pub struct EventTrigger {
    config: EventTriggerConfig,
    patterns: Vec<Option<Regex>>,
}

impl EventTrigger {
    /// Regex conditions are compiled here; a bad pattern is a config error.
    pub fn new(config: EventTriggerConfig) -> Result<Self> {
        let patterns = config
            .conditions
            .iter()
            .map(|c| match c.operator {
                EventOperator::Regex => {
                    let pattern = display_value(&c.value);
                    Regex::new(&pattern)
                        .map(Some)
                        .map_err(|e| LarkBotError::Config(format!("invalid regex '{pattern}': {e}")))
                }
                _ => Ok(None),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { config, patterns })
    }

    pub fn event_type(&self) -> Option<&str> {
        self.config.event_type.as_deref()
    }

    pub fn matches(&self, payload: &Value) -> bool {
        if let Some(expected) = &self.config.event_type {
            let actual = lookup_path(payload, "header.event_type").and_then(Value::as_str);
            if actual != Some(expected.as_str()) {
                return false;
            }
        }
        self.config
            .conditions
            .iter()
            .zip(&self.patterns)
            .all(|(condition, pattern)| check(condition, pattern.as_ref(), payload))
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn check(condition: &EventCondition, pattern: Option<&Regex>, payload: &Value) -> bool {
    let expected = &condition.value;
    match (condition.operator, lookup_path(payload, &condition.field)) {
        (EventOperator::Exists, actual) => {
            actual.is_some_and(|v| !v.is_null()) == expected.as_bool().unwrap_or(true)
        }
        (_, None) => false,
        (EventOperator::Equals, Some(actual)) => loosely_equal(actual, expected),
        (EventOperator::Contains, Some(actual)) => match actual {
            Value::String(s) => s.contains(&display_value(expected)),
            Value::Array(items) => items.iter().any(|item| loosely_equal(item, expected)),
            Value::Object(map) => expected.as_str().is_some_and(|key| map.contains_key(key)),
            _ => false,
        },
        (EventOperator::Regex, Some(actual)) => pattern.is_some_and(|re| re.is_match(&display_value(actual))),
        (EventOperator::GreaterThan, Some(actual)) => {
            matches!((as_number(actual), as_number(expected)), (Some(a), Some(b)) if a > b)
        }
        (EventOperator::LessThan, Some(actual)) => {
            matches!((as_number(actual), as_number(expected)), (Some(a), Some(b)) if a < b)
        }
        (EventOperator::InList, Some(actual)) => expected
            .as_array()
            .is_some_and(|items| items.iter().any(|item| loosely_equal(item, actual))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> Value {
        json!({
            "header": {"event_type": "im.message.receive_v1"},
            "event": {
                "message": {"chat_type": "group", "content": "deploy prod now", "mentions": ["bot", "ops"]},
                "sender": {"level": 7, "score": "42.5", "tag": "n/a"}
            }
        })
    }

    fn condition(field: &str, operator: EventOperator, value: Value) -> EventCondition {
        EventCondition { field: field.into(), operator, value }
    }

    fn trigger(event_type: Option<&str>, conditions: Vec<EventCondition>) -> EventTrigger {
        EventTrigger::new(EventTriggerConfig {
            event_type: event_type.map(String::from),
            conditions,
        })
        .unwrap()
    }

    #[test]
    fn test_event_type_match() {
        assert!(trigger(Some("im.message.receive_v1"), vec![]).matches(&payload()));
        assert!(!trigger(Some("im.chat.updated_v1"), vec![]).matches(&payload()));
        assert!(trigger(None, vec![]).matches(&json!({})));
        assert!(!trigger(Some("x"), vec![]).matches(&json!({"header": {}})));
    }

    #[test]
    fn test_operators() {
        use EventOperator::*;
        let p = payload();
        let cases = [
            (condition("event.message.chat_type", Equals, json!("group")), true),
            (condition("event.sender.level", Equals, json!(7.0)), true),
            (condition("event.message.content", Contains, json!("prod")), true),
            (condition("event.message.mentions", Contains, json!("ops")), true),
            (condition("event.message.content", Regex, json!("^deploy (prod|staging)")), true),
            (condition("event.message.content", Regex, json!("^rollback")), false),
            (condition("event.sender.level", GreaterThan, json!(5)), true),
            (condition("event.sender.score", LessThan, json!(50)), true),
            (condition("event.message.chat_type", InList, json!(["p2p", "group"])), true),
            (condition("event.message.missing", Exists, json!(true)), false),
            (condition("event.message.missing", Exists, json!(false)), true),
            (condition("event.sender", Exists, Value::Null), true),
            (condition("event.message.missing", Equals, json!("x")), false),
        ];
        for (cond, expected) in cases {
            let t = trigger(None, vec![cond.clone()]);
            assert_eq!(t.matches(&p), expected, "{cond:?}");
        }
    }

    #[test]
    fn test_numeric_comparison_on_text_fails_quietly() {
        let t = trigger(None, vec![condition("event.sender.tag", EventOperator::GreaterThan, json!(1))]);
        assert!(!t.matches(&payload()));
        let t = trigger(None, vec![condition("event.sender.level", EventOperator::LessThan, json!("many"))]);
        assert!(!t.matches(&payload()));
    }

    #[test]
    fn test_conditions_are_anded() {
        let t = trigger(
            Some("im.message.receive_v1"),
            vec![
                condition("event.message.chat_type", EventOperator::Equals, json!("group")),
                condition("event.sender.level", EventOperator::GreaterThan, json!(10)),
            ],
        );
        assert!(!t.matches(&payload()));
    }

    #[test]
    fn test_invalid_regex_rejected_at_build() {
        let config = EventTriggerConfig {
            event_type: None,
            conditions: vec![condition("a", EventOperator::Regex, json!("("))],
        };
        assert!(EventTrigger::new(config).is_err());
    }

    #[test]
    fn test_config_accepts_path_alias() {
        let config: EventTriggerConfig = serde_json::from_value(json!({
            "event_type": "e",
            "conditions": [{"path": "a.b", "operator": "in_list", "value": [1, 2]}]
        }))
        .unwrap();
        assert_eq!(config.conditions[0].field, "a.b");
        assert_eq!(config.conditions[0].operator, EventOperator::InList);
    }
}
