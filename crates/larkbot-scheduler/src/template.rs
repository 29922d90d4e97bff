//! `$var` / `${var}` interpolation and the named message template store.
//!
//! Substitution is "safe": placeholders without a matching context key are
//! left untouched instead of raising. `$$` renders a literal `$`.

use larkbot_core::error::{LarkBotError, Result};
use larkbot_core::traits::TemplateRenderer;
use larkbot_core::types::{Context, RenderedTemplate, lookup_path};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\$(?:(?P<escaped>\$)|(?P<named>[_a-zA-Z][_a-zA-Z0-9]*)|\{(?P<braced>[_a-zA-Z][_a-zA-Z0-9]*(?:\.[_a-zA-Z0-9]+)*)\})",
    )
    .expect("placeholder pattern is valid")
});

/// Render a context value the way it should appear inside text.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn resolve<'a>(context: &'a Context, key: &str) -> Option<&'a Value> {
    match key.split_once('.') {
        None => context.get(key),
        Some((head, rest)) => context.get(head).and_then(|v| lookup_path(v, rest)),
    }
}

/// Replace `$name`, `${name}` and `${name.path}` with context values.
pub fn safe_substitute(template: &str, context: &Context) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            if caps.name("escaped").is_some() {
                return "$".to_string();
            }
            let key = caps
                .name("named")
                .or_else(|| caps.name("braced"))
                .map(|m| m.as_str())
                .unwrap_or_default();
            match resolve(context, key) {
                Some(value) => display_value(value),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Interpolate every string inside a JSON value.
pub fn interpolate_value(value: &Value, context: &Context) -> Value {
    match value {
        Value::String(s) => Value::String(safe_substitute(s, context)),
        Value::Array(items) => Value::Array(items.iter().map(|v| interpolate_value(v, context)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), interpolate_value(v, context)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Interpolate the values of a string map (headers, query params, form).
pub fn interpolate_map(map: &BTreeMap<String, String>, context: &Context) -> BTreeMap<String, String> {
    map.iter()
        .map(|(k, v)| (k.clone(), safe_substitute(v, context)))
        .collect()
}

/// A named message template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageTemplate {
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
    pub content: String,
}

fn default_kind() -> String {
    "text".into()
}

/// In-memory [`TemplateRenderer`] over named templates.
#[derive(Debug, Default)]
pub struct TemplateStore {
    templates: HashMap<String, MessageTemplate>,
}

impl TemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(templates: HashMap<String, MessageTemplate>) -> Self {
        Self { templates }
    }

    pub fn insert(&mut self, name: &str, template: MessageTemplate) {
        self.templates.insert(name.to_string(), template);
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

impl TemplateRenderer for TemplateStore {
    fn render(&self, name: &str, context: &Context) -> Result<RenderedTemplate> {
        let template = self
            .templates
            .get(name)
            .ok_or_else(|| LarkBotError::Template(format!("Template '{name}' not found")))?;
        Ok(RenderedTemplate {
            kind: template.kind.clone(),
            content: safe_substitute(&template.content, context),
        })
    }
}
