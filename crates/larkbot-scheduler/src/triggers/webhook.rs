use larkbot_core::error::{LarkBotError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt::Write as _;

use super::manual::ParamType;

fn default_methods() -> Vec<String> {
    vec!["POST".into()]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    #[serde(rename = "type", default)]
    pub kind: ParamType,
}

/// Shallow payload schema: required top-level keys and their types.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PayloadSchema {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, FieldSchema>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookTriggerConfig {
    pub path: String,
    #[serde(default = "default_methods")]
    pub methods: Vec<String>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub validate_payload: bool,
    #[serde(default)]
    pub payload_schema: Option<PayloadSchema>,
}

/// Why a webhook call was turned away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookRejection {
    MethodNotAllowed(String),
    InvalidSignature,
    InvalidPayload(String),
}

impl WebhookRejection {
    /// HTTP status to answer with.
    pub fn status(&self) -> u16 {
        match self {
            WebhookRejection::MethodNotAllowed(_) => 405,
            WebhookRejection::InvalidSignature => 401,
            WebhookRejection::InvalidPayload(_) => 400,
        }
    }
}

impl std::fmt::Display for WebhookRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WebhookRejection::MethodNotAllowed(m) => write!(f, "Method {m} not allowed"),
            WebhookRejection::InvalidSignature => f.write_str("Invalid signature"),
            WebhookRejection::InvalidPayload(reason) => write!(f, "Invalid payload: {reason}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebhookTrigger {
    config: WebhookTriggerConfig,
}

impl WebhookTrigger {
    pub fn new(mut config: WebhookTriggerConfig) -> Result<Self> {
        if config.path.trim().is_empty() {
            return Err(LarkBotError::Config("webhook trigger needs a path".into()));
        }
        if !config.path.starts_with('/') {
            config.path.insert(0, '/');
        }
        for method in &mut config.methods {
            *method = method.to_uppercase();
        }
        Ok(Self { config })
    }

    pub fn path(&self) -> &str {
        &self.config.path
    }

    /// Method, then signature (when a secret is set), then schema (when
    /// `validate_payload` is on).
    pub fn validate(
        &self,
        method: &str,
        payload: &Value,
        signature: Option<&str>,
    ) -> std::result::Result<(), WebhookRejection> {
        let method = method.to_uppercase();
        if !self.config.methods.contains(&method) {
            return Err(WebhookRejection::MethodNotAllowed(method));
        }

        if let Some(secret) = &self.config.secret {
            let expected = webhook_signature(secret, payload);
            if signature != Some(expected.as_str()) {
                return Err(WebhookRejection::InvalidSignature);
            }
        }

        if self.config.validate_payload
            && let Some(schema) = &self.config.payload_schema
        {
            check_schema(schema, payload).map_err(WebhookRejection::InvalidPayload)?;
        }
        Ok(())
    }
}

fn check_schema(schema: &PayloadSchema, payload: &Value) -> std::result::Result<(), String> {
    let Some(fields) = payload.as_object() else {
        return Err("payload must be a JSON object".into());
    };
    if let Some(missing) = schema.required.iter().find(|k| !fields.contains_key(*k)) {
        return Err(format!("missing required field '{missing}'"));
    }
    for (name, field) in &schema.properties {
        if let Some(value) = fields.get(name)
            && !field.kind.matches(value)
        {
            return Err(format!("field '{name}' must be of type {}", field.kind.as_str()));
        }
    }
    Ok(())
}

/// `hex(sha256(secret + json))` where `json` is the payload in
/// [`canonical_json`] form.
///
/// This is a keyed hash, not an HMAC. Kept for compatibility with existing
/// senders.
pub fn webhook_signature(secret: &str, payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(canonical_json(payload).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Canonical signing text: `", "` and `": "` separators, sorted keys, non-ASCII
/// escaped as `\uXXXX`.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_value(value, &mut out);
    out
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) if n.is_f64() => out.push_str(&float_repr(&n.to_string())),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_value(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_string(key, out);
                out.push_str(": ");
                write_value(&map[key], out);
            }
            out.push('}');
        }
    }
}

/// `1e16` → `1e+16`, `1.5e-7` → `1.5e-07`.
fn float_repr(repr: &str) -> String {
    match repr.split_once('e') {
        Some((mantissa, exp)) => {
            let (sign, digits) = match exp.strip_prefix('-') {
                Some(d) => ('-', d),
                None => ('+', exp.trim_start_matches('+')),
            };
            format!("{mantissa}e{sign}{digits:0>2}")
        }
        None => repr.to_string(),
    }
}

fn write_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            ' '..='~' => out.push(c),
            _ => {
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    let _ = write!(out, "\\u{:04x}", unit);
                }
            }
        }
    }
    out.push('"');
}
