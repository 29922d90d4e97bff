//! Plain data types passed between the scheduler core and its collaborators.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Per-execution variables. Every execution works on its own copy.
pub type Context = serde_json::Map<String, Value>;

/// Follow a dot-separated path (`header.event_type`) through nested objects.
/// Numeric segments index into arrays.
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// An outbound HTTP request, already interpolated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// JSON body.
    #[serde(default)]
    pub json: Option<Value>,
    /// Form body.
    #[serde(default)]
    pub form: Option<BTreeMap<String, String>>,
    #[serde(default = "default_http_timeout", with = "duration_secs")]
    pub timeout: Duration,
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(30)
}

impl HttpRequest {
    pub fn new(method: &str, url: &str) -> Self {
        Self {
            method: method.to_uppercase(),
            url: url.to_string(),
            headers: BTreeMap::new(),
            params: BTreeMap::new(),
            json: None,
            form: None,
            timeout: default_http_timeout(),
        }
    }
}

/// A successful (2xx) HTTP response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    /// Parsed JSON body, or the raw text when the body is not JSON.
    pub fn body_value(&self) -> Value {
        serde_json::from_str(&self.body).unwrap_or_else(|_| Value::String(self.body.clone()))
    }
}

/// Output of a [`crate::traits::TemplateRenderer`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RenderedTemplate {
    /// Template kind, e.g. `text` or `card`.
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
}

/// Result reported by the AI action contract.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AiTaskResult {
    pub success: bool,
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub tools_called: Vec<String>,
}

/// Serde helper: durations as (fractional) seconds.
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom(format!("invalid duration: {secs}")));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

/// Serde helper: optional durations as (fractional) seconds.
pub mod opt_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        match Option::<f64>::deserialize(d)? {
            Some(secs) if secs.is_finite() && secs >= 0.0 => Ok(Some(Duration::from_secs_f64(secs))),
            Some(secs) => Err(serde::de::Error::custom(format!("invalid duration: {secs}"))),
            None => Ok(None),
        }
    }
}
