//! Plugin capability registry.
//!
//! A plugin publishes its callable methods when it is registered: each
//! method name maps to a typed async handler taking keyword arguments as a
//! JSON object. Tasks address them as `plugin.method`.

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::error::{LarkBotError, Result};

/// Handler behind one plugin method.
pub type PluginMethod = Arc<dyn Fn(Map<String, Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// A named plugin and the methods it exposes.
pub struct Plugin {
    name: String,
    methods: HashMap<String, PluginMethod>,
}

impl Plugin {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            methods: HashMap::new(),
        }
    }

    /// Builder: expose `method` backed by `handler`.
    pub fn method<F, Fut>(mut self, method: &str, handler: F) -> Self
    where
        F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let handler: PluginMethod = Arc::new(move |args| Box::pin(handler(args)));
        self.methods.insert(method.to_string(), handler);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    /// Sorted method names.
    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Invoke `method` with keyword arguments.
    pub async fn call(&self, method: &str, args: Map<String, Value>) -> Result<Value> {
        let handler = self.methods.get(method).ok_or_else(|| {
            LarkBotError::Plugin(format!(
                "Plugin '{}' has no method '{}'",
                self.name, method
            ))
        })?;
        handler(args).await
    }
}

/// Lookup of plugins by name.
pub trait PluginProvider: Send + Sync {
    fn get_plugin(&self, name: &str) -> Option<Arc<Plugin>>;
}

/// In-memory [`PluginProvider`].
#[derive(Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Plugin) {
        tracing::info!(
            "🔌 Registered plugin '{}' ({} methods)",
            plugin.name(),
            plugin.methods.len()
        );
        self.plugins.insert(plugin.name().to_string(), Arc::new(plugin));
    }

    pub fn count(&self) -> usize {
        self.plugins.len()
    }
}

impl PluginProvider for PluginRegistry {
    fn get_plugin(&self, name: &str) -> Option<Arc<Plugin>> {
        self.plugins.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_plugin() -> Plugin {
        Plugin::new("echo")
            .method("say", |args| async move {
                Ok(json!({"said": args.get("text").cloned().unwrap_or(Value::Null)}))
            })
            .method("fail", |_args| async move {
                Err(LarkBotError::Plugin("nope".into()))
            })
    }

    #[tokio::test]
    async fn test_call_registered_method() {
        let plugin = echo_plugin();
        let mut args = Map::new();
        args.insert("text".into(), json!("hi"));
        let out = plugin.call("say", args).await.unwrap();
        assert_eq!(out, json!({"said": "hi"}));
        assert_eq!(plugin.method_names(), vec!["fail", "say"]);
    }

    #[tokio::test]
    async fn test_unknown_method_is_error() {
        let plugin = echo_plugin();
        let err = plugin.call("shout", Map::new()).await.unwrap_err();
        assert!(err.to_string().contains("no method 'shout'"));
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = PluginRegistry::new();
        registry.register(echo_plugin());
        assert_eq!(registry.count(), 1);
        assert!(registry.get_plugin("echo").is_some());
        assert!(registry.get_plugin("missing").is_none());
    }
}
