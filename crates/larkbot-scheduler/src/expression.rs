//! Sandboxed expression and script engine (Rhai).
//!
//! Custom conditions, workflow step conditions and `script` actions run here.
//! Only the variables explicitly bound (normally just `context`) are visible;
//! module loading is disabled and every evaluation is bounded by operation,
//! call-depth and size limits.

use larkbot_core::error::{LarkBotError, Result};
use larkbot_core::types::Context;
use rhai::module_resolvers::DummyModuleResolver;
use rhai::{Array, Dynamic, Engine, Map, Scope};
use serde_json::{Map as JsonMap, Number, Value};

/// Expression evaluation engine using a locked-down Rhai configuration.
pub struct ExpressionEngine {
    engine: Engine,
}

impl Default for ExpressionEngine {
    fn default() -> Self {
        let mut engine = Engine::new();
        engine.set_max_operations(100_000);
        engine.set_max_call_levels(32);
        engine.set_max_expr_depths(64, 64);
        engine.set_max_string_size(64 * 1024);
        engine.set_max_array_size(10_000);
        engine.set_max_map_size(10_000);
        engine.set_module_resolver(DummyModuleResolver::new());
        engine.on_print(|text| tracing::info!("📜 {text}"));
        engine.on_debug(|text, source, pos| {
            tracing::debug!("📜 [{}:{}] {}", source.unwrap_or("script"), pos, text)
        });
        engine.register_fn("log", |message: Dynamic| {
            tracing::info!("📜 script: {message}");
        });
        ExpressionEngine { engine }
    }
}

impl ExpressionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate `expr` with `context` bound as the only variable.
    pub fn evaluate(&self, expr: &str, context: &Context) -> Result<Value> {
        let mut bindings = JsonMap::new();
        bindings.insert("context".into(), Value::Object(context.clone()));
        self.evaluate_with(expr, &bindings)
    }

    /// Evaluate `expr` with every entry of `bindings` bound as a variable.
    pub fn evaluate_with(&self, expr: &str, bindings: &JsonMap<String, Value>) -> Result<Value> {
        let mut scope = Scope::new();
        for (name, value) in bindings {
            scope.push_dynamic(name.as_str(), to_dynamic(value));
        }
        let result = self
            .engine
            .eval_with_scope::<Dynamic>(&mut scope, expr)
            .map_err(|err| LarkBotError::Expression(format!("expression error: {err}")))?;
        Ok(from_dynamic(result))
    }

    /// Evaluate `expr` and coerce the result to a boolean.
    pub fn evaluate_bool(&self, expr: &str, context: &Context) -> Result<bool> {
        self.evaluate(expr, context).map(|v| truthy(&v))
    }

    /// Run a script that may read and mutate `context`. Returns the context
    /// as it stands when the script finishes.
    pub fn run_script(&self, code: &str, context: &Context) -> Result<Context> {
        let mut scope = Scope::new();
        scope.push_dynamic("context", to_dynamic(&Value::Object(context.clone())));
        self.engine
            .run_with_scope(&mut scope, code)
            .map_err(|err| LarkBotError::Expression(format!("script error: {err}")))?;

        match scope.get_value::<Dynamic>("context").map(from_dynamic) {
            Some(Value::Object(updated)) => Ok(updated),
            _ => Err(LarkBotError::Expression(
                "script replaced `context` with a non-map value".into(),
            )),
        }
    }
}

/// Truthiness of a JSON value: null, false, 0, "" and empty containers are false.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Dynamic::from(i)
            } else {
                Dynamic::from(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => Dynamic::from(s.clone()),
        Value::Array(items) => {
            let arr: Array = items.iter().map(to_dynamic).collect();
            Dynamic::from_array(arr)
        }
        Value::Object(map) => {
            let mut rhai_map = Map::new();
            for (key, value) in map {
                rhai_map.insert(key.as_str().into(), to_dynamic(value));
            }
            Dynamic::from_map(rhai_map)
        }
    }
}

fn from_dynamic(value: Dynamic) -> Value {
    if value.is_unit() {
        return Value::Null;
    }
    if let Some(b) = value.clone().try_cast::<bool>() {
        return Value::Bool(b);
    }
    if let Some(i) = value.clone().try_cast::<i64>() {
        return Value::Number(Number::from(i));
    }
    if let Some(f) = value.clone().try_cast::<f64>() {
        return Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null);
    }
    if value.is_string() {
        return Value::String(value.into_string().unwrap_or_default());
    }
    if let Some(arr) = value.clone().try_cast::<Array>() {
        return Value::Array(arr.into_iter().map(from_dynamic).collect());
    }
    if let Some(map) = value.clone().try_cast::<Map>() {
        let mut json_map = JsonMap::new();
        for (key, value) in map {
            json_map.insert(key.to_string(), from_dynamic(value));
        }
        return Value::Object(json_map);
    }
    Value::String(value.to_string())
}
