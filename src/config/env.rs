//! `env` transform: substitutes environment variables into the config.
//!
//! ```yaml
//! accessToken: {$env: QUEUE_TOKEN}
//! maxCapacity: {$env: CAPACITY, type: number}
//! ```
//!
//! Supported types are `string` (default), `number`, `bool`, `json` and
//! `list` (whitespace separated strings).

use serde_json::{Map, Value};

use super::transform::{replace_objects, TransformProvider};

pub struct EnvTransform;

impl TransformProvider for EnvTransform {
    fn name(&self) -> &'static str {
        "env"
    }

    fn transform(&self, config: &mut Value) -> Result<(), String> {
        replace_objects(config, "env", &mut resolve)
    }
}

fn resolve(object: &Map<String, Value>) -> Result<Value, String> {
    let name = object
        .get("$env")
        .and_then(Value::as_str)
        .ok_or_else(|| "'$env' must be a string".to_string())?;

    if let Some(key) = object.keys().find(|k| *k != "$env" && *k != "type") {
        return Err(format!("unexpected key '{key}' next to '$env: {name}'"));
    }

    let kind = match object.get("type") {
        None => "string",
        Some(Value::String(kind)) => kind.as_str(),
        Some(_) => return Err(format!("'type' of '$env: {name}' must be a string")),
    };

    let raw = std::env::var(name)
        .map_err(|_| format!("environment variable '{name}' is not set"))?;
    parse_value(name, &raw, kind)
}

fn parse_value(name: &str, raw: &str, kind: &str) -> Result<Value, String> {
    match kind {
        "string" => Ok(Value::String(raw.to_string())),
        "number" => match serde_json::from_str::<Value>(raw.trim()) {
            Ok(value @ Value::Number(_)) => Ok(value),
            _ => Err(format!("environment variable '{name}' is not a number")),
        },
        "bool" => match raw.trim() {
            "true" | "1" => Ok(Value::Bool(true)),
            "false" | "0" => Ok(Value::Bool(false)),
            _ => Err(format!("environment variable '{name}' is not a boolean")),
        },
        "json" => serde_json::from_str(raw)
            .map_err(|e| format!("environment variable '{name}' is not valid JSON: {e}")),
        "list" => Ok(Value::Array(
            raw.split_whitespace()
                .map(|item| Value::String(item.to_string()))
                .collect(),
        )),
        other => Err(format!("unsupported type '{other}' for '$env: {name}'")),
    }
}
