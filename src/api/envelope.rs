//! Response envelope normalization.
//!
//! The backend wraps payloads inconsistently: `{ data: X }`,
//! `{ status: "success", ...fields }`, `{ data: { allergens: [...] } }` or the
//! bare payload. Everything coming back through `ApiClient` passes through
//! here once so the rest of the crate sees a single shape.

use serde_json::{Map, Value};

/// Unwrap one layer of envelope.
pub fn normalize(raw: Value) -> Value {
    match raw {
        Value::Object(mut map) => {
            if let Some(data) = map.remove("data") {
                if !data.is_null() {
                    return data;
                }
                map.insert("data".to_string(), data);
            }
            if map.get("status").and_then(Value::as_str) == Some("success") {
                map.remove("status");
            }
            Value::Object(map)
        }
        other => other,
    }
}

/// Extract a list of records stored under `key`, wherever the envelope put it.
pub fn collection(raw: Value, key: &str) -> Vec<Value> {
    match normalize(raw) {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove(key) {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

/// Extract a single record stored under `key`, falling back to the whole payload.
pub fn item(raw: Value, key: &str) -> Value {
    match normalize(raw) {
        Value::Object(mut map) => match map.remove(key) {
            Some(inner @ Value::Object(_)) => inner,
            Some(other) => {
                map.insert(key.to_string(), other);
                Value::Object(map)
            }
            None => Value::Object(map),
        },
        other => other,
    }
}

/// Record id from whichever key carried it. Ids arrive as strings, numbers or
/// populated `{ _id, ... }` objects; anything else is no id.
pub fn record_id(v: Option<Value>) -> Option<String> {
    match v? {
        Value::String(s) if !s.is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(mut map) => record_id(map.remove("_id").or_else(|| map.remove("id"))),
        _ => None,
    }
}

/// Server-provided error message, if the body carries one.
pub fn error_message(body: &Value) -> Option<String> {
    let obj: &Map<String, Value> = body.as_object()?;
    ["message", "error"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
