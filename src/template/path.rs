use serde_json::{Map, Value};
use std::collections::HashMap;

const MAX_FLATTEN_DEPTH: usize = 4;

/// Walks `context` along a dotted path. Numeric segments index arrays.
pub fn resolve_path<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = context;
    for segment in path.split('.') {
        let segment = segment.trim();
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Text form used when a token is embedded in a larger string.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// `ticket-reply_sent` -> `TICKET_REPLY_SENT`
pub fn mangle(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

pub fn is_upper_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.chars().any(|c| c.is_ascii_uppercase())
        && name
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

/// Flat `TICKET_SUBJECT`-style map derived from the context objects.
pub fn system_tokens(context: &Value) -> HashMap<String, Value> {
    let mut tokens = HashMap::new();
    if let Value::Object(map) = context {
        flatten_into(&mut tokens, None, map, 0);
    }
    tokens
}

fn flatten_into(
    tokens: &mut HashMap<String, Value>,
    prefix: Option<&str>,
    map: &Map<String, Value>,
    depth: usize,
) {
    for (key, value) in map {
        let name = match prefix {
            Some(prefix) => format!("{}_{}", prefix, mangle(key)),
            None => mangle(key),
        };
        if let Value::Object(inner) = value {
            if depth + 1 < MAX_FLATTEN_DEPTH {
                flatten_into(tokens, Some(&name), inner, depth + 1);
            }
        }
        tokens.insert(name, value.clone());
    }
}
