// Helpers over JSON values shared by the resolver, executor and actions

use indexmap::IndexMap;
use serde_json::{Map, Value};

/// Ordered variable mapping
pub type VarMap = IndexMap<String, Value>;

/// Truthiness used by conditionals and flags
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Interpret a user-supplied flag ("yes", "on", "1", true, ...)
pub fn boolean(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64() == Some(1),
        Value::String(s) => matches!(
            s.trim().to_lowercase().as_str(),
            "y" | "yes" | "on" | "1" | "true"
        ),
        _ => false,
    }
}

/// Render a value the way it appears on a command line: strings unquoted,
/// everything else as compact JSON.
pub fn to_plain_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Parse a number that may arrive as a string ("3", "0.5") or a JSON number
pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Overlay `top` onto `base`; later keys win
pub fn combine(base: &mut VarMap, top: &VarMap) {
    for (k, v) in top {
        base.insert(k.clone(), v.clone());
    }
}

/// Convert an ordered map into a JSON object
pub fn to_object(map: &VarMap) -> Map<String, Value> {
    map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

/// Convert a JSON object into an ordered map
pub fn from_object(obj: &Map<String, Value>) -> VarMap {
    obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}
