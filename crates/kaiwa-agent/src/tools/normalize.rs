//! Turning whatever a tool connection returns into a JSON payload.
//!
//! Precedence: plain JSON passes through, then types that know their own JSON
//! form (`Serializable`), and anything else is stringified. Per-shape adapters
//! (builtin `ToolResult`, MCP call results) implement `Serializable`.

use std::fmt;

use serde_json::{Map, Value};

use super::ToolResult;

/// A result type that can describe itself as JSON.
pub trait Serializable: Send {
    fn to_value(&self) -> Value;
}

/// Raw result of one tool call, before normalization.
pub enum ToolOutput {
    Json(Value),
    Structured(Box<dyn Serializable>),
    Opaque(Box<dyn fmt::Display + Send>),
}

impl ToolOutput {
    pub fn structured(value: impl Serializable + 'static) -> Self {
        Self::Structured(Box::new(value))
    }

    pub fn opaque(value: impl fmt::Display + Send + 'static) -> Self {
        Self::Opaque(Box::new(value))
    }

    pub fn into_value(self) -> Value {
        match self {
            ToolOutput::Json(v) => v,
            ToolOutput::Structured(s) => s.to_value(),
            ToolOutput::Opaque(o) => Value::String(o.to_string()),
        }
    }
}

impl fmt::Debug for ToolOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolOutput::Json(v) => f.debug_tuple("Json").field(v).finish(),
            ToolOutput::Structured(_) => f.write_str("Structured(..)"),
            ToolOutput::Opaque(o) => f.debug_tuple("Opaque").field(&o.to_string()).finish(),
        }
    }
}

impl From<Value> for ToolOutput {
    fn from(v: Value) -> Self {
        ToolOutput::Json(v)
    }
}

/// Successful builtin results carry JSON text; plain text becomes a string.
impl Serializable for ToolResult {
    fn to_value(&self) -> Value {
        serde_json::from_str(&self.content).unwrap_or_else(|_| Value::String(self.content.clone()))
    }
}

/// Copy an object's public fields, descending one level into nested objects.
///
/// Keys starting with `_` are internal and dropped at both levels. Deeper
/// values are kept as they are. Non-objects are returned unchanged.
pub fn public_fields(value: &Value) -> Value {
    let Value::Object(map) = value else {
        return value.clone();
    };

    let mut out = Map::new();
    for (key, field) in map {
        if key.starts_with('_') {
            continue;
        }
        let field = match field {
            Value::Object(inner) => Value::Object(
                inner
                    .iter()
                    .filter(|(k, _)| !k.starts_with('_'))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
            other => other.clone(),
        };
        out.insert(key.clone(), field);
    }
    Value::Object(out)
}
