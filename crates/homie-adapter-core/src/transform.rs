//! Declarative parser and transformer descriptions
//!
//! Configuration files cannot carry code, so the value transformations a
//! rule applies are described with [`TransformerSpec`]. The bridge crate
//! wraps these into its async `Transformer` trait next to hand-written
//! transformers registered from Rust.

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::AdapterError;

/// How raw payload bytes are decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ParserKind {
    /// Payload text used as-is
    #[default]
    Plain,
    /// Payload decoded as JSON
    Json,
}

impl ParserKind {
    /// Every supported parser kind
    pub const SUPPORTED: [ParserKind; 2] = [ParserKind::Json, ParserKind::Plain];

    /// Configuration spelling
    pub fn as_str(&self) -> &'static str {
        match self {
            ParserKind::Plain => "PLAIN",
            ParserKind::Json => "JSON",
        }
    }
}

impl FromStr for ParserKind {
    type Err = AdapterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PLAIN" => Ok(ParserKind::Plain),
            "JSON" => Ok(ParserKind::Json),
            other => Err(AdapterError::UnsupportedParser(other.to_string())),
        }
    }
}

impl fmt::Display for ParserKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pure value transformation described in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransformerSpec {
    /// Pass the value through
    Identity,
    /// Look the value up in a table
    Map {
        /// Lookup table keyed by the rendered input
        values: BTreeMap<String, Value>,
        /// Output for keys missing from the table (null when absent)
        #[serde(default)]
        default: Option<Value>,
    },
    /// Extract a member of a structured value by dotted path
    Field {
        /// Dotted path, array indices allowed (`a.0.b`)
        path: String,
    },
    /// Compare with a constant, yielding a boolean
    Equals {
        /// Value to compare against
        value: Value,
    },
    /// Numeric coercion
    Number,
    /// Ignore the input and emit a constant
    Constant {
        /// Emitted value
        value: Value,
    },
    /// Substitute the rendered input into `{value}`
    Template {
        /// Template text
        template: String,
    },
    /// Apply steps in order
    Pipe {
        /// Steps applied left to right
        steps: Vec<TransformerSpec>,
    },
}

impl TransformerSpec {
    /// Apply the transformation
    pub fn apply(&self, value: Value) -> Value {
        match self {
            TransformerSpec::Identity => value,
            TransformerSpec::Map { values, default } => values
                .get(&render_value(&value))
                .cloned()
                .or_else(|| default.clone())
                .unwrap_or(Value::Null),
            TransformerSpec::Field { path } => lookup_path(&value, path).unwrap_or(Value::Null),
            TransformerSpec::Equals { value: expected } => Value::Bool(&value == expected),
            TransformerSpec::Number => to_number(&value),
            TransformerSpec::Constant { value } => value.clone(),
            TransformerSpec::Template { template } => {
                Value::String(template.replace("{value}", &render_value(&value)))
            }
            TransformerSpec::Pipe { steps } => {
                steps.iter().fold(value, |acc, step| step.apply(acc))
            }
        }
    }
}

/// Render a value as payload text: strings verbatim, null as empty,
/// everything else in its JSON form.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn lookup_path(value: &Value, path: &str) -> Option<Value> {
    let mut current = value;
    for part in path.split('.').filter(|p| !p.is_empty()) {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

fn to_number(value: &Value) -> Value {
    match value {
        Value::Number(_) => value.clone(),
        Value::Bool(b) => Value::Number(Number::from(*b as i64)),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Value::Number(Number::from(0));
            }
            if let Ok(i) = trimmed.parse::<i64>() {
                return Value::Number(Number::from(i));
            }
            trimmed
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null)
        }
        _ => Value::Null,
    }
}
