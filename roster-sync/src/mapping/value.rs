//! Scalar value representation for mapped fields

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};

/// A scalar value read from a source record or written to a target record
///
/// Serializes untagged so output records render as plain JSON objects.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Null/empty value
    #[default]
    Null,
    /// Boolean
    Bool(bool),
    /// Whole number
    Int(i64),
    /// Floating point
    Float(f64),
    /// String value (dates stay strings)
    String(String),
}

impl Value {
    /// Check if this value is null
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Try to get as string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get as bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Parse a scalar from JSON. Objects and arrays are not scalars.
    pub fn from_json(json: &serde_json::Value) -> Option<Self> {
        match json {
            serde_json::Value::Null => Some(Value::Null),
            serde_json::Value::Bool(b) => Some(Value::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(Value::Int(i))
                } else {
                    n.as_f64().map(Value::Float)
                }
            }
            serde_json::Value::String(s) => Some(Value::String(s.clone())),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => None,
        }
    }

    /// Convert to JSON value for API calls
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::json!(*i),
            Value::Float(f) => serde_json::json!(*f),
            Value::String(s) => serde_json::Value::String(s.clone()),
        }
    }

    /// Coerce a resolved value into the target's representation
    ///
    /// Nulls are dropped (the field is omitted, never sent as empty) and
    /// booleans become the target's `Y`/`N` tokens.
    pub fn into_target(self) -> Option<Value> {
        match self {
            Value::Null => None,
            Value::Bool(true) => Some(Value::String("Y".to_string())),
            Value::Bool(false) => Some(Value::String("N".to_string())),
            other => Some(other),
        }
    }

    /// String form used as an identifier key (lookup maps, id stamping)
    pub fn as_key(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::String(s) if s.is_empty() => None,
            Value::String(s) => Some(s.clone()),
            Value::Int(i) => Some(i.to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::Bool(b) => Some(b.to_string()),
        }
    }

    /// Equality used by `when` predicates: numbers compare numerically
    pub fn matches(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                (*a as f64 - *b).abs() < f64::EPSILON
            }
            _ => self == other,
        }
    }

    /// Compare two ordering-field values (e.g. `updateDate`)
    ///
    /// Numbers compare numerically, RFC 3339 timestamps and plain dates
    /// compare chronologically, other strings lexically. Null sorts first.
    pub fn cmp_ordering(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Less,
            (_, Value::Null) => Ordering::Greater,
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                let a = self.as_f64().unwrap_or_default();
                let b = other.as_f64().unwrap_or_default();
                a.partial_cmp(&b).unwrap_or(Ordering::Equal)
            }
            (Value::String(a), Value::String(b)) => compare_temporal(a, b),
            _ => self.to_string().cmp(&other.to_string()),
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }
}

fn compare_temporal(a: &str, b: &str) -> Ordering {
    if let (Ok(a), Ok(b)) = (DateTime::parse_from_rfc3339(a), DateTime::parse_from_rfc3339(b)) {
        return a.cmp(&b);
    }
    if let (Ok(a), Ok(b)) = (
        NaiveDate::parse_from_str(a, "%Y-%m-%d"),
        NaiveDate::parse_from_str(b, "%Y-%m-%d"),
    ) {
        return a.cmp(&b);
    }
    a.cmp(b)
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "(null)"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(fl) => write!(f, "{}", fl),
            Value::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}
