//! Canonical JSON value tree used for structural comparison.
//!
//! Objects compare independent of key order, arrays compare positionally and
//! numbers compare by value (`1` equals `1.0`). Whitespace never matters
//! because comparison happens after parsing.

use serde_json::{Number, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub enum CanonicalValue {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    List(Vec<CanonicalValue>),
    Map(BTreeMap<String, CanonicalValue>),
}

impl CanonicalValue {
    /// Parse raw bytes into a canonical tree.
    pub fn parse(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_slice(bytes)?;
        Ok(Self::from(value))
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::List(_) => "array",
            Self::Map(_) => "object",
        }
    }
}

impl From<Value> for CanonicalValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => Self::Number(n),
            Value::String(s) => Self::String(s),
            Value::Array(items) => Self::List(items.into_iter().map(Self::from).collect()),
            // serde_json keeps the last duplicate key, so map keys are unique here.
            Value::Object(map) => Self::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Self::from(v)))
                    .collect(),
            ),
        }
    }
}

impl PartialEq for CanonicalValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => numbers_equal(a, b),
            (Self::String(a), Self::String(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            _ => false,
        }
    }
}

fn numbers_equal(a: &Number, b: &Number) -> bool {
    match (integer_of(a), integer_of(b)) {
        (Some(x), Some(y)) => x == y,
        (Some(x), None) => integral_float(b) == Some(x),
        (None, Some(y)) => integral_float(a) == Some(y),
        (None, None) => a.as_f64() == b.as_f64(),
    }
}

fn integer_of(n: &Number) -> Option<i128> {
    n.as_i64()
        .map(i128::from)
        .or_else(|| n.as_u64().map(i128::from))
}

/// The exact integer a float holds, if it holds one inside the i64/u64 range.
/// Integers are never widened to f64, which would round above 2^53.
fn integral_float(n: &Number) -> Option<i128> {
    let f = n.as_f64()?;
    let in_range = (-9_223_372_036_854_775_808.0..18_446_744_073_709_551_616.0).contains(&f);
    (f.fract() == 0.0 && in_range).then_some(f as i128)
}

/// Path of the first structural difference, e.g. `$.result.tools[2].name`.
pub fn first_difference(expected: &CanonicalValue, actual: &CanonicalValue) -> Option<String> {
    diff_at(expected, actual, "$".to_string())
}

fn diff_at(expected: &CanonicalValue, actual: &CanonicalValue, path: String) -> Option<String> {
    match (expected, actual) {
        (CanonicalValue::List(a), CanonicalValue::List(b)) => {
            for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
                if let Some(found) = diff_at(x, y, format!("{path}[{i}]")) {
                    return Some(found);
                }
            }
            if a.len() != b.len() {
                return Some(format!("{path} (length {} vs {})", a.len(), b.len()));
            }
            None
        }
        (CanonicalValue::Map(a), CanonicalValue::Map(b)) => {
            for (key, x) in a {
                match b.get(key) {
                    Some(y) => {
                        if let Some(found) = diff_at(x, y, format!("{path}.{key}")) {
                            return Some(found);
                        }
                    }
                    None => return Some(format!("{path}.{key} (missing)")),
                }
            }
            b.keys()
                .find(|key| !a.contains_key(*key))
                .map(|key| format!("{path}.{key} (unexpected)"))
        }
        _ if expected == actual => None,
        _ if expected.kind() != actual.kind() => {
            Some(format!("{path} ({} vs {})", expected.kind(), actual.kind()))
        }
        _ => Some(path),
    }
}
