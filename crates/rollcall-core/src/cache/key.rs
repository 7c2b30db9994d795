//! Deterministic cache-key encoding for fetch dependencies.
//!
//! Field collections are encoded with their names sorted, so two maps
//! holding the same fields in different insertion order produce the same
//! key. Lists keep their order. `undefined`, `null` and the strings
//! `"undefined"`/`"null"` all encode differently.

use std::fmt::Write as _;

/// A dependency value as seen by the key serializer.
#[derive(Debug, Clone, PartialEq)]
pub enum DepValue {
    /// An absent value.
    Undefined,
    Null,
    Bool(bool),
    /// Exact integer; ids above 2^53 stay distinct.
    Int(i128),
    Number(f64),
    String(String),
    /// Ordered sequence; order is part of the key.
    List(Vec<DepValue>),
    /// Unordered field collection; field order is ignored.
    Map(Vec<(String, DepValue)>),
    /// A callable, encoded by label only.
    Function(String),
}

impl DepValue {
    /// Build a field collection from `(name, value)` pairs.
    pub fn map<K, V, I>(fields: I) -> Self
    where
        K: Into<String>,
        V: Into<DepValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        DepValue::Map(
            fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn list<V, I>(items: I) -> Self
    where
        V: Into<DepValue>,
        I: IntoIterator<Item = V>,
    {
        DepValue::List(items.into_iter().map(Into::into).collect())
    }

    /// Placeholder for a function value. Two functions with the same label
    /// encode identically.
    pub fn function(label: impl Into<String>) -> Self {
        DepValue::Function(label.into())
    }
}

/// Encode a dependency value into its canonical string form.
pub fn serialize(value: &DepValue) -> String {
    let mut out = String::new();
    encode(value, &mut out);
    out
}

/// Encode a dependency list as an ordered sequence.
pub fn serialize_list(values: &[DepValue]) -> String {
    let mut out = String::new();
    encode_list(values, &mut out);
    out
}

/// Key used when a unit has no explicit cache key: `<label>_<deps>`.
pub fn derive_cache_key(label: &str, dependencies: &[DepValue]) -> String {
    format!("{}_{}", label, serialize_list(dependencies))
}

fn encode(value: &DepValue, out: &mut String) {
    match value {
        DepValue::Undefined => out.push_str("undefined"),
        DepValue::Null => out.push_str("null"),
        DepValue::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        DepValue::Int(i) => {
            let _ = write!(out, "{}", i);
        }
        DepValue::Number(n) => encode_float(*n, out),
        DepValue::String(s) => encode_str(s, out),
        DepValue::List(items) => encode_list(items, out),
        DepValue::Map(fields) => {
            let mut sorted: Vec<&(String, DepValue)> = fields.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(&b.0));
            out.push('{');
            for (i, (name, v)) in sorted.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                encode_str(name, out);
                out.push(':');
                encode(v, out);
            }
            out.push('}');
        }
        DepValue::Function(label) => {
            out.push_str("<fn:");
            encode_str(label, out);
            out.push('>');
        }
    }
}

/// Integral floats share the integer form, so `1` and `1.0` are the same
/// dependency and `-0` is `0`.
fn encode_float(n: f64, out: &mut String) {
    if n.fract() == 0.0 && n.abs() < i128::MAX as f64 {
        let _ = write!(out, "{}", n as i128);
    } else {
        let _ = write!(out, "{}", n);
    }
}

fn encode_list(items: &[DepValue], out: &mut String) {
    out.push('[');
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        encode(item, out);
    }
    out.push(']');
}

fn encode_str(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out.push('"');
}

// ============================================================================
// Conversions
// ============================================================================

impl From<bool> for DepValue {
    fn from(b: bool) -> Self {
        DepValue::Bool(b)
    }
}

macro_rules! int_from {
    ($($t:ty),*) => {
        $(
            impl From<$t> for DepValue {
                fn from(n: $t) -> Self {
                    DepValue::Int(n as i128)
                }
            }
        )*
    };
}

int_from!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

impl From<f32> for DepValue {
    fn from(n: f32) -> Self {
        DepValue::Number(f64::from(n))
    }
}

impl From<f64> for DepValue {
    fn from(n: f64) -> Self {
        DepValue::Number(n)
    }
}

impl From<&str> for DepValue {
    fn from(s: &str) -> Self {
        DepValue::String(s.to_string())
    }
}

impl From<String> for DepValue {
    fn from(s: String) -> Self {
        DepValue::String(s)
    }
}

impl<T: Into<DepValue>> From<Option<T>> for DepValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(DepValue::Null)
    }
}

impl<T: Into<DepValue>> From<Vec<T>> for DepValue {
    fn from(items: Vec<T>) -> Self {
        DepValue::list(items)
    }
}

impl From<&serde_json::Value> for DepValue {
    fn from(value: &serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => DepValue::Null,
            Value::Bool(b) => DepValue::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    DepValue::Int(i128::from(i))
                } else if let Some(u) = n.as_u64() {
                    DepValue::Int(i128::from(u))
                } else {
                    n.as_f64()
                        .map(DepValue::Number)
                        .unwrap_or_else(|| DepValue::String(n.to_string()))
                }
            }
            Value::String(s) => DepValue::String(s.clone()),
            Value::Array(items) => DepValue::List(items.iter().map(DepValue::from).collect()),
            Value::Object(fields) => DepValue::Map(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), DepValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<serde_json::Value> for DepValue {
    fn from(value: serde_json::Value) -> Self {
        DepValue::from(&value)
    }
}
