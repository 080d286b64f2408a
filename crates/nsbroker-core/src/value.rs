//! Values bound in namespaces and returned by expressions.

use crate::protocol::AsyncHandle;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A value living in a namespace binding table or travelling in a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// Reference to an asynchronous result.
    Handle(AsyncHandle),
    /// An asynchronous result that is still being computed.
    Busy,
    /// Evaluator-internal object (builtin function, service object).
    ///
    /// Has no wire form: serializing it fails, and the connection handler
    /// substitutes [`Value::unserializable`].
    #[serde(skip)]
    Native(String),
}

impl Value {
    /// Placeholder sent instead of a value the transport cannot encode.
    pub fn unserializable(original: &Value) -> Value {
        Value::Str(format!("Unserializable(\"{}\")", original))
    }

    /// Name of the value's type as reported by the `type()` builtin.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Handle(_) => "handle",
            Value::Busy => "busy",
            Value::Native(_) => "native",
        }
    }

    /// Truthiness used by `and`, `or` and `not`.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null | Value::Busy => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Map(map) => !map.is_empty(),
            Value::Handle(_) | Value::Native(_) => true,
        }
    }

    /// Whether the value (and everything inside it) has a wire form.
    ///
    /// JSON has no infinities or NaN, so non-finite floats have none.
    pub fn is_transportable(&self) -> bool {
        match self {
            Value::Native(_) => false,
            Value::Float(f) => f.is_finite(),
            Value::List(items) => items.iter().all(Value::is_transportable),
            Value::Map(map) => map.values().all(Value::is_transportable),
            _ => true,
        }
    }

    /// Source-literal form; strings come back quoted and escaped.
    pub fn repr(&self) -> String {
        match self {
            Value::Str(s) => quote(s),
            other => other.to_string(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view of ints and floats.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => {
                if x.is_finite() && x.fract() == 0.0 && x.abs() < 1e16 {
                    write!(f, "{:.1}", x)
                } else {
                    write!(f, "{}", x)
                }
            }
            Value::Str(s) => write!(f, "{}", s),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item.repr())?;
                }
                write!(f, "]")
            }
            Value::Map(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", quote(k), v.repr())?;
                }
                write!(f, "}}")
            }
            Value::Handle(handle) => write!(f, "{}", handle),
            Value::Busy => write!(f, "<busy>"),
            Value::Native(desc) => write!(f, "{}", desc),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_forms() {
        assert_eq!(Value::Int(2).to_string(), "2");
        assert_eq!(Value::Float(2.0).to_string(), "2.0");
        assert_eq!(Value::Float(0.5).to_string(), "0.5");
        assert_eq!(
            Value::from(vec![Value::Int(1), Value::from("a\"b")]).to_string(),
            "[1, \"a\\\"b\"]"
        );
    }

    #[test]
    fn test_native_refuses_to_serialize() {
        let native = Value::Native("<builtin sleep>".into());
        assert!(serde_json::to_string(&native).is_err());
        assert!(!Value::List(vec![Value::Int(1), native.clone()]).is_transportable());

        let placeholder = Value::unserializable(&native);
        assert_eq!(
            placeholder,
            Value::Str("Unserializable(\"<builtin sleep>\")".into())
        );
        assert!(serde_json::to_string(&placeholder).is_ok());
    }

    #[test]
    fn test_non_finite_floats_have_no_wire_form() {
        assert!(Value::Float(1.5).is_transportable());
        assert!(!Value::Float(f64::INFINITY).is_transportable());
        assert!(!Value::from(vec![Value::Int(1), Value::Float(f64::NAN)]).is_transportable());
        let mut map = BTreeMap::new();
        map.insert("k".to_string(), Value::Float(f64::NEG_INFINITY));
        assert!(!Value::Map(map).is_transportable());
    }

    #[test]
    fn test_json_shape() {
        let json = serde_json::to_string(&Value::Int(7)).unwrap();
        assert_eq!(json, r#"{"int":7}"#);
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Value::Int(7));
        assert_eq!(serde_json::to_string(&Value::Null).unwrap(), r#""null""#);
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Str(String::new()).is_truthy());
        assert!(Value::Int(-1).is_truthy());
        assert!(!Value::List(vec![]).is_truthy());
    }
}
