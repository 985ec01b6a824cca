//! Runtime values of the cell language.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Serialize, Serializer};

/// Persistent per-session bindings.
pub type Namespace = BTreeMap<String, Value>;

/// Host capabilities bound into the namespace as callable values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// `llm_query(chunk, question)`: synchronous delegate call.
    DelegateQuery,
    /// `FINAL_VAR(name)`: string form of a binding.
    FinalVar,
}

impl Capability {
    pub fn name(self) -> &'static str {
        match self {
            Capability::DelegateQuery => "llm_query",
            Capability::FinalVar => "FINAL_VAR",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Capability(Capability),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Capability(_) => "capability",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Capability(_) => true,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Levels of list nesting: `0` for scalars, `1` for a flat list.
    pub fn nesting_depth(&self) -> usize {
        match self {
            Value::List(items) => 1 + items.iter().map(Value::nesting_depth).max().unwrap_or(0),
            _ => 0,
        }
    }

    /// Source-like rendering used for echo and inside lists.
    pub fn repr(&self) -> String {
        match self {
            Value::Str(s) => format!("'{}'", escape(s)),
            other => other.to_string(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::None => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Value::Capability(cap) => serde_json::Value::String(format!("<capability:{}>", cap.name())),
        }
    }

    /// Objects have no cell-language counterpart and arrive as their JSON text.
    pub fn from_json(value: &serde_json::Value) -> Value {
        match value {
            serde_json::Value::Null => Value::None,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(items) => Value::List(items.iter().map(Value::from_json).collect()),
            serde_json::Value::Object(_) => Value::Str(value.to_string()),
        }
    }
}

/// `str()` form: strings render raw, everything else as its repr.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => f.write_str("none"),
            Value::Bool(b) => f.write_str(if *b { "true" } else { "false" }),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => f.write_str(&format_float(*x)),
            Value::Str(s) => f.write_str(s),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    f.write_str(&item.repr())?;
                }
                f.write_str("]")
            }
            Value::Capability(cap) => write!(f, "<capability:{}>", cap.name()),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

fn format_float(x: f64) -> String {
    if x.is_finite() && x.fract() == 0.0 && x.abs() < 1e16 {
        format!("{x:.1}")
    } else {
        format!("{x}")
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn floats_keep_a_decimal_point() {
        assert_eq!(Value::Float(2.0).to_string(), "2.0");
        assert_eq!(Value::Float(2.5).to_string(), "2.5");
        assert_eq!(Value::Float(-0.25).to_string(), "-0.25");
    }

    #[test]
    fn lists_render_items_by_repr() {
        let list = Value::List(vec![
            Value::Int(1),
            Value::Str("a'b".to_string()),
            Value::None,
        ]);
        assert_eq!(list.to_string(), r"[1, 'a\'b', none]");
    }

    #[test]
    fn json_conversion_preserves_shape() {
        let value = Value::from_json(&json!([1, 2.5, "x", null, true]));
        assert_eq!(value.to_json(), json!([1, 2.5, "x", null, true]));
        assert_eq!(Value::from_json(&json!({"a": 1})), Value::Str("{\"a\":1}".to_string()));
    }

    #[test]
    fn capabilities_serialize_as_markers() {
        let json = serde_json::to_value(Value::Capability(Capability::DelegateQuery)).expect("serialize");
        assert_eq!(json, json!("<capability:llm_query>"));
    }

    #[test]
    fn truthiness_follows_emptiness() {
        assert!(!Value::Str(String::new()).truthy());
        assert!(!Value::List(Vec::new()).truthy());
        assert!(!Value::Int(0).truthy());
        assert!(Value::Str("0".to_string()).truthy());
    }
}
