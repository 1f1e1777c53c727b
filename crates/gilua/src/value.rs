use std::{collections::BTreeMap, fmt, sync::Arc};

use serde::{Serialize, Serializer, ser::SerializeMap, ser::SerializeSeq};

use crate::{function::HostFunction, store::Userdata};

/// How numbers are marshaled out of the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NumberMode {
    /// Integers stay integers, floats stay floats.
    #[default]
    Exact,
    /// Every number becomes a float.
    Float,
}

/// A host-side copy of an interpreter value.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    /// Raw bytes; interpreter strings carry no encoding.
    String(Vec<u8>),
    /// A table whose keys are exactly `1..=n`.
    Array(Vec<Value>),
    /// Any other table, keyed by the string form of the original keys.
    Map(BTreeMap<String, Value>),
    /// A host value carried by a userdata of this crate.
    Userdata(Userdata),
    /// A host function; pushing it creates a new closure.
    Function(HostFunction),
    /// Something with no host counterpart (script functions, threads,
    /// foreign userdata), kept as its `tostring` form.
    Opaque(String),
}

impl Value {
    /// A string value from UTF-8 text.
    pub fn string(text: impl Into<String>) -> Self {
        Self::String(text.into().into_bytes())
    }

    /// Build a function value from a closure.
    pub fn function<F>(f: F) -> Self
    where
        F: Fn(&mut crate::State) -> crate::Result<usize> + Send + Sync + 'static,
    {
        Self::Function(Arc::new(f))
    }

    /// The string contents when this is valid UTF-8 text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric value of an integer or a float.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Integer(i) => Some(*i as f64),
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    /// Interpreter type name of the value once pushed.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Nil => "nil",
            Self::Boolean(_) => "boolean",
            Self::Integer(_) | Self::Number(_) => "number",
            Self::String(_) | Self::Opaque(_) => "string",
            Self::Array(_) | Self::Map(_) => "table",
            Self::Userdata(_) => "userdata",
            Self::Function(_) => "function",
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => f.write_str("Nil"),
            Self::Boolean(b) => f.debug_tuple("Boolean").field(b).finish(),
            Self::Integer(i) => f.debug_tuple("Integer").field(i).finish(),
            Self::Number(n) => f.debug_tuple("Number").field(n).finish(),
            Self::String(bytes) => f
                .debug_tuple("String")
                .field(&String::from_utf8_lossy(bytes))
                .finish(),
            Self::Array(items) => f.debug_tuple("Array").field(items).finish(),
            Self::Map(map) => f.debug_tuple("Map").field(map).finish(),
            Self::Userdata(_) => f.write_str("Userdata(..)"),
            Self::Function(_) => f.write_str("Function(..)"),
            Self::Opaque(repr) => f.debug_tuple("Opaque").field(repr).finish(),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Nil, Self::Nil) => true,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            (Self::Userdata(a), Self::Userdata(b)) => Arc::ptr_eq(a, b),
            (Self::Function(a), Self::Function(b)) => Arc::ptr_eq(a, b),
            (Self::Opaque(a), Self::Opaque(b)) => a == b,
            _ => false,
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Nil => serializer.serialize_unit(),
            Self::Boolean(b) => serializer.serialize_bool(*b),
            Self::Integer(i) => serializer.serialize_i64(*i),
            Self::Number(n) => serializer.serialize_f64(*n),
            Self::String(bytes) => serializer.serialize_str(&String::from_utf8_lossy(bytes)),
            Self::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Self::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
            Self::Userdata(_) => serializer.serialize_str("userdata"),
            Self::Function(_) => serializer.serialize_str("function"),
            Self::Opaque(repr) => serializer.serialize_str(repr),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Integer(i.into())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::string(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s.into_bytes())
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::Array(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self::Map(map)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Nil, Into::into)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Nil,
            serde_json::Value::Bool(b) => Self::Boolean(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Integer(i),
                None => Self::Number(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => s.into(),
            serde_json::Value::Array(items) => Self::Array(items.into_iter().map(Into::into).collect()),
            serde_json::Value::Object(entries) => {
                Self::Map(entries.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn from_json() {
        let value = Value::from(json!({
            "name": "gilua",
            "tags": ["a", 1, 2.5, null],
            "ok": true,
        }));

        let mut expected = BTreeMap::new();
        expected.insert("name".to_string(), Value::from("gilua"));
        expected.insert(
            "tags".to_string(),
            Value::Array(vec!["a".into(), 1.into(), 2.5.into(), Value::Nil]),
        );
        expected.insert("ok".to_string(), true.into());
        assert_eq!(value, Value::Map(expected));
    }

    #[test]
    fn serializes_like_json() {
        let value = Value::Array(vec![
            Value::Integer(1),
            Value::Number(1.5),
            Value::String(b"caf\xc3\xa9".to_vec()),
            Value::Opaque("function: builtin".into()),
            Value::Nil,
        ]);
        assert_eq!(
            serde_json::to_value(&value).unwrap(),
            json!([1, 1.5, "café", "function: builtin", null])
        );
    }

    #[test]
    fn accessors() {
        assert_eq!(Value::from("x").as_str(), Some("x"));
        assert_eq!(Value::String(vec![0xff]).as_str(), None);
        assert_eq!(Value::Integer(3).as_number(), Some(3.0));
        assert_eq!(Value::Number(3.0).as_integer(), None);
        assert_eq!(Value::from(None::<i64>), Value::Nil);
        assert_eq!(Value::Map(BTreeMap::new()).type_name(), "table");
    }
}
