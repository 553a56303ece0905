//! LwM2M resource model types.
//!
//! These types represent the values held by resources and the access flags
//! attached to them:
//! - `Value`: tagged union over the LwM2M data types
//! - `ValueKind`: the declared type of a resource
//! - `Operations`: readable / writable / executable flags

use serde::{Deserialize, Serialize};
use std::fmt;

/// A resource value.
///
/// Time resources are carried as `Integer` (seconds since the epoch) and
/// object links as `String` in "obj:inst" form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    Integer(i64),
    Float(f64),
    String(String),
    Opaque(Vec<u8>),
    Boolean(bool),
}

/// The declared type of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ValueKind {
    Integer,
    Float,
    String,
    Opaque,
    Boolean,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Integer => "integer",
            ValueKind::Float => "float",
            ValueKind::String => "string",
            ValueKind::Opaque => "opaque",
            ValueKind::Boolean => "boolean",
        };
        f.write_str(name)
    }
}

/// Errors raised when a value does not fit a resource type.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConversionError {
    #[error("cannot convert {from} value to {to}")]
    TypeMismatch { from: ValueKind, to: ValueKind },

    #[error("invalid {kind} text: {text:?}")]
    InvalidText { kind: ValueKind, text: String },

    #[error("payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("unsupported JSON value for {kind}: {json}")]
    InvalidJson { kind: ValueKind, json: String },
}

impl Value {
    /// Get the kind of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Integer(_) => ValueKind::Integer,
            Value::Float(_) => ValueKind::Float,
            Value::String(_) => ValueKind::String,
            Value::Opaque(_) => ValueKind::Opaque,
            Value::Boolean(_) => ValueKind::Boolean,
        }
    }

    /// Convert this value to `kind` following the write-boundary rules.
    ///
    /// Exact matches pass through, integers widen to floats and the
    /// integers 0 and 1 become booleans. Everything else is a mismatch.
    pub fn coerce(self, kind: ValueKind) -> Result<Value, ConversionError> {
        match (self, kind) {
            (v, k) if v.kind() == k => Ok(v),
            (Value::Integer(i), ValueKind::Float) => Ok(Value::Float(i as f64)),
            (Value::Integer(0), ValueKind::Boolean) => Ok(Value::Boolean(false)),
            (Value::Integer(1), ValueKind::Boolean) => Ok(Value::Boolean(true)),
            (v, k) => Err(ConversionError::TypeMismatch {
                from: v.kind(),
                to: k,
            }),
        }
    }

    /// Parse a text/plain (or opaque) payload into a value of `kind`.
    pub fn parse_text(kind: ValueKind, payload: &[u8]) -> Result<Value, ConversionError> {
        let text = || std::str::from_utf8(payload).map_err(|_| ConversionError::InvalidUtf8);
        let invalid = |text: &str| ConversionError::InvalidText {
            kind,
            text: text.to_string(),
        };

        match kind {
            ValueKind::Opaque => Ok(Value::Opaque(payload.to_vec())),
            ValueKind::String => Ok(Value::String(text()?.to_string())),
            ValueKind::Integer => {
                let t = text()?;
                t.trim().parse().map(Value::Integer).map_err(|_| invalid(t))
            }
            ValueKind::Float => {
                let t = text()?;
                t.trim().parse().map(Value::Float).map_err(|_| invalid(t))
            }
            ValueKind::Boolean => match text()?.trim() {
                "1" | "true" => Ok(Value::Boolean(true)),
                "0" | "false" => Ok(Value::Boolean(false)),
                other => Err(invalid(other)),
            },
        }
    }

    /// Encode the value as a text/plain payload.
    pub fn to_text(&self) -> Vec<u8> {
        match self {
            Value::Integer(i) => i.to_string().into_bytes(),
            Value::Float(f) => f.to_string().into_bytes(),
            Value::String(s) => s.clone().into_bytes(),
            Value::Opaque(bytes) => bytes.clone(),
            Value::Boolean(b) => if *b { b"1".to_vec() } else { b"0".to_vec() },
        }
    }

    /// Build a value of `kind` from JSON (objects files, host input).
    ///
    /// Opaque values accept either an array of byte values or a hex string.
    pub fn from_json(kind: ValueKind, json: &serde_json::Value) -> Result<Value, ConversionError> {
        use serde_json::Value as Json;

        let invalid = || ConversionError::InvalidJson {
            kind,
            json: json.to_string(),
        };

        match (kind, json) {
            (ValueKind::Integer, Json::Number(n)) => n.as_i64().map(Value::Integer).ok_or_else(invalid),
            (ValueKind::Float, Json::Number(n)) => n.as_f64().map(Value::Float).ok_or_else(invalid),
            (ValueKind::Boolean, Json::Bool(b)) => Ok(Value::Boolean(*b)),
            (ValueKind::String, Json::String(s)) => Ok(Value::String(s.clone())),
            (ValueKind::String, Json::Number(n)) => Ok(Value::String(n.to_string())),
            (ValueKind::Opaque, Json::String(s)) => {
                hex::decode(s).map(Value::Opaque).map_err(|_| invalid())
            }
            (ValueKind::Opaque, Json::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_u64()
                        .and_then(|b| u8::try_from(b).ok())
                        .ok_or_else(invalid)
                })
                .collect::<Result<Vec<u8>, _>>()
                .map(Value::Opaque),
            (kind, Json::Null) => Ok(Value::default_for(kind)),
            (kind, Json::Number(n)) if n.is_i64() => {
                Value::Integer(n.as_i64().unwrap_or_default()).coerce(kind)
            }
            _ => Err(invalid()),
        }
    }

    /// Convert the value to JSON for host-facing events.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Integer(i) => serde_json::json!(i),
            Value::Float(f) => serde_json::json!(f),
            Value::String(s) => serde_json::json!(s),
            Value::Opaque(bytes) => serde_json::json!(hex::encode(bytes)),
            Value::Boolean(b) => serde_json::json!(b),
        }
    }

    /// The zero value of a kind.
    pub fn default_for(kind: ValueKind) -> Value {
        match kind {
            ValueKind::Integer => Value::Integer(0),
            ValueKind::Float => Value::Float(0.0),
            ValueKind::String => Value::String(String::new()),
            ValueKind::Opaque => Value::Opaque(Vec::new()),
            ValueKind::Boolean => Value::Boolean(false),
        }
    }

    /// Numeric view used by notification thresholds.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::String(s) => write!(f, "{}", s),
            Value::Opaque(bytes) => write!(f, "0x{}", hex::encode(bytes)),
            Value::Boolean(b) => write!(f, "{}", b),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Opaque(v)
    }
}

/// Access flags of a resource, written "R", "W", "E" or combinations
/// such as "RW" in object definitions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Operations {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl Operations {
    pub const READ: Operations = Operations {
        read: true,
        write: false,
        execute: false,
    };
    pub const READ_WRITE: Operations = Operations {
        read: true,
        write: true,
        execute: false,
    };
    pub const EXECUTE: Operations = Operations {
        read: false,
        write: false,
        execute: true,
    };

    /// Parse an access string. Unknown characters are ignored.
    pub fn parse(acl: &str) -> Self {
        let acl = acl.to_ascii_uppercase();
        Self {
            read: acl.contains('R'),
            write: acl.contains('W'),
            execute: acl.contains('E'),
        }
    }
}

impl fmt::Display for Operations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.read {
            f.write_str("R")?;
        }
        if self.write {
            f.write_str("W")?;
        }
        if self.execute {
            f.write_str("E")?;
        }
        Ok(())
    }
}

impl Serialize for Operations {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Operations {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let acl = String::deserialize(deserializer)?;
        Ok(Operations::parse(&acl))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_coerce_exact_and_widening() {
        assert_eq!(Value::Integer(3).coerce(ValueKind::Integer), Ok(Value::Integer(3)));
        assert_eq!(Value::Integer(3).coerce(ValueKind::Float), Ok(Value::Float(3.0)));
        assert_eq!(Value::Integer(1).coerce(ValueKind::Boolean), Ok(Value::Boolean(true)));
        assert_eq!(Value::Integer(0).coerce(ValueKind::Boolean), Ok(Value::Boolean(false)));
    }

    #[test]
    fn test_coerce_mismatch() {
        assert_eq!(
            Value::Float(1.5).coerce(ValueKind::Integer),
            Err(ConversionError::TypeMismatch {
                from: ValueKind::Float,
                to: ValueKind::Integer
            })
        );
        assert!(Value::Integer(2).coerce(ValueKind::Boolean).is_err());
        assert!(Value::from("x").coerce(ValueKind::Integer).is_err());
    }

    #[test]
    fn test_parse_text() {
        assert_eq!(Value::parse_text(ValueKind::Integer, b" 42 "), Ok(Value::Integer(42)));
        assert_eq!(Value::parse_text(ValueKind::Float, b"21.5"), Ok(Value::Float(21.5)));
        assert_eq!(Value::parse_text(ValueKind::Boolean, b"1"), Ok(Value::Boolean(true)));
        assert_eq!(Value::parse_text(ValueKind::String, b"abc"), Ok(Value::from("abc")));
        assert_eq!(
            Value::parse_text(ValueKind::Opaque, &[0xff, 0x00]),
            Ok(Value::Opaque(vec![0xff, 0x00]))
        );
        assert!(Value::parse_text(ValueKind::Integer, b"4.2").is_err());
        assert!(Value::parse_text(ValueKind::String, &[0xff]).is_err());
    }

    #[test]
    fn test_text_encoding() {
        assert_eq!(Value::Boolean(true).to_text(), b"1".to_vec());
        assert_eq!(Value::Integer(-7).to_text(), b"-7".to_vec());
        assert_eq!(Value::from("dev1").to_text(), b"dev1".to_vec());
    }

    #[test]
    fn test_from_json() {
        let v = Value::from_json(ValueKind::Float, &serde_json::json!(21)).unwrap();
        assert_eq!(v, Value::Float(21.0));

        let v = Value::from_json(ValueKind::Opaque, &serde_json::json!("cafe")).unwrap();
        assert_eq!(v, Value::Opaque(vec![0xca, 0xfe]));

        let v = Value::from_json(ValueKind::Opaque, &serde_json::json!([1, 2])).unwrap();
        assert_eq!(v, Value::Opaque(vec![1, 2]));

        let v = Value::from_json(ValueKind::String, &serde_json::Value::Null).unwrap();
        assert_eq!(v, Value::String(String::new()));

        assert!(Value::from_json(ValueKind::Boolean, &serde_json::json!("yes")).is_err());
    }

    #[test]
    fn test_operations_parse() {
        assert_eq!(Operations::parse("RW"), Operations::READ_WRITE);
        assert_eq!(Operations::parse("e"), Operations::EXECUTE);
        assert_eq!(Operations::parse("R").to_string(), "R");
        assert_eq!(Operations::parse("").to_string(), "");
    }

    #[test]
    fn test_value_serialization() {
        let json = serde_json::to_string(&Value::Integer(5)).unwrap();
        assert_eq!(json, r#"{"type":"integer","value":5}"#);
    }
}
