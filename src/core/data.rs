//! Value types for the gateway.
//!
//! [`Value`] is the protocol-agnostic representation of a signal value as it
//! travels between connections, listeners, the store and the remote session.
//! [`ValueType`] is the declared type of a logical address and knows how to
//! normalize incoming values and parse configured defaults.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::address::LogicalKey;
use crate::core::error::{GatewayError, Result};

/// A protocol-agnostic value representation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Boolean value (digital I/O)
    Bool(bool),

    /// Integer value (short, integer and long addresses)
    Integer(i64),

    /// Floating-point number (float and double addresses)
    Float(f64),

    /// String value
    String(String),

    /// Raw bytes
    Bytes(Vec<u8>),

    /// Null/missing value
    #[default]
    Null,
}

impl Value {
    /// Try to get the value as f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Integer(v) => Some(*v as f64),
            Self::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Try to get the value as i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            Self::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            Self::Bool(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    /// Try to get the value as bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            Self::Integer(v) => Some(*v != 0),
            Self::Float(v) => Some(*v != 0.0),
            Self::String(s) => match s.trim() {
                s if s.eq_ignore_ascii_case("true") || s == "1" => Some(true),
                s if s.eq_ignore_ascii_case("false") || s == "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Try to get the value as string.
    pub fn as_string(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Check if this is a null value.
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{}", v),
            Self::Integer(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::String(s) => write!(f, "{}", s),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Self::Null => write!(f, "null"),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Self::Float(v as f64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Integer(v as i64)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Self::Integer(v as i64)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

/// Declared type of a logical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    /// Boolean (digital) signal.
    Boolean,
    /// 16-bit signed integer.
    Short,
    /// 32-bit signed integer.
    Integer,
    /// 64-bit signed integer.
    Long,
    /// 32-bit float.
    Float,
    /// 64-bit float.
    Double,
    /// UTF-8 string.
    String,
    /// Opaque bytes.
    ByteArray,
}

impl ValueType {
    /// Normalize `value` to this type.
    ///
    /// Integer types are range checked, booleans accept 0/1 and
    /// "true"/"false", floats accept integers.
    pub fn coerce(self, value: Value) -> Result<Value> {
        let mismatch = |v: &Value| {
            GatewayError::Value(format!("cannot convert {:?} to {}", v, self))
        };

        match self {
            Self::Boolean => value.as_bool().map(Value::Bool).ok_or_else(|| mismatch(&value)),
            Self::Short => {
                let v = integral(&value).ok_or_else(|| mismatch(&value))?;
                i16::try_from(v)
                    .map(|v| Value::Integer(v as i64))
                    .map_err(|_| GatewayError::Value(format!("{} out of range for short", v)))
            }
            Self::Integer => {
                let v = integral(&value).ok_or_else(|| mismatch(&value))?;
                i32::try_from(v)
                    .map(|v| Value::Integer(v as i64))
                    .map_err(|_| GatewayError::Value(format!("{} out of range for integer", v)))
            }
            Self::Long => integral(&value).map(Value::Integer).ok_or_else(|| mismatch(&value)),
            Self::Float => match &value {
                Value::String(s) => s.trim().parse::<f32>().map(|v| Value::Float(v as f64)).map_err(|_| mismatch(&value)),
                _ => value
                    .as_f64()
                    .map(|v| Value::Float(v as f32 as f64))
                    .ok_or_else(|| mismatch(&value)),
            },
            Self::Double => match &value {
                Value::String(s) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| mismatch(&value)),
                _ => value.as_f64().map(Value::Float).ok_or_else(|| mismatch(&value)),
            },
            Self::String => match value {
                Value::String(s) => Ok(Value::String(s)),
                Value::Bytes(_) | Value::Null => Err(mismatch(&value)),
                other => Ok(Value::String(other.to_string())),
            },
            Self::ByteArray => match value {
                Value::Bytes(b) => Ok(Value::Bytes(b)),
                Value::String(s) => Ok(Value::Bytes(s.into_bytes())),
                other => Err(mismatch(&other)),
            },
        }
    }

    /// Parse a configured default value.
    pub fn parse(self, raw: &str) -> Result<Value> {
        self.coerce(Value::String(raw.to_string()))
    }
}

fn integral(value: &Value) -> Option<i64> {
    match value {
        Value::String(s) => s.trim().parse::<i64>().ok(),
        other => other.as_i64(),
    }
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Boolean => "boolean",
            Self::Short => "short",
            Self::Integer => "integer",
            Self::Long => "long",
            Self::Float => "float",
            Self::Double => "double",
            Self::String => "string",
            Self::ByteArray => "byte_array",
        };
        write!(f, "{}", s)
    }
}

/// A value change observed by the runtime, as handed to persistence.
///
/// The value is the post-inversion (logical) value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueChange {
    /// Logical address the value belongs to.
    pub key: LogicalKey,

    /// The value
    pub value: Value,

    /// When the runtime delivered the value
    pub timestamp: DateTime<Utc>,
}

impl ValueChange {
    /// Create a new change stamped with the current time.
    pub fn new(key: LogicalKey, value: Value) -> Self {
        Self {
            key,
            value,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_conversions() {
        let v = Value::from(42.5);
        assert_eq!(v.as_f64(), Some(42.5));
        assert_eq!(v.as_i64(), None);

        let v = Value::from(true);
        assert_eq!(v.as_bool(), Some(true));
        assert_eq!(v.as_f64(), Some(1.0));
    }

    #[test]
    fn test_untagged_json_prefers_integers() {
        let v: Value = serde_json::from_str("7").unwrap();
        assert_eq!(v, Value::Integer(7));
        let v: Value = serde_json::from_str("7.5").unwrap();
        assert_eq!(v, Value::Float(7.5));
        let v: Value = serde_json::from_str("true").unwrap();
        assert_eq!(v, Value::Bool(true));
        let v: Value = serde_json::from_str("null").unwrap();
        assert!(v.is_null());
    }

    #[test]
    fn test_parse_defaults() {
        assert_eq!(ValueType::Boolean.parse("true").unwrap(), Value::Bool(true));
        assert_eq!(ValueType::Boolean.parse("0").unwrap(), Value::Bool(false));
        assert_eq!(ValueType::Short.parse("-12").unwrap(), Value::Integer(-12));
        assert_eq!(ValueType::Double.parse("2.5").unwrap(), Value::Float(2.5));
        assert_eq!(
            ValueType::String.parse("idle").unwrap(),
            Value::String("idle".into())
        );
        assert!(ValueType::Boolean.parse("maybe").is_err());
    }

    #[test]
    fn test_coerce_range_checks() {
        assert!(ValueType::Short.coerce(Value::Integer(40_000)).is_err());
        assert!(ValueType::Integer.coerce(Value::Integer(i64::MAX)).is_err());
        assert_eq!(
            ValueType::Long.coerce(Value::Integer(i64::MAX)).unwrap(),
            Value::Integer(i64::MAX)
        );
        assert!(ValueType::Integer.coerce(Value::Float(1.5)).is_err());
        assert_eq!(
            ValueType::Integer.coerce(Value::Float(3.0)).unwrap(),
            Value::Integer(3)
        );
    }

    #[test]
    fn test_coerce_strings_and_bytes() {
        assert_eq!(
            ValueType::String.coerce(Value::Integer(5)).unwrap(),
            Value::String("5".into())
        );
        assert_eq!(
            ValueType::ByteArray.coerce(Value::String("ab".into())).unwrap(),
            Value::Bytes(vec![b'a', b'b'])
        );
        assert!(ValueType::ByteArray.coerce(Value::Bool(true)).is_err());
    }
}
