use crate::types::Error;
use serde_derive::{Deserialize, Serialize};
use std::{convert::TryFrom, fmt};

/// Defines the fundamental value types a device can produce or
/// accept. Handlers pick the variant that matches the hardware and,
/// for devices that can be written, only accept payloads of the
/// correct shape.
///
/// The serialized form is a tagged union (`{"type": ..., "value":
/// ...}`) so readings survive a round trip over the wire without
/// losing the scalar kind.

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    /// Used by devices that have no value to report for an output
    /// (a sensor that momentarily has nothing to say, for instance.)
    Nil,

    /// For devices that return/accept a simple true/false, on/off,
    /// etc., state.
    Bool(bool),

    /// For devices that return/accept a signed integer. All signed
    /// widths are carried as 64-bit values.
    Int(i64),

    /// For devices that return/accept an unsigned integer. All
    /// unsigned widths are carried as 64-bit values.
    UInt(u64),

    /// For devices that return/accept floating point numbers. Both
    /// `f32` and `f64` sources are carried in double precision.
    Flt(f64),

    /// For devices that return/accept text. Since strings can
    /// greatly vary in size, care must be taken when returning this
    /// type. A handler that returns strings rapidly should keep them
    /// short.
    Str(String),

    /// Raw byte payloads. These can be written to a device but are
    /// rejected when building a reading because they don't round
    /// trip cleanly across every wire encoding.
    Bytes(Vec<u8>),
}

impl Value {
    /// Indicates whether the value is one of the numeric variants.
    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::UInt(_) | Value::Flt(_))
    }

    /// Returns the numeric value converted to double precision, if
    /// the variant is numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::UInt(v) => Some(*v as f64),
            Value::Flt(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::UInt(v) => write!(f, "{}", v),
            Value::Flt(v) => write!(f, "{}", v),
            Value::Str(v) => write!(f, "\"{}\"", v),
            Value::Bytes(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl TryFrom<Value> for bool {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        if let Value::Bool(v) = value {
            Ok(v)
        } else {
            Err(Error::InvArgument(String::from(
                "can't convert to boolean",
            )))
        }
    }
}

impl From<i8> for Value {
    fn from(value: i8) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<i16> for Value {
    fn from(value: i16) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl TryFrom<Value> for i64 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        if let Value::Int(v) = value {
            return Ok(v);
        }
        Err(Error::InvArgument(String::from(
            "can't convert to integer",
        )))
    }
}

impl TryFrom<Value> for i32 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        if let Value::Int(v) = value {
            if let Ok(v) = i32::try_from(v) {
                return Ok(v);
            }
        }
        Err(Error::InvArgument(String::from(
            "can't convert to integer",
        )))
    }
}

impl TryFrom<Value> for i16 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        if let Value::Int(v) = value {
            if let Ok(v) = i16::try_from(v) {
                return Ok(v);
            }
        }
        Err(Error::InvArgument(String::from(
            "can't convert to integer",
        )))
    }
}

impl From<u8> for Value {
    fn from(value: u8) -> Self {
        Value::UInt(u64::from(value))
    }
}

impl From<u16> for Value {
    fn from(value: u16) -> Self {
        Value::UInt(u64::from(value))
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::UInt(u64::from(value))
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::UInt(value)
    }
}

impl TryFrom<Value> for u64 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        if let Value::UInt(v) = value {
            return Ok(v);
        }
        Err(Error::InvArgument(String::from(
            "can't convert to unsigned integer",
        )))
    }
}

impl TryFrom<Value> for u32 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        if let Value::UInt(v) = value {
            if let Ok(v) = u32::try_from(v) {
                return Ok(v);
            }
        }
        Err(Error::InvArgument(String::from(
            "can't convert to unsigned integer",
        )))
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::Flt(f64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Flt(value)
    }
}

impl TryFrom<Value> for f64 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        if let Value::Flt(v) = value {
            Ok(v)
        } else {
            Err(Error::InvArgument(String::from(
                "can't convert to floating point",
            )))
        }
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.into())
    }
}

impl TryFrom<Value> for String {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        if let Value::Str(v) = value {
            Ok(v)
        } else {
            Err(Error::InvArgument(String::from(
                "can't convert to string",
            )))
        }
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}

impl TryFrom<Value> for Vec<u8> {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        if let Value::Bytes(v) = value {
            Ok(v)
        } else {
            Err(Error::InvArgument(String::from(
                "can't convert to bytes",
            )))
        }
    }
}
