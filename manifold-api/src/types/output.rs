//! Defines the output model: the named descriptions of the
//! observable quantities a plugin can produce.

use crate::types::{
    device::{Reading, Value},
    Error,
};
use chrono::Utc;
use serde_derive::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};

/// The engineering unit attached to an output. Some outputs (state,
/// status, counts) don't carry one.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    pub name: String,
    pub symbol: String,
}

impl Unit {
    pub fn new(name: &str, symbol: &str) -> Unit {
        Unit {
            name: name.into(),
            symbol: symbol.into(),
        }
    }
}

/// Describes one kind of reading a device can produce: the reading's
/// type label, the float precision to round to (0 means no
/// rounding), and the optional unit. Outputs are shared; many
/// devices typically reference the same output.
#[derive(Clone, Debug, PartialEq)]
pub struct Output {
    pub name: String,
    pub kind: String,
    pub precision: i32,
    pub unit: Option<Unit>,
}

impl Output {
    /// Creates an output whose reading type label matches its name.
    pub fn new(name: &str) -> Output {
        Output {
            name: name.into(),
            kind: name.into(),
            precision: 0,
            unit: None,
        }
    }

    pub fn with_kind(mut self, kind: &str) -> Output {
        self.kind = kind.into();
        self
    }

    pub fn with_precision(mut self, precision: i32) -> Output {
        self.precision = precision;
        self
    }

    pub fn with_unit(mut self, name: &str, symbol: &str) -> Output {
        self.unit = Some(Unit::new(name, symbol));
        self
    }

    /// Builds a reading for this output from a raw value. The
    /// reading is stamped with the current wall-clock time, carries
    /// the output's type and unit, and holds a back-pointer to the
    /// output itself.
    ///
    /// Floating point values are rounded to the output's precision.
    /// Byte values are rejected; they don't round trip cleanly
    /// across the wire format, so they can't become readings.
    pub fn make_reading(self: &Arc<Self>, value: Value) -> Result<Reading, Error> {
        let value = match value {
            Value::Bytes(_) => {
                return Err(Error::InvArgument(format!(
                    "output {} can't build a reading from raw bytes",
                    &self.name
                )))
            }
            Value::Flt(v) if self.precision > 0 => {
                Value::Flt(round_to(v, self.precision))
            }
            v => v,
        };

        Ok(Reading {
            ts: Utc::now(),
            kind: self.kind.clone(),
            unit: self.unit.clone(),
            value,
            context: HashMap::new(),
            output: Some(self.clone()),
        })
    }
}

// Rounds a value to the given number of decimal digits.

fn round_to(value: f64, digits: i32) -> f64 {
    let scale = 10.0f64.powi(digits);

    (value * scale).round() / scale
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_reading_basic() {
        let out = Arc::new(
            Output::new("temperature").with_unit("celsius", "C"),
        );
        let reading = out.make_reading(Value::Flt(20.25)).unwrap();

        assert_eq!(reading.kind, "temperature");
        assert_eq!(reading.unit, Some(Unit::new("celsius", "C")));
        assert_eq!(reading.value, Value::Flt(20.25));
        assert!(reading.context.is_empty());
        assert_eq!(
            reading.output.as_ref().map(|o| o.name.as_str()),
            Some("temperature")
        );
    }

    #[test]
    fn test_make_reading_rejects_bytes() {
        let out = Arc::new(Output::new("state"));

        assert!(out.make_reading(Value::Bytes(vec![1, 2])).is_err());
    }

    #[test]
    fn test_make_reading_precision() {
        let out = Arc::new(Output::new("voltage").with_precision(2));

        assert_eq!(
            out.make_reading(Value::Flt(3.14159)).unwrap().value,
            Value::Flt(3.14)
        );

        // Precision 0 leaves the value untouched.

        let out = Arc::new(Output::new("voltage"));

        assert_eq!(
            out.make_reading(Value::Flt(3.14159)).unwrap().value,
            Value::Flt(3.14159)
        );

        // Precision only applies to floats.

        let out = Arc::new(Output::new("count").with_precision(2));

        assert_eq!(
            out.make_reading(Value::UInt(12)).unwrap().value,
            Value::UInt(12)
        );
    }

    #[test]
    fn test_rounding() {
        assert_eq!(round_to(1.005, 1), 1.0);
        assert_eq!(round_to(-2.55, 1), -2.5);
        assert_eq!(round_to(98.654, 2), 98.65);
    }
}
