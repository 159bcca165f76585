//! Defines types related to devices.

use crate::{
    proto,
    types::{output::Output, Error},
    Result,
};
use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};
use std::{collections::HashMap, pin::Pin, sync::Arc};
use tokio_stream::Stream;

mod value;
pub use value::Value;

/// Generic type describing a stream of types.
///
/// Specializations of this type are used in various layers of the
/// runtime. The service façade, for instance, yields a stream of
/// device records for a metainfo request and a stream of readings
/// for a read request.
pub type DataStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

/// The set of operations a device supports, derived from the
/// functions its handler supplies.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize,
)]
pub struct Capabilities {
    pub read: bool,
    pub write: bool,
    pub listen: bool,
}

/// Represents one observation from a device at a specific moment.
///
/// A reading pairs a value with the timestamp at which it was
/// acquired, the type label and unit inherited from its output, and
/// a small free-form context map for annotations (`{"source":
/// "fanA"}`, for instance). Readings are immutable once they reach
/// the caches; the builder-style methods here are used while a
/// reading is still in the acquisition pipeline.
#[derive(Clone, Debug, PartialEq)]
pub struct Reading {
    pub ts: DateTime<Utc>,
    pub kind: String,
    pub unit: Option<super::output::Unit>,
    pub value: Value,
    pub context: HashMap<String, String>,
    pub output: Option<Arc<Output>>,
}

impl Reading {
    /// Merges the given entries into the reading's context.
    /// Conflicting keys are overwritten with the caller's values.
    pub fn with_context(
        mut self,
        ctx: HashMap<String, String>,
    ) -> Reading {
        self.context.extend(ctx);
        self
    }

    /// Multiplies the numeric value by `factor`. A factor of 1 is a
    /// no-op. A factor of 0 is rejected; silently zeroing out a
    /// reading hides real data loss. Any other factor converts the
    /// value to double precision.
    pub fn scale(mut self, factor: f64) -> Result<Reading> {
        if factor == 0.0 {
            return Err(Error::InvArgument(String::from(
                "scaling factor of 0 would erase the reading",
            )));
        }

        if factor == 1.0 {
            return Ok(self);
        }

        match self.value.as_f64() {
            Some(v) => {
                self.value = Value::Flt(v * factor);
                Ok(self)
            }
            None => Err(Error::InvArgument(format!(
                "can't scale non-numeric value {}",
                &self.value
            ))),
        }
    }

    /// Converts the reading into its wire representation. The unit
    /// field is always present on the wire; when the output has no
    /// unit, its name and symbol are empty strings.
    pub fn encode(&self) -> proto::Reading {
        proto::Reading {
            ts: self.ts.to_rfc3339(),
            kind: self.kind.clone(),
            unit: self.unit.clone().unwrap_or_default(),
            value: self.value.clone(),
            context: self.context.clone(),
        }
    }

    /// Rebuilds a reading from its wire representation. The
    /// back-pointer to the output is not conveyed on the wire, so it
    /// is always `None` on the result.
    pub fn decode(wire: &proto::Reading) -> Result<Reading> {
        let ts = DateTime::parse_from_rfc3339(&wire.ts)
            .map_err(|e| {
                Error::InvArgument(format!("bad timestamp: {}", e))
            })?
            .with_timezone(&Utc);

        Ok(Reading {
            ts,
            kind: wire.kind.clone(),
            unit: if wire.unit.name.is_empty()
                && wire.unit.symbol.is_empty()
            {
                None
            } else {
                Some(wire.unit.clone())
            },
            value: wire.value.clone(),
            context: wire.context.clone(),
            output: None,
        })
    }
}

/// The payload of one write request against a device. At least one
/// of `action` and `raw` must be present. The transaction field is a
/// caller-supplied correlation hint; the runtime always assigns its
/// own transaction IDs.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WriteData {
    pub action: Option<String>,
    pub raw: Option<Vec<u8>>,
    pub transaction: Option<String>,
}

impl WriteData {
    pub fn validate(&self) -> Result<()> {
        if self.action.is_none() && self.raw.is_none() {
            Err(Error::InvArgument(String::from(
                "write needs an action or a raw payload",
            )))
        } else {
            Ok(())
        }
    }

    /// A short description of the payload, echoed back in write
    /// receipts so clients can match transactions to their requests.
    pub fn summary(&self) -> String {
        match (&self.action, &self.raw) {
            (Some(action), Some(raw)) => {
                format!("{} ({} raw bytes)", action, raw.len())
            }
            (Some(action), None) => action.clone(),
            (None, Some(raw)) => format!("{} raw bytes", raw.len()),
            (None, None) => String::from("empty"),
        }
    }
}

/// A durable description of a single addressable endpoint managed by
/// the plugin. Devices are built once, at startup, and shared
/// immutably between the scheduler and the service façade.
#[derive(Clone, Debug)]
pub struct Device {
    id: String,
    pub kind: String,
    pub handler: Arc<str>,
    pub metadata: HashMap<String, String>,
    pub data: toml::value::Table,
    pub outputs: Vec<Arc<Output>>,
    pub scale: Option<f64>,
    capabilities: Capabilities,
}

impl Device {
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        id: String,
        kind: String,
        handler: Arc<str>,
        metadata: HashMap<String, String>,
        data: toml::value::Table,
        outputs: Vec<Arc<Output>>,
        scale: Option<f64>,
        capabilities: Capabilities,
    ) -> Device {
        Device {
            id,
            kind,
            handler,
            metadata,
            data,
            outputs,
            scale,
            capabilities,
        }
    }

    /// The device's stable ID. Given the same configuration and
    /// namespace inputs, this is byte-identical across runs and
    /// machines.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Finds the output binding with the given name.
    pub fn output(&self, name: &str) -> Option<&Arc<Output>> {
        self.outputs.iter().find(|o| o.name == name)
    }
}
