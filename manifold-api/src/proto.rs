//! Defines the message shapes of the wire protocol.
//!
//! The runtime's RPC server and the client tools share these types.
//! Framing is a single JSON document per line: a client sends one
//! encoded [`Request`], the server answers with one encoded
//! [`Response`]. Streamed results (metainfo, readings) are conveyed
//! as arrays inside the response.

use crate::types::{
    device::{Capabilities, Value, WriteData},
    output::Unit,
    transaction::Transaction,
    Error,
};
use serde_derive::{Deserialize, Serialize};
use std::collections::HashMap;

/// The well-known directory where plugins serving on Unix sockets
/// place their socket files.
pub const RUN_DIR: &str = "/tmp/manifold";

/// The requests a client can make against a plugin.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Describe the devices the plugin manages, optionally narrowed
    /// by `key=value` tag filters (`type=airflow`,
    /// `handler=pusher`).
    Metainfo {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        filter: Vec<String>,
    },

    /// Return the latest cached readings for a device.
    Read { device: String },

    /// Return the recent history of readings for a device, if the
    /// windowed cache is enabled.
    ReadWindow { device: String },

    /// Enqueue writes against a device and return immediately with
    /// one transaction ID per payload.
    WriteAsync {
        device: String,
        payload: Vec<WritePayload>,
    },

    /// Enqueue writes against a device and wait for each to reach a
    /// terminal state.
    WriteSync {
        device: String,
        payload: Vec<WritePayload>,
    },

    /// Look up the state of a previously returned transaction.
    Transaction { id: String },

    /// Report the plugin's health.
    Health,
}

/// The wire form of one write payload.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WritePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,
}

impl From<WritePayload> for WriteData {
    fn from(p: WritePayload) -> Self {
        WriteData {
            action: p.action,
            raw: p.raw,
            transaction: p.transaction,
        }
    }
}

impl From<&WriteData> for WritePayload {
    fn from(d: &WriteData) -> Self {
        WritePayload {
            action: d.action.clone(),
            raw: d.raw.clone(),
            transaction: d.transaction.clone(),
        }
    }
}

/// The wire form of one reading. The unit is always present; when
/// the output carries none, its name and symbol are empty strings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub ts: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub unit: Unit,
    pub value: Value,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, String>,
}

/// One entry of the windowed history cache: the readings delivered
/// by one acquisition, stamped with the delivery time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WindowEntry {
    pub ts: String,
    pub readings: Vec<Reading>,
}

/// Describes one device for a metainfo reply.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub handler: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    pub outputs: Vec<String>,
    pub capabilities: Capabilities,
}

/// Pairs an accepted write payload with the transaction created for
/// it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WriteReceipt {
    pub data: String,
    pub id: String,
}

/// The result of one health check.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub name: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// The plugin's aggregate health.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub ok: bool,
    pub ts: String,
    pub checks: Vec<HealthCheck>,
}

/// The wire form of an error reply.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    pub kind: String,
    pub message: String,
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError {
            kind: e.kind().to_string(),
            message: e.to_string(),
        }
    }
}

/// The replies a plugin sends. Every request yields exactly one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Response {
    Devices { devices: Vec<DeviceInfo> },
    Readings { readings: Vec<Reading> },
    Window { entries: Vec<WindowEntry> },
    Writes { transactions: Vec<WriteReceipt> },
    Transactions { transactions: Vec<Transaction> },
    Health { status: HealthStatus },
    Error { error: ApiError },
}

impl Response {
    pub fn error(e: Error) -> Response {
        Response::Error { error: e.into() }
    }
}
