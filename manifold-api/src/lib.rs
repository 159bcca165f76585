//! Defines the types and interfaces shared by every part of a
//! Manifold plugin: the device/reading data model, the handler
//! interface that plugin authors implement, and the wire message
//! shapes understood by the runtime's RPC server and the client
//! tools.

pub mod handler;
pub mod proto;
pub mod types;

pub use types::Error;

/// A `Result` type where the error value is a value from
/// `manifold_api::types::Error`.

pub type Result<T> = std::result::Result<T, types::Error>;
