//! The runtime framework for Manifold device plugins.
//!
//! A plugin binary links this crate, registers its device handlers
//! and any custom outputs, and hands control to [`Plugin::run`]. The
//! framework takes responsibility for everything else: configuration
//! intake, device construction and ID assignment, the read/write/
//! listen scheduling engine, write-transaction tracking, the reading
//! caches, and the RPC server that exposes it all to the upstream
//! monitor.
//!
//! ```ignore
//! #[tokio::main]
//! async fn main() {
//!     let Some(cfg) = manifold::config::get("example").await else {
//!         return;
//!     };
//!     let mut plugin = Plugin::new(meta, cfg);
//!
//!     plugin.register_handler(temperature_handler()).unwrap();
//!
//!     if let Err(e) = plugin.run().await {
//!         eprintln!("ERROR: {e}")
//!     }
//! }
//! ```

#![deny(unsafe_code)]

pub mod config;
pub mod health;
pub mod plugin;

mod cache;
mod dispatch;
mod id;
mod outputs;
mod registry;
mod scheduler;
mod server;
mod service;
mod txn;

pub use plugin::{DeviceRegistrar, Metadata, Plugin};

// Re-export the API crate so plugin binaries only need one
// dependency.

pub use manifold_api as api;
pub use manifold_api::{Error, Result};
