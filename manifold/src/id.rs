//! Stable identifier generation.
//!
//! Every plugin derives a namespace UUID from an ordered set of
//! configured components. Device IDs are digests of the namespace
//! and a device-identifying string, so a given configuration always
//! produces the same IDs, across restarts and across machines
//! (unless the machine is deliberately mixed into the namespace.)

use crate::config::IdConfig;
use manifold_api::{types::Error, Result};
use std::collections::HashMap;
use std::env;
use uuid::Uuid;

/// The plugin-unique parent of all device IDs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Namespace(Uuid);

impl Namespace {
    /// Builds the namespace from the enabled components, in their
    /// fixed order: plugin tag, machine ID, environment variables,
    /// custom strings. A referenced environment variable that isn't
    /// set is a configuration error; silently skipping it would
    /// shift every device ID.
    pub async fn build(tag: &str, cfg: &IdConfig) -> Result<Namespace> {
        let mut parts: Vec<String> = vec![];

        if cfg.use_plugin_tag {
            parts.push(tag.to_string())
        }

        if cfg.use_machine_id {
            parts.push(machine_id().await?)
        }

        for name in &cfg.use_env {
            match env::var(name) {
                Ok(v) => parts.push(v),
                Err(_) => {
                    return Err(Error::Config(format!(
                        "id.useEnv names '{}', which isn't set",
                        name
                    )))
                }
            }
        }

        for custom in &cfg.use_custom {
            parts.push(custom.clone())
        }

        if parts.is_empty() {
            return Err(Error::Config(
                "the plugin namespace needs at least one component"
                    .into(),
            ));
        }

        Ok(Namespace(Uuid::new_v5(
            &Uuid::NAMESPACE_OID,
            parts.join(".").as_bytes(),
        )))
    }

    /// Digests a device-identifying string into the device's stable
    /// ID.
    pub fn device_id(&self, component: &str) -> String {
        Uuid::new_v5(&self.0, component.as_bytes()).to_string()
    }
}

// The machine identity mixed into the namespace when
// `id.useMachineID` is set. Prefers the OS machine-id and falls
// back to the hostname.

async fn machine_id() -> Result<String> {
    if let Ok(contents) =
        tokio::fs::read_to_string("/etc/machine-id").await
    {
        let trimmed = contents.trim();

        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }

    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .map_err(|e| {
            Error::Config(format!("couldn't determine machine ID: {}", e))
        })
}

/// The default device-identifying string: a deterministic rendering
/// of the device's kind, metadata, and protocol data. Maps are
/// walked in sorted key order so the component doesn't depend on
/// serialization order.
pub fn default_component(
    kind: &str,
    metadata: &HashMap<String, String>,
    data: &toml::value::Table,
) -> String {
    let mut parts = vec![kind.to_string()];

    let mut meta: Vec<_> = metadata.iter().collect();

    meta.sort_by_key(|(k, _)| k.clone());

    for (k, v) in meta {
        parts.push(format!("{}={}", k, v))
    }

    let mut fields: Vec<_> = data.iter().collect();

    fields.sort_by_key(|(k, _)| k.clone());

    for (k, v) in fields {
        parts.push(format!("{}={}", k, v))
    }

    parts.join(".")
}
