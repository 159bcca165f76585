//! The registry of constructed devices.
//!
//! Devices are inserted during the startup window and the registry
//! is then frozen behind an `Arc` for the life of the process; the
//! scheduler and the service façade only ever read it. Insertion
//! order is preserved because the serial scheduling mode reads
//! devices in registry order.

use manifold_api::{
    handler::DeviceHandler,
    types::{device::Device, Error},
    Result,
};
use std::{collections::HashMap, sync::Arc};

/// One registered device with its resolved handler. The handler is
/// fixed at registration.
#[derive(Clone)]
pub struct Entry {
    pub device: Arc<Device>,
    pub handler: Arc<DeviceHandler>,
}

pub struct DeviceRegistry {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
}

impl DeviceRegistry {
    pub fn new() -> DeviceRegistry {
        DeviceRegistry {
            entries: vec![],
            index: HashMap::new(),
        }
    }

    /// Adds a device. Duplicate IDs are rejected; two identical
    /// device sections in a configuration would otherwise silently
    /// shadow each other.
    pub fn add(
        &mut self,
        device: Device,
        handler: Arc<DeviceHandler>,
    ) -> Result<()> {
        if self.index.contains_key(device.id()) {
            return Err(Error::Conflict(format!(
                "device ID {} is already registered",
                device.id()
            )));
        }

        self.index
            .insert(device.id().to_string(), self.entries.len());
        self.entries.push(Entry {
            device: Arc::new(device),
            handler,
        });
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Entry> {
        self.index.get(id).map(|idx| &self.entries[*idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over the devices matching every given tag filter.
    /// Recognized keys are `type` (or `kind`) and `handler`; an
    /// unrecognized key matches nothing, which a caller surfaces as
    /// an empty selection rather than an error.
    pub fn filter<'a>(
        &'a self,
        filters: &'a [(String, String)],
    ) -> impl Iterator<Item = &'a Entry> {
        self.entries.iter().filter(move |entry| {
            filters.iter().all(|(key, want)| match key.as_str() {
                "type" | "kind" => entry.device.kind == *want,
                "handler" => entry.handler.name.as_ref() == want,
                _ => false,
            })
        })
    }

    /// The devices the read loop polls: those whose handler reads
    /// and doesn't listen. A listening device pushes its own
    /// readings; polling it too would race the two pipelines.
    pub fn readable(&self) -> Vec<Entry> {
        self.entries
            .iter()
            .filter(|e| e.handler.read.is_some() && e.handler.listen.is_none())
            .cloned()
            .collect()
    }

    /// The devices that get a listener task.
    pub fn listeners(&self) -> Vec<Entry> {
        self.entries
            .iter()
            .filter(|e| e.handler.listen.is_some())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manifold_api::types::device::Capabilities;
    use std::collections::HashMap;

    fn device(id: &str, kind: &str, handler: &str) -> Device {
        Device::create(
            id.into(),
            kind.into(),
            handler.into(),
            HashMap::new(),
            toml::value::Table::new(),
            vec![],
            None,
            Capabilities::default(),
        )
    }

    fn read_handler(name: &str) -> Arc<DeviceHandler> {
        Arc::new(
            DeviceHandler::new(name).with_read(|_| async { Ok(vec![]) }),
        )
    }

    fn listen_handler(name: &str) -> Arc<DeviceHandler> {
        Arc::new(
            DeviceHandler::new(name).with_listen(|_, _, _| async {}),
        )
    }

    #[test]
    fn test_add_and_get() {
        let mut reg = DeviceRegistry::new();

        reg.add(device("d1", "temperature", "temp"), read_handler("temp"))
            .unwrap();

        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get("d1").unwrap().device.kind, "temperature");
        assert!(reg.get("d2").is_none());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut reg = DeviceRegistry::new();

        reg.add(device("d1", "temperature", "temp"), read_handler("temp"))
            .unwrap();

        let result = reg
            .add(device("d1", "humidity", "temp"), read_handler("temp"));

        assert!(matches!(result, Err(Error::Conflict(_))));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_insertion_order_preserved() {
        let mut reg = DeviceRegistry::new();

        for id in ["d3", "d1", "d2"] {
            reg.add(device(id, "t", "temp"), read_handler("temp"))
                .unwrap();
        }

        let ids: Vec<_> =
            reg.iter().map(|e| e.device.id().to_string()).collect();

        assert_eq!(ids, vec!["d3", "d1", "d2"]);
    }

    #[test]
    fn test_filter() {
        let mut reg = DeviceRegistry::new();

        reg.add(device("d1", "airflow", "fan"), read_handler("fan"))
            .unwrap();
        reg.add(device("d2", "airflow", "pusher"), listen_handler("pusher"))
            .unwrap();
        reg.add(device("d3", "led", "led"), read_handler("led"))
            .unwrap();

        let filters = vec![("type".to_string(), "airflow".to_string())];

        assert_eq!(reg.filter(&filters).count(), 2);

        let filters = vec![
            ("type".to_string(), "airflow".to_string()),
            ("handler".to_string(), "pusher".to_string()),
        ];
        let hits: Vec<_> = reg.filter(&filters).collect();

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].device.id(), "d2");

        let filters = vec![("color".to_string(), "red".to_string())];

        assert_eq!(reg.filter(&filters).count(), 0);
    }

    #[test]
    fn test_readable_excludes_listeners() {
        let mut reg = DeviceRegistry::new();

        reg.add(device("d1", "t", "temp"), read_handler("temp"))
            .unwrap();
        reg.add(device("d2", "t", "pusher"), listen_handler("pusher"))
            .unwrap();

        // A handler with both read and listen is listen-only from
        // the scheduler's point of view.

        let both = Arc::new(
            DeviceHandler::new("both")
                .with_read(|_| async { Ok(vec![]) })
                .with_listen(|_, _, _| async {}),
        );

        reg.add(device("d3", "t", "both"), both).unwrap();

        let readable: Vec<_> = reg
            .readable()
            .iter()
            .map(|e| e.device.id().to_string())
            .collect();

        assert_eq!(readable, vec!["d1"]);

        let listeners: Vec<_> = reg
            .listeners()
            .iter()
            .map(|e| e.device.id().to_string())
            .collect();

        assert_eq!(listeners, vec!["d2", "d3"]);
    }
}
