//! Defines the interface plugin authors implement to drive a kind
//! of device.
//!
//! A handler is a bundle of up to three functions plus a unique
//! name. The functions a handler supplies are also its capability
//! advertisement: a device whose handler has no `write` function is
//! a read-only device, and a device whose handler has a `listen`
//! function pushes its own readings instead of being polled.
//!
//! # Example
//!
//! ```ignore
//! let handler = DeviceHandler::new("temperature")
//!     .with_read(|dev: Arc<Device>| async move {
//!         let out = dev.output("temperature").unwrap().clone();
//!
//!         Ok(vec![out.make_reading(read_sensor(&dev).into())?])
//!     });
//! ```

use crate::{
    types::device::{Capabilities, Device, Reading, WriteData},
    Result,
};
use std::{future::Future, pin::Pin, sync::Arc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Represents the type used to specify the name of a handler.
pub type Name = Arc<str>;

/// The future type returned by handler functions.
pub type HandlerFut<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Reads the current state of a device, returning one reading per
/// output the device produced.
pub type ReadFunc =
    Arc<dyn Fn(Arc<Device>) -> HandlerFut<Result<Vec<Reading>>> + Send + Sync>;

/// Applies a write payload to a device.
pub type WriteFunc = Arc<
    dyn Fn(Arc<Device>, WriteData) -> HandlerFut<Result<()>> + Send + Sync,
>;

/// Runs indefinitely, pushing readings into the sink as the device
/// produces them. The function should return promptly once the
/// cancellation token fires.
pub type ListenFunc = Arc<
    dyn Fn(Arc<Device>, ReadingSink, CancellationToken) -> HandlerFut<()>
        + Send
        + Sync,
>;

/// Derives the device-identifying string from a device's protocol
/// data. When absent, the runtime digests the device's kind,
/// metadata, and data instead.
pub type DeviceIdFunc =
    Arc<dyn Fn(&toml::value::Table) -> String + Send + Sync>;

/// The bundle of functions that drives every device of one kind.
/// Handlers are immutable after registration; the builder methods
/// here are used while a plugin is being assembled.
#[derive(Clone)]
pub struct DeviceHandler {
    pub name: Name,
    pub read: Option<ReadFunc>,
    pub write: Option<WriteFunc>,
    pub listen: Option<ListenFunc>,
    pub device_id: Option<DeviceIdFunc>,
}

impl DeviceHandler {
    pub fn new(name: &str) -> DeviceHandler {
        DeviceHandler {
            name: name.into(),
            read: None,
            write: None,
            listen: None,
            device_id: None,
        }
    }

    pub fn with_read<F, Fut>(mut self, f: F) -> DeviceHandler
    where
        F: Fn(Arc<Device>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Reading>>> + Send + 'static,
    {
        self.read = Some(Arc::new(move |dev| Box::pin(f(dev))));
        self
    }

    pub fn with_write<F, Fut>(mut self, f: F) -> DeviceHandler
    where
        F: Fn(Arc<Device>, WriteData) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.write =
            Some(Arc::new(move |dev, data| Box::pin(f(dev, data))));
        self
    }

    pub fn with_listen<F, Fut>(mut self, f: F) -> DeviceHandler
    where
        F: Fn(Arc<Device>, ReadingSink, CancellationToken) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.listen = Some(Arc::new(move |dev, sink, token| {
            Box::pin(f(dev, sink, token))
        }));
        self
    }

    pub fn with_device_id<F>(mut self, f: F) -> DeviceHandler
    where
        F: Fn(&toml::value::Table) -> String + Send + Sync + 'static,
    {
        self.device_id = Some(Arc::new(f));
        self
    }

    /// The capability set advertised by this handler's functions.
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            read: self.read.is_some(),
            write: self.write.is_some(),
            listen: self.listen.is_some(),
        }
    }
}

/// The channel a listen function pushes readings into. The sink has
/// finite capacity; a push against a full sink is dropped, with a
/// warning, rather than blocking the handler or the scheduler.
#[derive(Clone)]
pub struct ReadingSink {
    device_id: String,
    tx: mpsc::Sender<(String, Vec<Reading>)>,
}

impl ReadingSink {
    pub fn new(
        device_id: &str,
        tx: mpsc::Sender<(String, Vec<Reading>)>,
    ) -> ReadingSink {
        ReadingSink {
            device_id: device_id.into(),
            tx,
        }
    }

    /// Hands a batch of readings to the runtime, to be cached as if
    /// it had been produced by a polled read.
    pub fn push(&self, readings: Vec<Reading>) {
        use mpsc::error::TrySendError;

        if readings.is_empty() {
            return;
        }

        match self.tx.try_send((self.device_id.clone(), readings)) {
            Ok(()) => (),
            Err(TrySendError::Full(_)) => {
                warn!(
                    device = &self.device_id,
                    "reading sink is full; dropping push"
                )
            }
            Err(TrySendError::Closed(_)) => {
                warn!(
                    device = &self.device_id,
                    "reading sink is closed; dropping push"
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::device::Value;
    use chrono::Utc;
    use std::collections::HashMap;

    fn reading() -> Reading {
        Reading {
            ts: Utc::now(),
            kind: "state".into(),
            unit: None,
            value: Value::Bool(true),
            context: HashMap::new(),
            output: None,
        }
    }

    #[test]
    fn test_capabilities() {
        let h = DeviceHandler::new("ro");

        assert_eq!(h.capabilities(), Capabilities::default());

        let h = DeviceHandler::new("ro")
            .with_read(|_| async { Ok(vec![]) });

        assert!(h.capabilities().read);
        assert!(!h.capabilities().write);
        assert!(!h.capabilities().listen);

        let h = DeviceHandler::new("rw")
            .with_read(|_| async { Ok(vec![]) })
            .with_write(|_, _| async { Ok(()) });

        assert!(h.capabilities().read);
        assert!(h.capabilities().write);

        let h = DeviceHandler::new("push")
            .with_listen(|_, _, _| async {});

        assert!(!h.capabilities().read);
        assert!(h.capabilities().listen);
    }

    #[tokio::test]
    async fn test_sink_delivery() {
        let (tx, mut rx) = mpsc::channel(4);
        let sink = ReadingSink::new("dev-1", tx);

        sink.push(vec![reading()]);

        let (id, readings) = rx.recv().await.unwrap();

        assert_eq!(id, "dev-1");
        assert_eq!(readings.len(), 1);
    }

    #[tokio::test]
    async fn test_sink_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let sink = ReadingSink::new("dev-1", tx);

        // The second push exceeds the sink's capacity and is
        // silently dropped; the first is still delivered.

        sink.push(vec![reading()]);
        sink.push(vec![reading(), reading()]);

        let (_, readings) = rx.recv().await.unwrap();

        assert_eq!(readings.len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sink_ignores_empty_batches() {
        let (tx, mut rx) = mpsc::channel(1);
        let sink = ReadingSink::new("dev-1", tx);

        sink.push(vec![]);
        assert!(rx.try_recv().is_err());
    }
}
