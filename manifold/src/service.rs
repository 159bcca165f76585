//! The service façade.
//!
//! This is the layer the RPC server calls into. It owns no state of
//! its own; it validates requests, consults the frozen registry and
//! the caches, and feeds the scheduler's write queue. Every error
//! leaving this module is one of the uniform API error kinds.

use crate::{
    cache::ReadingCache,
    health::HealthState,
    registry::DeviceRegistry,
    scheduler::WriteItem,
    txn::Transactions,
};
use manifold_api::{
    proto,
    types::{
        device::{DataStream, WriteData},
        transaction::{State, Transaction},
        Error,
    },
    Result,
};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::debug;

// How often write_sync re-checks its transactions.

const POLL_PERIOD: Duration = Duration::from_millis(25);

pub struct Service {
    registry: Arc<DeviceRegistry>,
    cache: Arc<ReadingCache>,
    txns: Transactions,
    tx_write: mpsc::Sender<WriteItem>,
    health: Arc<HealthState>,
    sync_timeout: Duration,
}

impl Service {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        cache: Arc<ReadingCache>,
        txns: Transactions,
        tx_write: mpsc::Sender<WriteItem>,
        health: Arc<HealthState>,
        write_interval: Duration,
    ) -> Service {
        Service {
            registry,
            cache,
            txns,
            tx_write,
            health,
            // Synchronous writes ride the same queue as everything
            // else, so give them a few write intervals before giving
            // up on a terminal state.
            sync_timeout: (write_interval * 10)
                .max(Duration::from_secs(30)),
        }
    }

    /// Describes the registered devices, in registry order,
    /// narrowed by any tag filters.
    pub fn metainfo(
        &self,
        filters: &[(String, String)],
    ) -> DataStream<proto::DeviceInfo> {
        let devices: Vec<_> = self
            .registry
            .filter(filters)
            .map(|entry| proto::DeviceInfo {
                id: entry.device.id().to_string(),
                kind: entry.device.kind.clone(),
                handler: entry.handler.name.to_string(),
                metadata: entry.device.metadata.clone(),
                outputs: entry
                    .device
                    .outputs
                    .iter()
                    .map(|o| o.name.clone())
                    .collect(),
                capabilities: entry.device.capabilities(),
            })
            .collect();

        Box::pin(tokio_stream::iter(devices))
    }

    /// The latest cached readings for a device. A device that
    /// hasn't produced anything yet yields an empty stream; that's
    /// a young plugin, not an error.
    pub fn read(&self, id: &str) -> Result<DataStream<proto::Reading>> {
        let entry = self.registry.get(id).ok_or(Error::NotFound)?;

        // Listen devices deliver readings through the same pipeline
        // as polled ones, so they're readable too.

        if entry.handler.read.is_none() && entry.handler.listen.is_none()
        {
            return Err(Error::Unsupported(format!(
                "device {} does not produce readings",
                id
            )));
        }

        let readings: Vec<_> = self
            .cache
            .current(id)
            .map(|entry| {
                entry.readings.iter().map(|r| r.encode()).collect()
            })
            .unwrap_or_default();

        Ok(Box::pin(tokio_stream::iter(readings)))
    }

    /// The recent history for a device, oldest first. Only
    /// available when the windowed cache is enabled.
    pub fn read_window(
        &self,
        id: &str,
    ) -> Result<Vec<proto::WindowEntry>> {
        if self.registry.get(id).is_none() {
            return Err(Error::NotFound);
        }

        if !self.cache.window_enabled() {
            return Err(Error::Unsupported(
                "the windowed cache is not enabled".into(),
            ));
        }

        Ok(self
            .cache
            .history(id)
            .iter()
            .map(|entry| proto::WindowEntry {
                ts: entry.ts.to_rfc3339(),
                readings: entry
                    .readings
                    .iter()
                    .map(|r| r.encode())
                    .collect(),
            })
            .collect())
    }

    /// Enqueues writes against a device, creating one transaction
    /// per payload. Nothing is enqueued unless every payload
    /// validates; a transaction is never created for a rejected
    /// write.
    pub fn write_async(
        &self,
        id: &str,
        payload: Vec<WriteData>,
    ) -> Result<Vec<proto::WriteReceipt>> {
        let entry = self.registry.get(id).ok_or(Error::NotFound)?;

        if entry.handler.write.is_none() {
            return Err(Error::Unsupported(format!(
                "device {} does not support writes",
                id
            )));
        }

        if payload.is_empty() {
            return Err(Error::InvArgument(
                "write request carries no payload".into(),
            ));
        }

        for data in &payload {
            data.validate()?;
        }

        let mut receipts = vec![];

        for data in payload {
            let txn = self.txns.create();

            if let Some(hint) = &data.transaction {
                debug!(
                    txn = &txn.id,
                    hint = hint.as_str(),
                    "caller supplied a transaction hint"
                )
            }

            let item = WriteItem {
                device: entry.device.clone(),
                handler: entry.handler.clone(),
                data: data.clone(),
                txn_id: txn.id.clone(),
            };

            if let Err(e) = self.tx_write.try_send(item) {
                // The write never made it onto the queue, so the
                // transaction must not be observable.

                self.txns.remove(&txn.id);
                return Err(e.into());
            }

            receipts.push(proto::WriteReceipt {
                data: data.summary(),
                id: txn.id,
            });
        }

        Ok(receipts)
    }

    /// Enqueues writes and waits for each to reach a terminal
    /// state, up to a deadline scaled from the write interval.
    pub async fn write_sync(
        &self,
        id: &str,
        payload: Vec<WriteData>,
    ) -> Result<Vec<Transaction>> {
        let receipts = self.write_async(id, payload)?;
        let ids: Vec<_> =
            receipts.into_iter().map(|r| r.id).collect();
        let deadline = tokio::time::Instant::now() + self.sync_timeout;

        loop {
            let snapshots: Vec<_> = ids
                .iter()
                .map(|id| self.txns.get(id))
                .collect::<Option<_>>()
                .ok_or_else(|| {
                    Error::Internal(
                        "transaction expired while awaited".into(),
                    )
                })?;

            if snapshots.iter().all(|t| t.state.is_terminal()) {
                return Ok(snapshots);
            }

            if tokio::time::Instant::now() >= deadline {
                // The handlers may still finish, but their results
                // are discarded: the transactions go terminal with
                // a timeout message, and the scheduler's late
                // updates bounce off the terminal state.

                for txn in snapshots {
                    if !txn.state.is_terminal() {
                        let _ = self.txns.update(
                            &txn.id,
                            State::Error,
                            "write timed out",
                        );
                    }
                }

                return Err(Error::Timeout);
            }

            tokio::time::sleep(POLL_PERIOD).await;
        }
    }

    /// Looks up a transaction.
    pub fn transaction(&self, id: &str) -> Result<Transaction> {
        self.txns.get(id).ok_or(Error::NotFound)
    }

    pub fn health(&self) -> proto::HealthStatus {
        self.health.status()
    }
}
