//! The scheduling engine.
//!
//! The scheduler owns three kinds of concurrent activity: the read
//! loop that polls readable devices, the write loop that drains the
//! write queue in batches, and one long-lived listener task per
//! device whose handler pushes its own readings. All of them funnel
//! results through a single fan-in channel into the caches, and all
//! of them stop when the shutdown token fires.
//!
//! The `mode` setting picks the discipline within one iteration:
//! serial dispatches devices one at a time in registry order,
//! parallel launches one task per device and awaits the lot. In
//! either mode, a device is never dispatched concurrently with
//! itself -- an iteration completes before the next begins, and
//! writes to one device are executed in submission order.

mod limiter;

pub use limiter::Limiter;

use crate::{
    cache::ReadingCache,
    config::{Mode, Settings},
    dispatch,
    health::HealthState,
    registry::{DeviceRegistry, Entry},
    txn::Transactions,
};
use manifold_api::{
    handler::ReadingSink,
    types::{
        device::{Device, Reading, WriteData},
        transaction::State,
    },
};
use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn};
use tracing_futures::Instrument;

/// The message marking a write cancelled while still queued.
pub const CANCEL_MSG: &str = "write cancelled before execution";

/// One queued write: the target device, its handler, the payload,
/// and the transaction tracking it.
pub struct WriteItem {
    pub device: Arc<Device>,
    pub handler: Arc<manifold_api::handler::DeviceHandler>,
    pub data: WriteData,
    pub txn_id: String,
}

type ReadingBatch = (String, Vec<Reading>);

pub struct Scheduler {
    registry: Arc<DeviceRegistry>,
    cache: Arc<ReadingCache>,
    txns: Transactions,
    settings: Settings,
    health: Arc<HealthState>,
    limiter: Option<Arc<Limiter>>,
    tx_write: mpsc::Sender<WriteItem>,
    rx_write: Option<mpsc::Receiver<WriteItem>>,
}

impl Scheduler {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        cache: Arc<ReadingCache>,
        txns: Transactions,
        settings: Settings,
        health: Arc<HealthState>,
    ) -> Scheduler {
        let (tx_write, rx_write) =
            mpsc::channel(settings.write.queue_size);
        let limiter = Limiter::from_config(&settings.limiter);

        Scheduler {
            registry,
            cache,
            txns,
            settings,
            health,
            limiter,
            tx_write,
            rx_write: Some(rx_write),
        }
    }

    /// The producer half of the write queue, handed to the service
    /// façade.
    pub fn writer(&self) -> mpsc::Sender<WriteItem> {
        self.tx_write.clone()
    }

    /// Spawns every scheduling task. The returned handles complete
    /// once the token has fired and the loops have wound down.
    pub fn start(
        &mut self,
        token: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![];

        // The fan-in task is the single consumer moving acquired
        // readings into the caches, in arrival order.

        let (tx_readings, rx_readings) =
            mpsc::channel::<ReadingBatch>(self.settings.read.queue_size);

        tasks.push(tokio::spawn(
            fan_in(rx_readings, self.cache.clone(), token.child_token())
                .instrument(info_span!("fan-in")),
        ));

        if !self.settings.read.disable {
            let devices = self.registry.readable();

            if devices.is_empty() {
                info!("no polled devices; read loop not started");
                self.health.mark_read_absent()
            } else {
                tasks.push(tokio::spawn(
                    read_loop(
                        devices,
                        self.settings.clone(),
                        self.limiter.clone(),
                        self.health.clone(),
                        tx_readings.clone(),
                        token.child_token(),
                    )
                    .instrument(info_span!("read-loop")),
                ));
            }
        }

        if !self.settings.write.disable {
            if let Some(rx_write) = self.rx_write.take() {
                tasks.push(tokio::spawn(
                    write_loop(
                        rx_write,
                        self.settings.clone(),
                        self.limiter.clone(),
                        self.txns.clone(),
                        self.health.clone(),
                        token.child_token(),
                    )
                    .instrument(info_span!("write-loop")),
                ));
            } else {
                warn!("scheduler already started once; build a new one")
            }
        }

        if !self.settings.listen.disable {
            for entry in self.registry.listeners() {
                tasks.push(start_listener(
                    entry,
                    tx_readings.clone(),
                    token.child_token(),
                ));
            }
        }

        tasks
    }
}

// Moves reading batches from the loops and listeners into the
// caches.

async fn fan_in(
    mut rx: mpsc::Receiver<ReadingBatch>,
    cache: Arc<ReadingCache>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            batch = rx.recv() => match batch {
                Some((id, readings)) => cache.update(&id, readings),
                None => return,
            }
        }
    }
}

// Waits for a limiter token, if a limiter is configured. Returns
// `false` when the shutdown token fired instead.

async fn acquire(
    limiter: &Option<Arc<Limiter>>,
    token: &CancellationToken,
) -> bool {
    match limiter {
        Some(limiter) => limiter.acquire(token).await.is_ok(),
        None => !token.is_cancelled(),
    }
}

// Sleeps, unless the shutdown token fires first.

async fn pause(delay: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = time::sleep(delay) => true,
    }
}

async fn read_loop(
    devices: Vec<Entry>,
    settings: Settings,
    limiter: Option<Arc<Limiter>>,
    health: Arc<HealthState>,
    tx: mpsc::Sender<ReadingBatch>,
    token: CancellationToken,
) {
    let interval = settings.read.interval();
    let delay = settings.read.delay();

    info!(devices = devices.len(), "read loop running");

    loop {
        let started = Instant::now();

        health.beat_read();

        match settings.mode {
            Mode::Serial => {
                for entry in &devices {
                    if !acquire(&limiter, &token).await {
                        info!("read loop stopping");
                        return;
                    }

                    read_one(entry, &tx, &health).await;

                    if !delay.is_zero() && !pause(delay, &token).await {
                        info!("read loop stopping");
                        return;
                    }
                }
            }

            Mode::Parallel => {
                let mut reads = vec![];

                for entry in devices.iter().cloned() {
                    let limiter = limiter.clone();
                    let health = health.clone();
                    let tx = tx.clone();
                    let token = token.clone();

                    reads.push(tokio::spawn(async move {
                        if acquire(&limiter, &token).await {
                            read_one(&entry, &tx, &health).await
                        }
                    }));
                }

                // The iteration isn't done until every device's
                // read is; this is what keeps a single device from
                // overlapping with itself.

                for read in reads {
                    let _ = read.await;
                }
            }
        }

        tokio::select! {
            _ = token.cancelled() => {
                info!("read loop stopping");
                return;
            }
            _ = time::sleep_until(started + interval) => ()
        }
    }
}

// Reads one device and forwards the result. Failures are logged and
// counted; they never stop the loop and never reach clients, who
// simply see the cache go stale.

async fn read_one(
    entry: &Entry,
    tx: &mpsc::Sender<ReadingBatch>,
    health: &Arc<HealthState>,
) {
    use mpsc::error::TrySendError;

    match dispatch::read(&entry.device, &entry.handler).await {
        Ok(readings) => {
            let readings = apply_scale(&entry.device, readings);

            if readings.is_empty() {
                return;
            }

            match tx
                .try_send((entry.device.id().to_string(), readings))
            {
                Ok(()) => (),
                Err(TrySendError::Full(_)) => {
                    warn!(
                        device = entry.device.id(),
                        "reading queue is full; dropping result"
                    );
                    health.mark_read_drop()
                }
                Err(TrySendError::Closed(_)) => warn!(
                    device = entry.device.id(),
                    "reading queue is closed; dropping result"
                ),
            }
        }
        Err(e) => {
            warn!(device = entry.device.id(), "read failed -- {}", e);
            health.count_read_error()
        }
    }
}

// Applies the device's configured scaling factor. A reading that
// can't be scaled is dropped rather than delivered wrong.

fn apply_scale(
    device: &Arc<Device>,
    readings: Vec<Reading>,
) -> Vec<Reading> {
    let Some(factor) = device.scale else {
        return readings;
    };

    readings
        .into_iter()
        .filter_map(|reading| match reading.scale(factor) {
            Ok(reading) => Some(reading),
            Err(e) => {
                warn!(
                    device = device.id(),
                    "dropping unscalable reading -- {}",
                    e
                );
                None
            }
        })
        .collect()
}

async fn write_loop(
    mut rx: mpsc::Receiver<WriteItem>,
    settings: Settings,
    limiter: Option<Arc<Limiter>>,
    txns: Transactions,
    health: Arc<HealthState>,
    token: CancellationToken,
) {
    let interval = settings.write.interval();
    let delay = settings.write.delay();
    let batch_size = settings.write.batch_size;

    info!("write loop running");

    loop {
        // Block for the first item of a batch, then take whatever
        // else is already queued, up to the batch size.

        let Some(first) = next_item(&mut rx, &health, &token).await
        else {
            break;
        };
        let mut batch = vec![first];

        while batch.len() < batch_size {
            match rx.try_recv() {
                Ok(item) => batch.push(item),
                Err(_) => break,
            }
        }

        match settings.mode {
            Mode::Serial => {
                for item in batch {
                    if token.is_cancelled() {
                        let _ = txns.update(
                            &item.txn_id,
                            State::Error,
                            CANCEL_MSG,
                        );
                        continue;
                    }

                    exec_write(item, &txns, &limiter, &token).await;

                    if !delay.is_zero() {
                        pause(delay, &token).await;
                    }
                }
            }

            Mode::Parallel => {
                // Fan the batch out by device: items for different
                // devices run concurrently, items for the same
                // device stay on one worker, in submission order.

                let mut groups: Vec<(String, Vec<WriteItem>)> = vec![];

                for item in batch {
                    let id = item.device.id().to_string();

                    match groups.iter_mut().find(|(gid, _)| *gid == id)
                    {
                        Some((_, items)) => items.push(item),
                        None => groups.push((id, vec![item])),
                    }
                }

                let mut writes = vec![];

                for (_, items) in groups {
                    let txns = txns.clone();
                    let limiter = limiter.clone();
                    let token = token.clone();

                    writes.push(tokio::spawn(async move {
                        for item in items {
                            exec_write(item, &txns, &limiter, &token)
                                .await
                        }
                    }));
                }

                for write in writes {
                    let _ = write.await;
                }
            }
        }

        tokio::select! {
            _ = token.cancelled() => break,
            _ = time::sleep(interval) => ()
        }
    }

    // Shutdown: anything still queued was never started. Close the
    // queue so producers see it, then mark the stragglers.

    rx.close();

    while let Ok(item) = rx.try_recv() {
        let _ = txns.update(&item.txn_id, State::Error, CANCEL_MSG);
    }

    info!("write loop stopping")
}

// Waits for the next queued write, keeping the loop's heartbeat
// fresh while idle. Returns `None` once the shutdown token fires or
// the queue closes.

async fn next_item(
    rx: &mut mpsc::Receiver<WriteItem>,
    health: &Arc<HealthState>,
    token: &CancellationToken,
) -> Option<WriteItem> {
    const HEARTBEAT: Duration = Duration::from_secs(5);

    loop {
        health.beat_write();

        tokio::select! {
            _ = token.cancelled() => return None,
            item = rx.recv() => return item,
            _ = time::sleep(HEARTBEAT) => ()
        }
    }
}

// Executes one write, walking its transaction through the FSM.

async fn exec_write(
    item: WriteItem,
    txns: &Transactions,
    limiter: &Option<Arc<Limiter>>,
    token: &CancellationToken,
) {
    if let Err(e) =
        txns.update(&item.txn_id, State::Writing, "write in progress")
    {
        warn!(txn = &item.txn_id, "couldn't start write -- {}", e);
        return;
    }

    if !acquire(limiter, token).await {
        let _ =
            txns.update(&item.txn_id, State::Error, "write cancelled");
        return;
    }

    match dispatch::write(&item.device, &item.handler, item.data).await
    {
        Ok(()) => {
            let _ = txns.update(&item.txn_id, State::Done, "");
        }
        Err(e) => {
            warn!(
                device = item.device.id(),
                "write failed -- {}",
                e
            );
            let _ =
                txns.update(&item.txn_id, State::Error, &e.to_string());
        }
    }
}

// One long-lived task per listening device. The handler is expected
// to run forever; if it returns or panics while the plugin is still
// up, it is restarted with the usual backoff so a flaky device
// doesn't disable its feed permanently.

fn start_listener(
    entry: Entry,
    tx: mpsc::Sender<ReadingBatch>,
    token: CancellationToken,
) -> JoinHandle<()> {
    use futures::FutureExt;

    const START_DELAY: u64 = 5;
    const MAX_DELAY: u64 = 600;

    let device_id = entry.device.id().to_string();

    tokio::spawn(
        async move {
            let Some(listen) = entry.handler.listen.clone() else {
                return;
            };
            let mut restart_delay = START_DELAY;

            info!("listener running");

            loop {
                let sink =
                    ReadingSink::new(entry.device.id(), tx.clone());
                let running = AssertUnwindSafe(listen(
                    entry.device.clone(),
                    sink,
                    token.child_token(),
                ))
                .catch_unwind();

                tokio::select! {
                    _ = token.cancelled() => {
                        info!("listener stopping");
                        return;
                    }
                    result = running => {
                        if let Err(payload) = result {
                            warn!(
                                "listener panicked -- {}",
                                dispatch::panic_message(payload)
                            )
                        }
                    }
                }

                if token.is_cancelled() {
                    info!("listener stopping");
                    return;
                }

                warn!("listener exited; delay before restarting ...");

                if !pause(
                    Duration::from_secs(restart_delay),
                    &token,
                )
                .await
                {
                    info!("listener stopping");
                    return;
                }

                restart_delay =
                    std::cmp::min(restart_delay * 2, MAX_DELAY);
            }
        }
        .instrument(info_span!("listener", device = device_id)),
    )
}
