//! A plugin exposing emulated devices.
//!
//! Useful for demos and for exercising a monitor without hardware:
//! temperature and humidity sensors that wander around a base
//! value, an LED that can be switched on and off, and a counter
//! that pushes a value on its own schedule instead of being polled.
//!
//! With no `emulator.toml` present, a default set of devices is
//! registered so the binary is useful out of the box.

use manifold::{
    api::{
        handler::DeviceHandler,
        types::device::{Device, Value},
        Error,
    },
    config::{self, DeviceConfig},
    Metadata, Plugin,
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

// A tiny linear congruential generator; emulated sensors just need
// plausible-looking wander, not real randomness.

fn jitter(state: &AtomicU64) -> f64 {
    let next = state
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |s| {
            Some(
                s.wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407),
            )
        })
        .unwrap_or(1);

    ((next >> 33) % 2001) as f64 / 1000.0 - 1.0
}

// Polled sensors: each read wanders around the device's configured
// base value.

fn sensor_handler(name: &'static str, default_base: f64) -> DeviceHandler {
    let state = Arc::new(AtomicU64::new(0x2545f4914f6cdd1d));

    DeviceHandler::new(name).with_read(move |dev: Arc<Device>| {
        let state = state.clone();

        async move {
            let base = dev
                .data
                .get("base")
                .and_then(|v| v.as_float())
                .unwrap_or(default_base);
            let Some(out) = dev.output(name) else {
                return Err(Error::Handler(format!(
                    "device has no '{}' output",
                    name
                )));
            };

            Ok(vec![out.make_reading(Value::Flt(
                base + jitter(&state),
            ))?])
        }
    })
}

// The LED: readable state, writable with "on"/"off" actions.

fn led_handler() -> DeviceHandler {
    let states = Arc::new(Mutex::new(HashMap::<String, String>::new()));
    let read_states = states.clone();

    DeviceHandler::new("led")
        .with_read(move |dev: Arc<Device>| {
            let states = read_states.clone();

            async move {
                let state = states
                    .lock()
                    .await
                    .get(dev.id())
                    .cloned()
                    .unwrap_or_else(|| String::from("off"));
                let Some(out) = dev.output("state") else {
                    return Err(Error::Handler(
                        "device has no 'state' output".into(),
                    ));
                };

                Ok(vec![out.make_reading(Value::Str(state))?])
            }
        })
        .with_write(move |dev: Arc<Device>, data| {
            let states = states.clone();

            async move {
                match data.action.as_deref() {
                    Some(action @ ("on" | "off")) => {
                        states
                            .lock()
                            .await
                            .insert(dev.id().into(), action.into());
                        Ok(())
                    }
                    Some(other) => Err(Error::InvArgument(format!(
                        "unknown led action '{}'",
                        other
                    ))),
                    None => Err(Error::InvArgument(
                        "led writes need an action".into(),
                    )),
                }
            }
        })
}

// The counter pushes on its own schedule instead of being polled.

fn counter_handler() -> DeviceHandler {
    DeviceHandler::new("counter").with_listen(
        |dev: Arc<Device>, sink, token: CancellationToken| async move {
            let period = dev
                .data
                .get("period")
                .and_then(|v| v.as_float())
                .unwrap_or(2.0);
            let Some(out) = dev.output("count") else {
                warn!("device has no 'count' output; listener idle");
                return;
            };
            let out = out.clone();
            let mut n: u32 = 0;

            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(
                        Duration::from_secs_f64(period)
                    ) => ()
                }

                n = n.wrapping_add(1);

                match out.make_reading(Value::UInt(n.into())) {
                    Ok(reading) => sink.push(vec![reading]),
                    Err(e) => warn!("couldn't build reading -- {}", e),
                }
            }
        },
    )
}

fn default_devices() -> Vec<DeviceConfig> {
    let dev = |kind: &str, outputs: &[&str], data: &[(&str, f64)]| {
        DeviceConfig {
            kind: kind.into(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            data: data
                .iter()
                .map(|(k, v)| {
                    (k.to_string(), toml::value::Value::Float(*v))
                })
                .collect(),
            ..DeviceConfig::default()
        }
    };

    vec![
        dev("temperature", &["temperature"], &[("base", 21.0)]),
        dev("humidity", &["humidity"], &[("base", 40.0)]),
        dev("led", &["state"], &[]),
        dev("counter", &["count"], &[("period", 2.0)]),
    ]
}

#[tokio::main]
async fn main() {
    let Some(mut cfg) = config::get("emulator").await else {
        return;
    };

    if cfg.device.is_empty() {
        cfg.device = default_devices()
    }

    let meta = Metadata::new("emulator", "manifold")
        .with_description("Emulated devices for demos and testing")
        .with_version(env!("CARGO_PKG_VERSION"));
    let mut plugin = Plugin::new(meta, cfg);
    let handlers = vec![
        sensor_handler("temperature", 21.0),
        sensor_handler("humidity", 40.0),
        led_handler(),
        counter_handler(),
    ];

    for handler in handlers {
        if let Err(e) = plugin.register_handler(handler) {
            eprintln!("ERROR: {e}");
            return;
        }
    }

    if let Err(e) = plugin.run().await {
        eprintln!("ERROR: {e}")
    }
}
