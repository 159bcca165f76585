//! Plugin health tracking.
//!
//! The scheduler reports heartbeats and queue pressure here; the
//! service façade serves the aggregate. When a health file is
//! configured, a background task touches it while the plugin is
//! healthy so process supervisors can watch the file's age instead
//! of speaking the RPC protocol.

use crate::config::{HealthConfig, Settings};
use chrono::Utc;
use manifold_api::proto;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const FILE_PERIOD: Duration = Duration::from_secs(10);

// A read drop this recent counts as queue saturation.

const SATURATION_WINDOW: Duration = Duration::from_secs(60);

pub type CheckFunc =
    Arc<dyn Fn() -> std::result::Result<(), String> + Send + Sync>;

#[derive(Default)]
struct Flags {
    read_beat: Option<Instant>,
    write_beat: Option<Instant>,
    read_loop_absent: bool,
    last_read_drop: Option<Instant>,
    read_errors: u64,
}

pub struct HealthState {
    flags: Mutex<Flags>,
    checks: Mutex<Vec<(String, CheckFunc)>>,
    defaults_enabled: bool,
    read_disabled: bool,
    write_disabled: bool,
    // A loop whose heartbeat is older than this is considered
    // stalled.
    read_liveness: Duration,
    write_liveness: Duration,
}

impl HealthState {
    pub fn new(settings: &Settings, cfg: &HealthConfig) -> HealthState {
        HealthState {
            flags: Mutex::new(Flags::default()),
            checks: Mutex::new(vec![]),
            defaults_enabled: !cfg.checks.disable_defaults,
            read_disabled: settings.read.disable,
            write_disabled: settings.write.disable,
            read_liveness: liveness(settings.read.interval()),
            write_liveness: liveness(settings.write.interval()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Flags> {
        self.flags.lock().expect("health mutex poisoned")
    }

    /// Registers a user-supplied health check.
    pub fn register(&self, name: &str, check: CheckFunc) {
        self.checks
            .lock()
            .expect("health mutex poisoned")
            .push((name.to_string(), check));
    }

    /// Called by the read loop at the top of each iteration.
    pub fn beat_read(&self) {
        self.lock().read_beat = Some(Instant::now());
    }

    /// Called when the scheduler decides not to run a read loop at
    /// all (no polled devices), so its absence isn't reported as a
    /// stall.
    pub fn mark_read_absent(&self) {
        self.lock().read_loop_absent = true;
    }

    /// Called by the write loop at the top of each batch.
    pub fn beat_write(&self) {
        self.lock().write_beat = Some(Instant::now());
    }

    /// Records that a reading was dropped because the internal
    /// queue was full.
    pub fn mark_read_drop(&self) {
        self.lock().last_read_drop = Some(Instant::now());
    }

    /// Counts a failed read. Read errors never halt the loop, but
    /// they should be visible somewhere.
    pub fn count_read_error(&self) {
        self.lock().read_errors += 1;
    }

    pub fn read_errors(&self) -> u64 {
        self.lock().read_errors
    }

    /// The aggregate health: every default and user check, plus an
    /// overall verdict.
    pub fn status(&self) -> proto::HealthStatus {
        let mut checks = vec![];

        if self.defaults_enabled {
            let flags = self.lock();

            if !self.read_disabled && !flags.read_loop_absent {
                checks.push(liveness_check(
                    "read-loop",
                    flags.read_beat,
                    self.read_liveness,
                ));
            }

            if !self.write_disabled {
                checks.push(liveness_check(
                    "write-loop",
                    flags.write_beat,
                    self.write_liveness,
                ));
            }

            let saturated = flags
                .last_read_drop
                .is_some_and(|t| t.elapsed() < SATURATION_WINDOW);

            checks.push(proto::HealthCheck {
                name: "read-queue".into(),
                ok: !saturated,
                message: saturated.then(|| {
                    String::from("readings dropped recently")
                }),
            });
        }

        for (name, check) in
            self.checks.lock().expect("health mutex poisoned").iter()
        {
            let result = check();

            checks.push(proto::HealthCheck {
                name: name.clone(),
                ok: result.is_ok(),
                message: result.err(),
            });
        }

        proto::HealthStatus {
            ok: checks.iter().all(|c| c.ok),
            ts: Utc::now().to_rfc3339(),
            checks,
        }
    }

    /// Starts the health-file task, if a path is configured. The
    /// file is touched periodically while the plugin is healthy, so
    /// its age going stale signals trouble.
    pub fn start_file_task(
        self: &Arc<Self>,
        cfg: &HealthConfig,
        token: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let path = cfg.health_file.clone()?;
        let health = self.clone();

        Some(tokio::spawn(async move {
            info!(file = &path, "health file task running");
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("health file task stopping");
                        return;
                    }
                    _ = tokio::time::sleep(FILE_PERIOD) => {
                        let status = health.status();

                        if status.ok {
                            if let Err(e) =
                                tokio::fs::write(&path, &status.ts).await
                            {
                                warn!(
                                    "couldn't touch health file -- {}",
                                    e
                                )
                            }
                        }
                    }
                }
            }
        }))
    }
}

fn liveness(interval: Duration) -> Duration {
    (interval * 3).max(Duration::from_secs(30))
}

fn liveness_check(
    name: &str,
    beat: Option<Instant>,
    bound: Duration,
) -> proto::HealthCheck {
    let (ok, message) = match beat {
        Some(t) if t.elapsed() <= bound => (true, None),
        Some(_) => (false, Some(String::from("heartbeat is stale"))),
        None => (false, Some(String::from("loop hasn't started"))),
    };

    proto::HealthCheck {
        name: name.into(),
        ok,
        message,
    }
}
