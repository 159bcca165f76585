//! The reading caches.
//!
//! The current-value cache holds the most recent list of readings
//! for each device; updates unconditionally replace. The optional
//! windowed cache keeps a short per-device history, bounded by both
//! a TTL and a maximum entry count, for monitors that want recent
//! trend data without a storage backend.

use crate::config::CacheSettings;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use manifold_api::types::device::Reading;
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// The readings delivered by one acquisition, stamped with the
/// delivery time.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub ts: DateTime<Utc>,
    pub readings: Vec<Reading>,
}

struct Window {
    ttl: Duration,
    max_size: usize,
    entries: Mutex<HashMap<String, VecDeque<CacheEntry>>>,
}

pub struct ReadingCache {
    current: Mutex<HashMap<String, CacheEntry>>,
    window: Option<Window>,
}

impl ReadingCache {
    pub fn new(cfg: &CacheSettings) -> ReadingCache {
        ReadingCache {
            current: Mutex::new(HashMap::new()),
            window: cfg.enabled.then(|| Window {
                ttl: cfg.ttl(),
                max_size: cfg.max_size,
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn window_enabled(&self) -> bool {
        self.window.is_some()
    }

    /// Stores the result of one acquisition. The current value is
    /// replaced, never merged; when the windowed cache is enabled
    /// the entry is appended there too.
    pub fn update(&self, id: &str, readings: Vec<Reading>) {
        let entry = CacheEntry {
            ts: Utc::now(),
            readings,
        };

        if let Some(window) = &self.window {
            if let Ok(mut entries) = window.entries.lock() {
                let ring = entries.entry(id.to_string()).or_default();

                ring.push_back(entry.clone());
                while ring.len() > window.max_size {
                    ring.pop_front();
                }
            } else {
                error!("couldn't update windowed cache for {}", id)
            }
        }

        if let Ok(mut current) = self.current.lock() {
            current.insert(id.to_string(), entry);
        } else {
            error!("couldn't update current value of {}", id)
        }
    }

    /// The most recent entry for the device, if any acquisition has
    /// completed yet.
    pub fn current(&self, id: &str) -> Option<CacheEntry> {
        self.current
            .lock()
            .ok()
            .and_then(|current| current.get(id).cloned())
    }

    /// A snapshot of the device's recent history, oldest first.
    /// Empty when the windowed cache is disabled.
    pub fn history(&self, id: &str) -> Vec<CacheEntry> {
        let Some(window) = &self.window else {
            return vec![];
        };

        window
            .entries
            .lock()
            .ok()
            .and_then(|entries| {
                entries.get(id).map(|ring| ring.iter().cloned().collect())
            })
            .unwrap_or_default()
    }

    // Drops window entries older than the TTL. The current-value
    // cache is never swept; a stale current value is still the
    // latest known state.

    fn sweep(&self) {
        let Some(window) = &self.window else { return };
        let Ok(ttl) = ChronoDuration::from_std(window.ttl) else {
            return;
        };
        let cutoff = Utc::now() - ttl;

        if let Ok(mut entries) = window.entries.lock() {
            for ring in entries.values_mut() {
                while ring.front().is_some_and(|e| e.ts <= cutoff) {
                    ring.pop_front();
                }
            }
            entries.retain(|_, ring| !ring.is_empty());
        }
    }

    /// Starts the background window sweeper, if the windowed cache
    /// is enabled.
    pub fn start_sweeper(
        self: &Arc<Self>,
        token: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let window = self.window.as_ref()?;
        let period = window.ttl.div_f64(4.0).max(Duration::from_secs(1));
        let cache = self.clone();

        Some(tokio::spawn(async move {
            info!("cache sweeper running");
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("cache sweeper stopping");
                        return;
                    }
                    _ = tokio::time::sleep(period) => cache.sweep()
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manifold_api::types::device::Value;

    fn reading(value: Value) -> Reading {
        Reading {
            ts: Utc::now(),
            kind: "temperature".into(),
            unit: None,
            value,
            context: HashMap::new(),
            output: None,
        }
    }

    fn settings(enabled: bool) -> CacheSettings {
        CacheSettings {
            enabled,
            ttl: 60.0,
            max_size: 3,
        }
    }

    #[test]
    fn test_current_last_write_wins() {
        let cache = ReadingCache::new(&settings(false));

        assert!(cache.current("d1").is_none());

        cache.update("d1", vec![reading(Value::Flt(1.0))]);
        cache.update("d1", vec![reading(Value::Flt(2.0))]);

        let entry = cache.current("d1").unwrap();

        assert_eq!(entry.readings.len(), 1);
        assert_eq!(entry.readings[0].value, Value::Flt(2.0));
    }

    #[test]
    fn test_devices_are_independent() {
        let cache = ReadingCache::new(&settings(false));

        cache.update("d1", vec![reading(Value::Flt(1.0))]);
        cache.update("d2", vec![reading(Value::Flt(2.0))]);

        assert_eq!(
            cache.current("d1").unwrap().readings[0].value,
            Value::Flt(1.0)
        );
        assert_eq!(
            cache.current("d2").unwrap().readings[0].value,
            Value::Flt(2.0)
        );
    }

    #[test]
    fn test_window_disabled() {
        let cache = ReadingCache::new(&settings(false));

        cache.update("d1", vec![reading(Value::Flt(1.0))]);

        assert!(!cache.window_enabled());
        assert!(cache.history("d1").is_empty());
    }

    #[test]
    fn test_window_keeps_history_in_order() {
        let cache = ReadingCache::new(&settings(true));

        for ii in 0..3 {
            cache.update("d1", vec![reading(Value::Int(ii))]);
        }

        let history = cache.history("d1");

        assert_eq!(history.len(), 3);
        for (ii, entry) in history.iter().enumerate() {
            assert_eq!(entry.readings[0].value, Value::Int(ii as i64));
        }
    }

    #[test]
    fn test_window_bounds_size() {
        let cache = ReadingCache::new(&settings(true));

        for ii in 0..10 {
            cache.update("d1", vec![reading(Value::Int(ii))]);
        }

        let history = cache.history("d1");

        // Only the most recent `max_size` entries survive.

        assert_eq!(history.len(), 3);
        assert_eq!(history[0].readings[0].value, Value::Int(7));
        assert_eq!(history[2].readings[0].value, Value::Int(9));
    }

    #[test]
    fn test_window_sweep_by_age() {
        let cache = ReadingCache::new(&settings(true));

        cache.update("d1", vec![reading(Value::Int(1))]);
        cache.update("d1", vec![reading(Value::Int(2))]);

        // Age the first entry past the TTL by hand.

        if let Some(window) = &cache.window {
            let mut entries = window.entries.lock().unwrap();
            let ring = entries.get_mut("d1").unwrap();

            ring[0].ts = Utc::now() - ChronoDuration::seconds(61);
        }

        cache.sweep();

        let history = cache.history("d1");

        assert_eq!(history.len(), 1);
        assert_eq!(history[0].readings[0].value, Value::Int(2));

        // The current value is untouched by sweeping.

        assert!(cache.current("d1").is_some());
    }
}
