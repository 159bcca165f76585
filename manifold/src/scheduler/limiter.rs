//! Token-bucket rate limiting for dispatches.

use crate::config::LimiterSettings;
use manifold_api::{types::Error, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// A token bucket refilled at `rate` tokens per second with room
/// for `burst` tokens. Every scheduler dispatch takes one token,
/// waiting for the bucket to refill when it runs dry.
pub struct Limiter {
    rate: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl Limiter {
    /// Builds a limiter from the configuration. A rate of 0 means
    /// unlimited, so no limiter is built. A burst of 0 defaults to
    /// one second's worth of tokens.
    pub fn from_config(cfg: &LimiterSettings) -> Option<Arc<Limiter>> {
        if cfg.rate <= 0.0 {
            return None;
        }

        let burst = if cfg.burst == 0 {
            cfg.rate.ceil()
        } else {
            f64::from(cfg.burst)
        };

        Some(Arc::new(Limiter {
            rate: cfg.rate,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last: Instant::now(),
            }),
        }))
    }

    // Takes a token if one is available; otherwise reports how long
    // to wait for the next one.

    fn try_take(&self) -> std::result::Result<(), Duration> {
        let mut bucket =
            self.bucket.lock().expect("limiter mutex poisoned");
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last).as_secs_f64();

        bucket.tokens =
            (bucket.tokens + elapsed * self.rate).min(self.burst);
        bucket.last = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64(
                (1.0 - bucket.tokens) / self.rate,
            ))
        }
    }

    /// Waits for a token. Returns `Cancelled` if the shutdown token
    /// fires first.
    pub async fn acquire(
        &self,
        token: &CancellationToken,
    ) -> Result<()> {
        loop {
            match self.try_take() {
                Ok(()) => return Ok(()),
                Err(wait) => {
                    tokio::select! {
                        _ = token.cancelled() => {
                            return Err(Error::Cancelled)
                        }
                        _ = tokio::time::sleep(wait) => ()
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(rate: f64, burst: u32) -> Arc<Limiter> {
        Limiter::from_config(&LimiterSettings { rate, burst }).unwrap()
    }

    #[test]
    fn test_zero_rate_is_unlimited() {
        assert!(Limiter::from_config(&LimiterSettings {
            rate: 0.0,
            burst: 10
        })
        .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_immediate() {
        let lim = limiter(1.0, 3);
        let token = CancellationToken::new();
        let start = Instant::now();

        for _ in 0..3 {
            lim.acquire(&token).await.unwrap();
        }

        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_rate() {
        let lim = limiter(2.0, 1);
        let token = CancellationToken::new();
        let start = Instant::now();

        // One burst token, then two refills at 2 tokens/second.

        for _ in 0..3 {
            lim.acquire(&token).await.unwrap();
        }

        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(999));
        assert!(elapsed <= Duration::from_millis(1100));
    }

    // The fairness bound: in any window of T seconds, no more than
    // rate * T + burst dispatches get through.

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_bound() {
        let lim = limiter(10.0, 5);
        let token = CancellationToken::new();
        let start = Instant::now();
        let window = Duration::from_secs(2);
        let mut dispatches = 0u32;

        while start.elapsed() < window {
            lim.acquire(&token).await.unwrap();
            dispatches += 1;
        }

        assert!(dispatches <= 10 * 2 + 5, "got {}", dispatches);
        assert!(dispatches >= 20, "got {}", dispatches);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation() {
        let lim = limiter(0.1, 1);
        let token = CancellationToken::new();

        lim.acquire(&token).await.unwrap();

        // The bucket is empty and refills at a token per ten
        // seconds; cancelling must interrupt the wait.

        let waiter = {
            let lim = lim.clone();
            let token = token.clone();

            tokio::spawn(async move { lim.acquire(&token).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        assert_eq!(waiter.await.unwrap(), Err(Error::Cancelled));
    }
}
