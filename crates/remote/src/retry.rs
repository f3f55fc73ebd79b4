//! Bounded, jittered retries on throttling responses.
//!
//! Only `RemoteError::Throttled` is retried; every other error propagates on
//! the first occurrence.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::RemoteError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Retries after the first call (so at most `max_retries + 1` calls).
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_sleep: Duration,
    /// Upper bound (exclusive) of the random jitter added to every sleep.
    pub max_jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 6,
            base_backoff: Duration::from_millis(1500),
            max_sleep: Duration::from_secs(20),
            max_jitter: Duration::from_millis(400),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ThrottleRetry {
    config: RetryConfig,
}

impl ThrottleRetry {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Sleep before retry number `attempt` (1-based), without jitter:
    /// `min(max_sleep, base_backoff * attempt)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.config
            .base_backoff
            .saturating_mul(attempt)
            .min(self.config.max_sleep)
    }

    fn jitter(&self) -> Duration {
        let max = self.config.max_jitter.as_micros() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(rand::thread_rng().gen_range(0..max))
    }

    /// Run `op`, retrying while it reports throttling.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, RemoteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Err(err) if err.is_throttled() => {
                    if attempt >= self.config.max_retries {
                        return Err(RemoteError::ThrottleExhausted {
                            retries: self.config.max_retries,
                        });
                    }
                    attempt += 1;
                    let delay = self.backoff(attempt) + self.jitter();
                    warn!(
                        operation,
                        attempt,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "remote throttled, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[test]
    fn backoff_is_linear_then_capped() {
        let r = ThrottleRetry::default();
        assert_eq!(r.backoff(1), Duration::from_millis(1500));
        assert_eq!(r.backoff(4), Duration::from_millis(6000));
        assert_eq!(r.backoff(14), Duration::from_secs(20));
        assert_eq!(r.backoff(u32::MAX), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_throttling_until_success() {
        let r = ThrottleRetry::default();
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let c = calls.clone();
        let out = r
            .run("read", || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(RemoteError::Throttled)
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;

        assert_eq!(out, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let slept = start.elapsed();
        assert!(slept >= Duration::from_millis(4500));
        assert!(slept < Duration::from_millis(4500 + 800));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let r = ThrottleRetry::default();
        let calls = AtomicU32::new(0);
        let out: Result<(), _> = r
            .run("create", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(RemoteError::Throttled) }
            })
            .await;

        assert_eq!(out, Err(RemoteError::ThrottleExhausted { retries: 6 }));
        assert_eq!(calls.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let r = ThrottleRetry::default();
        let calls = AtomicU32::new(0);
        let out: Result<(), _> = r
            .run("create", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(RemoteError::Fault("invalid partner".into())) }
            })
            .await;
        assert!(matches!(out, Err(RemoteError::Fault(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    proptest! {
        /// Property: every sleep stays within [backoff, backoff + max_jitter)
        /// and never exceeds max_sleep + max_jitter.
        #[test]
        fn sleeps_are_bounded(attempt in 1u32..1_000) {
            let r = ThrottleRetry::default();
            let base = r.backoff(attempt);
            let d = base + r.jitter();
            prop_assert!(d >= base);
            prop_assert!(d < base + r.config.max_jitter);
            prop_assert!(d < r.config.max_sleep + r.config.max_jitter);
        }
    }
}
